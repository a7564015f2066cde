//! Background task queue: a fixed worker pool over a priority heap,
//! with retries, cooperative cancellation, status tracking, and
//! TTL-bounded result retention.

use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::TaskConfig;
use crate::error::{Error, Result};

/// Task lifecycle. Transitions are monotonic except the
/// `Running → Queued` re-entry a retry performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Submission options. `None` fields fall back to the pool's config.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Higher values run first.
    pub priority: i32,
    pub max_attempts: Option<u32>,
    pub retry_backoff: Option<Duration>,
    pub result_ttl: Option<Duration>,
}

/// Passed to the job on every attempt. Jobs doing meaningful work in a
/// loop should poll `is_cancelled` at safe points.
pub struct TaskContext {
    cancel: Arc<AtomicBool>,
    pub attempt: u32,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

pub type TaskResult = std::result::Result<Value, String>;
type Job = Arc<dyn Fn(&TaskContext) -> TaskResult + Send + Sync>;

/// Point-in-time view of a task.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub id: Uuid,
    pub state: TaskState,
    pub attempts: u32,
    pub created_at: Instant,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub last_error: Option<String>,
}

struct TaskRecord {
    job: Job,
    priority: i32,
    max_attempts: u32,
    backoff: Duration,
    result_ttl: Duration,
    state: TaskState,
    attempts: u32,
    result: Option<TaskResult>,
    cancel: Arc<AtomicBool>,
    created_at: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    last_error: Option<String>,
}

#[derive(PartialEq, Eq)]
struct QueuedEntry {
    priority: i32,
    seq: u64,
    id: Uuid,
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then FIFO by sequence.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct DelayedEntry {
    not_before: Instant,
    entry: QueuedEntry,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedEntry>,
    delayed: Vec<DelayedEntry>,
}

impl QueueState {
    fn len(&self) -> usize {
        self.heap.len() + self.delayed.len()
    }

    /// Move due delayed entries into the heap; returns the nearest
    /// wake-up if anything is still pending.
    fn promote_due(&mut self, now: Instant) -> Option<Duration> {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].not_before <= now {
                let d = self.delayed.swap_remove(i);
                self.heap.push(d.entry);
            } else {
                i += 1;
            }
        }
        self.delayed
            .iter()
            .map(|d| d.not_before.saturating_duration_since(now))
            .min()
    }
}

struct Inner {
    config: TaskConfig,
    queue: Mutex<QueueState>,
    cv: Condvar,
    records: Mutex<HashMap<Uuid, TaskRecord>>,
    running: AtomicU64,
    seq: AtomicU64,
    shutdown: AtomicBool,
}

/// The task pool. Shared across requests; `submit` is cheap, workers
/// pull on their own threads.
pub struct TaskQueue {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(config: &TaskConfig) -> Self {
        let inner = Arc::new(Inner {
            config: config.clone(),
            queue: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
            records: Mutex::new(HashMap::new()),
            running: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers.max(1) {
            let inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("felis-task-{}", i))
                .spawn(move || worker_loop(inner));
            match handle {
                Ok(h) => workers.push(h),
                Err(e) => error!(error = %e, "failed to spawn task worker"),
            }
        }

        TaskQueue {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a job. Returns its id immediately; the job starts when a
    /// worker becomes free, in priority-then-FIFO order.
    pub fn submit<F>(&self, job: F, options: TaskOptions) -> Result<Uuid>
    where
        F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::Unavailable("task queue is shutting down".into()));
        }
        {
            let queue = self.inner.queue.lock();
            if queue.len() >= self.inner.config.queue_capacity {
                return Err(Error::Unavailable("task queue is full".into()));
            }
        }

        let id = Uuid::new_v4();
        let record = TaskRecord {
            job: Arc::new(job),
            priority: options.priority,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.inner.config.default_max_attempts)
                .max(1),
            backoff: options
                .retry_backoff
                .unwrap_or(self.inner.config.default_backoff),
            result_ttl: options.result_ttl.unwrap_or(self.inner.config.result_ttl),
            state: TaskState::Queued,
            attempts: 0,
            result: None,
            cancel: Arc::new(AtomicBool::new(false)),
            created_at: Instant::now(),
            started_at: None,
            finished_at: None,
            last_error: None,
        };

        self.inner.records.lock().insert(id, record);
        {
            let mut queue = self.inner.queue.lock();
            queue.heap.push(QueuedEntry {
                priority: options.priority,
                seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
                id,
            });
        }
        self.inner.cv.notify_one();
        debug!(task = %id, "task submitted");
        Ok(id)
    }

    /// Request cancellation. Queued tasks cancel immediately; running
    /// tasks observe the flag at their next `is_cancelled` check.
    pub fn cancel(&self, id: Uuid) -> bool {
        let mut records = self.inner.records.lock();
        match records.get_mut(&id) {
            Some(record) if !record.state.is_terminal() => {
                record.cancel.store(true, Ordering::Relaxed);
                if record.state == TaskState::Queued {
                    record.state = TaskState::Cancelled;
                    record.finished_at = Some(Instant::now());
                }
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, id: Uuid) -> Option<TaskStatus> {
        let mut records = self.inner.records.lock();
        reap_expired(&mut records);
        records.get(&id).map(|r| TaskStatus {
            id,
            state: r.state,
            attempts: r.attempts,
            created_at: r.created_at,
            started_at: r.started_at,
            finished_at: r.finished_at,
            last_error: r.last_error.clone(),
        })
    }

    /// The task's value or error, once terminal. `None` while the task
    /// is still pending or after its record expired.
    pub fn result(&self, id: Uuid) -> Option<TaskResult> {
        let mut records = self.inner.records.lock();
        reap_expired(&mut records);
        let record = records.get(&id)?;
        if !record.state.is_terminal() {
            return None;
        }
        match record.state {
            TaskState::Cancelled => Some(Err(record
                .last_error
                .clone()
                .unwrap_or_else(|| "cancelled".to_string()))),
            _ => record.result.clone(),
        }
    }

    /// Block until `id` reaches a terminal state or `timeout` elapses.
    pub fn wait(&self, id: Uuid, timeout: Duration) -> Option<TaskStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.status(id) {
                Some(status) if status.state.is_terminal() => return Some(status),
                Some(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => return other,
            }
        }
    }

    pub fn queued_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn running_len(&self) -> u64 {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Drain: cancel queued tasks, wait for running ones up to
    /// `deadline`, then flag the stragglers and detach the workers.
    pub fn shutdown(&self, deadline: Duration) {
        self.inner.shutdown.store(true, Ordering::Release);

        {
            let mut records = self.inner.records.lock();
            for record in records.values_mut() {
                if record.state == TaskState::Queued {
                    record.cancel.store(true, Ordering::Relaxed);
                    record.state = TaskState::Cancelled;
                    record.finished_at = Some(Instant::now());
                }
            }
        }
        self.inner.cv.notify_all();

        let until = Instant::now() + deadline;
        while self.inner.running.load(Ordering::Acquire) > 0 && Instant::now() < until {
            std::thread::sleep(Duration::from_millis(10));
        }

        if self.inner.running.load(Ordering::Acquire) > 0 {
            warn!("task shutdown deadline reached; flagging running tasks");
            let records = self.inner.records.lock();
            for record in records.values() {
                if record.state == TaskState::Running {
                    record.cancel.store(true, Ordering::Relaxed);
                }
            }
        }
        self.inner.cv.notify_all();

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if self.inner.running.load(Ordering::Acquire) == 0 {
                let _ = handle.join();
            }
            // Otherwise detach; the flagged task exits at its next
            // cancellation check.
        }
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let entry = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(entry) = {
                    let now = Instant::now();
                    queue.promote_due(now);
                    queue.heap.pop()
                } {
                    break Some(entry);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                let wake = queue
                    .promote_due(Instant::now())
                    .unwrap_or(Duration::from_millis(500));
                inner.cv.wait_for(&mut queue, wake);
            }
        };

        let entry = match entry {
            Some(e) => e,
            None => return,
        };

        let claimed = {
            let mut records = inner.records.lock();
            reap_expired(&mut records);
            match records.get_mut(&entry.id) {
                // A cancelled-while-queued task was already finalized.
                Some(record) if record.state == TaskState::Queued => {
                    record.state = TaskState::Running;
                    record.attempts += 1;
                    record.started_at = Some(Instant::now());
                    Some((record.job.clone(), record.cancel.clone(), record.attempts))
                }
                _ => None,
            }
        };

        let (job, cancel, attempt) = match claimed {
            Some(c) => c,
            None => continue,
        };

        inner.running.fetch_add(1, Ordering::AcqRel);
        let task_ctx = TaskContext {
            cancel: cancel.clone(),
            attempt,
        };
        // A panicking job fails with a synthetic error; the worker
        // itself survives and returns to the pool.
        let outcome = match catch_unwind(AssertUnwindSafe(|| (job)(&task_ctx))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".to_string());
                error!(task = %entry.id, panic = %msg, "task panicked");
                Err(format!("panic: {}", msg))
            }
        };
        inner.running.fetch_sub(1, Ordering::AcqRel);

        finalize(&inner, &entry, outcome, cancel.load(Ordering::Relaxed));
    }
}

fn finalize(inner: &Arc<Inner>, entry: &QueuedEntry, outcome: TaskResult, cancelled: bool) {
    let mut records = inner.records.lock();
    let record = match records.get_mut(&entry.id) {
        Some(r) => r,
        None => return,
    };

    match outcome {
        Ok(value) => {
            record.state = TaskState::Succeeded;
            record.result = Some(Ok(value));
            record.finished_at = Some(Instant::now());
        }
        Err(err) if cancelled => {
            record.state = TaskState::Cancelled;
            record.last_error = Some(err);
            record.finished_at = Some(Instant::now());
        }
        Err(err) => {
            let retriable = record.attempts < record.max_attempts
                && !inner.shutdown.load(Ordering::Acquire);
            record.last_error = Some(err.clone());
            if retriable {
                let delay = backoff_delay(record.backoff, record.attempts, inner.config.max_backoff);
                debug!(task = %entry.id, attempt = record.attempts, ?delay, "task retrying");
                record.state = TaskState::Queued;
                drop(records);
                let mut queue = inner.queue.lock();
                queue.delayed.push(DelayedEntry {
                    not_before: Instant::now() + delay,
                    entry: QueuedEntry {
                        priority: entry.priority,
                        seq: inner.seq.fetch_add(1, Ordering::Relaxed),
                        id: entry.id,
                    },
                });
                drop(queue);
                inner.cv.notify_one();
                return;
            }
            record.state = TaskState::Failed;
            record.result = Some(Err(err));
            record.finished_at = Some(Instant::now());
        }
    }
}

/// Bounded exponential backoff with jitter:
/// `base * 2^(attempt-1)`, capped, scaled by a 0.8–1.2 factor.
fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let raw = base.saturating_mul(1u32 << exp).min(cap);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    raw.mul_f64(jitter).min(cap)
}

fn reap_expired(records: &mut HashMap<Uuid, TaskRecord>) {
    records.retain(|_, r| {
        if !r.state.is_terminal() {
            return true;
        }
        match r.finished_at {
            Some(finished) => finished.elapsed() < r.result_ttl,
            None => true,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn queue(workers: usize) -> TaskQueue {
        TaskQueue::new(&TaskConfig {
            workers,
            ..TaskConfig::default()
        })
    }

    #[test]
    fn task_succeeds_and_reports_result() {
        let queue = queue(2);
        let id = queue
            .submit(|_ctx| Ok(json!({"answer": 42})), TaskOptions::default())
            .unwrap();

        let status = queue.wait(id, Duration::from_secs(5)).unwrap();
        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(status.attempts, 1);
        assert_eq!(queue.result(id).unwrap().unwrap(), json!({"answer": 42}));
    }

    #[test]
    fn failing_task_retries_then_succeeds() {
        let queue = queue(1);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_job = calls.clone();

        let id = queue
            .submit(
                move |_ctx| {
                    let n = calls_in_job.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("transient failure {}", n))
                    } else {
                        Ok(json!("done"))
                    }
                },
                TaskOptions {
                    max_attempts: Some(3),
                    retry_backoff: Some(Duration::from_millis(10)),
                    ..TaskOptions::default()
                },
            )
            .unwrap();

        let status = queue.wait(id, Duration::from_secs(5)).unwrap();
        assert_eq!(status.state, TaskState::Succeeded);
        assert_eq!(status.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_attempts_fail_with_last_error() {
        let queue = queue(1);
        let id = queue
            .submit(
                |_ctx| Err("always broken".to_string()),
                TaskOptions {
                    max_attempts: Some(2),
                    retry_backoff: Some(Duration::from_millis(5)),
                    ..TaskOptions::default()
                },
            )
            .unwrap();

        let status = queue.wait(id, Duration::from_secs(5)).unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.attempts, 2);
        assert_eq!(queue.result(id).unwrap().unwrap_err(), "always broken");
    }

    #[test]
    fn queued_task_cancels_immediately() {
        // No spare workers: occupy the single worker first.
        let queue = queue(1);
        let _blocker = queue
            .submit(
                |_ctx| {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(json!(null))
                },
                TaskOptions::default(),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let victim = queue
            .submit(|_ctx| Ok(json!("never runs")), TaskOptions::default())
            .unwrap();
        assert!(queue.cancel(victim));

        let status = queue.status(victim).unwrap();
        assert_eq!(status.state, TaskState::Cancelled);
        assert!(queue.result(victim).unwrap().is_err());
    }

    #[test]
    fn running_task_cancels_cooperatively() {
        let queue = queue(1);
        let id = queue
            .submit(
                |ctx| {
                    for _ in 0..200 {
                        if ctx.is_cancelled() {
                            return Err("stopped at safe point".to_string());
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(json!("finished"))
                },
                TaskOptions::default(),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert!(queue.cancel(id));

        let status = queue.wait(id, Duration::from_secs(5)).unwrap();
        assert_eq!(status.state, TaskState::Cancelled);
    }

    #[test]
    fn panicking_job_fails_without_poisoning_workers() {
        let queue = queue(1);
        let bad = queue
            .submit(|_ctx| panic!("boom"), TaskOptions::default())
            .unwrap();
        let status = queue.wait(bad, Duration::from_secs(5)).unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert!(status.last_error.unwrap().contains("boom"));

        // The worker survived and picks up new work.
        let good = queue
            .submit(|_ctx| Ok(json!("alive")), TaskOptions::default())
            .unwrap();
        let status = queue.wait(good, Duration::from_secs(5)).unwrap();
        assert_eq!(status.state, TaskState::Succeeded);
    }

    #[test]
    fn priority_orders_queued_tasks() {
        let queue = queue(1);
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        // Occupy the worker so the next two tasks queue up together.
        let _blocker = queue
            .submit(
                |_ctx| {
                    std::thread::sleep(Duration::from_millis(100));
                    Ok(json!(null))
                },
                TaskOptions::default(),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let low_order = order.clone();
        let low = queue
            .submit(
                move |_ctx| {
                    low_order.lock().push("low");
                    Ok(json!(null))
                },
                TaskOptions {
                    priority: 1,
                    ..TaskOptions::default()
                },
            )
            .unwrap();
        let high_order = order.clone();
        let high = queue
            .submit(
                move |_ctx| {
                    high_order.lock().push("high");
                    Ok(json!(null))
                },
                TaskOptions {
                    priority: 10,
                    ..TaskOptions::default()
                },
            )
            .unwrap();

        queue.wait(low, Duration::from_secs(5)).unwrap();
        queue.wait(high, Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock(), vec!["high", "low"]);
    }

    #[test]
    fn result_records_expire_after_ttl() {
        let queue = queue(1);
        let id = queue
            .submit(
                |_ctx| Ok(json!("short-lived")),
                TaskOptions {
                    result_ttl: Some(Duration::from_millis(50)),
                    ..TaskOptions::default()
                },
            )
            .unwrap();
        queue.wait(id, Duration::from_secs(5)).unwrap();
        assert!(queue.status(id).is_some());
        std::thread::sleep(Duration::from_millis(100));

        // Expiry is lazy: the access itself reaps the stale record.
        assert!(queue.status(id).is_none());
        assert!(queue.result(id).is_none());
    }

    #[test]
    fn shutdown_cancels_queued_work() {
        let queue = queue(1);
        let _blocker = queue
            .submit(
                |_ctx| {
                    std::thread::sleep(Duration::from_millis(100));
                    Ok(json!(null))
                },
                TaskOptions::default(),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let queued = queue
            .submit(|_ctx| Ok(json!("never")), TaskOptions::default())
            .unwrap();

        queue.shutdown(Duration::from_secs(2));
        assert_eq!(queue.status(queued).unwrap().state, TaskState::Cancelled);
        assert!(queue
            .submit(|_ctx| Ok(json!(null)), TaskOptions::default())
            .is_err());
    }
}
