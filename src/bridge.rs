//! Cross-thread async bridge: one cooperative runtime thread per
//! process, fed through a typed channel. Synchronous request workers
//! enqueue a future and block on a completion channel; cancellation
//! and timeouts propagate into the runtime via a token.

use std::future::Future;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Error, Result};

enum BridgeMsg {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// Handle to the runtime thread. Obtain it with [`AsyncBridge::global`];
/// the thread starts on first use and is shared process-wide.
pub struct AsyncBridge {
    tx: UnboundedSender<BridgeMsg>,
}

static BRIDGE: OnceLock<AsyncBridge> = OnceLock::new();

impl AsyncBridge {
    /// The process-wide bridge. Safe to call from any thread; the
    /// first caller spawns the runtime (one-shot init).
    pub fn global() -> &'static AsyncBridge {
        BRIDGE.get_or_init(AsyncBridge::start)
    }

    fn start() -> AsyncBridge {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<BridgeMsg>();

        let spawned = std::thread::Builder::new()
            .name("felis-runtime".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "failed to build bridge runtime");
                        return;
                    }
                };
                runtime.block_on(async move {
                    while let Some(msg) = rx.recv().await {
                        match msg {
                            BridgeMsg::Run(op) => op(),
                            BridgeMsg::Shutdown => break,
                        }
                    }
                    debug!("bridge runtime exiting");
                });
            });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn bridge runtime thread");
        }

        AsyncBridge { tx }
    }

    /// Run `future` on the runtime thread and block until it completes
    /// or `timeout` elapses. On timeout the runtime-side task is
    /// cancelled and the caller gets `Error::Timeout`.
    ///
    /// The future must be non-blocking: it shares the single
    /// cooperative runtime with every other bridged operation.
    pub fn run_on_runtime<F, T>(&self, future: F, timeout: Duration) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let (result_tx, result_rx) = std::sync::mpsc::sync_channel::<T>(1);

        let op = Box::new(move || {
            tokio::spawn(async move {
                tokio::select! {
                    _ = task_token.cancelled() => {}
                    value = future => {
                        // The caller may have timed out and gone away.
                        let _ = result_tx.send(value);
                    }
                }
            });
        });

        self.tx
            .send(BridgeMsg::Run(op))
            .map_err(|_| Error::Unavailable("bridge runtime is not running".into()))?;

        match result_rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                token.cancel();
                Err(Error::Timeout("bridged operation timed out".into()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Cancelled("bridged operation aborted".into()))
            }
        }
    }

    /// Ask the runtime thread to exit after draining queued messages.
    /// Subsequent `run_on_runtime` calls return `Unavailable`.
    pub fn shutdown(&self) {
        let _ = self.tx.send(BridgeMsg::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridged_future_returns_its_value() {
        let bridge = AsyncBridge::global();
        let value = bridge
            .run_on_runtime(async { 21 * 2 }, Duration::from_secs(5))
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn async_sleep_runs_off_the_caller_thread() {
        let bridge = AsyncBridge::global();
        let value = bridge
            .run_on_runtime(
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    "woke"
                },
                Duration::from_secs(5),
            )
            .unwrap();
        assert_eq!(value, "woke");
    }

    #[test]
    fn timeout_cancels_the_runtime_task() {
        let bridge = AsyncBridge::global();
        let result: Result<&str> = bridge.run_on_runtime(
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "too late"
            },
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn concurrent_callers_share_one_runtime() {
        let mut handles = Vec::new();
        for i in 0..8u32 {
            handles.push(std::thread::spawn(move || {
                AsyncBridge::global()
                    .run_on_runtime(
                        async move {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            i * 2
                        },
                        Duration::from_secs(5),
                    )
                    .unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), (i as u32) * 2);
        }
    }
}
