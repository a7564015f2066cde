//! Server shell: a socket2-tuned acceptor feeding a fixed pool of
//! request workers over a bounded channel, with cooperative graceful
//! shutdown wired to Ctrl-C.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};
use tracing::{info, warn};

use crate::app::{App, Engine};
use crate::bridge::AsyncBridge;
use crate::conn;
use crate::error::{Error, Result};
use crate::perf;

const DRAIN_DEADLINE: Duration = Duration::from_secs(30);
const TASK_DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Cooperative shutdown switch. Clone freely; `trigger` is idempotent.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(crate) fn as_flag(&self) -> &AtomicBool {
        &self.flag
    }
}

/// Entry point: bind and serve an [`App`].
pub struct Server;

impl Server {
    /// Bind the configured endpoint without serving yet. Useful for
    /// embedding and tests (bind port 0, read back the real address).
    pub fn bind(app: App) -> Result<BoundServer> {
        perf::init_date_cache();
        let engine = Arc::new(app.freeze()?);
        let listener = make_listener(&engine.config().server_addr())?;
        let addr = listener.local_addr()?;
        info!(%addr, workers = engine.config().worker_threads, "felis listening");
        Ok(BoundServer {
            engine,
            listener,
            shutdown: ShutdownHandle::new(),
        })
    }

    /// Bind and serve until a shutdown signal arrives. Registers the
    /// OS signal handler so applications do not have to.
    pub fn serve(app: App) -> Result<()> {
        let bound = Self::bind(app)?;
        let handle = bound.shutdown_handle();
        ctrlc::set_handler(move || {
            info!("shutdown signal received; draining");
            handle.trigger();
        })
        .map_err(|e| Error::Internal(format!("failed to register signal handler: {}", e)))?;
        bound.run()?;
        // The bridge runtime belongs to the process, not one server;
        // only the signal-driven path tears it down.
        AsyncBridge::global().shutdown();
        Ok(())
    }
}

/// A bound listener plus the frozen engine, ready to run.
pub struct BoundServer {
    engine: Arc<Engine>,
    listener: TcpListener,
    shutdown: ShutdownHandle,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Accept loop: runs until the shutdown handle fires, then drains
    /// in-flight connections, the task queue, and the bridge runtime.
    pub fn run(self) -> Result<()> {
        let BoundServer {
            engine,
            listener,
            shutdown,
        } = self;
        let config = engine.config().clone();
        let metrics = engine.context().metrics.clone();
        let workers = config.worker_threads.max(1);

        let (conn_tx, conn_rx) = crossbeam_channel::bounded::<TcpStream>(workers * 2);

        let core_ids = if config.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = conn_rx.clone();
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            let metrics = metrics.clone();
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();

            let handle = std::thread::Builder::new()
                .name(format!("felis-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    while let Ok(stream) = rx.recv() {
                        metrics.inc_conn();
                        conn::handle_connection(stream, &engine, shutdown.as_flag());
                        metrics.dec_conn();
                    }
                })
                .map_err(|e| Error::Internal(format!("failed to spawn worker: {}", e)))?;
            handles.push(handle);
        }

        // Periodic counter pulse.
        {
            let metrics = metrics.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("felis-metrics".to_string())
                .spawn(move || {
                    while !shutdown.is_triggered() {
                        std::thread::sleep(Duration::from_secs(5));
                        if shutdown.is_triggered() {
                            break;
                        }
                        let snap = metrics.snapshot();
                        info!(
                            active = snap.active_conns,
                            requests = snap.req_count,
                            bytes = snap.bytes_written,
                            "server stats"
                        );
                    }
                })
                .ok();
        }

        listener.set_nonblocking(true)?;
        while !shutdown.is_triggered() {
            match listener.accept() {
                Ok((stream, _peer)) => {
                    if stream.set_nonblocking(false).is_err() {
                        continue;
                    }
                    // Blocking send is the back-pressure: a full pool
                    // slows accepts rather than piling up connections.
                    if conn_tx.send(stream).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }

        info!("acceptor stopped; draining connections");
        drop(conn_tx);

        let deadline = Instant::now() + DRAIN_DEADLINE;
        while metrics.snapshot().active_conns > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(25));
        }
        for handle in handles {
            if metrics.snapshot().active_conns == 0 {
                let _ = handle.join();
            }
            // Stragglers hold keep-alive sockets; they exit with the
            // process once the drain deadline has passed.
        }

        engine.context().tasks.shutdown(TASK_DRAIN_DEADLINE);
        info!("server stopped");
        Ok(())
    }
}

fn make_listener(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Internal(format!("cannot resolve listen address {}", addr)))?;

    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}
