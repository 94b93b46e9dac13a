// src/server.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::ServerConf;
use crate::conn::FdGuard;
use crate::error::{EngineError, EngineResult};
use crate::metrics::EngineMetrics;
use crate::pool::{PoolConf, ThreadPool};
use crate::reactor::{Reactor, ReactorHandle};
use crate::router::Router;
use crate::syscalls::{self, EPOLLIN, Epoll, epoll_event};

/// The engine's front door: binds the listener, spawns the reactor
/// threads and the shared worker pool, and runs the accept loop on the
/// calling thread until it is told to stop.
pub struct Server {
    conf: ServerConf,
}

impl Server {
    pub fn new(conf: ServerConf) -> EngineResult<Self> {
        conf.validate()?;
        Ok(Self { conf })
    }

    /// Serve until Ctrl-C. For programmatic control use `run` with your
    /// own shutdown flag.
    pub fn serve(self, router: Router) -> EngineResult<()> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("received SIGINT, shutting down");
            flag.store(true, Ordering::SeqCst);
        })
        .map_err(|e| EngineError::Signal(e.to_string()))?;

        self.run(router, shutdown)
    }

    /// Blocks until `shutdown` is set. Teardown order: the acceptor stops
    /// taking sockets, reactors drain their in-flight tasks and close
    /// their connections, then the pool drains and joins.
    pub fn run(self, router: Router, shutdown: Arc<AtomicBool>) -> EngineResult<()> {
        let conf = Arc::new(self.conf);
        let router = Arc::new(router);
        let metrics = Arc::new(EngineMetrics::new());
        let pool = ThreadPool::new(PoolConf::from(&*conf));

        let listen = FdGuard::new(syscalls::create_listen_socket(
            &conf.host,
            conf.port,
            conf.backlog,
        )?);

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles: Vec<ReactorHandle> = Vec::with_capacity(conf.reactors);
        let mut threads = Vec::with_capacity(conf.reactors);

        for i in 0..conf.reactors {
            let (reactor, handle) = Reactor::new(
                i,
                conf.clone(),
                router.clone(),
                pool.clone(),
                metrics.clone(),
            )?;
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };
            let flag = shutdown.clone();

            let thread = thread::Builder::new()
                .name(format!("ravel-reactor-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!("reactor {} pinned to cpu {}", i, id.id);
                        }
                    }
                    reactor.run(flag);
                })?;

            handles.push(handle);
            threads.push(thread);
        }

        // periodic stats through the logging sink; detached like the
        // reactors' owner, it ends with the process
        let report_metrics = metrics.clone();
        let report_flag = shutdown.clone();
        thread::Builder::new()
            .name("ravel-metrics".to_string())
            .spawn(move || {
                while !report_flag.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_secs(5));
                    if report_flag.load(Ordering::Acquire) {
                        break;
                    }
                    let (active, requests, bytes) = report_metrics.snapshot();
                    tracing::info!(
                        "active connections: {} | total requests: {} | bytes sent: {}",
                        active,
                        requests,
                        bytes
                    );
                }
            })
            .ok();

        tracing::info!(
            "listening on {}:{} ({} reactors, pool {}..{})",
            conf.host,
            conf.port,
            conf.reactors,
            conf.pool_min_workers,
            conf.pool_max_workers
        );

        let accept_result = accept_loop(&listen, &handles, &conf, &shutdown);

        for handle in &handles {
            handle.stop();
        }
        for thread in threads {
            let _ = thread.join();
        }
        pool.shutdown();

        tracing::info!("server shut down");
        accept_result
    }
}

/// Own the listening socket and feed accepted connections round-robin to
/// the reactors, draining the accept queue greedily on every wakeup.
fn accept_loop(
    listen: &FdGuard,
    handles: &[ReactorHandle],
    conf: &ServerConf,
    shutdown: &AtomicBool,
) -> EngineResult<()> {
    let epoll = Epoll::new()?;
    epoll.add(
        listen.raw(),
        0,
        EPOLLIN,
        false,
        conf.edge_trigger_listener,
    )?;

    let mut events = vec![epoll_event { events: 0, u64: 0 }; 16];
    let mut next = 0usize;

    while !shutdown.load(Ordering::Acquire) {
        let n = match epoll.wait(&mut events, conf.wait_timeout_ms) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("acceptor: wait failed: {}", e);
                return Err(e);
            }
        };
        if n == 0 {
            continue;
        }

        loop {
            match syscalls::accept_connection(listen.raw()) {
                Ok(Some(fd)) => {
                    handles[next].push_conn(FdGuard::new(fd));
                    next = (next + 1) % handles.len();
                }
                Ok(None) => break, // queue drained
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    Ok(())
}
