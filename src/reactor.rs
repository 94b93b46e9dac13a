// src/reactor.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::ServerConf;
use crate::conn::{Connection, FdGuard, RawFd, StepKind, StepOutcome};
use crate::error::EngineResult;
use crate::metrics::EngineMetrics;
use crate::pool::ThreadPool;
use crate::router::Router;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, epoll_event,
};
use crate::timer::TimerManager;

/// Token reserved for the wake pipe; connection tokens are their fds.
const WAKE_TOKEN: u64 = u64::MAX;

/// A finished parse/respond step coming back from the pool.
pub struct Completion {
    pub fd: RawFd,
    pub conn: Connection,
    pub outcome: StepOutcome,
}

/// Connection table slot. `Dealing` means the connection is owned by an
/// in-flight task; nothing else may touch it until the completion is
/// applied, which is how "at most one task per connection" is enforced
/// structurally rather than with a lock.
enum Slot {
    Ready(Connection),
    Dealing { close_on_done: bool },
}

struct Inbox {
    new_socks: Vec<FdGuard>,
    completions: Vec<Completion>,
    stop: bool,
}

struct HandleShared {
    inbox: Mutex<Inbox>,
    wake_fd: FdGuard,
}

/// Cross-thread entry point into a reactor: a mutex-protected pending
/// list plus a byte-oriented wake signal. Only the reactor thread itself
/// ever mutates its multiplexer registrations.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<HandleShared>,
}

impl ReactorHandle {
    /// Hand a freshly accepted socket to this reactor.
    pub fn push_conn(&self, sock: FdGuard) {
        self.shared.inbox.lock().unwrap().new_socks.push(sock);
        syscalls::send_wake(self.shared.wake_fd.raw());
    }

    /// Return a connection from a finished task.
    pub fn push_completion(&self, completion: Completion) {
        self.shared
            .inbox
            .lock()
            .unwrap()
            .completions
            .push(completion);
        syscalls::send_wake(self.shared.wake_fd.raw());
    }

    /// Ask the reactor to drain in-flight work and exit.
    pub fn stop(&self) {
        self.shared.inbox.lock().unwrap().stop = true;
        syscalls::send_wake(self.shared.wake_fd.raw());
    }
}

/// Single-threaded event loop: one epoll instance, the connections it
/// exclusively owns, and their idle deadlines. Ready events dispatch the
/// connection into the shared pool; one-shot interest keeps the socket
/// silent until the completion re-arms it.
pub struct Reactor {
    id: usize,
    epoll: Epoll,
    wake_rx: FdGuard,
    handle: ReactorHandle,
    table: HashMap<RawFd, Slot>,
    timers: TimerManager,
    conf: Arc<ServerConf>,
    router: Arc<Router>,
    pool: ThreadPool,
    metrics: Arc<EngineMetrics>,
    dealing: usize,
    stopping: bool,
}

impl Reactor {
    pub fn new(
        id: usize,
        conf: Arc<ServerConf>,
        router: Arc<Router>,
        pool: ThreadPool,
        metrics: Arc<EngineMetrics>,
    ) -> EngineResult<(Self, ReactorHandle)> {
        let epoll = Epoll::new()?;
        let (rx, tx) = syscalls::create_wake_pipe()?;
        let wake_rx = FdGuard::new(rx);
        let wake_tx = FdGuard::new(tx);
        epoll.add(wake_rx.raw(), WAKE_TOKEN, EPOLLIN, false, false)?;

        let handle = ReactorHandle {
            shared: Arc::new(HandleShared {
                inbox: Mutex::new(Inbox {
                    new_socks: Vec::new(),
                    completions: Vec::new(),
                    stop: false,
                }),
                wake_fd: wake_tx,
            }),
        };

        let reactor = Self {
            id,
            epoll,
            wake_rx,
            handle: handle.clone(),
            table: HashMap::new(),
            timers: TimerManager::new(),
            conf,
            router,
            pool,
            metrics,
            dealing: 0,
            stopping: false,
        };

        Ok((reactor, handle))
    }

    pub fn run(mut self, shutdown: Arc<AtomicBool>) {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; self.conf.max_events];
        tracing::debug!("reactor {} entering event loop", self.id);

        loop {
            if shutdown.load(Ordering::Acquire) {
                self.stopping = true;
            }
            if self.stopping && self.dealing == 0 {
                break;
            }

            let n = match self.epoll.wait(&mut events, self.conf.wait_timeout_ms) {
                Ok(n) => n,
                Err(e) => {
                    // EINTR is absorbed by the wrapper; anything else here
                    // is a fatal multiplexer failure
                    tracing::error!("reactor {}: wait failed: {}", self.id, e);
                    break;
                }
            };

            for ev in &events[..n] {
                let token = ev.u64;
                if token == WAKE_TOKEN {
                    syscalls::drain_wake(self.wake_rx.raw());
                    self.drain_inbox();
                    continue;
                }

                let fd = token as RawFd;
                let flags = ev.events;
                if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
                    self.close_or_defer(fd);
                } else if flags & EPOLLIN as u32 != 0 {
                    self.dispatch(fd, StepKind::Read);
                } else if flags & EPOLLOUT as u32 != 0 {
                    self.dispatch(fd, StepKind::Write);
                }
            }

            self.sweep_timers();
        }

        self.teardown();
        tracing::debug!("reactor {} exited", self.id);
    }

    /// Pull everything the other threads left for us: new sockets to
    /// register, finished tasks to apply, and the stop request.
    fn drain_inbox(&mut self) {
        let (socks, completions, stop) = {
            let mut inbox = self.handle.shared.inbox.lock().unwrap();
            (
                std::mem::take(&mut inbox.new_socks),
                std::mem::take(&mut inbox.completions),
                inbox.stop,
            )
        };

        if stop {
            self.stopping = true;
        }
        for completion in completions {
            self.apply_completion(completion);
        }
        for sock in socks {
            self.register_new(sock);
        }
    }

    fn register_new(&mut self, sock: FdGuard) {
        if self.stopping {
            return; // guard drops, socket closes
        }

        let fd = sock.raw();
        match self.epoll.add(
            fd,
            fd as u64,
            EPOLLIN | EPOLLRDHUP,
            true,
            self.conf.edge_trigger_conns,
        ) {
            Ok(()) => {
                let conn = Connection::new(sock, self.conf.read_chunk_size);
                self.arm_timer(fd);
                self.table.insert(fd, Slot::Ready(conn));
                self.metrics.inc_conn();
            }
            Err(e) => {
                tracing::warn!("reactor {}: failed to register fd {}: {}", self.id, fd, e);
            }
        }
    }

    /// Move the connection out of its slot and into a pool task. While the
    /// slot is `Dealing` the fd is disarmed (one-shot), so no second
    /// dispatch can happen.
    fn dispatch(&mut self, fd: RawFd, kind: StepKind) {
        // already owned by a task, or a stale event for a gone fd
        if !matches!(self.table.get(&fd), Some(Slot::Ready(_))) {
            return;
        }
        if self.stopping {
            // draining: no new work is dispatched, idle connections go down
            self.close_now(fd);
            return;
        }
        let conn = match self.table.insert(fd, Slot::Dealing { close_on_done: false }) {
            Some(Slot::Ready(conn)) => conn,
            _ => return,
        };

        self.dealing += 1;
        let router = self.router.clone();
        let conf = self.conf.clone();
        let metrics = self.metrics.clone();
        let handle = self.handle.clone();

        let submitted = self.pool.submit(move || {
            let mut conn = conn;
            let outcome = conn.step(kind, &router, &conf, &metrics);
            handle.push_completion(Completion { fd, conn, outcome });
        });

        if submitted.is_err() {
            // pool is shutting down; the dropped closure closed the socket
            self.dealing -= 1;
            self.table.remove(&fd);
            self.timers.remove(fd);
            self.metrics.dec_conn();
        }
    }

    fn apply_completion(&mut self, completion: Completion) {
        let Completion { fd, conn, outcome } = completion;
        self.dealing = self.dealing.saturating_sub(1);

        let close_flagged = matches!(
            self.table.get(&fd),
            Some(Slot::Dealing { close_on_done: true })
        );

        if self.stopping || close_flagged || outcome == StepOutcome::Close {
            self.remove_entry(fd);
            drop(conn);
            return;
        }

        let interests = match outcome {
            StepOutcome::AwaitRead => EPOLLIN | EPOLLRDHUP,
            StepOutcome::AwaitWrite => EPOLLOUT | EPOLLRDHUP,
            StepOutcome::Close => unreachable!(),
        };

        match self
            .epoll
            .modify(fd, fd as u64, interests, true, self.conf.edge_trigger_conns)
        {
            Ok(()) => {
                self.arm_timer(fd);
                self.table.insert(fd, Slot::Ready(conn));
            }
            Err(e) => {
                tracing::warn!("reactor {}: re-arm of fd {} failed: {}", self.id, fd, e);
                self.remove_entry(fd);
                drop(conn);
            }
        }
    }

    /// Hangup/error events close idle connections immediately; a dealing
    /// connection is only flagged, because a task still owns its buffers.
    fn close_or_defer(&mut self, fd: RawFd) {
        match self.table.get_mut(&fd) {
            Some(Slot::Ready(_)) => self.close_now(fd),
            Some(Slot::Dealing { close_on_done }) => *close_on_done = true,
            None => {}
        }
    }

    fn close_now(&mut self, fd: RawFd) {
        if let Some(slot) = self.table.remove(&fd) {
            self.epoll.delete(fd).ok();
            self.timers.remove(fd);
            self.metrics.dec_conn();
            drop(slot); // Ready slot drops the fd guard, closing the socket
        }
    }

    /// Bookkeeping removal for a connection whose fd is owned elsewhere
    /// (completion path).
    fn remove_entry(&mut self, fd: RawFd) {
        self.table.remove(&fd);
        self.epoll.delete(fd).ok();
        self.timers.remove(fd);
        self.metrics.dec_conn();
    }

    fn arm_timer(&mut self, fd: RawFd) {
        let expire = Instant::now() + Duration::from_millis(self.conf.idle_timeout_ms);
        self.timers.add_or_refresh(fd, expire);
    }

    /// Reap idle connections. A connection mid-task gets a fresh window
    /// instead of being destroyed under the task's feet.
    fn sweep_timers(&mut self) {
        let expired = self.timers.sweep(Instant::now());
        for fd in expired {
            match self.table.get(&fd) {
                Some(Slot::Ready(_)) => {
                    tracing::debug!("reactor {}: idle timeout on fd {}", self.id, fd);
                    self.close_now(fd);
                }
                Some(Slot::Dealing { .. }) => self.arm_timer(fd),
                None => {}
            }
        }
    }

    fn teardown(&mut self) {
        // late completions keep their connections alive until the inbox
        // itself is dropped; everything registered here goes down now
        let fds: Vec<RawFd> = self.table.keys().copied().collect();
        for fd in fds {
            if let Some(slot) = self.table.remove(&fd) {
                if matches!(slot, Slot::Ready(_)) {
                    self.metrics.dec_conn();
                }
                self.epoll.delete(fd).ok();
                drop(slot);
            }
        }
        self.timers = TimerManager::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dealing_slot_blocks_second_dispatch() {
        // the structural no-double-dispatch guarantee: once a connection
        // moves into a task, its slot no longer yields it
        let mut table: HashMap<RawFd, Slot> = HashMap::new();
        let conn = Connection::new(FdGuard::new(-1), 64);
        table.insert(5, Slot::Ready(conn));

        let first = match table.insert(5, Slot::Dealing { close_on_done: false }) {
            Some(Slot::Ready(c)) => Some(c),
            _ => None,
        };
        assert!(first.is_some());

        let second = match table.get(&5) {
            Some(Slot::Ready(_)) => true,
            _ => false,
        };
        assert!(!second, "second dispatch must see the Dealing slot");
    }
}
