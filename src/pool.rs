// src/pool.rs
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ServerConf;
use crate::error::{EngineError, EngineResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// stop_num protocol: 0 = running, k > 0 = exactly k workers retire after
/// their current wait, STOP_ALL = full shutdown (drain queue first).
const STOP_ALL: i32 = -1;

#[derive(Debug, Clone)]
pub struct PoolConf {
    pub min_workers: usize,
    pub max_workers: usize,
    pub dynamic: bool,
    pub manager_interval: Duration,
    pub busy_threshold: usize,
    pub idle_threshold: usize,
    pub status_times: u32,
    pub adjust_step: usize,
}

impl Default for PoolConf {
    fn default() -> Self {
        Self {
            min_workers: 4,
            max_workers: 16,
            dynamic: true,
            manager_interval: Duration::from_secs(10),
            busy_threshold: 100,
            idle_threshold: 10,
            status_times: 3,
            adjust_step: 1,
        }
    }
}

impl From<&ServerConf> for PoolConf {
    fn from(conf: &ServerConf) -> Self {
        Self {
            min_workers: conf.pool_min_workers,
            max_workers: conf.pool_max_workers,
            dynamic: conf.pool_dynamic,
            manager_interval: Duration::from_millis(conf.pool_manager_interval_ms),
            busy_threshold: conf.pool_busy_threshold,
            idle_threshold: conf.pool_idle_threshold,
            status_times: conf.pool_status_times,
            adjust_step: conf.pool_adjust_step,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Adjust {
    Grow,
    Shrink,
}

/// Queue-length hysteresis. Consecutive busy (or idle) samples must reach
/// `status_times` before an adjustment fires; a sample in the normal band
/// resets both counters, which is what prevents oscillation.
pub(crate) struct SizingPolicy {
    busy_threshold: usize,
    idle_threshold: usize,
    status_times: u32,
    busy_times: u32,
    idle_times: u32,
}

impl SizingPolicy {
    pub(crate) fn new(conf: &PoolConf) -> Self {
        Self {
            busy_threshold: conf.busy_threshold,
            idle_threshold: conf.idle_threshold,
            status_times: conf.status_times,
            busy_times: 0,
            idle_times: 0,
        }
    }

    pub(crate) fn observe(&mut self, queue_len: usize) -> Option<Adjust> {
        if queue_len > self.busy_threshold {
            self.busy_times += 1;
            self.idle_times = 0;
        } else if queue_len < self.idle_threshold {
            self.idle_times += 1;
            self.busy_times = 0;
        } else {
            self.busy_times = 0;
            self.idle_times = 0;
        }

        if self.busy_times >= self.status_times {
            Some(Adjust::Grow)
        } else if self.idle_times >= self.status_times {
            Some(Adjust::Shrink)
        } else {
            None
        }
    }
}

struct PoolInner {
    conf: PoolConf,
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    stop_num: AtomicI32,
    /// Worker ids that have returned and are waiting to be joined.
    exited: Mutex<Vec<u64>>,
    workers: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
    live: AtomicUsize,
    mgr_gate: (Mutex<bool>, Condvar),
    mgr_handle: Mutex<Option<JoinHandle<()>>>,
}

/// FIFO task pool with an optional sizing manager.
///
/// Partial shutdown (scale-down) tells exactly K workers to exit after
/// their current wait returns; a worker mid-task always finishes it first.
/// Full shutdown additionally drains the queue before any worker exits —
/// submitted tasks are never dropped — and rejects new submissions.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

pub struct TaskHandle<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task delivers its result.
    pub fn wait(self) -> EngineResult<T> {
        self.rx.recv().map_err(|_| EngineError::TaskLost)
    }
}

impl ThreadPool {
    pub fn new(conf: PoolConf) -> Self {
        let inner = Arc::new(PoolInner {
            conf: conf.clone(),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stop_num: AtomicI32::new(0),
            exited: Mutex::new(Vec::new()),
            workers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            mgr_gate: (Mutex::new(false), Condvar::new()),
            mgr_handle: Mutex::new(None),
        });

        for _ in 0..conf.min_workers {
            PoolInner::spawn_worker(&inner);
        }
        if conf.dynamic {
            let mgr_inner = inner.clone();
            let handle = thread::Builder::new()
                .name("ravel-pool-mgr".to_string())
                .spawn(move || PoolInner::manager_main(mgr_inner));
            if let Ok(h) = handle {
                *inner.mgr_handle.lock().unwrap() = Some(h);
            }
        }

        Self { inner }
    }

    /// Enqueue a unit of work. Fails once full shutdown has begun.
    pub fn submit<F, T>(&self, f: F) -> EngineResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        {
            let mut q = self.inner.queue.lock().unwrap();
            if self.inner.stop_num.load(Ordering::Acquire) == STOP_ALL {
                return Err(EngineError::PoolStopped);
            }
            q.push_back(Box::new(move || {
                let out = f();
                let _ = tx.send(out);
            }));
        }
        self.inner.available.notify_one();
        Ok(TaskHandle { rx })
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Workers spawned and not yet joined.
    pub fn worker_count(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Full shutdown: stop the manager, drain the queue, join every worker.
    pub fn shutdown(&self) {
        // manager first, so it cannot resize a pool that is going away
        {
            let (lock, cvar) = &self.inner.mgr_gate;
            *lock.lock().unwrap() = true;
            cvar.notify_one();
        }
        if let Some(h) = self.inner.mgr_handle.lock().unwrap().take() {
            let _ = h.join();
        }

        {
            let _q = self.inner.queue.lock().unwrap();
            self.inner.stop_num.store(STOP_ALL, Ordering::Release);
        }
        self.inner.available.notify_all();

        let handles: Vec<_> = {
            let mut ws = self.inner.workers.lock().unwrap();
            ws.drain().collect()
        };
        for (_, h) in handles {
            let _ = h.join();
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
        }
        self.inner.exited.lock().unwrap().clear();
    }
}

impl PoolInner {
    fn spawn_worker(inner: &Arc<PoolInner>) {
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let worker_inner = inner.clone();
        let handle = thread::Builder::new()
            .name(format!("ravel-pool-{}", id))
            .spawn(move || PoolInner::worker_main(worker_inner, id));

        match handle {
            Ok(h) => {
                inner.workers.lock().unwrap().insert(id, h);
                inner.live.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => tracing::error!("failed to spawn pool worker: {}", e),
        }
    }

    fn worker_main(inner: Arc<PoolInner>, id: u64) {
        loop {
            let task = {
                let mut q = inner.queue.lock().unwrap();
                loop {
                    let stop = inner.stop_num.load(Ordering::Acquire);
                    if stop > 0 {
                        // partial scale-down: claim one retirement slot
                        if inner
                            .stop_num
                            .compare_exchange(stop, stop - 1, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            drop(q);
                            inner.exited.lock().unwrap().push(id);
                            return;
                        }
                        continue; // raced another worker, re-read
                    }
                    if stop == STOP_ALL && q.is_empty() {
                        // full shutdown, queue drained
                        drop(q);
                        inner.exited.lock().unwrap().push(id);
                        return;
                    }
                    if let Some(task) = q.pop_front() {
                        break task;
                    }
                    q = inner.available.wait(q).unwrap();
                }
            };

            // a panicking task must not take the worker down with it
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::error!("pool worker {}: task panicked", id);
            }
        }
    }

    fn manager_main(inner: Arc<PoolInner>) {
        let mut policy = SizingPolicy::new(&inner.conf);

        loop {
            {
                let (lock, cvar) = &inner.mgr_gate;
                let stop = lock.lock().unwrap();
                let (stop, _timeout) = cvar
                    .wait_timeout_while(stop, inner.conf.manager_interval, |s| !*s)
                    .unwrap();
                if *stop {
                    return;
                }
            }

            // finish the previous adjustment before sampling again
            if !PoolInner::join_exited(&inner) {
                continue;
            }

            let queue_len = inner.queue.lock().unwrap().len();
            match policy.observe(queue_len) {
                Some(Adjust::Grow) => PoolInner::scale_up(&inner),
                Some(Adjust::Shrink) => PoolInner::scale_down(&inner),
                None => {}
            }
        }
    }

    /// Join workers that have retired since the last pass. Returns true
    /// when no retirement is still in flight.
    fn join_exited(inner: &Arc<PoolInner>) -> bool {
        if inner.stop_num.load(Ordering::Acquire) > 0 {
            return false; // signalled workers have not all exited yet
        }

        let ids: Vec<u64> = std::mem::take(&mut *inner.exited.lock().unwrap());
        if ids.is_empty() {
            return true;
        }

        let mut ws = inner.workers.lock().unwrap();
        for id in ids {
            if let Some(h) = ws.remove(&id) {
                let _ = h.join();
                inner.live.fetch_sub(1, Ordering::AcqRel);
            }
        }
        false
    }

    fn scale_up(inner: &Arc<PoolInner>) {
        let live = inner.live.load(Ordering::Acquire);
        let step = inner
            .conf
            .adjust_step
            .min(inner.conf.max_workers.saturating_sub(live));
        if step == 0 {
            return;
        }
        tracing::debug!("pool busy, growing by {} (live {})", step, live);
        for _ in 0..step {
            PoolInner::spawn_worker(inner);
        }
    }

    fn scale_down(inner: &Arc<PoolInner>) {
        let live = inner.live.load(Ordering::Acquire);
        let step = inner
            .conf
            .adjust_step
            .min(live.saturating_sub(inner.conf.min_workers));
        if step == 0 {
            return;
        }
        tracing::debug!("pool idle, retiring {} (live {})", step, live);
        {
            let _q = inner.queue.lock().unwrap();
            if inner.stop_num.load(Ordering::Acquire) == 0 {
                inner.stop_num.store(step as i32, Ordering::Release);
            }
        }
        inner.available.notify_all();
    }
}
