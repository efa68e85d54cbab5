//! Capacity-bounded pool of reusable worker threads.
//!
//! A submission is handed to the worker that has been idle the longest. If no
//! worker is idle and the pool is below capacity a new worker thread is
//! spawned, otherwise the submitter blocks until a worker frees up or the pool
//! closes. Each worker registers itself as idle after finishing a task and
//! waits in its single-slot mailbox for the next one. A reaper thread evicts
//! workers idle for longer than the survival time.

// Public API
mod builder;
pub use builder::{
    Builder, Config, DEFAULT_CAPACITY, DEFAULT_MIN_CLEANUP_INTERVAL, DEFAULT_SURVIVAL_TIME,
    MIN_CLEANUP_INTERVAL_FLOOR,
};

pub(crate) use builder::{PanicHandler, PoolConfig};

mod idle;
use idle::IdleRegistry;

mod reaper;
use reaper::Reaper;

mod worker;
use worker::{Worker, spawn_worker_thread};


use crate::error::PoolError;
use crate::task::{Task, WithArg};
use crate::utils::WaitGroup;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Upper bound on exited worker structs kept around for reuse.
const RECYCLE_LIMIT: usize = 256;

/// Everything guarded by the pool's state lock.
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) idle: IdleRegistry,

    /// Worker structs whose thread has left the worker loop.
    pub(crate) recycled: Vec<Arc<Worker>>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cfg: PoolConfig,

    capacity: AtomicUsize,

    /// Live workers, idle or busy.
    running: AtomicUsize,

    /// Only ever flipped while holding `state`, so checking it under the lock
    /// is race free. Lock-free reads are a fast path.
    closed: AtomicBool,

    next_worker_id: AtomicU64,

    pub(crate) state: Mutex<State>,

    /// Signals submitters blocked at capacity.
    available: Condvar,

    /// The reaper sleeps on this between ticks.
    pub(crate) reaper_wakeup: Condvar,

    /// One count per live worker, `close_graceful` waits for zero.
    live: WaitGroup,

    panic_handler: RwLock<Option<PanicHandler>>,
}

impl Shared {
    pub(crate) fn new(cfg: PoolConfig) -> Self {
        Self {
            capacity: AtomicUsize::new(cfg.capacity),
            running: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            next_worker_id: AtomicU64::new(0),
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            reaper_wakeup: Condvar::new(),
            live: WaitGroup::new(),
            panic_handler: RwLock::new(cfg.panic_handler.clone()),
            cfg,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    fn cap(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    // Negative while more workers are alive than the capacity allows.
    // Capacities beyond `isize::MAX` saturate.
    fn free(&self) -> isize {
        let cap = isize::try_from(self.cap()).unwrap_or(isize::MAX);
        let len = isize::try_from(self.len()).unwrap_or(isize::MAX);
        cap.saturating_sub(len)
    }

    fn below_capacity(&self) -> bool {
        self.len() < self.cap()
    }

    fn over_capacity(&self) -> bool {
        self.len() > self.cap()
    }

    // Must be called with the state lock held, so that a graceful close either
    // sees this worker in the live count or rejects the submission.
    fn reserve_slot(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
        self.live.add(1);
    }

    fn release_slot(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
        {
            let _state = self.state.lock();
            self.available.notify_one();
        }
        self.live.done();
    }

    fn new_worker(&self) -> Arc<Worker> {
        Arc::new(Worker::new(
            self.next_worker_id.fetch_add(1, Ordering::Relaxed),
        ))
    }

    /// Makes a worker that just finished a task available for the next one.
    ///
    /// The worker is visible to submitters and the reaper only once this
    /// returns `Ok`, at which point it must wait on its mailbox.
    pub(crate) fn register_idle(&self, worker: &Arc<Worker>) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        if self.over_capacity() {
            warn!(
                worker = worker.id(),
                live = self.len(),
                capacity = self.cap(),
                "capacity overshoot, retiring worker"
            );
            return Err(PoolError::Overload);
        }

        let mut state = self.state.lock();
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        // Timestamp under the lock, the registry is ordered by idle time.
        let now = Instant::now();
        state.idle.push(Arc::clone(worker), now);
        self.available.notify_one();
        Ok(())
    }

    /// Exit bookkeeping of a worker thread. Runs exactly once per spawned
    /// worker, after it left its loop.
    pub(crate) fn worker_exited(&self, worker: &Arc<Worker>) {
        self.running.fetch_sub(1, Ordering::AcqRel);
        trace!(worker = worker.id(), live = self.len(), "worker exited");

        {
            let mut state = self.state.lock();
            // The thread has left its loop and never touches `worker` again,
            // so the struct can be handed to a new thread right away.
            if !self.is_closed() && state.recycled.len() < RECYCLE_LIMIT {
                debug_assert!(!worker.has_pending_message());
                state.recycled.push(Arc::clone(worker));
            }
            self.available.notify_one();
        }

        self.live.done();
    }

    pub(crate) fn notify_panic(&self) {
        // Clone out so the handler runs without holding the lock.
        let handler = self.panic_handler.read().clone();
        if let Some(handler) = handler {
            (handler.0)();
        }
    }

    /// Transitions the pool to closed. Returns `false` if it already was.
    fn shutdown(&self) -> bool {
        if self.is_closed() {
            return false;
        }

        let _state = self.state.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        debug!(
            live = self.len(),
            "pool closing, waking blocked submitters and reaper"
        );
        self.available.notify_all();
        self.reaper_wakeup.notify_all();
        true
    }
}

/// A capacity-bounded pool of worker threads.
///
/// All methods take `&self`; share the pool between threads with an `Arc` or
/// scoped threads. Dropping the pool closes it without waiting, tasks already
/// running finish on their own.
pub struct Pool {
    shared: Arc<Shared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.cap())
            .field("running", &self.len())
            .field("idle", &self.idle())
            .field("closed", &self.is_closed())
            .field("survival_time", &self.shared.cfg.survival_time)
            .finish()
    }
}

impl Pool {
    /// Creates a pool from plain settings. See [`Pool::builder`] for the full
    /// set of options.
    pub fn new(config: Config) -> Result<Pool, PoolError> {
        Builder::from(config).try_build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_config(cfg: PoolConfig) -> Result<Pool, PoolError> {
        let shared = Arc::new(Shared::new(cfg));
        let reaper = Reaper::spawn(Arc::clone(&shared))?;

        debug!(
            capacity = shared.cfg.capacity,
            survival_time = ?shared.cfg.survival_time,
            min_cleanup_interval = ?shared.cfg.min_cleanup_interval,
            "pool started"
        );

        Ok(Pool {
            shared,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Submits a task.
    ///
    /// Reuses the longest idle worker, or spawns a new one while below
    /// capacity. At capacity the call blocks until a worker becomes available,
    /// there is no timeout. Returns [`PoolError::Closed`] if the pool is closed
    /// before the task could be handed off.
    pub fn submit<T: Task>(&self, task: T) -> Result<(), PoolError> {
        self.dispatch(Box::new(task))
    }

    /// Submits an already boxed task. `None` is rejected with
    /// [`PoolError::InvalidTask`].
    pub fn submit_dyn(&self, task: Option<Box<dyn Task>>) -> Result<(), PoolError> {
        let task = task.ok_or(PoolError::InvalidTask)?;
        self.dispatch(task)
    }

    /// Submits a function. `None` is rejected with
    /// [`PoolError::InvalidTaskFunc`].
    pub fn submit_func<F>(&self, func: Option<F>) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let func = func.ok_or(PoolError::InvalidTaskFunc)?;
        self.dispatch(Box::new(func))
    }

    /// Submits a one-argument function together with its argument.
    pub fn submit_with<F, A>(&self, func: F, arg: A) -> Result<(), PoolError>
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        self.dispatch(Box::new(WithArg { func, arg }))
    }

    fn dispatch(&self, task: Box<dyn Task>) -> Result<(), PoolError> {
        let shared = &self.shared;

        if shared.is_closed() {
            return Err(PoolError::Closed);
        }

        let mut state = shared.state.lock();

        // Every wakeup re-checks all conditions, it may be spurious or come
        // from a concurrent shutdown.
        loop {
            if shared.is_closed() {
                return Err(PoolError::Closed);
            }

            if let Some(worker) = state.idle.pop() {
                drop(state);
                trace!(worker = worker.id(), "reusing idle worker");
                worker.assign(task);
                return Ok(());
            }

            if shared.below_capacity() {
                let worker = state
                    .recycled
                    .pop()
                    .unwrap_or_else(|| shared.new_worker());
                shared.reserve_slot();
                drop(state);

                trace!(worker = worker.id(), "spawning worker");
                return spawn_worker_thread(shared, worker, task).map_err(|e| {
                    error!(error = %e, "failed to spawn worker thread");
                    shared.release_slot();
                    PoolError::Spawn(e)
                });
            }

            shared.available.wait(&mut state);
        }
    }

    /// Closes the pool without waiting for workers to exit.
    ///
    /// New submissions are rejected and blocked submitters return
    /// [`PoolError::Closed`]. Idle workers are terminated by the reaper, busy
    /// workers exit after their current task. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), PoolError> {
        self.shared.shutdown();
        Ok(())
    }

    /// Closes the pool and blocks until every worker thread has exited.
    ///
    /// Afterwards `len()` and `idle()` are zero for good.
    ///
    /// # Panics
    ///
    /// Panics when called from a task running on this pool, since the calling
    /// worker would wait for itself.
    #[track_caller]
    pub fn close_graceful(&self) -> Result<(), PoolError> {
        self.assert_not_own_worker();
        self.close()?;
        self.shared.live.wait();
        self.join_reaper();
        Ok(())
    }

    /// Like [`Pool::close_graceful`], but gives up after `timeout` with
    /// [`PoolError::ShutdownTimeout`]. The pool stays closed either way.
    #[track_caller]
    pub fn close_graceful_timeout(&self, timeout: Duration) -> Result<(), PoolError> {
        self.assert_not_own_worker();
        self.close()?;
        if !self.shared.live.wait_timeout(timeout) {
            warn!(
                remaining = self.shared.live.count(),
                ?timeout,
                "graceful shutdown timed out"
            );
            return Err(PoolError::ShutdownTimeout(timeout));
        }
        self.join_reaper();
        Ok(())
    }

    #[track_caller]
    fn assert_not_own_worker(&self) {
        assert!(
            !worker::is_worker_of(&self.shared),
            "cannot wait for pool shutdown from one of its own workers"
        );
    }

    fn join_reaper(&self) {
        if let Some(handle) = self.reaper.lock().take()
            && handle.join().is_err()
        {
            error!("reaper thread panicked");
        }
    }

    /// Changes the capacity. Shrinking never interrupts live workers, excess
    /// workers retire as they finish their tasks.
    pub fn adjust(&self, capacity: usize) {
        if self.cap() == capacity {
            return;
        }

        self.shared.capacity.store(capacity, Ordering::Release);
        debug!(capacity, "pool capacity adjusted");

        // Growing may let blocked submitters spawn.
        let _state = self.shared.state.lock();
        self.shared.available.notify_all();
    }

    /// Number of live workers, idle or busy.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cap(&self) -> usize {
        self.shared.cap()
    }

    /// `cap() - len()`. Negative after shrinking the capacity below the live
    /// worker count, until the excess workers retire.
    pub fn free(&self) -> isize {
        self.shared.free()
    }

    /// Number of workers waiting for a task.
    pub fn idle(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Sets the callback invoked after a task panics. It runs on the worker
    /// thread of the failed task, with no information about the task. That
    /// worker exits afterwards.
    pub fn set_panic_handler<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.panic_handler.write() = Some(PanicHandler(Arc::new(f)));
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}
