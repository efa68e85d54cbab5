use crate::pool::Shared;
use crate::task::Task;
use crate::utils::ScopeGuard;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::thread;
use tracing::{error, trace};

thread_local! {
    // Address of the `Shared` owning this thread, null outside of worker threads.
    static CURRENT_POOL: Cell<*const Shared> = const { Cell::new(ptr::null()) };
}

/// Whether the calling thread is a worker of `shared`.
pub(crate) fn is_worker_of(shared: &Arc<Shared>) -> bool {
    CURRENT_POOL.with(|current| ptr::eq(current.get(), Arc::as_ptr(shared)))
}

pub(crate) enum Message {
    Run(Box<dyn Task>),
    Terminate,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Run(_) => f.debug_tuple("Run").field(&"<task>").finish(),
            Message::Terminate => f.write_str("Terminate"),
        }
    }
}

/// Single-slot inbound channel of a worker.
///
/// Whoever removes a worker from the idle registry is its only sender until
/// the worker registers again, so the slot never holds two messages.
#[derive(Debug, Default)]
struct Mailbox {
    slot: Mutex<Option<Message>>,
    ready: Condvar,
}

impl Mailbox {
    #[track_caller]
    fn send(&self, msg: Message) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "worker mailbox already holds {:?}", slot);
        *slot = Some(msg);
        self.ready.notify_one();
    }

    fn recv(&self) -> Message {
        let mut slot = self.slot.lock();
        loop {
            if let Some(msg) = slot.take() {
                return msg;
            }
            // Loop on spurious wakeups.
            self.ready.wait(&mut slot);
        }
    }

    fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// State of one pooled worker.
///
/// The struct outlives the thread that runs it: once the thread leaves its
/// loop the struct may go back to the pool's recycle cache and be handed to a
/// future thread.
#[derive(Debug)]
pub(crate) struct Worker {
    id: u64,
    mailbox: Mailbox,
}

impl Worker {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            mailbox: Mailbox::default(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Hands the next task to an idle worker, waking its loop.
    pub(crate) fn assign(&self, task: Box<dyn Task>) {
        self.mailbox.send(Message::Run(task));
    }

    /// Asks an idle worker to leave its loop.
    pub(crate) fn terminate(&self) {
        self.mailbox.send(Message::Terminate);
    }

    pub(crate) fn has_pending_message(&self) -> bool {
        !self.mailbox.is_empty()
    }
}

/// Starts an OS thread running `worker` with `task` as its first job.
///
/// The caller must already have reserved a slot for this worker in `shared`.
pub(crate) fn spawn_worker_thread(
    shared: &Arc<Shared>,
    worker: Arc<Worker>,
    task: Box<dyn Task>,
) -> io::Result<()> {
    let mut builder = thread::Builder::new().name(shared.cfg.thread_name.0());

    if let Some(stack_size) = shared.cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let shared = Arc::clone(shared);

    // The join handle is dropped on purpose, graceful shutdown waits on the
    // pool's live worker count instead.
    builder
        .spawn(move || {
            CURRENT_POOL.with(|current| current.set(Arc::as_ptr(&shared)));
            trace!(worker = worker.id(), "worker started");

            worker_loop(&shared, &worker, task);
        })
        .map(|_| ())
}

fn worker_loop(shared: &Shared, worker: &Arc<Worker>, mut task: Box<dyn Task>) {
    // Runs on every exit path, including a panic escaping the handler.
    let _exit = ScopeGuard::new(|| shared.worker_exited(worker));

    loop {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            error!(
                worker = worker.id(),
                panic = panic_payload_as_str(&payload),
                "task panicked, worker exiting"
            );
            shared.notify_panic();
            return;
        }

        if let Err(e) = shared.register_idle(worker) {
            trace!(worker = worker.id(), reason = %e, "worker not re-registered");
            return;
        }

        match worker.mailbox.recv() {
            Message::Run(next) => task = next,
            Message::Terminate => {
                trace!(worker = worker.id(), "worker terminated");
                return;
            }
        }
    }
}

fn panic_payload_as_str(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<dyn Any>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    assert_impl_all!(Worker: Send, Sync);

    #[test]
    fn test_mailbox_delivers_across_threads() {
        let worker = Arc::new(Worker::new(1));
        let hits = Arc::new(AtomicUsize::new(0));

        let receiver = {
            let worker = Arc::clone(&worker);
            thread::spawn(move || {
                let mut runs = 0;
                loop {
                    match worker.mailbox.recv() {
                        Message::Run(task) => {
                            task.run();
                            runs += 1;
                        }
                        Message::Terminate => return runs,
                    }
                }
            })
        };

        for _ in 0..3 {
            // Wait until the previous message was consumed, a single slot
            // only holds one message at a time.
            while worker.has_pending_message() {
                thread::sleep(Duration::from_millis(1));
            }

            let hits = Arc::clone(&hits);
            worker.assign(Box::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
        }

        while worker.has_pending_message() {
            thread::sleep(Duration::from_millis(1));
        }
        worker.terminate();

        assert_eq!(receiver.join().unwrap(), 3);
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        assert!(!worker.has_pending_message());
    }

    #[test]
    fn test_panic_payload_as_str() {
        let payload = panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(panic_payload_as_str(&payload), "static message");

        let payload = panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_payload_as_str(&payload), "formatted 42");

        let payload = panic::catch_unwind(|| std::panic::panic_any(7_u32)).unwrap_err();
        assert_eq!(panic_payload_as_str(&payload), "Box<dyn Any>");
    }

    #[test]
    fn test_is_worker_of_outside_pool() {
        let shared = Arc::new(Shared::new(Default::default()));
        assert!(!is_worker_of(&shared));
    }
}
