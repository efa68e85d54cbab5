/// A unit of work executed on a pool worker.
///
/// Any `FnOnce() + Send + 'static` closure is a task. Types with richer state
/// can implement the trait directly:
///
/// ```
/// use idlepool::Task;
///
/// struct Flush {
///     bytes: Vec<u8>,
/// }
///
/// impl Task for Flush {
///     fn run(self: Box<Self>) {
///         drop(self.bytes);
///     }
/// }
/// ```
pub trait Task: Send + 'static {
    fn run(self: Box<Self>);
}

impl<F> Task for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// Binds an argument to a one-argument function, see `Pool::submit_with`.
pub(crate) struct WithArg<F, A> {
    pub(crate) func: F,
    pub(crate) arg: A,
}

impl<F, A> Task for WithArg<F, A>
where
    F: FnOnce(A) + Send + 'static,
    A: Send + 'static,
{
    fn run(self: Box<Self>) {
        let WithArg { func, arg } = *self;
        func(arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Add {
        counter: Arc<AtomicUsize>,
        n: usize,
    }

    impl Task for Add {
        fn run(self: Box<Self>) {
            self.counter.fetch_add(self.n, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_closure_and_struct_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let closure: Box<dyn Task> = Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        closure.run();

        let add: Box<dyn Task> = Box::new(Add {
            counter: Arc::clone(&counter),
            n: 10,
        });
        add.run();

        let with_arg: Box<dyn Task> = Box::new(WithArg {
            func: |(c, n): (Arc<AtomicUsize>, usize)| {
                c.fetch_add(n, Ordering::Relaxed);
            },
            arg: (Arc::clone(&counter), 100),
        });
        with_arg.run();

        assert_eq!(counter.load(Ordering::Relaxed), 111);
    }
}
