use crate::error::PoolError;
use crate::pool::Pool;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Default upper bound on live workers.
pub const DEFAULT_CAPACITY: usize = 100_000;

/// Default time a worker may stay idle before the reaper evicts it.
pub const DEFAULT_SURVIVAL_TIME: Duration = Duration::from_secs(1);

/// Default smallest interval between two reaper ticks.
pub const DEFAULT_MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(100);

/// Shorter cleanup intervals are raised to this value.
pub const MIN_CLEANUP_INTERVAL_FLOOR: Duration = Duration::from_millis(1);

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("idlepool-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Callback invoked once for every task that panics.
#[derive(Clone)]
pub(crate) struct PanicHandler(pub(crate) Arc<dyn Fn() + Send + Sync + 'static>);

impl fmt::Debug for PanicHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicHandler").field(&"<function>").finish()
    }
}

/// Plain pool settings, for callers that prefer a struct literal over the
/// [`Builder`].
///
/// Zero durations are replaced by their defaults when the pool is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub capacity: usize,
    pub survival_time: Duration,
    pub min_cleanup_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            capacity: DEFAULT_CAPACITY,
            survival_time: DEFAULT_SURVIVAL_TIME,
            min_cleanup_interval: DEFAULT_MIN_CLEANUP_INTERVAL,
        }
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Soft upper bound on live workers. Can be changed later with
    /// [`Pool::adjust`].
    capacity: usize,

    /// How long a worker may sit in the idle registry before eviction.
    survival_time: Duration,

    /// Lower bound on the reaper's tick interval. Keeps the reaper from
    /// spinning when many workers expire a few microseconds apart.
    min_cleanup_interval: Duration,

    /// Name fn used for worker threads.
    thread_name: ThreadNameFn,

    /// Stack size used for worker threads.
    thread_stack_size: Option<usize>,

    panic_handler: Option<PanicHandler>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Self {
            capacity: DEFAULT_CAPACITY,
            survival_time: DEFAULT_SURVIVAL_TIME,
            min_cleanup_interval: DEFAULT_MIN_CLEANUP_INTERVAL,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            panic_handler: None,
        }
    }

    /// Sets the maximum number of live workers.
    ///
    /// Defaults to 100 000.
    pub fn capacity(mut self, val: usize) -> Self {
        self.capacity = val;
        self
    }

    /// Sets how long an idle worker is kept before the reaper terminates it.
    ///
    /// Defaults to 1 second. A zero duration keeps the default.
    pub fn survival_time(mut self, val: Duration) -> Self {
        self.survival_time = val;
        self
    }

    /// Sets the minimum interval between two reaper ticks.
    ///
    /// Defaults to 100 milliseconds. A zero duration keeps the default, any
    /// other value is raised to at least [`MIN_CLEANUP_INTERVAL_FLOOR`].
    pub fn min_cleanup_interval(mut self, val: Duration) -> Self {
        self.min_cleanup_interval = val;
        self
    }

    /// Sets the name of every worker thread.
    ///
    /// The default name is "idlepool-{id}", where id is monotonically
    /// increasing.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of each worker thread.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets the callback invoked when a task panics. See
    /// [`Pool::set_panic_handler`].
    pub fn panic_handler<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.panic_handler = Some(PanicHandler(Arc::new(f)));
        self
    }

    /// Creates the configured `Pool` and starts its reaper thread.
    pub fn try_build(self) -> Result<Pool, PoolError> {
        Pool::from_config(self.into())
    }
}

impl From<Config> for Builder {
    fn from(cfg: Config) -> Builder {
        Builder::new()
            .capacity(cfg.capacity)
            .survival_time(cfg.survival_time)
            .min_cleanup_interval(cfg.min_cleanup_interval)
    }
}

// Normalised builder, consumed by the pool, its workers and the reaper.
#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) capacity: usize,
    pub(crate) survival_time: Duration,
    pub(crate) min_cleanup_interval: Duration,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) panic_handler: Option<PanicHandler>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Builder::new().into()
    }
}

impl From<Builder> for PoolConfig {
    fn from(builder: Builder) -> PoolConfig {
        PoolConfig {
            capacity: builder.capacity,
            survival_time: non_zero_or(builder.survival_time, DEFAULT_SURVIVAL_TIME),
            min_cleanup_interval: non_zero_or(
                builder.min_cleanup_interval,
                DEFAULT_MIN_CLEANUP_INTERVAL,
            )
            .max(MIN_CLEANUP_INTERVAL_FLOOR),
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            panic_handler: builder.panic_handler,
        }
    }
}

fn non_zero_or(val: Duration, default: Duration) -> Duration {
    if val.is_zero() { default } else { val }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    // The config is cloned into every worker thread.
    assert_impl_all!(PoolConfig: Send, Sync, Clone);

    #[test]
    fn test_defaults() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.capacity, DEFAULT_CAPACITY);
        assert_eq!(cfg.survival_time, DEFAULT_SURVIVAL_TIME);
        assert_eq!(cfg.min_cleanup_interval, DEFAULT_MIN_CLEANUP_INTERVAL);
        assert!(cfg.thread_stack_size.is_none());
        assert!(cfg.panic_handler.is_none());
    }

    #[rstest]
    #[case::zero(Duration::ZERO, DEFAULT_SURVIVAL_TIME)]
    #[case::ten_ms(Duration::from_millis(10), Duration::from_millis(10))]
    #[case::one_minute(Duration::from_secs(60), Duration::from_secs(60))]
    fn test_survival_time_normalisation(#[case] given: Duration, #[case] expected: Duration) {
        let cfg: PoolConfig = Builder::new().survival_time(given).into();
        assert_eq!(cfg.survival_time, expected);
    }

    #[rstest]
    #[case::zero(Duration::ZERO, DEFAULT_MIN_CLEANUP_INTERVAL)]
    #[case::one_us(Duration::from_micros(1), MIN_CLEANUP_INTERVAL_FLOOR)]
    #[case::at_floor(MIN_CLEANUP_INTERVAL_FLOOR, MIN_CLEANUP_INTERVAL_FLOOR)]
    #[case::five_ms(Duration::from_millis(5), Duration::from_millis(5))]
    fn test_cleanup_interval_normalisation(#[case] given: Duration, #[case] expected: Duration) {
        let cfg: PoolConfig = Builder::new().min_cleanup_interval(given).into();
        assert_eq!(cfg.min_cleanup_interval, expected);
    }

    #[test]
    fn test_from_config() {
        let cfg: PoolConfig = Builder::from(Config {
            capacity: 7,
            survival_time: Duration::ZERO,
            min_cleanup_interval: Duration::from_millis(3),
        })
        .into();

        assert_eq!(cfg.capacity, 7);
        assert_eq!(cfg.survival_time, DEFAULT_SURVIVAL_TIME);
        assert_eq!(cfg.min_cleanup_interval, Duration::from_millis(3));
    }

    #[test]
    fn test_thread_names() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.thread_name.0(), "idlepool-0");
        assert_eq!(cfg.thread_name.0(), "idlepool-1");

        let cfg: PoolConfig = Builder::new().thread_name("fixed").into();
        assert_eq!(cfg.thread_name.0(), "fixed");
        assert_eq!(cfg.thread_name.0(), "fixed");
    }

    #[test]
    #[should_panic(expected = "thread_stack_size must be a power of two")]
    fn test_stack_size_must_be_power_of_two() {
        let _ = Builder::new().thread_stack_size(1000);
    }
}
