//! A capacity-bounded thread pool.
//!
//! Tasks submitted to a [`Pool`] run on long-lived worker threads. A worker
//! that finishes its task parks itself in an idle registry and is handed the
//! next submission directly, so high volumes of short tasks do not pay for a
//! thread spawn each. Workers idle for longer than the configured survival
//! time are evicted by a background reaper thread.
//!
//! ```no_run
//! use idlepool::Pool;
//! use std::time::Duration;
//!
//! let pool = Pool::builder()
//!     .capacity(8)
//!     .survival_time(Duration::from_secs(5))
//!     .try_build()
//!     .expect("failed to start pool");
//!
//! pool.submit(|| println!("hello from a pooled thread")).unwrap();
//! pool.close_graceful().unwrap();
//! ```

mod error;
pub use error::PoolError;

pub mod pool;
pub use pool::{Builder, Config, Pool};

mod task;
pub use task::Task;

mod utils;
