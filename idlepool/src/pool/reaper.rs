use crate::pool::{Shared, State};
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::debug;

/// Background thread evicting workers idle beyond the survival time, and
/// terminating every idle worker once the pool closes.
///
/// The reaper is the only party reaching into idle workers on shutdown:
/// `close` merely stops new registrations and wakes the reaper up.
pub(crate) struct Reaper {
    shared: Arc<Shared>,
    deadline: Instant,
}

impl Reaper {
    pub(crate) fn spawn(shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
        let reaper = Reaper {
            deadline: Instant::now() + shared.cfg.survival_time,
            shared,
        };

        thread::Builder::new()
            .name("idlepool-reaper".to_string())
            .spawn(move || reaper.run())
    }

    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();

        loop {
            if let ControlFlow::Break(()) = self.tick(&mut state) {
                break;
            }

            // `close` flips the flag and notifies while holding the state lock,
            // so the wakeup cannot slip in between the check above and here.
            shared.reaper_wakeup.wait_until(&mut state, self.deadline);
        }
    }

    fn tick(&mut self, state: &mut State) -> ControlFlow<()> {
        if self.shared.is_closed() {
            let terminated = state.idle.reset();
            state.recycled.clear();
            debug!(terminated, "pool closed, reaper drained idle workers");
            return ControlFlow::Break(());
        }

        let now = Instant::now();
        if now < self.deadline {
            // Spurious wakeup.
            return ControlFlow::Continue(());
        }

        let survival = self.shared.cfg.survival_time;
        let eviction = state.idle.evict_expired(now, survival);

        if eviction.evicted > 0 {
            debug!(
                evicted = eviction.evicted,
                idle = state.idle.len(),
                "evicted expired idle workers"
            );
        }

        let interval = eviction
            .next_expiry
            .unwrap_or(survival)
            .max(self.shared.cfg.min_cleanup_interval);
        self.deadline = now + interval;

        ControlFlow::Continue(())
    }
}
