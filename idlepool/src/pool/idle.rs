use crate::pool::worker::Worker;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct IdleEntry {
    worker: Arc<Worker>,
    since: Instant,
}

/// Outcome of one reaper scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Eviction {
    pub(crate) evicted: usize,

    /// Time until the oldest remaining worker expires, `None` if the registry
    /// is empty.
    pub(crate) next_expiry: Option<Duration>,
}

/// FIFO of idle workers, oldest first.
///
/// Made of two buffers: `push` appends to `tail`, `pop` takes from `head`, and
/// an exhausted `head` is refilled by swapping in the whole `tail`. Both
/// buffers keep their allocation across swaps.
///
/// Workers are always pushed with a fresh timestamp and `head` is only
/// refilled once empty, so every `head` entry is older than every `tail`
/// entry. The eviction scan relies on this to stop at the first worker that
/// has not expired yet.
#[derive(Debug, Default)]
pub(crate) struct IdleRegistry {
    /// Oldest entry last, so that `Vec::pop` yields it.
    head: Vec<IdleEntry>,

    /// Insertion order, oldest entry first.
    tail: Vec<IdleEntry>,
}

impl IdleRegistry {
    pub(crate) fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_empty() && self.tail.is_empty()
    }

    pub(crate) fn push(&mut self, worker: Arc<Worker>, since: Instant) {
        debug_assert!(
            self.tail.last().is_none_or(|last| last.since <= since),
            "idle workers must be registered in time order"
        );
        self.tail.push(IdleEntry { worker, since });
    }

    /// Removes the worker that has been idle the longest.
    pub(crate) fn pop(&mut self) -> Option<Arc<Worker>> {
        if self.head.is_empty() {
            self.flip();
        }
        self.head.pop().map(|entry| entry.worker)
    }

    /// Terminates every worker idle for at least `survival`.
    pub(crate) fn evict_expired(&mut self, now: Instant, survival: Duration) -> Eviction {
        let mut evicted = 0;

        // Second pass covers `tail` entries that aged past the threshold
        // while `head` was being drained.
        for _ in 0..2 {
            if self.head.is_empty() {
                self.flip();
            }

            while let Some(since) = self.head.last().map(|entry| entry.since) {
                let idle_for = now.saturating_duration_since(since);
                if idle_for < survival {
                    return Eviction {
                        evicted,
                        next_expiry: Some(survival - idle_for),
                    };
                }

                if let Some(entry) = self.head.pop() {
                    entry.worker.terminate();
                    evicted += 1;
                }
            }
        }

        Eviction {
            evicted,
            next_expiry: None,
        }
    }

    /// Terminates every idle worker and empties the registry. Returns how many
    /// workers were terminated.
    pub(crate) fn reset(&mut self) -> usize {
        let terminated = self.len();

        for entry in self.head.drain(..).chain(self.tail.drain(..)) {
            entry.worker.terminate();
        }

        terminated
    }

    fn flip(&mut self) {
        debug_assert!(self.head.is_empty());
        mem::swap(&mut self.head, &mut self.tail);
        self.head.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn workers(n: u64) -> Vec<Arc<Worker>> {
        (0..n).map(|id| Arc::new(Worker::new(id))).collect()
    }

    // Registers `n` workers, the i-th one idle since `base + i * step`.
    fn registry_with(n: u64, base: Instant, step: Duration) -> (IdleRegistry, Vec<Arc<Worker>>) {
        let mut registry = IdleRegistry::default();
        let workers = workers(n);
        for (i, w) in workers.iter().enumerate() {
            registry.push(Arc::clone(w), base + step * i as u32);
        }
        (registry, workers)
    }

    #[test]
    fn test_pop_is_fifo_across_flips() {
        let base = Instant::now();
        let (mut registry, _workers) = registry_with(3, base, Duration::from_millis(1));

        assert_eq!(registry.pop().map(|w| w.id()), Some(0));

        // Lands in `tail` while `head` still holds 1 and 2.
        registry.push(Arc::new(Worker::new(3)), base + Duration::from_millis(5));
        assert_eq!(registry.len(), 3);

        let order = std::iter::from_fn(|| registry.pop().map(|w| w.id())).collect::<Vec<_>>();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(registry.is_empty());
        assert!(registry.pop().is_none());
    }

    #[rstest]
    #[case::none_expired(Duration::from_millis(5), 0, 5)]
    #[case::some_expired(Duration::from_millis(30), 3, 2)]
    #[case::all_expired(Duration::from_millis(100), 5, 0)]
    fn test_evict_expired(
        #[case] elapsed: Duration,
        #[case] expected_evicted: usize,
        #[case] expected_left: usize,
    ) {
        // Idle since 0ms, 10ms, 20ms, 30ms, 40ms. Survival is 10ms.
        let base = Instant::now();
        let (mut registry, workers) = registry_with(5, base, Duration::from_millis(10));
        let now = base + elapsed;

        let eviction = registry.evict_expired(now, Duration::from_millis(10));

        assert_eq!(eviction.evicted, expected_evicted);
        assert_eq!(registry.len(), expected_left);

        for (i, w) in workers.iter().enumerate() {
            assert_eq!(w.has_pending_message(), i < expected_evicted);
        }

        match expected_left {
            0 => assert_eq!(eviction.next_expiry, None),
            _ => {
                let oldest_left = base + Duration::from_millis(10) * expected_evicted as u32;
                let expected = Duration::from_millis(10) - (now - oldest_left);
                assert_eq!(eviction.next_expiry, Some(expected));
            }
        }
    }

    #[test]
    fn test_evict_reaches_into_tail() {
        let base = Instant::now();
        let (mut registry, workers) = registry_with(2, base, Duration::from_millis(1));

        // Popping moves workers 0 and 1 into `head` and takes 0, worker 2
        // then lands in `tail`.
        let first = registry.pop().unwrap();
        assert_eq!(first.id(), 0);
        let late = Arc::new(Worker::new(2));
        registry.push(Arc::clone(&late), base + Duration::from_millis(2));

        let eviction =
            registry.evict_expired(base + Duration::from_secs(1), Duration::from_millis(10));

        assert_eq!(eviction.evicted, 2);
        assert_eq!(eviction.next_expiry, None);
        assert!(registry.is_empty());
        assert!(workers[1].has_pending_message());
        assert!(late.has_pending_message());
        assert!(!first.has_pending_message());
    }

    #[test]
    fn test_reset_terminates_everyone() {
        let base = Instant::now();
        let (mut registry, workers) = registry_with(4, base, Duration::from_millis(1));

        // Split entries across both buffers.
        let popped = registry.pop().unwrap();
        registry.push(Arc::clone(&popped), base + Duration::from_millis(10));

        assert_eq!(registry.reset(), 4);
        assert!(registry.is_empty());
        assert!(workers.iter().all(|w| w.has_pending_message()));
    }

    #[test]
    fn test_empty_registry() {
        let mut registry = IdleRegistry::default();
        let eviction = registry.evict_expired(Instant::now(), Duration::from_secs(1));

        assert_eq!(
            eviction,
            Eviction {
                evicted: 0,
                next_expiry: None
            }
        );
        assert_eq!(registry.reset(), 0);
    }
}
