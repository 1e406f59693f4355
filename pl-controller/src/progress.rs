//! Process-wide step counter shared by collectors and the learner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotone count of simulated steps. Only ever incremented.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter {
    inner: Arc<AtomicU64>,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from an earlier run's value.
    pub fn starting_at(value: u64) -> Self {
        Self {
            inner: Arc::new(AtomicU64::new(value)),
        }
    }

    /// Add `steps` and return the new total.
    pub fn add(&self, steps: u64) -> u64 {
        self.inner.fetch_add(steps, Ordering::AcqRel) + steps
    }

    pub fn get(&self) -> u64 {
        self.inner.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn concurrent_increments_are_not_lost() {
        let p = ProgressCounter::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = p.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        p.add(3);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(p.get(), 12_000);
    }

    #[test]
    fn add_returns_running_total() {
        let p = ProgressCounter::starting_at(10);
        assert_eq!(p.add(5), 15);
        assert_eq!(p.get(), 15);
    }
}
