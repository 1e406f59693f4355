//! Fixed-capacity ring store of transitions.

use pl_core::Transition;
use rand::Rng;

use crate::ReplayError;

/// Arena + write cursor. Once full, each push overwrites the oldest entry.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    slots: Vec<Transition>,
    capacity: usize,
    cursor: usize,
    total_pushed: u64,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Result<Self, ReplayError> {
        if capacity == 0 {
            return Err(ReplayError::InvalidConfig("replay capacity must be > 0"));
        }
        Ok(Self {
            slots: Vec::with_capacity(capacity.min(1 << 16)),
            capacity,
            cursor: 0,
            total_pushed: 0,
        })
    }

    pub fn push(&mut self, t: Transition) {
        if self.slots.len() < self.capacity {
            self.slots.push(t);
        } else {
            self.slots[self.cursor] = t;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
        self.total_pushed += 1;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes over the buffer's lifetime, including overwritten ones.
    pub fn total_pushed(&self) -> u64 {
        self.total_pushed
    }

    /// Uniform sampling with replacement. Empty buffer -> empty batch.
    pub fn sample<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Vec<Transition> {
        if self.slots.is_empty() {
            return Vec::new();
        }
        (0..batch_size)
            .map(|_| self.slots[rng.gen_range(0..self.slots.len())].clone())
            .collect()
    }

    /// Survivors, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> + '_ {
        let split = if self.slots.len() < self.capacity {
            0
        } else {
            self.cursor
        };
        self.slots[split..].iter().chain(self.slots[..split].iter())
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.cursor = 0;
    }
}

/// Where a transition was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// Training store plus held-out test store.
#[derive(Debug, Clone)]
pub struct SplitBuffers {
    pub train: ReplayBuffer,
    pub test: ReplayBuffer,
}

impl SplitBuffers {
    pub fn new(train_capacity: usize, test_capacity: usize) -> Result<Self, ReplayError> {
        Ok(Self {
            train: ReplayBuffer::new(train_capacity)?,
            test: ReplayBuffer::new(test_capacity)?,
        })
    }

    /// Route with probability `test_ratio` to the test store. One draw per call.
    pub fn route<R: Rng>(&mut self, t: Transition, test_ratio: f32, rng: &mut R) -> Split {
        if rng.gen::<f32>() < test_ratio {
            self.test.push(t);
            Split::Test
        } else {
            self.train.push(t);
            Split::Train
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pl_core::Observation;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::sync::Arc;

    fn t(id: f32) -> Transition {
        Transition {
            state: Arc::new(Observation::new(vec![], vec![id])),
            action: 0,
            n_step_return: id,
            next_state: None,
            n: 1,
            gamma: 0.99,
            bootstrap_discount: 0.99,
            greedy_path: true,
        }
    }

    fn ids(b: &ReplayBuffer) -> Vec<f32> {
        b.iter().map(|t| t.n_step_return).collect()
    }

    #[test]
    fn never_exceeds_capacity_and_evicts_oldest() {
        let mut b = ReplayBuffer::new(3).unwrap();
        for i in 0..3 {
            b.push(t(i as f32));
        }
        assert_eq!(ids(&b), vec![0.0, 1.0, 2.0]);
        b.push(t(3.0));
        assert_eq!(b.len(), 3);
        assert_eq!(ids(&b), vec![1.0, 2.0, 3.0]);
        for i in 4..11 {
            b.push(t(i as f32));
            assert!(b.len() <= b.capacity());
        }
        assert_eq!(ids(&b), vec![8.0, 9.0, 10.0]);
        assert_eq!(b.total_pushed(), 11);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(ReplayBuffer::new(0).is_err());
    }

    #[test]
    fn sample_is_uniform_with_replacement() {
        let mut b = ReplayBuffer::new(4).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(b.sample(8, &mut rng).is_empty());
        for i in 0..4 {
            b.push(t(i as f32));
        }
        let batch = b.sample(4_000, &mut rng);
        assert_eq!(batch.len(), 4_000);
        let mut counts = [0usize; 4];
        for x in &batch {
            counts[x.n_step_return as usize] += 1;
        }
        assert!(counts.iter().all(|&c| c > 800 && c < 1_200), "{counts:?}");
    }

    #[test]
    fn routing_respects_ratio_roughly() {
        let mut s = SplitBuffers::new(10_000, 10_000).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for i in 0..5_000 {
            s.route(t(i as f32), 0.1, &mut rng);
        }
        assert_eq!(s.train.len() + s.test.len(), 5_000);
        assert!(s.test.len() > 350 && s.test.len() < 650);
        let mut none = SplitBuffers::new(10, 10).unwrap();
        for i in 0..10 {
            assert_eq!(none.route(t(i as f32), 0.0, &mut rng), Split::Train);
        }
        assert!(none.test.is_empty());
    }
}
