//! The learner-side policy model and the collector-side factory.
//!
//! Network architecture and loss live behind these traits. [`LinearQ`] is a
//! small linear action-value model over the float features, enough to drive
//! the pipeline end to end.

use std::sync::Arc;

use pl_core::{Observation, Transition, A};
use pl_runtime::Policy;
use thiserror::Error;

use crate::model_slot::PolicySnapshot;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("training step failed: {0}")]
    Step(String),
    #[error("bad snapshot: {0}")]
    Snapshot(String),
    #[error("empty batch")]
    EmptyBatch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOutcome {
    pub loss: f32,
}

/// Learner-owned model. Only the learner thread touches it.
pub trait PolicyModel: Send {
    /// One parameter update from a uniformly sampled batch.
    fn train_step(&mut self, batch: &[Transition]) -> Result<TrainOutcome, TrainingError>;
    /// Loss on held-out transitions, without updating.
    fn test_loss(&mut self, batch: &[Transition]) -> Result<f32, TrainingError>;
    /// Current parameters as an immutable snapshot.
    fn snapshot(&self) -> PolicySnapshot;
    /// Resume from a persisted snapshot.
    fn load_snapshot(&mut self, snap: &PolicySnapshot) -> Result<(), TrainingError>;
}

/// Builds an inference handle from a published snapshot.
pub trait PolicyFactory: Send + Sync {
    fn build(&self, snap: &PolicySnapshot) -> Result<Arc<dyn Policy>, TrainingError>;
}

/// `Q(s, a) = w[a] . features(s) + b[a]`, fitted to n-step targets with plain SGD.
#[derive(Debug, Clone)]
pub struct LinearQ {
    dim: usize,
    /// A rows of `dim + 1` (weights then bias).
    params: Vec<f32>,
    lr: f32,
    updates: u64,
}

impl LinearQ {
    pub fn new(dim: usize, lr: f32) -> Self {
        Self {
            dim,
            params: vec![0.0; A * (dim + 1)],
            lr,
            updates: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn q(&self, features: &[f32], a: usize) -> f32 {
        q_row(&self.params, self.dim, features, a)
    }

    fn max_q(&self, features: &[f32]) -> f32 {
        (0..A).map(|a| self.q(features, a)).fold(f32::NEG_INFINITY, f32::max)
    }

    fn target(&self, t: &Transition) -> f32 {
        match &t.next_state {
            Some(next) => t.n_step_return + t.bootstrap_discount * self.max_q(&next.features),
            None => t.n_step_return,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.params.len() * 4);
        out.extend_from_slice(&(self.dim as u32).to_le_bytes());
        for p in &self.params {
            out.extend_from_slice(&p.to_le_bytes());
        }
        out
    }
}

fn q_row(params: &[f32], dim: usize, features: &[f32], a: usize) -> f32 {
    let row = &params[a * (dim + 1)..(a + 1) * (dim + 1)];
    let dot: f32 = row[..dim].iter().zip(features).map(|(w, x)| w * x).sum();
    dot + row[dim]
}

fn decode(bytes: &[u8]) -> Result<(usize, Vec<f32>), TrainingError> {
    if bytes.len() < 4 {
        return Err(TrainingError::Snapshot("missing header".to_string()));
    }
    let dim = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let want = A * (dim + 1);
    let body = &bytes[4..];
    if body.len() != want * 4 {
        return Err(TrainingError::Snapshot(format!(
            "expected {want} params, got {} bytes",
            body.len()
        )));
    }
    let params = body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((dim, params))
}

impl PolicyModel for LinearQ {
    fn train_step(&mut self, batch: &[Transition]) -> Result<TrainOutcome, TrainingError> {
        if batch.is_empty() {
            return Err(TrainingError::EmptyBatch);
        }
        // Targets use the parameters from before this step.
        let targets: Vec<f32> = batch.iter().map(|t| self.target(t)).collect();
        let scale = self.lr / batch.len() as f32;
        let mut loss = 0.0f32;
        for (t, target) in batch.iter().zip(targets) {
            let a = t.action as usize;
            if a >= A {
                return Err(TrainingError::Step(format!("action {a} out of range")));
            }
            let err = self.q(&t.state.features, a) - target;
            loss += err * err;
            let dim = self.dim;
            let row = &mut self.params[a * (dim + 1)..(a + 1) * (dim + 1)];
            for (w, x) in row[..dim].iter_mut().zip(&t.state.features) {
                *w -= scale * err * x;
            }
            row[dim] -= scale * err;
        }
        let loss = loss / batch.len() as f32;
        if !loss.is_finite() {
            return Err(TrainingError::Step("loss diverged".to_string()));
        }
        self.updates += 1;
        Ok(TrainOutcome { loss })
    }

    fn test_loss(&mut self, batch: &[Transition]) -> Result<f32, TrainingError> {
        if batch.is_empty() {
            return Err(TrainingError::EmptyBatch);
        }
        let sum: f32 = batch
            .iter()
            .map(|t| {
                let err = self.q(&t.state.features, t.action as usize % A) - self.target(t);
                err * err
            })
            .sum();
        Ok(sum / batch.len() as f32)
    }

    fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot::new(self.updates, self.encode())
    }

    fn load_snapshot(&mut self, snap: &PolicySnapshot) -> Result<(), TrainingError> {
        let (dim, params) = decode(&snap.bytes)?;
        if dim != self.dim {
            return Err(TrainingError::Snapshot(format!(
                "feature dim {dim}, model uses {}",
                self.dim
            )));
        }
        self.params = params;
        self.updates = snap.version;
        Ok(())
    }
}

/// Inference side of [`LinearQ`].
#[derive(Debug)]
pub struct LinearQPolicy {
    version: u64,
    dim: usize,
    params: Vec<f32>,
}

impl Policy for LinearQPolicy {
    fn version(&self) -> u64 {
        self.version
    }

    fn scores(&self, obs: &Observation) -> Vec<f32> {
        (0..A)
            .map(|a| q_row(&self.params, self.dim, &obs.features, a))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinearQFactory;

impl PolicyFactory for LinearQFactory {
    fn build(&self, snap: &PolicySnapshot) -> Result<Arc<dyn Policy>, TrainingError> {
        let (dim, params) = decode(&snap.bytes)?;
        Ok(Arc::new(LinearQPolicy {
            version: snap.version,
            dim,
            params,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(features: Vec<f32>, action: u8, ret: f32) -> Transition {
        Transition {
            state: Arc::new(Observation::new(Vec::new(), features)),
            action,
            n_step_return: ret,
            next_state: None,
            n: 1,
            gamma: 0.9,
            bootstrap_discount: 0.9,
            greedy_path: true,
        }
    }

    #[test]
    fn fits_terminal_returns() {
        let mut m = LinearQ::new(2, 0.5);
        let batch = vec![t(vec![1.0, 0.0], 3, 1.0), t(vec![0.0, 1.0], 5, -1.0)];
        let first = m.train_step(&batch).unwrap().loss;
        for _ in 0..200 {
            m.train_step(&batch).unwrap();
        }
        let last = m.test_loss(&batch).unwrap();
        assert!(last < first * 0.01, "{first} -> {last}");

        let policy = LinearQFactory.build(&m.snapshot()).unwrap();
        let s = policy.scores(&Observation::new(Vec::new(), vec![1.0, 0.0]));
        assert_eq!(pl_core::argmax(&s), Some(3));
        assert_eq!(policy.version(), 201);
    }

    #[test]
    fn snapshot_round_trips_through_load() {
        let mut a = LinearQ::new(3, 0.1);
        a.train_step(&[t(vec![1.0, 2.0, 3.0], 0, 2.0)]).unwrap();
        let snap = a.snapshot();
        let mut b = LinearQ::new(3, 0.1);
        b.load_snapshot(&snap).unwrap();
        assert_eq!(b.snapshot(), snap);
        assert!(LinearQ::new(4, 0.1).load_snapshot(&snap).is_err());
    }

    #[test]
    fn empty_batch_and_bad_blob_are_errors() {
        let mut m = LinearQ::new(1, 0.1);
        assert!(matches!(m.train_step(&[]), Err(TrainingError::EmptyBatch)));
        assert!(LinearQFactory
            .build(&PolicySnapshot::new(0, vec![1, 0]))
            .is_err());
    }
}
