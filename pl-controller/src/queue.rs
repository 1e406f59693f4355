//! Bounded rollout queue from one collector to the learner.
//!
//! A full queue blocks the collector for at most `wait`; after that the
//! rollout is dropped and counted as lost. Nothing is retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryRecvError};
use pl_core::Rollout;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("rollout queue full for {0:?}; rollout dropped")]
    Overflow(Duration),
    #[error("learner is gone")]
    Disconnected,
}

#[derive(Debug, Default)]
pub struct QueueStats {
    sent: AtomicU64,
    lost: AtomicU64,
    received: AtomicU64,
}

impl QueueStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

pub struct RolloutSender {
    tx: Sender<Rollout>,
    wait: Duration,
    stats: Arc<QueueStats>,
}

pub struct RolloutReceiver {
    rx: Receiver<Rollout>,
    stats: Arc<QueueStats>,
}

pub fn rollout_queue(capacity: usize, wait: Duration) -> (RolloutSender, RolloutReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let stats = Arc::new(QueueStats::default());
    (
        RolloutSender {
            tx,
            wait,
            stats: Arc::clone(&stats),
        },
        RolloutReceiver { rx, stats },
    )
}

impl RolloutSender {
    pub fn send(&self, r: Rollout) -> Result<(), QueueError> {
        match self.tx.send_timeout(r, self.wait) {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.stats.lost.fetch_add(1, Ordering::Relaxed);
                Err(QueueError::Overflow(self.wait))
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(QueueError::Disconnected),
        }
    }

    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }
}

impl RolloutReceiver {
    pub fn try_recv(&self) -> Result<Rollout, TryRecvError> {
        let r = self.rx.try_recv()?;
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        Ok(r)
    }

    pub fn inner(&self) -> &Receiver<Rollout> {
        &self.rx
    }

    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
