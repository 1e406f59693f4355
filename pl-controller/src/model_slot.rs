//! Latest-only policy snapshot hand-off from the learner to one collector.
//!
//! ```text
//! invariant: slot.pending <= 1 snapshot at all times
//! ```

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

const SNAPSHOT_MAGIC: &[u8; 4] = b"PLS1";

/// Immutable, versioned parameter blob. The learner is the only writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub version: u64,
    pub bytes: Arc<Vec<u8>>,
}

impl PolicySnapshot {
    pub fn new(version: u64, bytes: Vec<u8>) -> Self {
        Self {
            version,
            bytes: Arc::new(bytes),
        }
    }

    /// `magic | u64 version | blob`, written to a tmp file and renamed into place.
    pub fn write_atomic(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        let mut buf = Vec::with_capacity(12 + self.bytes.len());
        buf.extend_from_slice(SNAPSHOT_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.bytes);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, buf)?;
        fs::rename(&tmp, path)
    }

    pub fn read(path: impl AsRef<Path>) -> io::Result<Self> {
        let buf = fs::read(path)?;
        if buf.len() < 12 || &buf[..4] != SNAPSHOT_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a policy snapshot",
            ));
        }
        let mut v = [0u8; 8];
        v.copy_from_slice(&buf[4..12]);
        Ok(Self::new(u64::from_le_bytes(v), buf[12..].to_vec()))
    }
}

/// Single-slot mailbox. Publishing replaces an unconsumed snapshot.
#[derive(Debug, Default)]
pub struct ModelSlot {
    pending: Mutex<Option<PolicySnapshot>>,
    published: AtomicU64,
    replaced: AtomicU64,
    taken: AtomicU64,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if an unconsumed snapshot was overwritten.
    pub fn publish(&self, snap: PolicySnapshot) -> bool {
        let mut guard = self.pending.lock();
        let was_pending = guard.is_some();
        if was_pending {
            self.replaced.fetch_add(1, Ordering::Relaxed);
        }
        *guard = Some(snap);
        self.published.fetch_add(1, Ordering::Relaxed);
        was_pending
    }

    /// Non-blocking; `None` when nothing new was published.
    pub fn take(&self) -> Option<PolicySnapshot> {
        let taken = self.pending.lock().take();
        if taken.is_some() {
            self.taken.fetch_add(1, Ordering::Relaxed);
        }
        taken
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// (published, replaced, taken)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.published.load(Ordering::Relaxed),
            self.replaced.load(Ordering::Relaxed),
            self.taken.load(Ordering::Relaxed),
        )
    }
}
