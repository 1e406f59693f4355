//! Structured view over a `get-simulation-state` blob.
//!
//! Layout of the part the pipeline reads (little-endian):
//! `i32 race_time_ms, f32[3] position, f32[3] velocity, f32[9] orientation,
//! u32 n, u8[n] checkpoint states, u32 m, i32[m] checkpoint times`, then
//! simulator-private bytes. The whole blob is kept for `rewind-to-state`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot truncated at offset {at}: need {need} more bytes")]
    TooShort { at: usize, need: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dynamics {
    pub race_time_ms: i32,
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    /// Row-major 3x3; columns are the car's right, up and forward axes in world space.
    pub orientation: [f32; 9],
}

impl Dynamics {
    pub fn speed(&self) -> f32 {
        let [x, y, z] = self.velocity;
        (x * x + y * y + z * z).sqrt()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointData {
    pub states: Vec<u8>,
    pub times: Vec<i32>,
}

impl CheckpointData {
    pub fn passed(&self) -> usize {
        self.states.iter().filter(|&&s| s != 0).count()
    }
}

/// Immutable once captured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationSnapshot {
    raw: Vec<u8>,
    dynamics: Option<Dynamics>,
    checkpoints: CheckpointData,
}

impl SimulationSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a state blob. A zero-length blob is an empty snapshot.
    pub fn parse(raw: Vec<u8>) -> Result<Self, SnapshotError> {
        if raw.is_empty() {
            return Ok(Self::empty());
        }
        let (dynamics, checkpoints) = {
            let mut c = Cursor::new(&raw);
            let race_time_ms = c.read_i32()?;
            let mut position = [0f32; 3];
            for v in &mut position {
                *v = c.read_f32()?;
            }
            let mut velocity = [0f32; 3];
            for v in &mut velocity {
                *v = c.read_f32()?;
            }
            let mut orientation = [0f32; 9];
            for v in &mut orientation {
                *v = c.read_f32()?;
            }
            let n_states = c.read_u32()? as usize;
            let states = c.take(n_states)?.to_vec();
            let n_times = c.read_u32()? as usize;
            c.ensure(n_times.saturating_mul(4))?;
            let mut times = Vec::with_capacity(n_times);
            for _ in 0..n_times {
                times.push(c.read_i32()?);
            }
            (
                Dynamics {
                    race_time_ms,
                    position,
                    velocity,
                    orientation,
                },
                CheckpointData { states, times },
            )
        };
        Ok(Self {
            raw,
            dynamics: Some(dynamics),
            checkpoints,
        })
    }

    /// Serialize structured fields followed by `tail` (opaque simulator bytes).
    pub fn build(dynamics: Dynamics, checkpoints: CheckpointData, tail: &[u8]) -> Self {
        let mut raw = Vec::with_capacity(
            64 + 8 + checkpoints.states.len() + checkpoints.times.len() * 4 + tail.len(),
        );
        raw.extend_from_slice(&dynamics.race_time_ms.to_le_bytes());
        for v in dynamics
            .position
            .iter()
            .chain(dynamics.velocity.iter())
            .chain(dynamics.orientation.iter())
        {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        raw.extend_from_slice(&(checkpoints.states.len() as u32).to_le_bytes());
        raw.extend_from_slice(&checkpoints.states);
        raw.extend_from_slice(&(checkpoints.times.len() as u32).to_le_bytes());
        for t in &checkpoints.times {
            raw.extend_from_slice(&t.to_le_bytes());
        }
        raw.extend_from_slice(tail);
        Self {
            raw,
            dynamics: Some(dynamics),
            checkpoints,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn dynamics(&self) -> Option<&Dynamics> {
        self.dynamics.as_ref()
    }

    pub fn checkpoints(&self) -> &CheckpointData {
        &self.checkpoints
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, off: 0 }
    }

    fn ensure(&self, n: usize) -> Result<(), SnapshotError> {
        let left = self.bytes.len() - self.off;
        if n > left {
            return Err(SnapshotError::TooShort {
                at: self.off,
                need: n - left,
            });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        self.ensure(n)?;
        let s = &self.bytes[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn read_u32(&mut self) -> Result<u32, SnapshotError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, SnapshotError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f32(&mut self) -> Result<f32, SnapshotError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
