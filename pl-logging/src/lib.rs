//! pl-logging: NDJSON events and the run manifest.
//!
//! Append-only NDJSON logs for run post-mortems: one file per collector
//! (episode and session events) plus one for the learner, one JSON object per line.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run manifest schema version.
pub const RUN_MANIFEST_VERSION: u32 = 1;

pub const LEARNER_FILE: &str = "learner.ndjson";
pub const MANIFEST_FILE: &str = "run.json";

/// Each collector appends to its own file so lines from different threads never interleave.
pub fn collector_log_name(collector_id: u32) -> String {
    format!("collector_{collector_id:02}.ndjson")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifestV1 {
    pub run_manifest_version: u32,

    pub run_id: String,
    pub created_ts_ms: u64,

    pub feature_schema_id: u32,
    pub action_count: usize,

    // Hashes for reproducibility.
    pub git_hash: Option<String>,
    pub config_hash: Option<String>,

    // Layout.
    pub logs_dir: String,
    pub replay_dir: Option<String>,

    // Counters.
    pub episodes_completed: u64,
    pub rollouts_lost: u64,
    pub train_step: u64,
    pub policy_version: u64,
    pub progress: u64,
}

pub fn now_ms() -> u64 {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    d.as_millis() as u64
}

pub fn hash_config_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub fn try_git_hash() -> Option<String> {
    use std::process::Command;

    let out = Command::new("git").args(["rev-parse", "HEAD"]).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8(out.stdout).ok()?;
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

pub fn read_manifest(path: impl AsRef<Path>) -> Result<RunManifestV1, NdjsonError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice::<RunManifestV1>(&bytes)?)
}

pub fn write_manifest_atomic(path: impl AsRef<Path>, m: &RunManifestV1) -> Result<(), NdjsonError> {
    let path = path.as_ref();
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(m)?;
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyStatsV1 {
    pub duplicate_frames: u32,
    pub desync_steps: u32,
    pub empty_snapshots: u32,
    pub reconnect_events: u32,
}

/// One line per completed (finished or timed-out) episode.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,

    pub run_id: String,
    pub collector_id: u32,
    pub episode: u64,
    /// "finished" | "timed_out"
    pub outcome: &'static str,
    pub greedy_eval: bool,

    pub steps: u64,
    pub race_time_ms: i32,
    pub zones_reached: u32,
    pub total_reward: f32,

    pub policy_version_first: u64,
    pub policy_version_last: u64,
    pub progress: u64,
    /// False when the rollout was dropped at the queue.
    pub enqueued: bool,

    pub anomalies: AnomalyStatsV1,
}

/// Connection lifecycle and recoverable failures seen by a collector.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,

    pub run_id: String,
    pub collector_id: u32,
    /// "connected" | "connect_failed" | "episode_failed" | "closed"
    pub kind: &'static str,
    pub attempt: u32,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LearnerStatsEventV1 {
    pub event: &'static str,
    pub ts_ms: u64,

    pub run_id: String,
    pub train_step: u64,
    pub mean_loss: Option<f32>,
    pub test_loss: Option<f32>,

    pub train_size: usize,
    pub test_size: usize,
    pub transitions_total: u64,
    pub windows_dropped: u64,

    /// Indexed by collector id.
    pub rollouts_received: Vec<u64>,
    pub rollouts_lost: u64,

    pub policy_version: u64,
    pub progress: u64,
}

#[derive(Debug, Error)]
pub enum NdjsonError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Append-only NDJSON writer.
///
/// Contract: each call writes exactly one JSON object followed by a newline.
pub struct NdjsonWriter {
    w: BufWriter<File>,
    lines_since_flush: u64,
    flush_every_lines: u64,
}

impl NdjsonWriter {
    /// Open a file for append. Creates it if it doesn't exist.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self, NdjsonError> {
        Self::open_append_with_flush(path, 0)
    }

    /// `flush_every_lines=0` disables periodic flushing.
    pub fn open_append_with_flush(
        path: impl AsRef<Path>,
        flush_every_lines: u64,
    ) -> Result<Self, NdjsonError> {
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            w: BufWriter::new(f),
            lines_since_flush: 0,
            flush_every_lines,
        })
    }

    pub fn write_event<T: Serialize>(&mut self, event: &T) -> Result<(), NdjsonError> {
        let mut buf = serde_json::to_vec(event)?;
        buf.push(b'\n');
        self.w.write_all(&buf)?;
        self.lines_since_flush += 1;
        if self.flush_every_lines > 0 && self.lines_since_flush >= self.flush_every_lines {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), NdjsonError> {
        self.w.flush()?;
        self.lines_since_flush = 0;
        Ok(())
    }
}

/// Parse every complete JSON line, skipping blanks and a torn trailing line.
pub fn read_ndjson_lenient(path: impl AsRef<Path>) -> Result<Vec<serde_json::Value>, NdjsonError> {
    let s = std::fs::read_to_string(path)?;
    Ok(s.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
