use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Clamp a scalar into [0,1], treating non-finite inputs as 0.0.
pub fn clamp01(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Snapshot of the shared affective field at one point in time.
///
/// Produced by the field source, consumed read-only by the mirror loop.
/// All scalar components live in [0,1]; `ts_secs` is UTC epoch seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FieldState {
    pub coherence: f64,
    pub entropy: f64,
    pub pad: [f64; 3],
    pub ts_secs: i64,
}

impl FieldState {
    /// Build a state from possibly malformed inputs: scalars are clamped
    /// into [0,1] (non-finite -> 0.0) and the PAD slice is truncated or
    /// zero-extended to exactly three components.
    pub fn new(coherence: f64, entropy: f64, pad: &[f64], ts_secs: i64) -> Self {
        Self {
            coherence: clamp01(coherence),
            entropy: clamp01(entropy),
            pad: repair_pad(pad),
            ts_secs,
        }
    }

    /// Re-apply the normalization rules to an existing state.
    pub fn sanitized(&self) -> Self {
        Self::new(self.coherence, self.entropy, &self.pad, self.ts_secs)
    }
}

fn repair_pad(pad: &[f64]) -> [f64; 3] {
    let mut out = [0.0_f64; 3];
    for (slot, value) in out.iter_mut().zip(pad.iter()) {
        *slot = clamp01(*value);
    }
    out
}

/// Feedback tone emitted toward connected clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Warm,
    Cool,
    Neutral,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warm => "warm",
            Self::Cool => "cool",
            Self::Neutral => "neutral",
        }
    }

    /// Lenient parse for values coming back from storage. Unknown labels
    /// normalize to `Neutral` rather than failing the read path.
    pub fn from_label(label: &str) -> Self {
        match label {
            "warm" => Self::Warm,
            "cool" => Self::Cool,
            _ => Self::Neutral,
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One feedback action: tone label, intensity scalar and display message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirrorAction {
    pub tone: Tone,
    pub intensity: f64,
    pub message: String,
}

impl MirrorAction {
    pub fn intensity_bin(&self) -> i64 {
        intensity_bin(self.intensity)
    }
}

/// Discretize an intensity scalar into one of ten arm bins.
pub fn intensity_bin(intensity: f64) -> i64 {
    ((clamp01(intensity) * 10.0).round() as i64).min(9)
}

/// Recenter a stored bin to its midpoint intensity. Capped below 1.0 so
/// a re-binned midpoint can never escalate past the top arm.
pub fn intensity_from_bin(bin: i64) -> f64 {
    ((bin.clamp(0, 9) as f64 + 0.5) / 10.0).clamp(0.0, 0.99)
}

/// Where a decision came from: the learned policy, an exploration draw,
/// or the caller-supplied fallback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Mirror,
    Explore,
    Fallback,
}

impl fmt::Display for PolicySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Mirror => "mirror",
            Self::Explore => "explore",
            Self::Fallback => "fallback",
        };
        f.write_str(value)
    }
}

/// Result of one `choose_action` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub action: MirrorAction,
    pub bucket_key: String,
    pub source: PolicySource,
}

/// One completed (action, outcome) pair. Append-only audit/training row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodeRecord {
    pub ts_secs: i64,
    pub user_count: i64,
    pub tone: Tone,
    pub intensity: f64,
    pub intensity_bin: i64,
    pub bucket_key: String,
    pub pre_coherence: f64,
    pub pre_entropy: f64,
    pub pre_pad: [f64; 3],
    pub post_coherence: f64,
    pub post_entropy: f64,
    pub post_pad: [f64; 3],
    pub duration_ms: i64,
    pub reward: f64,
}

/// Aggregated reward statistic for one (bucket, tone, intensity bin) arm.
/// `sample_count` is always >= 1 for a persisted row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRow {
    pub bucket_key: String,
    pub tone: Tone,
    pub intensity_bin: i64,
    pub reward_avg: f64,
    pub sample_count: i64,
    pub updated_at_secs: i64,
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
}

/// Compose the discrete context key: hour-of-day, load tier, dominant
/// PAD axis. The same function serves the online selection path and the
/// offline aggregation path; keys must never diverge between the two.
pub fn derive_bucket_key(ts_secs: i64, load: i64, pad: &[f64]) -> String {
    let hour = Utc
        .timestamp_opt(ts_secs, 0)
        .single()
        .map(|dt| dt.hour())
        .unwrap_or(0);

    let load_bin = if load < 20 {
        'L'
    } else if load < 60 {
        'M'
    } else {
        'H'
    };

    let pad = repair_pad(pad);
    // Ties resolve to the lowest index: P beats A beats D.
    let mut dominant = 0;
    for idx in 1..3 {
        if pad[idx] > pad[dominant] {
            dominant = idx;
        }
    }
    let axis = ['P', 'A', 'D'][dominant];

    format!("{hour:02}-{load_bin}-{axis}")
}

/// Reward for the transition between two field snapshots: coherence
/// should rise, entropy should fall. PAD values and elapsed time do not
/// participate; negative rewards are valid signal.
pub fn compute_reward(pre: &FieldState, post: &FieldState) -> f64 {
    let delta_coherence = clamp01(post.coherence) - clamp01(pre.coherence);
    let delta_entropy = clamp01(post.entropy) - clamp01(pre.entropy);
    delta_coherence - delta_entropy
}

/// Produces field snapshots on demand. Implemented by the excluded
/// field aggregation layer; the mirror loop only consumes it.
#[async_trait]
pub trait FieldSource: Send + Sync {
    async fn current_snapshot(&self) -> Result<FieldState>;
}

/// Supplies the default action when no learned policy applies.
pub trait FallbackPolicy: Send + Sync {
    fn default_action(&self, state: &FieldState) -> MirrorAction;
}

/// Wall-clock seam so tests can pin time.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        Utc::now().timestamp()
    }
}
