//! Synthetic field driver pieces: a random-walk field source and a
//! static fallback policy, enough to exercise the mirror loop end to
//! end without the full aggregation pipeline.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use field_types::{clamp01, Clock, FallbackPolicy, FieldSource, FieldState, MirrorAction, Tone};
use rand::Rng;

/// Field source backed by a bounded random walk. Each snapshot nudges
/// coherence, entropy and PAD a small step and stamps the current time.
pub struct DriftingFieldSource {
    state: Mutex<FieldState>,
    clock: Arc<dyn Clock>,
}

impl DriftingFieldSource {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let seed = FieldState::new(0.5, 0.5, &[0.5, 0.4, 0.3], clock.now_secs());
        Self {
            state: Mutex::new(seed),
            clock,
        }
    }
}

#[async_trait]
impl FieldSource for DriftingFieldSource {
    async fn current_snapshot(&self) -> Result<FieldState> {
        let mut rng = rand::thread_rng();
        let mut guard = self
            .state
            .lock()
            .map_err(|_| anyhow!("field state lock poisoned"))?;

        guard.coherence = clamp01(guard.coherence + rng.gen_range(-0.05..=0.05));
        guard.entropy = clamp01(guard.entropy + rng.gen_range(-0.05..=0.05));
        for axis in guard.pad.iter_mut() {
            *axis = clamp01(*axis + rng.gen_range(-0.03..=0.03));
        }
        guard.ts_secs = self.clock.now_secs();

        Ok(*guard)
    }
}

/// Fixed tone heuristic used when no learned policy applies: soothe a
/// noisy field, cool an already settled one, stay neutral otherwise.
pub struct SteadyFallback;

impl FallbackPolicy for SteadyFallback {
    fn default_action(&self, state: &FieldState) -> MirrorAction {
        if state.entropy > 0.6 {
            MirrorAction {
                tone: Tone::Warm,
                intensity: 0.6,
                message: "the field trembles; hold it gently".to_string(),
            }
        } else if state.coherence > 0.7 {
            MirrorAction {
                tone: Tone::Cool,
                intensity: 0.4,
                message: "the field is settled; keep it light".to_string(),
            }
        } else {
            MirrorAction {
                tone: Tone::Neutral,
                intensity: 0.5,
                message: "steady breathing".to_string(),
            }
        }
    }
}
