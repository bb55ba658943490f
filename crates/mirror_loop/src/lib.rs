//! The mirror loop: an online, context-bucketed policy that picks the
//! feedback action for the current field state and learns from the field
//! state observed after the action went out.
//!
//! One loop instance is shared by all sessions. Calls for the same
//! session are mutually exclusive; unrelated sessions never serialize
//! against each other.

pub mod learner;

use std::sync::Arc;

use dashmap::DashMap;
use field_types::{
    compute_reward, derive_bucket_key, intensity_bin, intensity_from_bin, clamp01, Clock,
    Decision, EpisodeRecord, FieldState, MirrorAction, PolicySource, Tone,
};
use policy_store::PolicyStore;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct MirrorLoopConfig {
    /// Exploration probability for the ε-greedy draw.
    pub epsilon: f64,
    /// Pending actions older than this are dropped instead of paired,
    /// so a stale action cannot claim credit for a far-future
    /// observation. 0 disables the window.
    pub max_pending_age_secs: i64,
}

impl Default for MirrorLoopConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            max_pending_age_secs: 900,
        }
    }
}

/// Action taken but not yet paired with a post-state observation.
#[derive(Debug, Clone)]
struct PendingAction {
    pre_state: FieldState,
    tone: Tone,
    intensity: f64,
    bucket_key: String,
    user_count: i64,
    started_at_secs: i64,
}

#[derive(Debug, Default)]
struct Session {
    pending: Option<PendingAction>,
    last_bucket: Option<String>,
    last_source: Option<PolicySource>,
    last_action: Option<(Tone, f64)>,
}

/// Last decision snapshot for one session, served to the admin surface.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContextSnapshot {
    pub bucket_key: Option<String>,
    pub source: Option<PolicySource>,
    pub tone: Option<Tone>,
    pub intensity: Option<f64>,
    pub awaiting_outcome: bool,
}

pub struct MirrorLoop {
    store: PolicyStore,
    clock: Arc<dyn Clock>,
    cfg: MirrorLoopConfig,
    sessions: DashMap<String, Arc<Mutex<Session>>>,
}

impl MirrorLoop {
    pub fn new(store: PolicyStore, clock: Arc<dyn Clock>, cfg: MirrorLoopConfig) -> Self {
        Self {
            store,
            clock,
            cfg,
            sessions: DashMap::new(),
        }
    }

    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    fn session(&self, session_id: &str) -> Arc<Mutex<Session>> {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Pick the action to emit for `current_state`.
    ///
    /// Consults the learned policy with probability `1-ε`, otherwise
    /// defers to the fallback. Always records the chosen action (and the
    /// pre-state) as the session's pending action, replacing any earlier
    /// unconsumed one: only the most recent action can be attributed to
    /// the next observation. In-memory bookkeeping only; the single
    /// suspension point is the policy read.
    pub async fn choose_action(
        &self,
        session_id: &str,
        current_state: &FieldState,
        fallback: MirrorAction,
        user_count: i64,
        mirror_allowed: bool,
    ) -> Decision {
        let slot = self.session(session_id);
        let mut session = slot.lock().await;

        let state = current_state.sanitized();
        let bucket_key = derive_bucket_key(state.ts_secs, user_count, &state.pad);
        session.last_bucket = Some(bucket_key.clone());

        if !mirror_allowed {
            // Opted-out context: hand back the fallback untouched and
            // forget any in-flight action so it cannot pair later.
            session.pending = None;
            session.last_source = Some(PolicySource::Fallback);
            session.last_action = Some((fallback.tone, fallback.intensity));
            metrics::counter!("mirror.decision.bypass").increment(1);
            return Decision {
                action: fallback,
                bucket_key,
                source: PolicySource::Fallback,
            };
        }

        let roll: f64 = rand::thread_rng().gen();
        let (tone, intensity, source) = if roll < self.cfg.epsilon {
            (fallback.tone, clamp01(fallback.intensity), PolicySource::Explore)
        } else {
            match self.store.best_row(&bucket_key).await {
                Some(row) if row.reward_avg > 0.0 => (
                    row.tone,
                    intensity_from_bin(row.intensity_bin),
                    PolicySource::Mirror,
                ),
                _ => (fallback.tone, clamp01(fallback.intensity), PolicySource::Fallback),
            }
        };
        metrics::counter!("mirror.decision", "source" => source.to_string()).increment(1);

        if session.pending.is_some() {
            metrics::counter!("mirror.pending.superseded").increment(1);
        }
        session.pending = Some(PendingAction {
            pre_state: state,
            tone,
            intensity,
            bucket_key: bucket_key.clone(),
            user_count,
            started_at_secs: self.clock.now_secs(),
        });
        session.last_source = Some(source);
        session.last_action = Some((tone, intensity));

        Decision {
            action: MirrorAction {
                tone,
                intensity,
                message: fallback.message,
            },
            bucket_key,
            source,
        }
    }

    /// Pair a fresh field observation with the session's pending action
    /// and persist the resulting episode. No-op when nothing is pending.
    /// Storage trouble degrades learning speed only; it never reaches
    /// the caller.
    pub async fn observe_state(&self, session_id: &str, post_state: &FieldState) {
        let slot = self.session(session_id);
        let mut session = slot.lock().await;
        let Some(pending) = session.pending.take() else {
            return;
        };

        let now = self.clock.now_secs();
        if self.cfg.max_pending_age_secs > 0
            && now.saturating_sub(pending.started_at_secs) > self.cfg.max_pending_age_secs
        {
            tracing::debug!(bucket = %pending.bucket_key, "dropping stale pending action");
            metrics::counter!("mirror.pending.stale_drop").increment(1);
            return;
        }
        drop(session);

        let mut post = post_state.sanitized();
        if post.ts_secs <= pending.pre_state.ts_secs {
            // Synthesize a strictly-later post timestamp so the episode
            // never carries a non-positive duration.
            post.ts_secs = pending.pre_state.ts_secs + 1;
        }

        let reward = compute_reward(&pending.pre_state, &post);
        let episode = EpisodeRecord {
            ts_secs: post.ts_secs,
            user_count: pending.user_count,
            tone: pending.tone,
            intensity: pending.intensity,
            intensity_bin: intensity_bin(pending.intensity),
            bucket_key: pending.bucket_key,
            pre_coherence: pending.pre_state.coherence,
            pre_entropy: pending.pre_state.entropy,
            pre_pad: pending.pre_state.pad,
            post_coherence: post.coherence,
            post_entropy: post.entropy,
            post_pad: post.pad,
            duration_ms: (post.ts_secs - pending.pre_state.ts_secs).max(0) * 1_000,
            reward,
        };

        tracing::debug!(bucket = %episode.bucket_key, reward, "mirror episode paired");
        metrics::counter!("mirror.episode.paired").increment(1);
        self.store.record_episode(&episode).await;
    }

    /// Session teardown: any pending action is discarded, never recorded.
    pub async fn end_session(&self, session_id: &str) {
        if let Some((_, slot)) = self.sessions.remove(session_id) {
            let mut session = slot.lock().await;
            if session.pending.take().is_some() {
                tracing::debug!(session_id, "discarding pending action on teardown");
            }
        }
    }

    /// Last decision made for a session, if it was ever seen.
    pub async fn current_context(&self, session_id: &str) -> Option<ContextSnapshot> {
        let slot = self.sessions.get(session_id)?.clone();
        let session = slot.lock().await;
        Some(ContextSnapshot {
            bucket_key: session.last_bucket.clone(),
            source: session.last_source,
            tone: session.last_action.map(|(tone, _)| tone),
            intensity: session.last_action.map(|(_, intensity)| intensity),
            awaiting_outcome: session.pending.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;

    struct FixedClock(AtomicI64);

    impl FixedClock {
        fn at(secs: i64) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(secs)))
        }

        fn advance(&self, secs: i64) {
            self.0.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for FixedClock {
        fn now_secs(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    // 2024-01-01 12:00:00 UTC; load 30 -> M; pad dominant D.
    const TS_12H: i64 = 1_704_110_400;

    fn state_for_bucket_12_m_d(coherence: f64, entropy: f64, ts_secs: i64) -> FieldState {
        FieldState::new(coherence, entropy, &[0.1, 0.2, 0.9], ts_secs)
    }

    fn fallback(tone: Tone) -> MirrorAction {
        MirrorAction {
            tone,
            intensity: 0.5,
            message: "listening to the field".to_string(),
        }
    }

    fn greedy_loop(store: PolicyStore, clock: Arc<dyn Clock>) -> MirrorLoop {
        MirrorLoop::new(
            store,
            clock,
            MirrorLoopConfig {
                epsilon: 0.0,
                ..MirrorLoopConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn greedy_pick_follows_learned_policy() {
        let store = PolicyStore::open_in_memory().expect("store");
        store.upsert_policy_row("12-M-D", Tone::Cool, 5, 0.8).await;

        let mirror = greedy_loop(store, FixedClock::at(TS_12H));
        let decision = mirror
            .choose_action(
                "s1",
                &state_for_bucket_12_m_d(0.4, 0.6, TS_12H),
                fallback(Tone::Neutral),
                30,
                true,
            )
            .await;

        assert_eq!(decision.bucket_key, "12-M-D");
        assert_eq!(decision.source, PolicySource::Mirror);
        assert_eq!(decision.action.tone, Tone::Cool);
        assert!((decision.action.intensity - 0.55).abs() < 1e-12);
    }

    #[tokio::test]
    async fn non_positive_reward_rows_fall_back() {
        let store = PolicyStore::open_in_memory().expect("store");
        store.upsert_policy_row("12-M-D", Tone::Cool, 5, -0.2).await;

        let mirror = greedy_loop(store, FixedClock::at(TS_12H));
        let decision = mirror
            .choose_action(
                "s1",
                &state_for_bucket_12_m_d(0.4, 0.6, TS_12H),
                fallback(Tone::Warm),
                30,
                true,
            )
            .await;

        assert_eq!(decision.source, PolicySource::Fallback);
        assert_eq!(decision.action.tone, Tone::Warm);
    }

    #[tokio::test]
    async fn bypass_ignores_learned_policy_and_clears_pending() {
        let store = PolicyStore::open_in_memory().expect("store");
        store.upsert_policy_row("12-M-D", Tone::Cool, 5, 0.9).await;

        let mirror = greedy_loop(store.clone(), FixedClock::at(TS_12H));
        let pre = state_for_bucket_12_m_d(0.4, 0.6, TS_12H);

        // Arm a pending action, then bypass: the pending slot must clear.
        mirror
            .choose_action("s1", &pre, fallback(Tone::Warm), 30, true)
            .await;
        let decision = mirror
            .choose_action("s1", &pre, fallback(Tone::Warm), 30, false)
            .await;
        assert_eq!(decision.source, PolicySource::Fallback);
        assert_eq!(decision.action.tone, Tone::Warm);
        assert!((decision.action.intensity - 0.5).abs() < 1e-12);

        mirror
            .observe_state("s1", &state_for_bucket_12_m_d(0.7, 0.4, TS_12H + 5))
            .await;
        assert_eq!(store.stats().await.total_episodes, 0);
    }

    #[tokio::test]
    async fn explore_keeps_fallback_action_but_still_learns() {
        let store = PolicyStore::open_in_memory().expect("store");
        store.upsert_policy_row("12-M-D", Tone::Cool, 5, 0.9).await;

        let mirror = MirrorLoop::new(
            store.clone(),
            FixedClock::at(TS_12H),
            MirrorLoopConfig {
                epsilon: 1.0,
                ..MirrorLoopConfig::default()
            },
        );
        let decision = mirror
            .choose_action(
                "s1",
                &state_for_bucket_12_m_d(0.4, 0.6, TS_12H),
                fallback(Tone::Warm),
                30,
                true,
            )
            .await;
        assert_eq!(decision.source, PolicySource::Explore);
        assert_eq!(decision.action.tone, Tone::Warm);

        mirror
            .observe_state("s1", &state_for_bucket_12_m_d(0.7, 0.4, TS_12H + 3))
            .await;
        let recent = store.recent_episodes(5).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].tone, Tone::Warm);
    }

    #[tokio::test]
    async fn observation_pairs_with_latest_action_only() {
        let store = PolicyStore::open_in_memory().expect("store");
        let mirror = greedy_loop(store.clone(), FixedClock::at(TS_12H));
        let pre = state_for_bucket_12_m_d(0.4, 0.6, TS_12H);

        mirror
            .choose_action("s1", &pre, fallback(Tone::Warm), 30, true)
            .await;
        mirror
            .choose_action("s1", &pre, fallback(Tone::Cool), 30, true)
            .await;
        mirror
            .observe_state("s1", &state_for_bucket_12_m_d(0.7, 0.4, TS_12H + 2))
            .await;
        // A second observation finds nothing pending.
        mirror
            .observe_state("s1", &state_for_bucket_12_m_d(0.9, 0.2, TS_12H + 4))
            .await;

        let recent = store.recent_episodes(5).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].tone, Tone::Cool);
        assert!((recent[0].reward - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn observe_without_pending_is_a_noop() {
        let store = PolicyStore::open_in_memory().expect("store");
        let mirror = greedy_loop(store.clone(), FixedClock::at(TS_12H));
        mirror
            .observe_state("s1", &state_for_bucket_12_m_d(0.7, 0.4, TS_12H))
            .await;
        assert_eq!(store.stats().await.total_episodes, 0);
    }

    #[tokio::test]
    async fn equal_timestamps_synthesize_forward_tick() {
        let store = PolicyStore::open_in_memory().expect("store");
        let mirror = greedy_loop(store.clone(), FixedClock::at(TS_12H));

        let pre = state_for_bucket_12_m_d(0.4, 0.6, TS_12H);
        mirror
            .choose_action("s1", &pre, fallback(Tone::Warm), 30, true)
            .await;
        // Post snapshot carries the same timestamp as the pre state.
        mirror
            .observe_state("s1", &state_for_bucket_12_m_d(0.5, 0.5, TS_12H))
            .await;

        let recent = store.recent_episodes(1).await;
        assert_eq!(recent[0].ts_secs, TS_12H + 1);
        assert_eq!(recent[0].duration_ms, 1_000);
    }

    #[tokio::test]
    async fn stale_pending_action_is_dropped() {
        let store = PolicyStore::open_in_memory().expect("store");
        let clock = FixedClock::at(TS_12H);
        let mirror = MirrorLoop::new(
            store.clone(),
            clock.clone(),
            MirrorLoopConfig {
                epsilon: 0.0,
                max_pending_age_secs: 60,
            },
        );

        let pre = state_for_bucket_12_m_d(0.4, 0.6, TS_12H);
        mirror
            .choose_action("s1", &pre, fallback(Tone::Warm), 30, true)
            .await;
        clock.advance(3_600);
        mirror
            .observe_state("s1", &state_for_bucket_12_m_d(0.9, 0.1, TS_12H + 3_600))
            .await;

        assert_eq!(store.stats().await.total_episodes, 0);
        // The slot cleared: the session is idle again.
        let ctx = mirror.current_context("s1").await.expect("context");
        assert!(!ctx.awaiting_outcome);
    }

    #[tokio::test]
    async fn session_teardown_discards_pending() {
        let store = PolicyStore::open_in_memory().expect("store");
        let mirror = greedy_loop(store.clone(), FixedClock::at(TS_12H));

        let pre = state_for_bucket_12_m_d(0.4, 0.6, TS_12H);
        mirror
            .choose_action("s1", &pre, fallback(Tone::Warm), 30, true)
            .await;
        mirror.end_session("s1").await;
        mirror
            .observe_state("s1", &state_for_bucket_12_m_d(0.9, 0.1, TS_12H + 2))
            .await;

        assert_eq!(store.stats().await.total_episodes, 0);
    }

    #[tokio::test]
    async fn sessions_do_not_share_pending_state() {
        let store = PolicyStore::open_in_memory().expect("store");
        let mirror = greedy_loop(store.clone(), FixedClock::at(TS_12H));
        let pre = state_for_bucket_12_m_d(0.4, 0.6, TS_12H);

        mirror
            .choose_action("alpha", &pre, fallback(Tone::Warm), 30, true)
            .await;
        mirror
            .choose_action("beta", &pre, fallback(Tone::Cool), 30, true)
            .await;
        mirror
            .observe_state("beta", &state_for_bucket_12_m_d(0.7, 0.4, TS_12H + 2))
            .await;

        let recent = store.recent_episodes(5).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].tone, Tone::Cool);

        let alpha = mirror.current_context("alpha").await.expect("context");
        assert!(alpha.awaiting_outcome);
    }

    #[tokio::test]
    async fn degraded_store_still_serves_fallback() {
        let mirror = greedy_loop(PolicyStore::degraded(), FixedClock::at(TS_12H));
        let pre = state_for_bucket_12_m_d(0.4, 0.6, TS_12H);

        let decision = mirror
            .choose_action("s1", &pre, fallback(Tone::Neutral), 30, true)
            .await;
        assert_eq!(decision.source, PolicySource::Fallback);

        // Pairing still works in memory; the append is silently dropped.
        mirror
            .observe_state("s1", &state_for_bucket_12_m_d(0.7, 0.4, TS_12H + 2))
            .await;
        let ctx = mirror.current_context("s1").await.expect("context");
        assert!(!ctx.awaiting_outcome);
    }

    #[tokio::test]
    async fn learned_policy_round_trip_through_episodes() {
        let store = PolicyStore::open_in_memory().expect("store");
        let mirror = greedy_loop(store.clone(), FixedClock::at(TS_12H));
        let pre = state_for_bucket_12_m_d(0.3, 0.7, TS_12H);

        // First pass: nothing learned yet, fallback wins; outcome improves
        // the field, so the arm turns positive.
        let first = mirror
            .choose_action("s1", &pre, fallback(Tone::Cool), 30, true)
            .await;
        assert_eq!(first.source, PolicySource::Fallback);
        mirror
            .observe_state("s1", &state_for_bucket_12_m_d(0.8, 0.2, TS_12H + 5))
            .await;

        // Second pass: the incrementally-updated row now drives the pick.
        let second = mirror
            .choose_action("s1", &pre, fallback(Tone::Warm), 30, true)
            .await;
        assert_eq!(second.source, PolicySource::Mirror);
        assert_eq!(second.action.tone, Tone::Cool);
    }
}
