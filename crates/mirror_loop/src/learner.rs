//! Periodic policy consolidation.
//!
//! The online path keeps aggregates fresh incrementally; the learner
//! re-derives every policy row from the episode log on an interval so
//! drift (crash between the two writes, manual episode imports) heals
//! itself without operator action.

use std::sync::Arc;
use std::time::Duration;

use policy_store::PolicyStore;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct PolicyLearner {
    store: PolicyStore,
    interval: Duration,
    // Serializes rebuilds; a rebuild requested while one runs is skipped,
    // not queued, since the next pass covers the same episodes anyway.
    gate: Mutex<()>,
}

impl PolicyLearner {
    pub fn new(store: PolicyStore, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            interval,
            gate: Mutex::new(()),
        })
    }

    /// One consolidation pass. Returns whether the rebuild actually ran.
    pub async fn run_once(&self) -> bool {
        let Ok(_guard) = self.gate.try_lock() else {
            tracing::debug!("rebuild already in progress, coalescing");
            metrics::counter!("mirror.learner.coalesced").increment(1);
            return false;
        };
        self.store.rebuild_all().await;
        metrics::counter!("mirror.learner.rebuilds").increment(1);
        true
    }

    /// Spawn the interval loop. The first rebuild happens one interval
    /// after startup; the online upserts cover the gap.
    pub fn spawn(self: &Arc<Self>) -> LearnerHandle {
        let learner = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(learner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        learner.run_once().await;
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("policy learner stopping");
                        return;
                    }
                }
            }
        });
        LearnerHandle {
            join,
            shutdown: shutdown_tx,
        }
    }
}

pub struct LearnerHandle {
    join: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl LearnerHandle {
    /// Signal the loop to exit and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }

    pub fn abort(&self) {
        self.join.abort();
    }
}
