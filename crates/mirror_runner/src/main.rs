use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use field_types::{Clock, FallbackPolicy, FieldSource, SystemClock};
use mirror_loop::learner::PolicyLearner;
use mirror_loop::{MirrorLoop, MirrorLoopConfig};
use policy_store::PolicyStore;
use rand::Rng;
use serde::{Deserialize, Serialize};

mod field;

use field::{DriftingFieldSource, SteadyFallback};

const DRIVER_SESSION: &str = "field-driver";

#[derive(Parser, Debug)]
#[command(name = "mirror-runner", version, about = "Mirror loop service: field driver + admin API")]
struct Cli {
    #[arg(long, env = "MIRROR_DB_PATH", default_value = "data/mirror_loop.db")]
    db_path: String,
    #[arg(long, env = "MIRROR_EPSILON", default_value_t = 0.1)]
    epsilon: f64,
    #[arg(long, env = "MIRROR_REBUILD_INTERVAL_SECS", default_value_t = 60)]
    rebuild_interval_secs: u64,
    #[arg(long, env = "MIRROR_MAX_PENDING_AGE_SECS", default_value_t = 900)]
    max_pending_age_secs: i64,
    #[arg(long, env = "MIRROR_FIELD_TICK_SECS", default_value_t = 5)]
    field_tick_secs: u64,
    #[arg(long, env = "MIRROR_BIND", default_value = "0.0.0.0:8080")]
    bind: String,
}

#[derive(Clone)]
struct AppState {
    mirror: Arc<MirrorLoop>,
    learner: Arc<PolicyLearner>,
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    store_degraded: bool,
}

#[derive(Deserialize)]
struct BucketQuery {
    bucket_key: Option<String>,
}

#[derive(Deserialize)]
struct SessionQuery {
    session: Option<String>,
}

#[derive(Deserialize)]
struct EpisodesQuery {
    limit: Option<u32>,
}

#[derive(Serialize)]
struct RebuildResp {
    ran: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry = observability::init("mirror_runner")?;

    let store = PolicyStore::open(&cli.db_path);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mirror = Arc::new(MirrorLoop::new(
        store.clone(),
        clock.clone(),
        MirrorLoopConfig {
            epsilon: cli.epsilon,
            max_pending_age_secs: cli.max_pending_age_secs,
        },
    ));

    let learner = PolicyLearner::new(store, Duration::from_secs(cli.rebuild_interval_secs));
    let _learner_handle = learner.spawn();

    spawn_field_driver(
        mirror.clone(),
        Arc::new(DriftingFieldSource::new(clock)),
        Duration::from_secs(cli.field_tick_secs.max(1)),
    );

    let state = AppState {
        mirror,
        learner,
        prometheus: telemetry.prometheus.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/mirror/policy", get(policy))
        .route("/mirror/policy/best", get(policy_best))
        .route("/mirror/stats", get(stats))
        .route("/mirror/heatmap", get(heatmap))
        .route("/mirror/episodes", get(episodes))
        .route("/mirror/context", get(context))
        .route("/mirror/rebuild", post(rebuild))
        .with_state(state);

    let addr: SocketAddr = cli.bind.parse()?;
    tracing::info!(%addr, "mirror admin api started");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

/// Drive the loop against the synthetic field: choose an action on one
/// tick, observe the outcome on the next.
fn spawn_field_driver(mirror: Arc<MirrorLoop>, source: Arc<DriftingFieldSource>, tick: Duration) {
    tokio::spawn(async move {
        let fallback = SteadyFallback;
        let mut ticker = tokio::time::interval(tick);
        let mut user_count: i64 = 24;
        loop {
            ticker.tick().await;
            let pre = match source.current_snapshot().await {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(%err, "field snapshot failed");
                    continue;
                }
            };
            user_count = (user_count + rand::thread_rng().gen_range(-3..=3)).clamp(0, 150);

            let decision = mirror
                .choose_action(
                    DRIVER_SESSION,
                    &pre,
                    fallback.default_action(&pre),
                    user_count,
                    true,
                )
                .await;
            tracing::debug!(
                bucket = %decision.bucket_key,
                source = %decision.source,
                tone = %decision.action.tone,
                "field action chosen"
            );

            ticker.tick().await;
            match source.current_snapshot().await {
                Ok(post) => mirror.observe_state(DRIVER_SESSION, &post).await,
                Err(err) => tracing::warn!(%err, "field snapshot failed, outcome skipped"),
            }
        }
    });
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResp {
        status: "ok",
        store_degraded: state.mirror.store().is_degraded(),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}

async fn policy(
    State(state): State<AppState>,
    Query(query): Query<BucketQuery>,
) -> impl IntoResponse {
    Json(state.mirror.store().rows(query.bucket_key.as_deref()).await)
}

async fn policy_best(
    State(state): State<AppState>,
    Query(query): Query<BucketQuery>,
) -> impl IntoResponse {
    let Some(bucket_key) = query.bucket_key else {
        return (StatusCode::BAD_REQUEST, "bucket_key required").into_response();
    };
    Json(state.mirror.store().best_row(&bucket_key).await).into_response()
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.mirror.store().stats().await)
}

async fn heatmap(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.mirror.store().heatmap().await)
}

async fn episodes(
    State(state): State<AppState>,
    Query(query): Query<EpisodesQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).min(500);
    Json(state.mirror.store().recent_episodes(limit).await)
}

async fn context(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> impl IntoResponse {
    let session = query.session.as_deref().unwrap_or(DRIVER_SESSION);
    Json(state.mirror.current_context(session).await)
}

async fn rebuild(State(state): State<AppState>) -> impl IntoResponse {
    let ran = state.learner.run_once().await;
    Json(RebuildResp { ran })
}
