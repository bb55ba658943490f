//! Durable store for mirror episodes and aggregated policy rows.
//!
//! Two tables: `mirror_episodes` is the append-only training/audit log,
//! `policy_rows` is the per-arm aggregate the selection path reads.
//! Both the incremental running-mean upsert and the full group-by
//! rebuild converge to the same aggregates for the same episode set.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use field_types::{EpisodeRecord, MirrorError, PolicyRow, Tone};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio::task;

/// Heatmap cell: average reward per (tone, intensity bin) across all buckets.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HeatmapCell {
    pub tone: Tone,
    pub intensity_bin: i64,
    pub reward_avg: f64,
    pub sample_count: i64,
}

/// Aggregate counters for the administrative reporting surface.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StoreStats {
    pub total_episodes: i64,
    pub avg_reward: f64,
    pub unique_buckets: i64,
    /// Share of the 72-key context space seen at least once.
    pub bucket_coverage: f64,
}

const BUCKET_SPACE: f64 = 72.0;

/// SQLite-backed policy store.
///
/// If the database cannot be opened at construction time the store runs
/// degraded: writes become no-ops, reads return empty results, and the
/// rest of the system keeps serving fallback actions.
#[derive(Clone)]
pub struct PolicyStore {
    conn: Option<Arc<Mutex<Connection>>>,
}

impl PolicyStore {
    /// Open (or create) the store at `path`. Never fails: an unreachable
    /// database yields a degraded store, logged once here.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        match Self::try_open(path.as_ref()) {
            Ok(store) => store,
            Err(err) => {
                tracing::warn!(%err, "policy store unavailable, running degraded");
                Self { conn: None }
            }
        }
    }

    fn try_open(path: &Path) -> Result<Self, MirrorError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| MirrorError::StorageUnavailable(err.to_string()))?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|err| MirrorError::StorageUnavailable(err.to_string()))?;
        init_schema(&conn).map_err(|err| MirrorError::StorageUnavailable(err.to_string()))?;
        Ok(Self {
            conn: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// In-memory store, used by tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Construct a store that is degraded from the start.
    pub fn degraded() -> Self {
        Self { conn: None }
    }

    pub fn is_degraded(&self) -> bool {
        self.conn.is_none()
    }

    /// Run a blocking sqlite operation off the async runtime. Failures
    /// are logged, not surfaced; callers observe them as absent results.
    async fn with_conn<T, F>(&self, op: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let Some(conn) = self.conn.clone() else {
            tracing::debug!(op, "policy store degraded, skipping operation");
            return None;
        };
        let joined = task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| anyhow!("connection lock poisoned"))?;
            f(&mut guard)
        })
        .await;
        match joined {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                tracing::warn!(op, %err, "policy store operation failed");
                None
            }
            Err(err) => {
                tracing::warn!(op, %err, "policy store task aborted");
                None
            }
        }
    }

    /// Durably append one episode row.
    pub async fn append_episode(&self, episode: &EpisodeRecord) {
        let episode = episode.clone();
        self.with_conn("append_episode", move |conn| insert_episode(conn, &episode))
            .await;
    }

    /// Incremental running-mean update of one policy row, creating it on
    /// first sight of the key.
    pub async fn upsert_policy_row(
        &self,
        bucket_key: &str,
        tone: Tone,
        intensity_bin: i64,
        reward: f64,
    ) {
        let bucket_key = bucket_key.to_string();
        self.with_conn("upsert_policy_row", move |conn| {
            upsert_row(conn, &bucket_key, tone, intensity_bin, reward)
        })
        .await;
    }

    /// Append the episode and fold it into its policy row in a single
    /// transaction, so a selection read never observes the episode
    /// without its aggregate (or vice versa).
    pub async fn record_episode(&self, episode: &EpisodeRecord) {
        let episode = episode.clone();
        self.with_conn("record_episode", move |conn| {
            let tx = conn.transaction()?;
            insert_episode(&tx, &episode)?;
            upsert_row(
                &tx,
                &episode.bucket_key,
                episode.tone,
                episode.intensity_bin,
                episode.reward,
            )?;
            tx.commit()?;
            Ok(())
        })
        .await;
    }

    /// Recompute every policy row from the full episode table. Overwrites
    /// existing aggregates in place; running it twice is a no-op.
    pub async fn rebuild_all(&self) {
        self.with_conn("rebuild_all", move |conn| {
            let now = Utc::now().timestamp();
            conn.execute(
                r#"
                INSERT INTO policy_rows
                    (bucket_key, tone, intensity_bin, reward_avg, sample_count, updated_at_secs)
                SELECT bucket_key, tone, intensity_bin, AVG(reward), COUNT(*), ?
                FROM mirror_episodes
                GROUP BY bucket_key, tone, intensity_bin
                ON CONFLICT(bucket_key, tone, intensity_bin) DO UPDATE SET
                    reward_avg = excluded.reward_avg,
                    sample_count = excluded.sample_count,
                    updated_at_secs = excluded.updated_at_secs
                "#,
                params![now],
            )?;
            Ok(())
        })
        .await;
    }

    /// Best-evidenced arm for a bucket: highest reward average, ties
    /// broken by higher sample count.
    pub async fn best_row(&self, bucket_key: &str) -> Option<PolicyRow> {
        let bucket_key = bucket_key.to_string();
        self.with_conn("best_row", move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {POLICY_COLUMNS} FROM policy_rows WHERE bucket_key = ? \
                     ORDER BY reward_avg DESC, sample_count DESC LIMIT 1"
                ),
                params![bucket_key],
                decode_policy_row,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
        .flatten()
    }

    /// All policy rows, optionally filtered by bucket, best first.
    pub async fn rows(&self, bucket_key: Option<&str>) -> Vec<PolicyRow> {
        let bucket_key = bucket_key.map(ToOwned::to_owned);
        self.with_conn("rows", move |conn| {
            let mut out = Vec::new();
            match bucket_key {
                Some(bucket) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {POLICY_COLUMNS} FROM policy_rows WHERE bucket_key = ? \
                         ORDER BY reward_avg DESC, sample_count DESC"
                    ))?;
                    let rows = stmt.query_map(params![bucket], decode_policy_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {POLICY_COLUMNS} FROM policy_rows \
                         ORDER BY reward_avg DESC, sample_count DESC"
                    ))?;
                    let rows = stmt.query_map([], decode_policy_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
        .await
        .unwrap_or_default()
    }

    /// Newest episodes first, up to `limit`.
    pub async fn recent_episodes(&self, limit: u32) -> Vec<EpisodeRecord> {
        self.with_conn("recent_episodes", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EPISODE_COLUMNS} FROM mirror_episodes ORDER BY id DESC LIMIT ?"
            ))?;
            let rows = stmt.query_map(params![limit], decode_episode)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .unwrap_or_default()
    }

    /// Average reward per (tone, intensity bin) across every bucket.
    pub async fn heatmap(&self) -> Vec<HeatmapCell> {
        self.with_conn("heatmap", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT tone, intensity_bin, AVG(reward), COUNT(*) \
                 FROM mirror_episodes GROUP BY tone, intensity_bin ORDER BY tone, intensity_bin",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(HeatmapCell {
                    tone: Tone::from_label(&row.get::<_, String>(0)?),
                    intensity_bin: row.get(1)?,
                    reward_avg: row.get(2)?,
                    sample_count: row.get(3)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
        .unwrap_or_default()
    }

    /// Aggregate counters over the whole episode log.
    pub async fn stats(&self) -> StoreStats {
        self.with_conn("stats", move |conn| {
            let (total, avg, buckets) = conn.query_row(
                "SELECT COUNT(*), COALESCE(AVG(reward), 0.0), COUNT(DISTINCT bucket_key) \
                 FROM mirror_episodes",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )?;
            Ok(StoreStats {
                total_episodes: total,
                avg_reward: avg,
                unique_buckets: buckets,
                bucket_coverage: buckets as f64 / BUCKET_SPACE,
            })
        })
        .await
        .unwrap_or_default()
    }
}

const POLICY_COLUMNS: &str =
    "bucket_key, tone, intensity_bin, reward_avg, sample_count, updated_at_secs";

const EPISODE_COLUMNS: &str = "ts_secs, user_count, tone, intensity, intensity_bin, bucket_key, \
     pre_coherence, pre_entropy, pre_pad, post_coherence, post_entropy, post_pad, \
     duration_ms, reward";

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS mirror_episodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_secs INTEGER NOT NULL,
            user_count INTEGER NOT NULL,
            tone TEXT NOT NULL,
            intensity REAL NOT NULL,
            intensity_bin INTEGER NOT NULL,
            bucket_key TEXT NOT NULL,
            pre_coherence REAL NOT NULL,
            pre_entropy REAL NOT NULL,
            pre_pad TEXT NOT NULL,
            post_coherence REAL NOT NULL,
            post_entropy REAL NOT NULL,
            post_pad TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            reward REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_mirror_episodes_bucket ON mirror_episodes(bucket_key);
        CREATE INDEX IF NOT EXISTS idx_mirror_episodes_ts ON mirror_episodes(ts_secs);

        CREATE TABLE IF NOT EXISTS policy_rows (
            bucket_key TEXT NOT NULL,
            tone TEXT NOT NULL,
            intensity_bin INTEGER NOT NULL,
            reward_avg REAL NOT NULL,
            sample_count INTEGER NOT NULL,
            updated_at_secs INTEGER NOT NULL,
            PRIMARY KEY (bucket_key, tone, intensity_bin)
        );
        "#,
    )?;
    Ok(())
}

fn insert_episode(conn: &Connection, episode: &EpisodeRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO mirror_episodes ({EPISODE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ),
        params![
            episode.ts_secs,
            episode.user_count,
            episode.tone.as_str(),
            episode.intensity,
            episode.intensity_bin,
            episode.bucket_key,
            episode.pre_coherence,
            episode.pre_entropy,
            encode_pad(&episode.pre_pad),
            episode.post_coherence,
            episode.post_entropy,
            encode_pad(&episode.post_pad),
            episode.duration_ms,
            episode.reward,
        ],
    )?;
    Ok(())
}

fn upsert_row(
    conn: &Connection,
    bucket_key: &str,
    tone: Tone,
    intensity_bin: i64,
    reward: f64,
) -> Result<()> {
    // The DO UPDATE expressions all read the pre-update row, so the mean
    // update uses the incremented count exactly once.
    conn.execute(
        r#"
        INSERT INTO policy_rows
            (bucket_key, tone, intensity_bin, reward_avg, sample_count, updated_at_secs)
        VALUES (?, ?, ?, ?, 1, ?)
        ON CONFLICT(bucket_key, tone, intensity_bin) DO UPDATE SET
            reward_avg = reward_avg + (excluded.reward_avg - reward_avg) / (sample_count + 1),
            sample_count = sample_count + 1,
            updated_at_secs = excluded.updated_at_secs
        "#,
        params![
            bucket_key,
            tone.as_str(),
            intensity_bin,
            reward,
            Utc::now().timestamp(),
        ],
    )?;
    Ok(())
}

fn decode_policy_row(row: &Row<'_>) -> rusqlite::Result<PolicyRow> {
    Ok(PolicyRow {
        bucket_key: row.get(0)?,
        tone: Tone::from_label(&row.get::<_, String>(1)?),
        intensity_bin: row.get(2)?,
        reward_avg: row.get(3)?,
        sample_count: row.get(4)?,
        updated_at_secs: row.get(5)?,
    })
}

fn decode_episode(row: &Row<'_>) -> rusqlite::Result<EpisodeRecord> {
    Ok(EpisodeRecord {
        ts_secs: row.get(0)?,
        user_count: row.get(1)?,
        tone: Tone::from_label(&row.get::<_, String>(2)?),
        intensity: row.get(3)?,
        intensity_bin: row.get(4)?,
        bucket_key: row.get(5)?,
        pre_coherence: row.get(6)?,
        pre_entropy: row.get(7)?,
        pre_pad: decode_pad(&row.get::<_, String>(8)?),
        post_coherence: row.get(9)?,
        post_entropy: row.get(10)?,
        post_pad: decode_pad(&row.get::<_, String>(11)?),
        duration_ms: row.get(12)?,
        reward: row.get(13)?,
    })
}

fn encode_pad(pad: &[f64; 3]) -> String {
    format!("{:.4},{:.4},{:.4}", pad[0], pad[1], pad[2])
}

fn decode_pad(raw: &str) -> [f64; 3] {
    match try_decode_pad(raw) {
        Ok(pad) => pad,
        Err(err) => {
            tracing::warn!(%err, "normalizing malformed pad column");
            [0.0; 3]
        }
    }
}

fn try_decode_pad(raw: &str) -> Result<[f64; 3], MirrorError> {
    let mut out = [0.0_f64; 3];
    for (idx, part) in raw.split(',').take(3).enumerate() {
        out[idx] = part
            .trim()
            .parse::<f64>()
            .map_err(|_| MirrorError::MalformedRecord(format!("pad component {part:?}")))?;
    }
    Ok(out)
}
