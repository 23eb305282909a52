//! SQLite-backed persistent store.
//!
//! All authoritative state lives here; no component caches counters across
//! scheduler ticks. Multi-entity invariants (task creation + dispatched
//! keyspace, crack counters + hashlist totals, retry re-accounting) are
//! updated inside single transactions.

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

mod agents;
mod benchmarks;
mod events;
mod hashlists;
mod jobs;
mod layers;
mod presets;
mod settings;
mod tasks;

pub use jobs::JobFilter;
pub use tasks::{IngestOutcome, ProgressDelta};

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
}

impl StoreError {
    /// Busy/locked conditions that the caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(
                err,
                _,
            ))) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// StoreDb
// ---------------------------------------------------------------------------

/// Async SQLite store for jobs, tasks, layers, agents, hashlists, cracks,
/// benchmarks, presets, and system settings.
pub struct StoreDb {
    conn: Connection,
}

impl StoreDb {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> StoreResult<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS hashlists (
                        id                     TEXT PRIMARY KEY,
                        name                   TEXT NOT NULL,
                        hash_type_id           INTEGER NOT NULL,
                        total_hashes           INTEGER NOT NULL DEFAULT 0,
                        cracked_hashes         INTEGER NOT NULL DEFAULT 0,
                        has_mixed_work_factors INTEGER NOT NULL DEFAULT 0,
                        is_ready               INTEGER NOT NULL DEFAULT 0,
                        created_at             TEXT NOT NULL,
                        updated_at             TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS hashes (
                        id                 TEXT PRIMARY KEY,
                        original_hash      TEXT NOT NULL UNIQUE,
                        plaintext          TEXT,
                        is_cracked         INTEGER NOT NULL DEFAULT 0,
                        cracked_by_task_id TEXT,
                        metadata           TEXT
                    );

                    CREATE TABLE IF NOT EXISTS hashlist_hashes (
                        hashlist_id TEXT NOT NULL REFERENCES hashlists(id) ON DELETE CASCADE,
                        hash_id     TEXT NOT NULL REFERENCES hashes(id) ON DELETE CASCADE,
                        PRIMARY KEY (hashlist_id, hash_id)
                    );

                    CREATE TABLE IF NOT EXISTS job_executions (
                        id                           TEXT PRIMARY KEY,
                        name                         TEXT NOT NULL,
                        hashlist_id                  TEXT NOT NULL REFERENCES hashlists(id) ON DELETE CASCADE,
                        priority                     INTEGER NOT NULL DEFAULT 0,
                        max_agents                   INTEGER NOT NULL DEFAULT 0,
                        chunk_size_seconds           INTEGER NOT NULL,
                        attack_mode                  INTEGER NOT NULL,
                        attack_config                TEXT NOT NULL,
                        uses_rule_splitting          INTEGER NOT NULL DEFAULT 0,
                        multiplication_factor        INTEGER NOT NULL DEFAULT 1,
                        base_keyspace                INTEGER,
                        effective_keyspace           INTEGER,
                        total_keyspace               INTEGER,
                        processed_keyspace           INTEGER NOT NULL DEFAULT 0,
                        dispatched_keyspace          INTEGER NOT NULL DEFAULT 0,
                        is_accurate_keyspace         INTEGER NOT NULL DEFAULT 0,
                        overall_progress_percent     REAL NOT NULL DEFAULT 0,
                        status                       TEXT NOT NULL,
                        error_message                TEXT,
                        preset_id                    TEXT,
                        allow_high_priority_override INTEGER NOT NULL DEFAULT 0,
                        interrupted_by               TEXT,
                        created_by                   TEXT NOT NULL,
                        created_at                   TEXT NOT NULL,
                        updated_at                   TEXT NOT NULL,
                        started_at                   TEXT,
                        cracking_completed_at        TEXT,
                        completed_at                 TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_job_executions_status
                        ON job_executions(status);
                    CREATE INDEX IF NOT EXISTS idx_job_executions_order
                        ON job_executions(priority DESC, created_at ASC);

                    CREATE TABLE IF NOT EXISTS job_increment_layers (
                        id                       TEXT PRIMARY KEY,
                        job_id                   TEXT NOT NULL REFERENCES job_executions(id) ON DELETE CASCADE,
                        layer_index              INTEGER NOT NULL,
                        mask                     TEXT NOT NULL,
                        base_keyspace            INTEGER NOT NULL DEFAULT 0,
                        effective_keyspace       INTEGER NOT NULL DEFAULT 0,
                        processed_keyspace       INTEGER NOT NULL DEFAULT 0,
                        dispatched_keyspace      INTEGER NOT NULL DEFAULT 0,
                        is_accurate_keyspace     INTEGER NOT NULL DEFAULT 0,
                        overall_progress_percent REAL NOT NULL DEFAULT 0,
                        status                   TEXT NOT NULL,
                        created_at               TEXT NOT NULL,
                        updated_at               TEXT NOT NULL,
                        UNIQUE (job_id, layer_index)
                    );

                    CREATE TABLE IF NOT EXISTS job_tasks (
                        id                           TEXT PRIMARY KEY,
                        job_id                       TEXT NOT NULL REFERENCES job_executions(id) ON DELETE CASCADE,
                        agent_id                     TEXT,
                        status                       TEXT NOT NULL,
                        keyspace_start               INTEGER NOT NULL DEFAULT 0,
                        keyspace_end                 INTEGER NOT NULL DEFAULT 0,
                        keyspace_processed           INTEGER NOT NULL DEFAULT 0,
                        effective_keyspace_start     INTEGER,
                        effective_keyspace_end       INTEGER,
                        effective_keyspace_processed INTEGER,
                        rule_start_index             INTEGER,
                        rule_end_index               INTEGER,
                        is_rule_split_task           INTEGER NOT NULL DEFAULT 0,
                        chunk_actual_keyspace        INTEGER,
                        benchmark_speed              INTEGER,
                        average_speed                INTEGER,
                        progress_percent             REAL NOT NULL DEFAULT 0,
                        crack_count                  INTEGER NOT NULL DEFAULT 0,
                        expected_crack_count         INTEGER NOT NULL DEFAULT 0,
                        received_crack_count         INTEGER NOT NULL DEFAULT 0,
                        batches_complete_signaled    INTEGER NOT NULL DEFAULT 0,
                        retry_count                  INTEGER NOT NULL DEFAULT 0,
                        consecutive_failures         INTEGER NOT NULL DEFAULT 0,
                        retransmit_count             INTEGER NOT NULL DEFAULT 0,
                        last_retransmit_at           TEXT,
                        increment_layer_id           TEXT REFERENCES job_increment_layers(id) ON DELETE SET NULL,
                        error_message                TEXT,
                        created_at                   TEXT NOT NULL,
                        updated_at                   TEXT NOT NULL,
                        started_at                   TEXT,
                        cracking_completed_at        TEXT,
                        completed_at                 TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_job_tasks_job    ON job_tasks(job_id);
                    CREATE INDEX IF NOT EXISTS idx_job_tasks_status ON job_tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_job_tasks_agent  ON job_tasks(agent_id);

                    CREATE TABLE IF NOT EXISTS agents (
                        id               TEXT PRIMARY KEY,
                        name             TEXT NOT NULL UNIQUE,
                        status           TEXT NOT NULL,
                        owner_id         TEXT,
                        devices          TEXT NOT NULL DEFAULT '[]',
                        is_enabled       INTEGER NOT NULL DEFAULT 1,
                        schedule         TEXT,
                        last_heartbeat   TEXT,
                        extra_parameters TEXT,
                        created_at       TEXT NOT NULL,
                        updated_at       TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

                    CREATE TABLE IF NOT EXISTS agent_benchmarks (
                        agent_id     TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                        attack_mode  TEXT NOT NULL,
                        hash_type_id INTEGER NOT NULL,
                        speed        INTEGER NOT NULL,
                        updated_at   TEXT NOT NULL,
                        PRIMARY KEY (agent_id, attack_mode, hash_type_id)
                    );

                    CREATE TABLE IF NOT EXISTS benchmark_requests (
                        id            TEXT PRIMARY KEY,
                        agent_id      TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                        job_id        TEXT REFERENCES job_executions(id) ON DELETE CASCADE,
                        kind          TEXT NOT NULL,
                        attack_mode   TEXT NOT NULL,
                        hash_type_id  INTEGER NOT NULL,
                        status        TEXT NOT NULL,
                        outcome       TEXT,
                        error_message TEXT,
                        created_at    TEXT NOT NULL,
                        completed_at  TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_benchmark_requests_status
                        ON benchmark_requests(status);

                    CREATE TABLE IF NOT EXISTS preset_jobs (
                        id                           TEXT PRIMARY KEY,
                        name                         TEXT NOT NULL UNIQUE,
                        attack_config                TEXT NOT NULL,
                        priority                     INTEGER NOT NULL DEFAULT 0,
                        max_agents                   INTEGER NOT NULL DEFAULT 0,
                        chunk_size_seconds           INTEGER NOT NULL,
                        binary_id                    TEXT,
                        allow_high_priority_override INTEGER NOT NULL DEFAULT 0,
                        created_at                   TEXT NOT NULL,
                        updated_at                   TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS job_workflows (
                        id         TEXT PRIMARY KEY,
                        name       TEXT NOT NULL UNIQUE,
                        created_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS job_workflow_steps (
                        id          TEXT PRIMARY KEY,
                        workflow_id TEXT NOT NULL REFERENCES job_workflows(id) ON DELETE CASCADE,
                        preset_id   TEXT NOT NULL REFERENCES preset_jobs(id) ON DELETE CASCADE,
                        step_order  INTEGER NOT NULL,
                        UNIQUE (workflow_id, step_order)
                    );

                    CREATE TABLE IF NOT EXISTS system_settings (
                        key        TEXT PRIMARY KEY,
                        value      TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS task_crack_batches (
                        task_id     TEXT NOT NULL REFERENCES job_tasks(id) ON DELETE CASCADE,
                        batch_id    TEXT NOT NULL,
                        entry_count INTEGER NOT NULL,
                        received_at TEXT NOT NULL,
                        PRIMARY KEY (task_id, batch_id)
                    );

                    CREATE TABLE IF NOT EXISTS emitted_events (
                        kind       TEXT NOT NULL,
                        entity_id  TEXT NOT NULL,
                        attempt    INTEGER NOT NULL DEFAULT 0,
                        emitted_at TEXT NOT NULL,
                        PRIMARY KEY (kind, entity_id, attempt)
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }
}

// ---------------------------------------------------------------------------
// Column conversion helpers
// ---------------------------------------------------------------------------

pub(crate) fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

pub(crate) fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

pub(crate) fn parse_uuid(raw: &str) -> Uuid {
    Uuid::parse_str(raw).expect("valid uuid")
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub(crate) fn parse_opt_uuid(raw: Option<String>) -> Option<Uuid> {
    raw.map(|s| parse_uuid(&s))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| parse_ts(&s))
}

/// Keyspace counters are stored as SQLite INTEGERs; the representable
/// maximum setting keeps them inside i64 range.
pub(crate) fn as_i64(val: u64) -> i64 {
    val as i64
}

pub(crate) fn as_u64(val: i64) -> u64 {
    val.max(0) as u64
}

pub(crate) fn as_opt_i64(val: Option<u64>) -> Option<i64> {
    val.map(as_i64)
}

pub(crate) fn as_opt_u64(val: Option<i64>) -> Option<u64> {
    val.map(as_u64)
}
