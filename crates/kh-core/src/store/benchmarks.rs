use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::attack::AttackMode;
use crate::types::{
    BenchmarkKind, BenchmarkOutcome, BenchmarkRecord, BenchmarkRequest, BenchmarkRequestStatus,
};

use super::{
    as_i64, as_u64, enum_from_sql, enum_to_sql, parse_opt_ts, parse_opt_uuid, parse_ts,
    parse_uuid, StoreDb, StoreError, StoreResult,
};

const REQUEST_COLUMNS: &str = "id, agent_id, job_id, kind, attack_mode, hash_type_id, status,
    outcome, error_message, created_at, completed_at";

impl StoreDb {
    // -----------------------------------------------------------------------
    // Benchmark records
    // -----------------------------------------------------------------------

    /// Upsert keeps exactly one record per (agent, attack mode, hash type).
    pub async fn upsert_benchmark(&self, record: &BenchmarkRecord) -> StoreResult<()> {
        let r = record.clone();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_benchmarks (agent_id, attack_mode, hash_type_id, speed,
                        updated_at)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(agent_id, attack_mode, hash_type_id) DO UPDATE SET
                        speed=excluded.speed, updated_at=excluded.updated_at",
                    rusqlite::params![
                        r.agent_id.to_string(),
                        enum_to_sql(&r.attack_mode),
                        r.hash_type_id,
                        as_i64(r.speed),
                        r.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_benchmark(
        &self,
        agent_id: Uuid,
        attack_mode: AttackMode,
        hash_type_id: u32,
    ) -> StoreResult<Option<BenchmarkRecord>> {
        let agent_str = agent_id.to_string();
        let mode_str = enum_to_sql(&attack_mode);
        self.conn()
            .call(move |conn| {
                let result: Option<(i64, String)> = conn
                    .query_row(
                        "SELECT speed, updated_at FROM agent_benchmarks
                         WHERE agent_id = ?1 AND attack_mode = ?2 AND hash_type_id = ?3",
                        rusqlite::params![agent_str, mode_str, hash_type_id],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(result.map(|(speed, updated_at)| BenchmarkRecord {
                    agent_id: parse_uuid(&agent_str),
                    attack_mode,
                    hash_type_id,
                    speed: as_u64(speed),
                    updated_at: parse_ts(&updated_at),
                }))
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Benchmark requests
    // -----------------------------------------------------------------------

    pub async fn insert_benchmark_request(&self, request: &BenchmarkRequest) -> StoreResult<()> {
        let r = request.clone();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO benchmark_requests (id, agent_id, job_id, kind, attack_mode,
                        hash_type_id, status, outcome, error_message, created_at, completed_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    rusqlite::params![
                        r.id.to_string(),
                        r.agent_id.to_string(),
                        r.job_id.map(|j| j.to_string()),
                        enum_to_sql(&r.kind),
                        enum_to_sql(&r.attack_mode),
                        r.hash_type_id,
                        enum_to_sql(&r.status),
                        r.outcome
                            .as_ref()
                            .map(|o| serde_json::to_string(o).expect("serialize outcome")),
                        r.error_message,
                        r.created_at.to_rfc3339(),
                        r.completed_at.map(|t| t.to_rfc3339()),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_benchmark_request(&self, id: Uuid) -> StoreResult<Option<BenchmarkRequest>> {
        let id_str = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM benchmark_requests WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_request(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// At most one in-flight `agent_speed` probe per (agent, config).
    pub async fn has_pending_speed_request(
        &self,
        agent_id: Uuid,
        attack_mode: AttackMode,
        hash_type_id: u32,
    ) -> StoreResult<bool> {
        let agent_str = agent_id.to_string();
        let mode_str = enum_to_sql(&attack_mode);
        self.conn()
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM benchmark_requests
                     WHERE agent_id = ?1 AND attack_mode = ?2 AND hash_type_id = ?3
                       AND kind = 'agent_speed' AND status = 'pending'",
                    rusqlite::params![agent_str, mode_str, hash_type_id],
                    |r| r.get(0),
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// At most one in-flight `forced` probe per job, settled or not.
    pub async fn forced_request_for_job(
        &self,
        job_id: Uuid,
    ) -> StoreResult<Option<BenchmarkRequest>> {
        let job_str = job_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM benchmark_requests
                     WHERE job_id = ?1 AND kind = 'forced'
                     ORDER BY created_at DESC LIMIT 1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![job_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_request(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Settle a pending request with its typed result. Late results against
    /// an absent request record are discarded (returns false).
    pub async fn complete_benchmark_request(
        &self,
        id: Uuid,
        outcome: &BenchmarkOutcome,
    ) -> StoreResult<bool> {
        let id_str = id.to_string();
        let outcome_json = serde_json::to_string(outcome).expect("serialize outcome");
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE benchmark_requests
                     SET status = 'completed', outcome = ?1, completed_at = ?2
                     WHERE id = ?3 AND status = 'pending'",
                    rusqlite::params![outcome_json, now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn fail_benchmark_request(
        &self,
        id: Uuid,
        error: impl Into<String>,
    ) -> StoreResult<bool> {
        let id_str = id.to_string();
        let error = error.into();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE benchmark_requests
                     SET status = 'failed', error_message = ?1, completed_at = ?2
                     WHERE id = ?3 AND status = 'pending'",
                    rusqlite::params![error, now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Fail pending requests older than the probe budget.
    /// Returns the ids that timed out.
    pub async fn fail_timed_out_benchmark_requests(
        &self,
        budget_seconds: u64,
    ) -> StoreResult<Vec<Uuid>> {
        let cutoff = (Utc::now() - Duration::seconds(budget_seconds as i64)).to_rfc3339();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM benchmark_requests
                         WHERE status = 'pending' AND created_at < ?1",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![cutoff])?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        out.push(row.get::<_, String>(0)?);
                    }
                    out
                };
                for id in &ids {
                    tx.execute(
                        "UPDATE benchmark_requests
                         SET status = 'failed', error_message = 'benchmark timed out',
                             completed_at = ?1
                         WHERE id = ?2",
                        rusqlite::params![now, id],
                    )?;
                }
                tx.commit()?;
                Ok(ids.iter().map(|s| parse_uuid(s)).collect())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Drop settled request records older than `max_age_seconds`; the
    /// scheduler calls this after consuming results each cycle.
    pub async fn reap_benchmark_requests(&self, max_age_seconds: u64) -> StoreResult<u64> {
        let cutoff = (Utc::now() - Duration::seconds(max_age_seconds as i64)).to_rfc3339();
        self.conn()
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM benchmark_requests
                     WHERE status IN ('completed', 'failed') AND completed_at < ?1",
                    rusqlite::params![cutoff],
                )?;
                Ok(removed as u64)
            })
            .await
            .map_err(StoreError::from)
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<BenchmarkRequest> {
    let id_str: String = row.get(0)?;
    let agent_str: String = row.get(1)?;
    let job_str: Option<String> = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let mode_str: String = row.get(4)?;
    let status_str: String = row.get(6)?;
    let outcome_json: Option<String> = row.get(7)?;
    let created_at_str: String = row.get(9)?;
    let completed_at_str: Option<String> = row.get(10)?;

    Ok(BenchmarkRequest {
        id: parse_uuid(&id_str),
        agent_id: parse_uuid(&agent_str),
        job_id: parse_opt_uuid(job_str),
        kind: enum_from_sql::<BenchmarkKind>(&kind_str),
        attack_mode: enum_from_sql::<AttackMode>(&mode_str),
        hash_type_id: row.get(5)?,
        status: enum_from_sql::<BenchmarkRequestStatus>(&status_str),
        outcome: outcome_json.map(|s| serde_json::from_str(&s).expect("valid outcome json")),
        error_message: row.get(8)?,
        created_at: parse_ts(&created_at_str),
        completed_at: parse_opt_ts(completed_at_str),
    })
}
