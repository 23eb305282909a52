use chrono::Utc;
use rusqlite::types::Value;
use uuid::Uuid;

use crate::attack::AttackConfig;
use crate::types::{Job, JobStatus};

use super::{
    as_i64, as_opt_i64, as_opt_u64, as_u64, enum_from_sql, enum_to_sql, parse_opt_ts,
    parse_opt_uuid, parse_ts, parse_uuid, StoreDb, StoreError, StoreResult,
};

const JOB_COLUMNS: &str = "id, name, hashlist_id, priority, max_agents, chunk_size_seconds,
    attack_mode, attack_config, uses_rule_splitting, multiplication_factor,
    base_keyspace, effective_keyspace, total_keyspace, processed_keyspace,
    dispatched_keyspace, is_accurate_keyspace, overall_progress_percent, status,
    error_message, preset_id, allow_high_priority_override, interrupted_by,
    created_by, created_at, updated_at, started_at, cracking_completed_at, completed_at";

// ---------------------------------------------------------------------------
// JobFilter
// ---------------------------------------------------------------------------

/// Filter + pagination for `list_jobs`. Offset/size paging per the API
/// surface; `search` matches the job name.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub priority: Option<u32>,
    pub search: Option<String>,
    pub created_by: Option<String>,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl JobFilter {
    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        if let Some(status) = self.status {
            clauses.push(format!("status = ?{}", params.len() + 1));
            params.push(Value::Text(enum_to_sql(&status)));
        }
        if let Some(priority) = self.priority {
            clauses.push(format!("priority = ?{}", params.len() + 1));
            params.push(Value::Integer(priority as i64));
        }
        if let Some(search) = &self.search {
            clauses.push(format!("name LIKE ?{}", params.len() + 1));
            params.push(Value::Text(format!("%{}%", search)));
        }
        if let Some(created_by) = &self.created_by {
            clauses.push(format!("created_by = ?{}", params.len() + 1));
            params.push(Value::Text(created_by.clone()));
        }
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (sql, params)
    }
}

// ---------------------------------------------------------------------------
// Job CRUD
// ---------------------------------------------------------------------------

impl StoreDb {
    pub async fn upsert_job(&self, job: &Job) -> StoreResult<()> {
        let j = job.clone();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO job_executions (id, name, hashlist_id, priority, max_agents,
                        chunk_size_seconds, attack_mode, attack_config, uses_rule_splitting,
                        multiplication_factor, base_keyspace, effective_keyspace, total_keyspace,
                        processed_keyspace, dispatched_keyspace, is_accurate_keyspace,
                        overall_progress_percent, status, error_message, preset_id,
                        allow_high_priority_override, interrupted_by, created_by, created_at,
                        updated_at, started_at, cracking_completed_at, completed_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,
                        ?19,?20,?21,?22,?23,?24,?25,?26,?27,?28)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, priority=excluded.priority,
                        max_agents=excluded.max_agents,
                        chunk_size_seconds=excluded.chunk_size_seconds,
                        uses_rule_splitting=excluded.uses_rule_splitting,
                        multiplication_factor=excluded.multiplication_factor,
                        base_keyspace=excluded.base_keyspace,
                        effective_keyspace=excluded.effective_keyspace,
                        total_keyspace=excluded.total_keyspace,
                        processed_keyspace=excluded.processed_keyspace,
                        dispatched_keyspace=excluded.dispatched_keyspace,
                        is_accurate_keyspace=excluded.is_accurate_keyspace,
                        overall_progress_percent=excluded.overall_progress_percent,
                        status=excluded.status, error_message=excluded.error_message,
                        preset_id=excluded.preset_id,
                        allow_high_priority_override=excluded.allow_high_priority_override,
                        interrupted_by=excluded.interrupted_by,
                        updated_at=excluded.updated_at, started_at=excluded.started_at,
                        cracking_completed_at=excluded.cracking_completed_at,
                        completed_at=excluded.completed_at",
                    rusqlite::params![
                        j.id.to_string(),
                        j.name,
                        j.hashlist_id.to_string(),
                        j.priority,
                        j.max_agents,
                        j.chunk_size_seconds,
                        j.attack.mode().as_hashcat_mode(),
                        serde_json::to_string(&j.attack).expect("serialize attack config"),
                        j.uses_rule_splitting,
                        as_i64(j.multiplication_factor),
                        as_opt_i64(j.base_keyspace),
                        as_opt_i64(j.effective_keyspace),
                        as_opt_i64(j.total_keyspace),
                        as_i64(j.processed_keyspace),
                        as_i64(j.dispatched_keyspace),
                        j.is_accurate_keyspace,
                        j.overall_progress_percent,
                        enum_to_sql(&j.status),
                        j.error_message,
                        j.preset_id.map(|p| p.to_string()),
                        j.allow_high_priority_override,
                        j.interrupted_by.map(|i| i.to_string()),
                        j.created_by,
                        j.created_at.to_rfc3339(),
                        j.updated_at.to_rfc3339(),
                        j.started_at.map(|t| t.to_rfc3339()),
                        j.cracking_completed_at.map(|t| t.to_rfc3339()),
                        j.completed_at.map(|t| t.to_rfc3339()),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        let id_str = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM job_executions WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_job(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> StoreResult<Vec<Job>> {
        let (where_sql, params) = filter.where_clause();
        let limit = filter.limit.unwrap_or(u64::MAX >> 1);
        let offset = filter.offset;
        self.conn()
            .call(move |conn| {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM job_executions{where_sql}
                     ORDER BY created_at DESC LIMIT {limit} OFFSET {offset}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_job(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_jobs(&self, filter: JobFilter) -> StoreResult<u64> {
        let (where_sql, params) = filter.where_clause();
        self.conn()
            .call(move |conn| {
                let sql = format!("SELECT COUNT(*) FROM job_executions{where_sql}");
                let mut stmt = conn.prepare(&sql)?;
                let count: i64 =
                    stmt.query_row(rusqlite::params_from_iter(params), |r| r.get(0))?;
                Ok(as_u64(count))
            })
            .await
            .map_err(StoreError::from)
    }

    /// Jobs eligible for scheduling: `pending`/`running` with a ready
    /// hashlist, in strict `(priority DESC, created_at ASC)` order.
    pub async fn runnable_jobs(&self) -> StoreResult<Vec<Job>> {
        self.conn()
            .call(move |conn| {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM job_executions j
                     WHERE j.status IN ('pending', 'running')
                       AND EXISTS (SELECT 1 FROM hashlists h
                                   WHERE h.id = j.hashlist_id AND h.is_ready = 1)
                     ORDER BY j.priority DESC, j.created_at ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_job(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Targeted mutations
    // -----------------------------------------------------------------------

    /// Transition the job's status, stamping the matching timestamp.
    /// Returns the previous status, or `None` when the job is missing.
    pub async fn set_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
    ) -> StoreResult<Option<JobStatus>> {
        let id_str = id.to_string();
        let status_str = enum_to_sql(&status);
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let previous: Option<String> = tx
                    .query_row(
                        "SELECT status FROM job_executions WHERE id = ?1",
                        rusqlite::params![id_str],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(previous) = previous else {
                    return Ok(None);
                };

                let stamp_column = match status {
                    JobStatus::Running => Some("started_at"),
                    JobStatus::Processing => Some("cracking_completed_at"),
                    JobStatus::Completed => Some("completed_at"),
                    _ => None,
                };
                match stamp_column {
                    Some(col) => tx.execute(
                        &format!(
                            "UPDATE job_executions
                             SET status = ?1, updated_at = ?2,
                                 {col} = COALESCE({col}, ?2)
                             WHERE id = ?3"
                        ),
                        rusqlite::params![status_str, now, id_str],
                    )?,
                    None => tx.execute(
                        "UPDATE job_executions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                        rusqlite::params![status_str, now, id_str],
                    )?,
                };
                tx.commit()?;
                Ok(Some(enum_from_sql(&previous)))
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn set_job_error(&self, id: Uuid, error: Option<String>) -> StoreResult<()> {
        let id_str = id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE job_executions SET error_message = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![error, now, id_str],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Atomic single-column update; returns false when the job is missing.
    pub async fn set_job_priority(&self, id: Uuid, priority: u32) -> StoreResult<bool> {
        self.update_job_column(id, "priority", Value::Integer(priority as i64))
            .await
    }

    pub async fn set_job_max_agents(&self, id: Uuid, max_agents: u32) -> StoreResult<bool> {
        self.update_job_column(id, "max_agents", Value::Integer(max_agents as i64))
            .await
    }

    /// Applies to tasks generated after this call only.
    pub async fn set_job_chunk_size(&self, id: Uuid, seconds: u32) -> StoreResult<bool> {
        self.update_job_column(id, "chunk_size_seconds", Value::Integer(seconds as i64))
            .await
    }

    pub async fn set_job_progress_percent(&self, id: Uuid, percent: f64) -> StoreResult<()> {
        let id_str = id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE job_executions
                     SET overall_progress_percent = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![percent, now, id_str],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    async fn update_job_column(&self, id: Uuid, column: &str, value: Value) -> StoreResult<bool> {
        let id_str = id.to_string();
        let now = Utc::now().to_rfc3339();
        let sql = format!("UPDATE job_executions SET {column} = ?1, updated_at = ?2 WHERE id = ?3");
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(&sql, rusqlite::params![value, now, id_str])?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Apply an authoritative keyspace from a forced benchmark.
    ///
    /// Already-dispatched ranges are preserved: only the effective keyspace
    /// (and layer keyspaces by index) change, and `is_accurate_keyspace`
    /// flips on. `dispatched_keyspace` is untouched.
    pub async fn apply_forced_keyspace(
        &self,
        job_id: Uuid,
        effective: u64,
        layer_keyspaces: Vec<(u32, u64)>,
    ) -> StoreResult<()> {
        let id_str = job_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE job_executions
                     SET effective_keyspace = ?1, total_keyspace = ?1,
                         is_accurate_keyspace = 1, updated_at = ?2
                     WHERE id = ?3",
                    rusqlite::params![as_i64(effective), now, id_str],
                )?;
                for (layer_index, keyspace) in layer_keyspaces {
                    tx.execute(
                        "UPDATE job_increment_layers
                         SET effective_keyspace = ?1, is_accurate_keyspace = 1, updated_at = ?2
                         WHERE job_id = ?3 AND layer_index = ?4",
                        rusqlite::params![as_i64(keyspace), now, id_str, layer_index],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Record that `job_id` was preempted by `by`.
    pub async fn mark_job_interrupted(&self, job_id: Uuid, by: Uuid) -> StoreResult<()> {
        let id_str = job_id.to_string();
        let by_str = by.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE job_executions SET interrupted_by = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![by_str, now, id_str],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Every job currently waiting behind a preemptor.
    pub async fn interrupted_jobs(&self) -> StoreResult<Vec<Job>> {
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM job_executions WHERE interrupted_by IS NOT NULL"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_job(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn clear_job_interruption(&self, job_id: Uuid) -> StoreResult<()> {
        let id_str = job_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE job_executions SET interrupted_by = NULL, updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, id_str],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn delete_job(&self, id: Uuid) -> StoreResult<bool> {
        let id_str = id.to_string();
        self.conn()
            .call(move |conn| {
                let changed =
                    conn.execute("DELETE FROM job_executions WHERE id = ?1", [id_str])?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

pub(super) fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let id_str: String = row.get(0)?;
    let hashlist_str: String = row.get(2)?;
    let attack_json: String = row.get(7)?;
    let attack: AttackConfig = serde_json::from_str(&attack_json).expect("valid attack config");
    let status_str: String = row.get(17)?;
    let preset_str: Option<String> = row.get(19)?;
    let interrupted_str: Option<String> = row.get(21)?;
    let created_at_str: String = row.get(23)?;
    let updated_at_str: String = row.get(24)?;
    let started_at_str: Option<String> = row.get(25)?;
    let cracking_completed_str: Option<String> = row.get(26)?;
    let completed_at_str: Option<String> = row.get(27)?;

    Ok(Job {
        id: parse_uuid(&id_str),
        name: row.get(1)?,
        hashlist_id: parse_uuid(&hashlist_str),
        priority: row.get(3)?,
        max_agents: row.get(4)?,
        chunk_size_seconds: row.get(5)?,
        attack,
        uses_rule_splitting: row.get(8)?,
        multiplication_factor: as_u64(row.get(9)?),
        base_keyspace: as_opt_u64(row.get(10)?),
        effective_keyspace: as_opt_u64(row.get(11)?),
        total_keyspace: as_opt_u64(row.get(12)?),
        processed_keyspace: as_u64(row.get(13)?),
        dispatched_keyspace: as_u64(row.get(14)?),
        is_accurate_keyspace: row.get(15)?,
        overall_progress_percent: row.get(16)?,
        status: enum_from_sql(&status_str),
        error_message: row.get(18)?,
        preset_id: parse_opt_uuid(preset_str),
        allow_high_priority_override: row.get(20)?,
        interrupted_by: parse_opt_uuid(interrupted_str),
        created_by: row.get(22)?,
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
        started_at: parse_opt_ts(started_at_str),
        cracking_completed_at: parse_opt_ts(cracking_completed_str),
        completed_at: parse_opt_ts(completed_at_str),
    })
}
