use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{CrackEntry, Task, TaskStatus};

use super::{
    as_i64, as_opt_i64, as_opt_u64, as_u64, enum_from_sql, enum_to_sql, parse_opt_ts,
    parse_opt_uuid, parse_ts, parse_uuid, StoreDb, StoreError, StoreResult,
};

const TASK_COLUMNS: &str = "id, job_id, agent_id, status, keyspace_start, keyspace_end,
    keyspace_processed, effective_keyspace_start, effective_keyspace_end,
    effective_keyspace_processed, rule_start_index, rule_end_index, is_rule_split_task,
    chunk_actual_keyspace, benchmark_speed, average_speed, progress_percent, crack_count,
    expected_crack_count, received_crack_count, batches_complete_signaled, retry_count,
    consecutive_failures, retransmit_count, last_retransmit_at, increment_layer_id,
    error_message, created_at, updated_at, started_at, cracking_completed_at, completed_at";

// ---------------------------------------------------------------------------
// Result payloads
// ---------------------------------------------------------------------------

/// What changed when a progress report was applied.
#[derive(Debug, Clone)]
pub struct ProgressDelta {
    pub job_id: Uuid,
    pub layer_id: Option<Uuid>,
    /// Newly processed candidates on the effective axis.
    pub effective_delta: u64,
    pub task_progress_percent: f64,
    /// True when this report pinned `chunk_actual_keyspace`.
    pub pinned_actual: bool,
}

/// Outcome of one crack-batch ingest.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub job_id: Uuid,
    pub hashlist_id: Uuid,
    /// The batch had been applied before; counters untouched.
    pub duplicate_batch: bool,
    /// Entries accepted over the wire in this batch.
    pub received: u64,
    /// Entries newly persisted to the hash store.
    pub inserted: u64,
    /// Task counters after the batch.
    pub received_crack_count: u64,
    pub expected_crack_count: u64,
    pub batches_complete_signaled: bool,
    pub task_status: TaskStatus,
    /// This batch produced the job's first crack.
    pub first_crack_for_job: bool,
}

// ---------------------------------------------------------------------------
// Task CRUD & transitions
// ---------------------------------------------------------------------------

impl StoreDb {
    /// Insert a task and advance the job's (and layer's) dispatched
    /// keyspace in the same transaction.
    pub async fn create_task_with_dispatch(
        &self,
        task: &Task,
        dispatch_advance: u64,
    ) -> StoreResult<()> {
        let t = task.clone();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                insert_task(&tx, &t)?;
                let now = Utc::now().to_rfc3339();
                tx.execute(
                    "UPDATE job_executions
                     SET dispatched_keyspace = dispatched_keyspace + ?1, updated_at = ?2
                     WHERE id = ?3",
                    rusqlite::params![as_i64(dispatch_advance), now, t.job_id.to_string()],
                )?;
                if let Some(layer_id) = t.increment_layer_id {
                    tx.execute(
                        "UPDATE job_increment_layers
                         SET dispatched_keyspace = dispatched_keyspace + ?1, updated_at = ?2
                         WHERE id = ?3",
                        rusqlite::params![as_i64(dispatch_advance), now, layer_id.to_string()],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_task(&self, id: Uuid) -> StoreResult<Option<Task>> {
        let id_str = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {TASK_COLUMNS} FROM job_tasks WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn tasks_for_job(&self, job_id: Uuid) -> StoreResult<Vec<Task>> {
        let id_str = job_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM job_tasks
                     WHERE job_id = ?1 ORDER BY created_at ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn tasks_for_layer(&self, layer_id: Uuid) -> StoreResult<Vec<Task>> {
        let id_str = layer_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM job_tasks
                     WHERE increment_layer_id = ?1 ORDER BY created_at ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// The task currently occupying an agent, if any.
    pub async fn active_task_for_agent(&self, agent_id: Uuid) -> StoreResult<Option<Task>> {
        let id_str = agent_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM job_tasks
                     WHERE agent_id = ?1
                       AND status IN ('assigned', 'running', 'reconnect_pending', 'processing')
                     LIMIT 1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Distinct agents currently holding tasks of this job.
    pub async fn active_agent_count_for_job(&self, job_id: Uuid) -> StoreResult<u64> {
        let id_str = job_id.to_string();
        self.conn()
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(DISTINCT agent_id) FROM job_tasks
                     WHERE job_id = ?1 AND agent_id IS NOT NULL
                       AND status IN ('assigned', 'running', 'reconnect_pending', 'processing')",
                    rusqlite::params![id_str],
                    |r| r.get(0),
                )?;
                Ok(as_u64(count))
            })
            .await
            .map_err(StoreError::from)
    }

    /// Pending (unassigned) tasks of a job, oldest first.
    pub async fn pending_tasks_for_job(&self, job_id: Uuid) -> StoreResult<Vec<Task>> {
        let id_str = job_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM job_tasks
                     WHERE job_id = ?1 AND status = 'pending' ORDER BY created_at ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Hand a pending task to an agent. Returns false when the task is no
    /// longer pending (another path got there first).
    pub async fn try_assign_task(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        benchmark_speed: Option<u64>,
    ) -> StoreResult<bool> {
        let id_str = task_id.to_string();
        let agent_str = agent_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE job_tasks
                     SET status = 'assigned', agent_id = ?1,
                         benchmark_speed = COALESCE(?2, benchmark_speed), updated_at = ?3
                     WHERE id = ?4 AND status = 'pending'",
                    rusqlite::params![agent_str, as_opt_i64(benchmark_speed), now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// `task_started` received: assigned (or recovering reconnect-pending)
    /// to running.
    pub async fn record_task_started(
        &self,
        task_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let id_str = task_id.to_string();
        let at_str = at.to_rfc3339();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE job_tasks
                     SET status = 'running', started_at = COALESCE(started_at, ?1),
                         updated_at = ?2
                     WHERE id = ?3 AND status IN ('assigned', 'reconnect_pending')",
                    rusqlite::params![at_str, now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Apply a `task_progress` report: pin the actual chunk keyspace on
    /// first sight, advance the task's processed counters monotonically,
    /// and roll the effective-axis delta up to the job (and layer) inside
    /// one transaction.
    ///
    /// `reported_processed` counts candidates on the effective axis within
    /// this chunk, which is what hashcat's progress figures measure.
    pub async fn apply_task_progress(
        &self,
        task_id: Uuid,
        reported_processed: u64,
        current_speed: Option<u64>,
        hashcat_progress_total: Option<u64>,
        multiplication_factor: u64,
    ) -> StoreResult<Option<ProgressDelta>> {
        let id_str = task_id.to_string();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut stmt =
                    tx.prepare(&format!("SELECT {TASK_COLUMNS} FROM job_tasks WHERE id = ?1"))?;
                let task = {
                    let mut rows = stmt.query(rusqlite::params![id_str])?;
                    match rows.next()? {
                        Some(row) => row_to_task(row)?,
                        None => return Ok(None),
                    }
                };
                drop(stmt);

                if task.status != TaskStatus::Running {
                    return Ok(None);
                }

                let factor = multiplication_factor.max(1);
                let mut pinned = false;
                let mut actual = task.chunk_actual_keyspace;
                if actual.is_none() {
                    if let Some(total) = hashcat_progress_total {
                        actual = Some(total);
                        pinned = true;
                    }
                }

                // Effective span of this chunk: hashcat's own total once
                // pinned, otherwise the estimate from the split axis.
                let estimated_span = if task.is_rule_split_task {
                    task.chunk_span()
                } else {
                    task.chunk_span().saturating_mul(factor)
                };
                let span = actual.unwrap_or(estimated_span).max(1);

                let old_effective = if task.is_rule_split_task || factor > 1 {
                    task.effective_keyspace_processed.unwrap_or(0)
                } else {
                    task.keyspace_processed
                };
                let new_effective = reported_processed.min(span).max(old_effective);
                let effective_delta = new_effective - old_effective;

                // Raw-axis mirror for the keyspace-split bookkeeping.
                let raw_processed = if task.is_rule_split_task {
                    task.keyspace_processed
                } else {
                    (new_effective / factor).min(task.chunk_span())
                };

                let progress_percent = (new_effective as f64 / span as f64 * 100.0).min(100.0);
                let average_speed = match (task.average_speed, current_speed) {
                    (Some(avg), Some(cur)) => Some((avg + cur) / 2),
                    (None, Some(cur)) => Some(cur),
                    (avg, None) => avg,
                };

                let now = Utc::now().to_rfc3339();
                tx.execute(
                    "UPDATE job_tasks
                     SET keyspace_processed = ?1, effective_keyspace_processed = ?2,
                         chunk_actual_keyspace = ?3, average_speed = ?4,
                         progress_percent = ?5, updated_at = ?6
                     WHERE id = ?7",
                    rusqlite::params![
                        as_i64(raw_processed),
                        if task.is_rule_split_task || factor > 1 {
                            Some(as_i64(new_effective))
                        } else {
                            task.effective_keyspace_processed.map(as_i64)
                        },
                        as_opt_i64(actual),
                        as_opt_i64(average_speed),
                        progress_percent,
                        now,
                        id_str
                    ],
                )?;

                if effective_delta > 0 {
                    tx.execute(
                        "UPDATE job_executions
                         SET processed_keyspace = processed_keyspace + ?1, updated_at = ?2
                         WHERE id = ?3",
                        rusqlite::params![as_i64(effective_delta), now, task.job_id.to_string()],
                    )?;
                    if let Some(layer_id) = task.increment_layer_id {
                        tx.execute(
                            "UPDATE job_increment_layers
                             SET processed_keyspace = processed_keyspace + ?1, updated_at = ?2
                             WHERE id = ?3",
                            rusqlite::params![as_i64(effective_delta), now, layer_id.to_string()],
                        )?;
                    }
                }
                tx.commit()?;

                Ok(Some(ProgressDelta {
                    job_id: task.job_id,
                    layer_id: task.increment_layer_id,
                    effective_delta,
                    task_progress_percent: progress_percent,
                    pinned_actual: pinned,
                }))
            })
            .await
            .map_err(StoreError::from)
    }

    /// `task_cracking_completed`: running to processing, expected crack
    /// count recorded. Returns false on a state mismatch.
    pub async fn mark_cracking_completed(
        &self,
        task_id: Uuid,
        expected_crack_count: u64,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let id_str = task_id.to_string();
        let at_str = at.to_rfc3339();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE job_tasks
                     SET status = 'processing', expected_crack_count = ?1,
                         cracking_completed_at = COALESCE(cracking_completed_at, ?2),
                         updated_at = ?3
                     WHERE id = ?4 AND status = 'running'",
                    rusqlite::params![as_i64(expected_crack_count), at_str, now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Agent asserts all crack batches were sent. Returns the task snapshot
    /// after the flag lands so the caller can evaluate completion.
    pub async fn mark_batches_complete(&self, task_id: Uuid) -> StoreResult<Option<Task>> {
        let id_str = task_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE job_tasks SET batches_complete_signaled = 1, updated_at = ?1
                     WHERE id = ?2",
                    rusqlite::params![now, id_str],
                )?;
                let mut stmt = conn
                    .prepare(&format!("SELECT {TASK_COLUMNS} FROM job_tasks WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Finish a task. Frees the agent slot; stamps `completed_at`.
    pub async fn complete_task(&self, task_id: Uuid, warning: Option<String>) -> StoreResult<bool> {
        let id_str = task_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE job_tasks
                     SET status = 'completed', agent_id = NULL, progress_percent = 100.0,
                         error_message = COALESCE(?1, error_message),
                         completed_at = COALESCE(completed_at, ?2), updated_at = ?2
                     WHERE id = ?3 AND status IN ('running', 'processing')",
                    rusqlite::params![warning, now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Heartbeat gap within grace: park every live task of this agent.
    /// Returns the parked task ids.
    pub async fn park_tasks_for_agent(&self, agent_id: Uuid) -> StoreResult<Vec<Uuid>> {
        let id_str = agent_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut parked = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM job_tasks
                         WHERE agent_id = ?1 AND status IN ('assigned', 'running')",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![id_str])?;
                    while let Some(row) = rows.next()? {
                        let task_id: String = row.get(0)?;
                        parked.push(parse_uuid(&task_id));
                    }
                }
                for task_id in &parked {
                    tx.execute(
                        "UPDATE job_tasks SET status = 'reconnect_pending', updated_at = ?1
                         WHERE id = ?2",
                        rusqlite::params![now, task_id.to_string()],
                    )?;
                }
                tx.commit()?;
                Ok(parked)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Reconnect-pending tasks that have sat unrecovered past the grace
    /// period and are due for re-issue.
    pub async fn reconnect_pending_tasks_older_than(
        &self,
        grace_seconds: u64,
    ) -> StoreResult<Vec<Task>> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(grace_seconds as i64)).to_rfc3339();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM job_tasks
                     WHERE status = 'reconnect_pending' AND updated_at < ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![cutoff])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Re-issue a reconnect-pending task: back to the pending pool with its
    /// range intact, its processed contribution rolled back off the job and
    /// layer counters in the same transaction.
    pub async fn reissue_task(&self, task_id: Uuid) -> StoreResult<bool> {
        let id_str = task_id.to_string();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let reissued = reset_task_in_tx(&tx, &id_str, "reconnect_pending", false)?;
                tx.commit()?;
                Ok(reissued)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Park any agent-held task back into the pending pool (pause path).
    /// Range preserved, processed contribution re-accounted.
    pub async fn suspend_task(&self, task_id: Uuid) -> StoreResult<bool> {
        let id_str = task_id.to_string();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let suspended = reset_task_in_tx(&tx, &id_str, "any_active", false)?;
                tx.commit()?;
                Ok(suspended)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Record a retryable task failure.
    pub async fn fail_task(&self, task_id: Uuid, error: impl Into<String>) -> StoreResult<bool> {
        let id_str = task_id.to_string();
        let error = error.into();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE job_tasks
                     SET status = 'failed', agent_id = NULL, error_message = ?1,
                         consecutive_failures = consecutive_failures + 1, updated_at = ?2
                     WHERE id = ?3 AND status NOT IN ('completed', 'cancelled')",
                    rusqlite::params![error, now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> StoreResult<bool> {
        let id_str = task_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE job_tasks SET status = 'cancelled', agent_id = NULL, updated_at = ?1
                     WHERE id = ?2 AND status NOT IN ('completed', 'failed', 'cancelled')",
                    rusqlite::params![now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Reset a single failed task for retry, bumping `retry_count` and
    /// re-accounting the job's processed keyspace in the same transaction.
    pub async fn reset_task_for_retry(&self, task_id: Uuid) -> StoreResult<bool> {
        let id_str = task_id.to_string();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let reset = reset_task_in_tx(&tx, &id_str, "failed", true)?;
                tx.commit()?;
                Ok(reset)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Reset every failed/cancelled task of a job for retry.
    /// Returns the number of tasks reset.
    pub async fn reset_tasks_for_job_retry(&self, job_id: Uuid) -> StoreResult<u64> {
        let id_str = job_id.to_string();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM job_tasks
                         WHERE job_id = ?1 AND status IN ('failed', 'cancelled')",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![id_str])?;
                    let mut out = Vec::new();
                    while let Some(row) = rows.next()? {
                        out.push(row.get::<_, String>(0)?);
                    }
                    out
                };
                let mut reset = 0u64;
                for task_id in &ids {
                    if reset_task_in_tx(&tx, task_id, "any_resettable", true)? {
                        reset += 1;
                    }
                }
                tx.commit()?;
                Ok(reset)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Administrative escape hatch: mark every non-terminal task completed
    /// without reconciling keyspace.
    pub async fn force_complete_tasks(&self, job_id: Uuid) -> StoreResult<u64> {
        let id_str = job_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE job_tasks
                     SET status = 'completed', agent_id = NULL,
                         completed_at = COALESCE(completed_at, ?1), updated_at = ?1
                     WHERE job_id = ?2 AND status NOT IN ('completed', 'failed', 'cancelled')",
                    rusqlite::params![now, id_str],
                )?;
                Ok(changed as u64)
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Crack ingest
    // -----------------------------------------------------------------------

    /// Apply one crack batch transactionally and idempotently.
    ///
    /// A repeated `(task_id, batch_id)` is a no-op on every counter but
    /// still reports success so the agent gets its ack. New entries update
    /// only hashes that belong to the job's hashlist and are not yet
    /// cracked; the first task to deliver a crack keeps the attribution.
    pub async fn ingest_crack_batch(
        &self,
        task_id: Uuid,
        batch_id: &str,
        entries: &[CrackEntry],
    ) -> StoreResult<Option<IngestOutcome>> {
        let id_str = task_id.to_string();
        let batch = batch_id.to_string();
        let entries = entries.to_vec();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;

                let header: Option<(String, String)> = tx
                    .query_row(
                        "SELECT t.job_id, j.hashlist_id
                         FROM job_tasks t JOIN job_executions j ON j.id = t.job_id
                         WHERE t.id = ?1",
                        rusqlite::params![id_str],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .map(Some)
                    .or_else(no_rows_to_none)?;
                let Some((job_id_str, hashlist_str)) = header else {
                    return Ok(None);
                };
                let job_id = parse_uuid(&job_id_str);
                let hashlist_id = parse_uuid(&hashlist_str);

                let now = Utc::now().to_rfc3339();
                let fresh_batch = tx.execute(
                    "INSERT OR IGNORE INTO task_crack_batches
                        (task_id, batch_id, entry_count, received_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id_str, batch, entries.len() as i64, now],
                )? > 0;

                let mut inserted = 0u64;
                let mut first_crack_for_job = false;
                if fresh_batch {
                    let already_cracked: i64 = tx.query_row(
                        "SELECT SUM(crack_count) FROM job_tasks WHERE job_id = ?1",
                        rusqlite::params![job_id_str],
                        |r| r.get::<_, Option<i64>>(0).map(|v| v.unwrap_or(0)),
                    )?;

                    for entry in &entries {
                        let changed = tx.execute(
                            "UPDATE hashes
                             SET plaintext = ?1, is_cracked = 1, cracked_by_task_id = ?2
                             WHERE original_hash = ?3 AND is_cracked = 0
                               AND id IN (SELECT hash_id FROM hashlist_hashes
                                          WHERE hashlist_id = ?4)",
                            rusqlite::params![entry.plaintext, id_str, entry.hash_value, hashlist_str],
                        )?;
                        inserted += changed as u64;
                    }

                    tx.execute(
                        "UPDATE job_tasks
                         SET received_crack_count = received_crack_count + ?1,
                             crack_count = crack_count + ?2, updated_at = ?3
                         WHERE id = ?4",
                        rusqlite::params![entries.len() as i64, as_i64(inserted), now, id_str],
                    )?;
                    if inserted > 0 {
                        tx.execute(
                            "UPDATE hashlists
                             SET cracked_hashes = cracked_hashes + ?1, updated_at = ?2
                             WHERE id = ?3",
                            rusqlite::params![as_i64(inserted), now, hashlist_str],
                        )?;
                        first_crack_for_job = already_cracked == 0;
                    }
                }

                let (received, expected, complete_flag, status_str): (i64, i64, bool, String) = tx
                    .query_row(
                        "SELECT received_crack_count, expected_crack_count,
                                batches_complete_signaled, status
                         FROM job_tasks WHERE id = ?1",
                        rusqlite::params![id_str],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                    )?;
                tx.commit()?;

                Ok(Some(IngestOutcome {
                    job_id,
                    hashlist_id,
                    duplicate_batch: !fresh_batch,
                    received: if fresh_batch { entries.len() as u64 } else { 0 },
                    inserted,
                    received_crack_count: as_u64(received),
                    expected_crack_count: as_u64(expected),
                    batches_complete_signaled: complete_flag,
                    task_status: enum_from_sql(&status_str),
                    first_crack_for_job,
                }))
            })
            .await
            .map_err(StoreError::from)
    }

    /// Stamp a retransmit cycle on a processing task.
    pub async fn record_retransmit(&self, task_id: Uuid) -> StoreResult<bool> {
        let id_str = task_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE job_tasks
                     SET retransmit_count = retransmit_count + 1,
                         last_retransmit_at = ?1, updated_at = ?1
                     WHERE id = ?2 AND status = 'processing'",
                    rusqlite::params![now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Processing tasks that signaled batches-complete but still miss
    /// cracks; candidates for retransmission.
    pub async fn tasks_awaiting_cracks(&self) -> StoreResult<Vec<Task>> {
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM job_tasks
                     WHERE status = 'processing'
                       AND batches_complete_signaled = 1
                       AND received_crack_count < expected_crack_count"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

fn insert_task(tx: &rusqlite::Transaction<'_>, t: &Task) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO job_tasks (id, job_id, agent_id, status, keyspace_start, keyspace_end,
            keyspace_processed, effective_keyspace_start, effective_keyspace_end,
            effective_keyspace_processed, rule_start_index, rule_end_index, is_rule_split_task,
            chunk_actual_keyspace, benchmark_speed, average_speed, progress_percent,
            crack_count, expected_crack_count, received_crack_count, batches_complete_signaled,
            retry_count, consecutive_failures, retransmit_count, last_retransmit_at,
            increment_layer_id, error_message, created_at, updated_at, started_at,
            cracking_completed_at, completed_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,
            ?22,?23,?24,?25,?26,?27,?28,?29,?30,?31,?32)",
        rusqlite::params![
            t.id.to_string(),
            t.job_id.to_string(),
            t.agent_id.map(|a| a.to_string()),
            enum_to_sql(&t.status),
            as_i64(t.keyspace_start),
            as_i64(t.keyspace_end),
            as_i64(t.keyspace_processed),
            as_opt_i64(t.effective_keyspace_start),
            as_opt_i64(t.effective_keyspace_end),
            as_opt_i64(t.effective_keyspace_processed),
            as_opt_i64(t.rule_start_index),
            as_opt_i64(t.rule_end_index),
            t.is_rule_split_task,
            as_opt_i64(t.chunk_actual_keyspace),
            as_opt_i64(t.benchmark_speed),
            as_opt_i64(t.average_speed),
            t.progress_percent,
            as_i64(t.crack_count),
            as_i64(t.expected_crack_count),
            as_i64(t.received_crack_count),
            t.batches_complete_signaled,
            t.retry_count,
            t.consecutive_failures,
            t.retransmit_count,
            t.last_retransmit_at.map(|ts| ts.to_rfc3339()),
            t.increment_layer_id.map(|l| l.to_string()),
            t.error_message.clone(),
            t.created_at.to_rfc3339(),
            t.updated_at.to_rfc3339(),
            t.started_at.map(|ts| ts.to_rfc3339()),
            t.cracking_completed_at.map(|ts| ts.to_rfc3339()),
            t.completed_at.map(|ts| ts.to_rfc3339()),
        ],
    )?;
    Ok(())
}

/// Shared reset used by re-issue and retry paths: the task returns to the
/// pending pool with its range intact; its processed contribution comes off
/// the job and layer counters so the work is re-done by the next agent.
fn reset_task_in_tx(
    tx: &rusqlite::Transaction<'_>,
    task_id: &str,
    expected_status: &str,
    bump_retry: bool,
) -> rusqlite::Result<bool> {
    let row: Option<(String, String, i64, Option<i64>, Option<String>, bool, i64)> = tx
        .query_row(
            "SELECT job_id, status, keyspace_processed, effective_keyspace_processed,
                    increment_layer_id, is_rule_split_task, expected_crack_count
             FROM job_tasks WHERE id = ?1",
            rusqlite::params![task_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .map(Some)
        .or_else(no_rows_to_none)?;
    let Some((job_id, status, raw_processed, effective_processed, layer_id, is_rule_split, _)) =
        row
    else {
        return Ok(false);
    };

    let matches = match expected_status {
        "any_resettable" => status == "failed" || status == "cancelled",
        "any_active" => {
            matches!(
                status.as_str(),
                "assigned" | "running" | "reconnect_pending" | "processing"
            )
        }
        expected => status == expected,
    };
    if !matches {
        return Ok(false);
    }

    let processed_delta = if is_rule_split {
        effective_processed.unwrap_or(0)
    } else {
        // Progress rolled up to the job on the effective axis; the mirror
        // column carries it when a multiplication factor applies.
        effective_processed.unwrap_or(raw_processed)
    };

    let now = Utc::now().to_rfc3339();
    tx.execute(
        &format!(
            "UPDATE job_tasks
             SET status = 'pending', agent_id = NULL, keyspace_processed = 0,
                 effective_keyspace_processed = CASE
                     WHEN effective_keyspace_processed IS NULL THEN NULL ELSE 0 END,
                 progress_percent = 0, chunk_actual_keyspace = NULL,
                 expected_crack_count = 0, batches_complete_signaled = 0,
                 error_message = NULL, started_at = NULL, cracking_completed_at = NULL,
                 {retry_bump}
                 updated_at = ?1
             WHERE id = ?2",
            retry_bump = if bump_retry {
                "retry_count = retry_count + 1,"
            } else {
                ""
            }
        ),
        rusqlite::params![now, task_id],
    )?;

    if processed_delta > 0 {
        tx.execute(
            "UPDATE job_executions
             SET processed_keyspace = MAX(0, processed_keyspace - ?1), updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![processed_delta, now, job_id],
        )?;
        if let Some(layer_id) = layer_id {
            tx.execute(
                "UPDATE job_increment_layers
                 SET processed_keyspace = MAX(0, processed_keyspace - ?1), updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![processed_delta, now, layer_id],
            )?;
        }
    }
    Ok(true)
}

fn no_rows_to_none<T>(e: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

pub(super) fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id_str: String = row.get(0)?;
    let job_str: String = row.get(1)?;
    let agent_str: Option<String> = row.get(2)?;
    let status_str: String = row.get(3)?;
    let retransmit_at_str: Option<String> = row.get(24)?;
    let layer_str: Option<String> = row.get(25)?;
    let created_at_str: String = row.get(27)?;
    let updated_at_str: String = row.get(28)?;
    let started_at_str: Option<String> = row.get(29)?;
    let cracking_completed_str: Option<String> = row.get(30)?;
    let completed_at_str: Option<String> = row.get(31)?;

    Ok(Task {
        id: parse_uuid(&id_str),
        job_id: parse_uuid(&job_str),
        agent_id: parse_opt_uuid(agent_str),
        status: enum_from_sql(&status_str),
        keyspace_start: as_u64(row.get(4)?),
        keyspace_end: as_u64(row.get(5)?),
        keyspace_processed: as_u64(row.get(6)?),
        effective_keyspace_start: as_opt_u64(row.get(7)?),
        effective_keyspace_end: as_opt_u64(row.get(8)?),
        effective_keyspace_processed: as_opt_u64(row.get(9)?),
        rule_start_index: as_opt_u64(row.get(10)?),
        rule_end_index: as_opt_u64(row.get(11)?),
        is_rule_split_task: row.get(12)?,
        chunk_actual_keyspace: as_opt_u64(row.get(13)?),
        benchmark_speed: as_opt_u64(row.get(14)?),
        average_speed: as_opt_u64(row.get(15)?),
        progress_percent: row.get(16)?,
        crack_count: as_u64(row.get(17)?),
        expected_crack_count: as_u64(row.get(18)?),
        received_crack_count: as_u64(row.get(19)?),
        batches_complete_signaled: row.get(20)?,
        retry_count: row.get(21)?,
        consecutive_failures: row.get(22)?,
        retransmit_count: row.get(23)?,
        last_retransmit_at: parse_opt_ts(retransmit_at_str),
        increment_layer_id: parse_opt_uuid(layer_str),
        error_message: row.get(26)?,
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
        started_at: parse_opt_ts(started_at_str),
        cracking_completed_at: parse_opt_ts(cracking_completed_str),
        completed_at: parse_opt_ts(completed_at_str),
    })
}
