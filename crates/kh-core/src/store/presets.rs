use uuid::Uuid;

use crate::attack::AttackConfig;
use crate::types::{JobWorkflow, JobWorkflowStep, PresetJob};

use super::{parse_ts, parse_uuid, StoreDb, StoreError, StoreResult};

const PRESET_COLUMNS: &str = "id, name, attack_config, priority, max_agents,
    chunk_size_seconds, binary_id, allow_high_priority_override, created_at, updated_at";

impl StoreDb {
    pub async fn upsert_preset(&self, preset: &PresetJob) -> StoreResult<()> {
        let p = preset.clone();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO preset_jobs (id, name, attack_config, priority, max_agents,
                        chunk_size_seconds, binary_id, allow_high_priority_override,
                        created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, attack_config=excluded.attack_config,
                        priority=excluded.priority, max_agents=excluded.max_agents,
                        chunk_size_seconds=excluded.chunk_size_seconds,
                        binary_id=excluded.binary_id,
                        allow_high_priority_override=excluded.allow_high_priority_override,
                        updated_at=excluded.updated_at",
                    rusqlite::params![
                        p.id.to_string(),
                        p.name,
                        serde_json::to_string(&p.attack).expect("serialize attack config"),
                        p.priority,
                        p.max_agents,
                        p.chunk_size_seconds,
                        p.binary_id.map(|b| b.to_string()),
                        p.allow_high_priority_override,
                        p.created_at.to_rfc3339(),
                        p.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_preset(&self, id: Uuid) -> StoreResult<Option<PresetJob>> {
        let id_str = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PRESET_COLUMNS} FROM preset_jobs WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_preset(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn insert_workflow(
        &self,
        workflow: &JobWorkflow,
        steps: &[JobWorkflowStep],
    ) -> StoreResult<()> {
        let w = workflow.clone();
        let steps = steps.to_vec();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO job_workflows (id, name, created_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![w.id.to_string(), w.name, w.created_at.to_rfc3339()],
                )?;
                for step in &steps {
                    tx.execute(
                        "INSERT INTO job_workflow_steps (id, workflow_id, preset_id, step_order)
                         VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![
                            step.id.to_string(),
                            w.id.to_string(),
                            step.preset_id.to_string(),
                            step.step_order
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<JobWorkflow>> {
        let id_str = id.to_string();
        self.conn()
            .call(move |conn| {
                let result: Option<(String, String)> = conn
                    .query_row(
                        "SELECT name, created_at FROM job_workflows WHERE id = ?1",
                        rusqlite::params![id_str],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(result.map(|(name, created_at)| JobWorkflow {
                    id: parse_uuid(&id_str),
                    name,
                    created_at: parse_ts(&created_at),
                }))
            })
            .await
            .map_err(StoreError::from)
    }

    /// Steps of a workflow in execution order.
    pub async fn workflow_steps(&self, workflow_id: Uuid) -> StoreResult<Vec<JobWorkflowStep>> {
        let id_str = workflow_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_id, preset_id, step_order FROM job_workflow_steps
                     WHERE workflow_id = ?1 ORDER BY step_order ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let id: String = row.get(0)?;
                    let workflow: String = row.get(1)?;
                    let preset: String = row.get(2)?;
                    out.push(JobWorkflowStep {
                        id: parse_uuid(&id),
                        workflow_id: parse_uuid(&workflow),
                        preset_id: parse_uuid(&preset),
                        step_order: row.get(3)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }
}

fn row_to_preset(row: &rusqlite::Row<'_>) -> rusqlite::Result<PresetJob> {
    let id_str: String = row.get(0)?;
    let attack_json: String = row.get(2)?;
    let binary_str: Option<String> = row.get(6)?;
    let created_at_str: String = row.get(8)?;
    let updated_at_str: String = row.get(9)?;

    let attack: AttackConfig = serde_json::from_str(&attack_json).expect("valid attack config");

    Ok(PresetJob {
        id: parse_uuid(&id_str),
        name: row.get(1)?,
        attack,
        priority: row.get(3)?,
        max_agents: row.get(4)?,
        chunk_size_seconds: row.get(5)?,
        binary_id: binary_str.map(|s| parse_uuid(&s)),
        allow_high_priority_override: row.get(7)?,
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
    })
}
