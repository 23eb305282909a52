use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::types::{Agent, AgentSchedule, AgentStatus, DeviceInfo};

use super::{enum_from_sql, enum_to_sql, parse_opt_ts, parse_ts, parse_uuid, StoreDb, StoreError, StoreResult};

const AGENT_COLUMNS: &str = "id, name, status, owner_id, devices, is_enabled, schedule,
    last_heartbeat, extra_parameters, created_at, updated_at";

impl StoreDb {
    pub async fn upsert_agent(&self, agent: &Agent) -> StoreResult<()> {
        let a = agent.clone();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, status, owner_id, devices, is_enabled,
                        schedule, last_heartbeat, extra_parameters, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, status=excluded.status, owner_id=excluded.owner_id,
                        devices=excluded.devices, is_enabled=excluded.is_enabled,
                        schedule=excluded.schedule, last_heartbeat=excluded.last_heartbeat,
                        extra_parameters=excluded.extra_parameters, updated_at=excluded.updated_at",
                    rusqlite::params![
                        a.id.to_string(),
                        a.name,
                        enum_to_sql(&a.status),
                        a.owner_id,
                        serde_json::to_string(&a.devices).expect("serialize devices"),
                        a.is_enabled,
                        a.schedule
                            .as_ref()
                            .map(|s| serde_json::to_string(s).expect("serialize schedule")),
                        a.last_heartbeat.map(|t| t.to_rfc3339()),
                        a.extra_parameters,
                        a.created_at.to_rfc3339(),
                        a.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_agent(&self, id: Uuid) -> StoreResult<Option<Agent>> {
        let id_str = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list_agents(&self) -> StoreResult<Vec<Agent>> {
        self.conn()
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY name"))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn set_agent_status(&self, id: Uuid, status: AgentStatus) -> StoreResult<bool> {
        let id_str = id.to_string();
        let status_str = enum_to_sql(&status);
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE agents SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![status_str, now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Record a heartbeat, marking the agent active and refreshing its
    /// device inventory when one was reported.
    pub async fn record_heartbeat(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        devices: Option<Vec<DeviceInfo>>,
    ) -> StoreResult<bool> {
        let id_str = id.to_string();
        let at_str = at.to_rfc3339();
        let devices_json =
            devices.map(|d| serde_json::to_string(&d).expect("serialize devices"));
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE agents
                     SET last_heartbeat = ?1, status = 'active',
                         devices = COALESCE(?2, devices), updated_at = ?1
                     WHERE id = ?3",
                    rusqlite::params![at_str, devices_json, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Active agents whose last heartbeat is older than `max_age_seconds`.
    pub async fn stale_agents(&self, max_age_seconds: u64) -> StoreResult<Vec<Agent>> {
        let cutoff = (Utc::now() - Duration::seconds(max_age_seconds as i64)).to_rfc3339();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AGENT_COLUMNS} FROM agents
                     WHERE status = 'active'
                       AND (last_heartbeat IS NULL OR last_heartbeat < ?1)"
                ))?;
                let mut rows = stmt.query(rusqlite::params![cutoff])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(2)?;
    let devices_json: String = row.get(4)?;
    let schedule_json: Option<String> = row.get(6)?;
    let heartbeat_str: Option<String> = row.get(7)?;
    let created_at_str: String = row.get(9)?;
    let updated_at_str: String = row.get(10)?;

    let devices: Vec<DeviceInfo> =
        serde_json::from_str(&devices_json).expect("valid device json");
    let schedule: Option<AgentSchedule> =
        schedule_json.map(|s| serde_json::from_str(&s).expect("valid schedule json"));

    Ok(Agent {
        id: parse_uuid(&id_str),
        name: row.get(1)?,
        status: enum_from_sql(&status_str),
        owner_id: row.get(3)?,
        devices,
        is_enabled: row.get(5)?,
        schedule,
        last_heartbeat: parse_opt_ts(heartbeat_str),
        extra_parameters: row.get(8)?,
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
    })
}
