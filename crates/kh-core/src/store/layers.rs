use chrono::Utc;
use uuid::Uuid;

use crate::types::{IncrementLayer, LayerStatus};

use super::{
    as_i64, as_u64, enum_from_sql, enum_to_sql, parse_ts, parse_uuid, StoreDb, StoreError,
    StoreResult,
};

const LAYER_COLUMNS: &str = "id, job_id, layer_index, mask, base_keyspace, effective_keyspace,
    processed_keyspace, dispatched_keyspace, is_accurate_keyspace, overall_progress_percent,
    status, created_at, updated_at";

impl StoreDb {
    pub async fn insert_layer(&self, layer: &IncrementLayer) -> StoreResult<()> {
        let l = layer.clone();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO job_increment_layers (id, job_id, layer_index, mask,
                        base_keyspace, effective_keyspace, processed_keyspace,
                        dispatched_keyspace, is_accurate_keyspace, overall_progress_percent,
                        status, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                    rusqlite::params![
                        l.id.to_string(),
                        l.job_id.to_string(),
                        l.layer_index,
                        l.mask,
                        as_i64(l.base_keyspace),
                        as_i64(l.effective_keyspace),
                        as_i64(l.processed_keyspace),
                        as_i64(l.dispatched_keyspace),
                        l.is_accurate_keyspace,
                        l.overall_progress_percent,
                        enum_to_sql(&l.status),
                        l.created_at.to_rfc3339(),
                        l.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_layer(&self, id: Uuid) -> StoreResult<Option<IncrementLayer>> {
        let id_str = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {LAYER_COLUMNS} FROM job_increment_layers WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_layer(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Layers of a job in dispatch order (`layer_index` ascending).
    pub async fn layers_for_job(&self, job_id: Uuid) -> StoreResult<Vec<IncrementLayer>> {
        let id_str = job_id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {LAYER_COLUMNS} FROM job_increment_layers
                     WHERE job_id = ?1 ORDER BY layer_index ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_layer(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn set_layer_status(&self, id: Uuid, status: LayerStatus) -> StoreResult<bool> {
        let id_str = id.to_string();
        let status_str = enum_to_sql(&status);
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE job_increment_layers SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![status_str, now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn set_layer_progress_percent(&self, id: Uuid, percent: f64) -> StoreResult<()> {
        let id_str = id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "UPDATE job_increment_layers
                     SET overall_progress_percent = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![percent, now, id_str],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }
}

fn row_to_layer(row: &rusqlite::Row<'_>) -> rusqlite::Result<IncrementLayer> {
    let id_str: String = row.get(0)?;
    let job_str: String = row.get(1)?;
    let status_str: String = row.get(10)?;
    let created_at_str: String = row.get(11)?;
    let updated_at_str: String = row.get(12)?;

    Ok(IncrementLayer {
        id: parse_uuid(&id_str),
        job_id: parse_uuid(&job_str),
        layer_index: row.get(2)?,
        mask: row.get(3)?,
        base_keyspace: as_u64(row.get(4)?),
        effective_keyspace: as_u64(row.get(5)?),
        processed_keyspace: as_u64(row.get(6)?),
        dispatched_keyspace: as_u64(row.get(7)?),
        is_accurate_keyspace: row.get(8)?,
        overall_progress_percent: row.get(9)?,
        status: enum_from_sql(&status_str),
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
    })
}
