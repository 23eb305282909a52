use chrono::Utc;
use uuid::Uuid;

use crate::types::Hashlist;

use super::{as_i64, as_u64, parse_ts, parse_uuid, StoreDb, StoreError, StoreResult};

const HASHLIST_COLUMNS: &str = "id, name, hash_type_id, total_hashes, cracked_hashes,
    has_mixed_work_factors, is_ready, created_at, updated_at";

impl StoreDb {
    pub async fn upsert_hashlist(&self, hashlist: &Hashlist) -> StoreResult<()> {
        let h = hashlist.clone();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO hashlists (id, name, hash_type_id, total_hashes,
                        cracked_hashes, has_mixed_work_factors, is_ready, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, total_hashes=excluded.total_hashes,
                        cracked_hashes=excluded.cracked_hashes,
                        has_mixed_work_factors=excluded.has_mixed_work_factors,
                        is_ready=excluded.is_ready, updated_at=excluded.updated_at",
                    rusqlite::params![
                        h.id.to_string(),
                        h.name,
                        h.hash_type_id,
                        as_i64(h.total_hashes),
                        as_i64(h.cracked_hashes),
                        h.has_mixed_work_factors,
                        h.is_ready,
                        h.created_at.to_rfc3339(),
                        h.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_hashlist(&self, id: Uuid) -> StoreResult<Option<Hashlist>> {
        let id_str = id.to_string();
        self.conn()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {HASHLIST_COLUMNS} FROM hashlists WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_hashlist(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Register one hash and attach it to a hashlist, bumping the
    /// hashlist's total in the same transaction. Ingest proper is outside
    /// the core; this exists for bootstrap and tests.
    pub async fn add_hash(
        &self,
        hashlist_id: Uuid,
        original_hash: &str,
        metadata: Option<String>,
    ) -> StoreResult<Uuid> {
        let list_str = hashlist_id.to_string();
        let hash_value = original_hash.to_string();
        self.conn()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now().to_rfc3339();
                let hash_id = Uuid::new_v4();
                tx.execute(
                    "INSERT INTO hashes (id, original_hash, metadata) VALUES (?1, ?2, ?3)
                     ON CONFLICT(original_hash) DO NOTHING",
                    rusqlite::params![hash_id.to_string(), hash_value, metadata],
                )?;
                // Resolve the id in case the hash already existed.
                let resolved: String = tx.query_row(
                    "SELECT id FROM hashes WHERE original_hash = ?1",
                    rusqlite::params![hash_value],
                    |r| r.get(0),
                )?;
                let linked = tx.execute(
                    "INSERT OR IGNORE INTO hashlist_hashes (hashlist_id, hash_id)
                     VALUES (?1, ?2)",
                    rusqlite::params![list_str, resolved],
                )?;
                if linked > 0 {
                    tx.execute(
                        "UPDATE hashlists
                         SET total_hashes = total_hashes + 1, updated_at = ?1 WHERE id = ?2",
                        rusqlite::params![now, list_str],
                    )?;
                }
                tx.commit()?;
                Ok(parse_uuid(&resolved))
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn mark_hashlist_ready(&self, id: Uuid) -> StoreResult<bool> {
        let id_str = id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE hashlists SET is_ready = 1, updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, id_str],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Cascades to the hashlist's jobs, their tasks and layers.
    pub async fn delete_hashlist(&self, id: Uuid) -> StoreResult<bool> {
        let id_str = id.to_string();
        self.conn()
            .call(move |conn| {
                let changed = conn.execute("DELETE FROM hashlists WHERE id = ?1", [id_str])?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count of cracked hashes actually persisted for a hashlist;
    /// the source of truth behind the `cracked_hashes` counter.
    pub async fn cracked_hash_count(&self, hashlist_id: Uuid) -> StoreResult<u64> {
        let id_str = hashlist_id.to_string();
        self.conn()
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM hashes
                     WHERE is_cracked = 1
                       AND id IN (SELECT hash_id FROM hashlist_hashes WHERE hashlist_id = ?1)",
                    rusqlite::params![id_str],
                    |r| r.get(0),
                )?;
                Ok(as_u64(count))
            })
            .await
            .map_err(StoreError::from)
    }

    /// The task credited with cracking a given hash, if cracked.
    pub async fn crack_attribution(&self, original_hash: &str) -> StoreResult<Option<Uuid>> {
        let hash_value = original_hash.to_string();
        self.conn()
            .call(move |conn| {
                let attribution: Option<Option<String>> = conn
                    .query_row(
                        "SELECT cracked_by_task_id FROM hashes WHERE original_hash = ?1",
                        rusqlite::params![hash_value],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(attribution.flatten().map(|s| parse_uuid(&s)))
            })
            .await
            .map_err(StoreError::from)
    }
}

fn row_to_hashlist(row: &rusqlite::Row<'_>) -> rusqlite::Result<Hashlist> {
    let id_str: String = row.get(0)?;
    let created_at_str: String = row.get(7)?;
    let updated_at_str: String = row.get(8)?;

    Ok(Hashlist {
        id: parse_uuid(&id_str),
        name: row.get(1)?,
        hash_type_id: row.get(2)?,
        total_hashes: as_u64(row.get(3)?),
        cracked_hashes: as_u64(row.get(4)?),
        has_mixed_work_factors: row.get(5)?,
        is_ready: row.get(6)?,
        created_at: parse_ts(&created_at_str),
        updated_at: parse_ts(&updated_at_str),
    })
}
