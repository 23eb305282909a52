use chrono::Utc;

use super::{StoreDb, StoreError, StoreResult};

impl StoreDb {
    /// Claim an emission slot for (kind, entity, attempt). Returns true
    /// exactly once per tuple; callers publish the event only on true.
    pub async fn try_mark_emitted(
        &self,
        kind: &str,
        entity_id: &str,
        attempt: u32,
    ) -> StoreResult<bool> {
        let kind = kind.to_string();
        let entity = entity_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO emitted_events (kind, entity_id, attempt, emitted_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![kind, entity, attempt, now],
                )?;
                Ok(inserted > 0)
            })
            .await
            .map_err(StoreError::from)
    }
}
