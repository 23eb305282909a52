use chrono::Utc;

use crate::settings::SystemSettings;

use super::{StoreDb, StoreError, StoreResult};

impl StoreDb {
    pub async fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO system_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                        value=excluded.value, updated_at=excluded.updated_at",
                    rusqlite::params![key, value, now],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.conn()
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM system_settings WHERE key = ?1",
                        rusqlite::params![key],
                        |r| r.get::<_, String>(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Typed settings snapshot; the scheduler takes one per tick instead of
    /// caching across ticks.
    pub async fn load_system_settings(&self) -> StoreResult<SystemSettings> {
        let pairs: Vec<(String, String)> = self
            .conn()
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT key, value FROM system_settings")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get(0)?, row.get(1)?));
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)?;
        Ok(SystemSettings::from_pairs(
            pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ))
    }
}
