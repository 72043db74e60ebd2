use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde_json::json;
use tokio_rusqlite::Connection;

use super::errors::ChatError;
use super::store::{SESSION_KEY, SessionRecord, SessionStore, is_stale, write_timestamp};

/// Session store backed by the `session_record` table.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Connection,
    key: String,
}

impl SqliteSessionStore {
    pub fn new(db: &Connection) -> Self {
        Self {
            db: db.clone(),
            key: SESSION_KEY.to_string(),
        }
    }
}

pub async fn find_session_record(
    db: &Connection,
    key: &str,
) -> Result<Option<SessionRecord>, ChatError> {
    let key = key.to_owned();
    let row = db
        .call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT data, updated_at FROM session_record WHERE key = ?1",
                    [key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            Ok(row)
        })
        .await?;

    let Some((data, updated_at)) = row else {
        return Ok(None);
    };
    let mut record: SessionRecord = serde_json::from_str(&data)?;
    // The column holds the timestamp the write was actually stored with
    record.timestamp = updated_at;
    Ok(Some(record))
}

/// Insert or replace the record stored at `key`. With `only_newer` a
/// record older than the stored one is skipped. Returns the timestamp
/// the record was stored with, or `None` when it was skipped.
pub async fn upsert_session_record(
    db: &Connection,
    key: &str,
    record: &SessionRecord,
    only_newer: bool,
) -> Result<Option<i64>, ChatError> {
    let key = key.to_owned();
    let data = json!(record).to_string();
    let requested = record.timestamp;
    let stored_at = db
        .call(move |conn| {
            let tx = conn.transaction()?;
            let previous: Option<i64> = tx
                .query_row(
                    "SELECT updated_at FROM session_record WHERE key = ?1",
                    [&key],
                    |row| row.get(0),
                )
                .optional()?;
            let now = Utc::now().timestamp_millis();
            if only_newer && is_stale(requested, previous, now) {
                return Ok(None);
            }

            let updated_at = write_timestamp(requested, previous, now);
            tx.execute(
                r#"
                INSERT INTO session_record (key, data, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    data = excluded.data,
                    updated_at = excluded.updated_at
                "#,
                params![key, data, updated_at],
            )?;
            tx.commit()?;
            Ok(Some(updated_at))
        })
        .await?;

    Ok(stored_at)
}

pub async fn delete_session_record(db: &Connection, key: &str) -> Result<(), ChatError> {
    let key = key.to_owned();
    db.call(move |conn| {
        conn.execute("DELETE FROM session_record WHERE key = ?1", [key])?;
        Ok(())
    })
    .await?;
    Ok(())
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self) -> Result<Option<SessionRecord>, ChatError> {
        find_session_record(&self.db, &self.key).await
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), ChatError> {
        upsert_session_record(&self.db, &self.key, record, false).await?;
        Ok(())
    }

    async fn save_if_newer(&self, record: &SessionRecord) -> Result<bool, ChatError> {
        let stored_at = upsert_session_record(&self.db, &self.key, record, true).await?;
        Ok(stored_at.is_some())
    }

    async fn clear(&self) -> Result<(), ChatError> {
        delete_session_record(&self.db, &self.key).await
    }
}
