use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::error::{MirrorError, Result};

/// A connected mailbox and its per-mailbox sync overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub mailbox_id: String,
    pub provider: String,
    pub email: String,
    /// Virtual mailbox spanning others; never synced directly
    pub is_aggregate: bool,
    pub max_page_count: Option<u32>,
    pub loop_enabled: Option<bool>,
    pub created_at: i64,
}

impl ConnectionRecord {
    pub fn new(mailbox_id: &str, provider: &str, email: &str) -> Self {
        Self {
            mailbox_id: mailbox_id.to_string(),
            provider: provider.to_string(),
            email: email.to_string(),
            is_aggregate: false,
            max_page_count: None,
            loop_enabled: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

pub fn upsert_connection(pool: &DbPool, record: &ConnectionRecord) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO connections (mailbox_id, provider, email, is_aggregate, max_page_count, loop_enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(mailbox_id) DO UPDATE SET
            provider = excluded.provider,
            email = excluded.email,
            is_aggregate = excluded.is_aggregate,
            max_page_count = excluded.max_page_count,
            loop_enabled = excluded.loop_enabled",
        params![
            record.mailbox_id,
            record.provider,
            record.email,
            record.is_aggregate,
            record.max_page_count,
            record.loop_enabled,
            record.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_connection(pool: &DbPool, mailbox_id: &str) -> Result<Option<ConnectionRecord>> {
    let conn = pool.get()?;
    let result = conn.query_row(
        "SELECT mailbox_id, provider, email, is_aggregate, max_page_count, loop_enabled, created_at
         FROM connections WHERE mailbox_id = ?1",
        params![mailbox_id],
        |row| {
            Ok(ConnectionRecord {
                mailbox_id: row.get(0)?,
                provider: row.get(1)?,
                email: row.get(2)?,
                is_aggregate: row.get(3)?,
                max_page_count: row.get(4)?,
                loop_enabled: row.get(5)?,
                created_at: row.get(6)?,
            })
        },
    );

    match result {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(MirrorError::Storage(e.to_string())),
    }
}

pub fn delete_connection(pool: &DbPool, mailbox_id: &str) -> Result<bool> {
    let conn = pool.get()?;
    let deleted = conn.execute(
        "DELETE FROM connections WHERE mailbox_id = ?1",
        params![mailbox_id],
    )?;
    Ok(deleted > 0)
}
