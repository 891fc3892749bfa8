use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::error::{MirrorError, Result};
use crate::types::Label;

/// One row of the shard directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardRow {
    pub mailbox_id: String,
    pub shard_id: String,
    pub seq: i64,
    pub created_at: i64,
    pub last_used: Option<i64>,
}

/// Shards of a mailbox in registry (creation) order
pub fn list_shards(pool: &DbPool, mailbox_id: &str) -> Result<Vec<ShardRow>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT mailbox_id, shard_id, seq, created_at, last_used
         FROM shard_registry
         WHERE mailbox_id = ?1
         ORDER BY seq ASC",
    )?;

    let rows = stmt
        .query_map(params![mailbox_id], |row| {
            Ok(ShardRow {
                mailbox_id: row.get(0)?,
                shard_id: row.get(1)?,
                seq: row.get(2)?,
                created_at: row.get(3)?,
                last_used: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows)
}

/// Append a shard at the end of the mailbox's registry order
pub fn insert_shard(pool: &DbPool, mailbox_id: &str, shard_id: &str) -> Result<ShardRow> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp_millis();

    conn.execute(
        "INSERT INTO shard_registry (mailbox_id, shard_id, seq, created_at, last_used)
         SELECT ?1, ?2, COALESCE(MAX(seq), 0) + 1, ?3, ?3
         FROM shard_registry WHERE mailbox_id = ?1",
        params![mailbox_id, shard_id, now],
    )?;

    let seq: i64 = conn.query_row(
        "SELECT seq FROM shard_registry WHERE mailbox_id = ?1 AND shard_id = ?2",
        params![mailbox_id, shard_id],
        |row| row.get(0),
    )?;

    Ok(ShardRow {
        mailbox_id: mailbox_id.to_string(),
        shard_id: shard_id.to_string(),
        seq,
        created_at: now,
        last_used: Some(now),
    })
}

pub fn touch_shard(pool: &DbPool, mailbox_id: &str, shard_id: &str) -> Result<()> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp_millis();
    conn.execute(
        "UPDATE shard_registry SET last_used = ?1 WHERE mailbox_id = ?2 AND shard_id = ?3",
        params![now, mailbox_id, shard_id],
    )?;
    Ok(())
}

pub fn delete_shards(pool: &DbPool, mailbox_id: &str) -> Result<usize> {
    let conn = pool.get()?;
    let deleted = conn.execute(
        "DELETE FROM shard_registry WHERE mailbox_id = ?1",
        params![mailbox_id],
    )?;
    Ok(deleted)
}

// ========== Canonical labels ==========

pub fn get_label(pool: &DbPool, mailbox_id: &str, label_id: &str) -> Result<Option<Label>> {
    let conn = pool.get()?;
    let result = conn.query_row(
        "SELECT label_id, name, color FROM mailbox_labels WHERE mailbox_id = ?1 AND label_id = ?2",
        params![mailbox_id, label_id],
        |row| {
            Ok(Label {
                id: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
            })
        },
    );

    match result {
        Ok(label) => Ok(Some(label)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(MirrorError::Storage(e.to_string())),
    }
}

/// Create the label unless the mailbox already has one with this id
pub fn insert_label_if_missing(pool: &DbPool, mailbox_id: &str, label: &Label) -> Result<bool> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp_millis();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO mailbox_labels (mailbox_id, label_id, name, color, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![mailbox_id, label.id, label.name, label.color, now],
    )?;
    Ok(inserted > 0)
}

pub fn upsert_label(pool: &DbPool, mailbox_id: &str, label: &Label) -> Result<()> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO mailbox_labels (mailbox_id, label_id, name, color, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(mailbox_id, label_id) DO UPDATE SET
            name = excluded.name,
            color = excluded.color,
            updated_at = excluded.updated_at",
        params![mailbox_id, label.id, label.name, label.color, now],
    )?;
    Ok(())
}

pub fn list_labels(pool: &DbPool, mailbox_id: &str) -> Result<Vec<Label>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT label_id, name, color FROM mailbox_labels WHERE mailbox_id = ?1 ORDER BY label_id",
    )?;
    let labels = stmt
        .query_map(params![mailbox_id], |row| {
            Ok(Label {
                id: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(labels)
}

pub fn delete_labels(pool: &DbPool, mailbox_id: &str) -> Result<usize> {
    let conn = pool.get()?;
    let deleted = conn.execute(
        "DELETE FROM mailbox_labels WHERE mailbox_id = ?1",
        params![mailbox_id],
    )?;
    Ok(deleted)
}
