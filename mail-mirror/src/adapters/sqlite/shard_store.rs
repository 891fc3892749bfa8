//! SQLite store behind a single shard
//!
//! Holds the relational mirror (threads, labels, thread-label links) for one
//! slice of a mailbox. All methods are synchronous; the shard actor in
//! `crate::shard` owns the store and is the only caller.

use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use super::pool::{create_memory_pool, create_pool, DbConnection, DbPool};
use super::schema;
use crate::error::{MirrorError, Result};
use crate::types::folder::SPAM;
use crate::types::{
    DeleteResult, FolderFilter, Label, ModifyLabelsResult, PageCursor, Sender, Thread,
    ThreadDetail, ThreadPage, ThreadQuery, ThreadSummary,
};

const THREAD_COLUMNS: &str =
    "t.id, t.thread_id, t.provider_id, t.latest_sender, t.latest_received_on, t.latest_subject";

pub struct ShardStore {
    pool: DbPool,
}

impl ShardStore {
    /// Open (or create) a shard file at the given path
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_pool(create_pool(path, 2)?)
    }

    /// Create an in-memory shard (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::with_pool(create_memory_pool()?)
    }

    fn with_pool(pool: DbPool) -> Result<Self> {
        let store = Self { pool };
        let conn = store.connection()?;
        schema::initialize_shard_schema(&conn)?;
        drop(conn);
        Ok(store)
    }

    pub fn connection(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| MirrorError::Storage(format!("Failed to get shard connection: {}", e)))
    }

    // ========== Writes ==========

    /// Insert or update a thread and link it to `labels`.
    ///
    /// Missing label rows are created as given; existing ones are left alone.
    /// Re-applying the same thread and labels adds no rows.
    pub fn upsert_thread(&self, thread: &Thread, labels: &[Label]) -> Result<()> {
        let sender = serde_json::to_string(&thread.latest_sender)?;

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO threads (id, thread_id, provider_id, latest_sender, latest_received_on, latest_subject)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                thread_id = excluded.thread_id,
                provider_id = excluded.provider_id,
                latest_sender = excluded.latest_sender,
                latest_received_on = excluded.latest_received_on,
                latest_subject = excluded.latest_subject",
            params![
                thread.id,
                thread.thread_id,
                thread.provider_id,
                sender,
                thread.latest_received_on,
                thread.latest_subject,
            ],
        )?;

        for label in labels {
            insert_label_if_missing(&tx, label)?;
            tx.execute(
                "INSERT OR IGNORE INTO thread_labels (thread_id, label_id) VALUES (?1, ?2)",
                params![thread.id, label.id],
            )?;
        }

        tx.commit()?;

        debug!("Upserted thread {} with {} labels", thread.id, labels.len());
        Ok(())
    }

    pub fn delete_thread(&self, id: &str) -> Result<DeleteResult> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!("SELECT {} FROM threads t WHERE t.id = ?1", THREAD_COLUMNS),
                params![id],
                thread_from_row,
            )
            .optional()?;

        let Some(thread) = existing else {
            return Ok(DeleteResult::default());
        };

        tx.execute("DELETE FROM thread_labels WHERE thread_id = ?1", params![id])?;
        tx.execute("DELETE FROM threads WHERE id = ?1", params![id])?;
        tx.commit()?;

        Ok(DeleteResult {
            count: 1,
            threads: vec![thread],
        })
    }

    /// Delete every thread linked to SPAM
    pub fn delete_spam_threads(&self) -> Result<DeleteResult> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let threads = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM threads t
                 JOIN thread_labels tl ON tl.thread_id = t.id
                 WHERE tl.label_id = ?1",
                THREAD_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![SPAM], thread_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        if threads.is_empty() {
            return Ok(DeleteResult::default());
        }

        tx.execute(
            "DELETE FROM threads WHERE id IN (SELECT thread_id FROM thread_labels WHERE label_id = ?1)",
            params![SPAM],
        )?;
        tx.execute(
            "DELETE FROM thread_labels WHERE thread_id NOT IN (SELECT id FROM threads)",
            [],
        )?;
        tx.commit()?;

        Ok(DeleteResult {
            count: threads.len(),
            threads,
        })
    }

    /// Remove `remove` links first, then link `add`. Only links that actually
    /// changed are reported.
    pub fn modify_labels(
        &self,
        thread_id: &str,
        add: &[Label],
        remove: &[String],
    ) -> Result<ModifyLabelsResult> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM threads WHERE id = ?1)",
            params![thread_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(MirrorError::ThreadNotFound(thread_id.to_string()));
        }

        let mut result = ModifyLabelsResult::default();

        for label_id in remove {
            let changed = tx.execute(
                "DELETE FROM thread_labels WHERE thread_id = ?1 AND label_id = ?2",
                params![thread_id, label_id],
            )?;
            if changed > 0 {
                result.removed.push(label_id.clone());
            }
        }

        for label in add {
            insert_label_if_missing(&tx, label)?;
            let changed = tx.execute(
                "INSERT OR IGNORE INTO thread_labels (thread_id, label_id) VALUES (?1, ?2)",
                params![thread_id, label.id],
            )?;
            if changed > 0 {
                result.added.push(label.id.clone());
            }
        }

        tx.commit()?;
        Ok(result)
    }

    /// Rewrite name/color of a label this shard already knows.
    /// Returns false when the shard never saw the label.
    pub fn update_label(&self, label: &Label) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE labels SET name = ?2, color = ?3 WHERE id = ?1",
                params![label.id, label.name, label.color],
            )
            .map_err(|e| MirrorError::LabelCreation(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Drop every shard-local table. The store is unusable afterwards.
    pub fn drop_tables(&self) -> Result<()> {
        let conn = self.connection()?;
        schema::drop_shard_schema(&conn)
    }

    // ========== Reads ==========

    /// One page of threads, newest first.
    ///
    /// Fetches `max_results + 1` rows to learn whether another page exists;
    /// the token points just past the last returned row.
    pub fn query(&self, query: &ThreadQuery) -> Result<ThreadPage> {
        if query.max_results == 0 {
            return Ok(ThreadPage::default());
        }

        let mut threads = self.fetch(query, query.max_results.saturating_add(1))?;
        let next_page_token = if threads.len() > query.max_results {
            threads.truncate(query.max_results);
            threads.last().map(|t| t.cursor().encode())
        } else {
            None
        };

        Ok(ThreadPage {
            threads,
            next_page_token,
        })
    }

    /// Up to `limit` rows past the query's page token, newest first
    pub fn fetch(&self, query: &ThreadQuery, limit: usize) -> Result<Vec<ThreadSummary>> {
        let conn = self.connection()?;

        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(folder) = query.folder.as_deref().filter(|f| !f.trim().is_empty()) {
            match FolderFilter::from_folder(folder) {
                FolderFilter::Label(label_id) => {
                    args.push(Box::new(label_id));
                    clauses.push(format!(
                        "EXISTS (SELECT 1 FROM thread_labels tl WHERE tl.thread_id = t.id AND tl.label_id = ?{})",
                        args.len()
                    ));
                }
                FolderFilter::Excluding(label_ids) => {
                    let placeholders = push_all(&mut args, label_ids);
                    clauses.push(format!(
                        "NOT EXISTS (SELECT 1 FROM thread_labels tl WHERE tl.thread_id = t.id AND tl.label_id IN ({}))",
                        placeholders
                    ));
                }
            }
        }

        if !query.label_ids.is_empty() {
            if query.require_all {
                for label_id in &query.label_ids {
                    args.push(Box::new(label_id.clone()));
                    clauses.push(format!(
                        "EXISTS (SELECT 1 FROM thread_labels tl WHERE tl.thread_id = t.id AND tl.label_id = ?{})",
                        args.len()
                    ));
                }
            } else {
                let placeholders = push_all(&mut args, query.label_ids.clone());
                clauses.push(format!(
                    "EXISTS (SELECT 1 FROM thread_labels tl WHERE tl.thread_id = t.id AND tl.label_id IN ({}))",
                    placeholders
                ));
            }
        }

        if let Some(text) = query
            .search_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            args.push(Box::new(format!("%{}%", escape_like(text))));
            let n = args.len();
            // Sender values only, never the JSON keys around them
            clauses.push(format!(
                "(t.latest_subject LIKE ?{n} ESCAPE '\\' \
                 OR CASE WHEN json_valid(t.latest_sender) \
                    THEN json_extract(t.latest_sender, '$.email') LIKE ?{n} ESCAPE '\\' \
                      OR json_extract(t.latest_sender, '$.name') LIKE ?{n} ESCAPE '\\' \
                    ELSE t.latest_sender LIKE ?{n} ESCAPE '\\' END)"
            ));
        }

        if let Some(cursor) = query.page_token.as_deref().and_then(PageCursor::parse) {
            args.push(Box::new(cursor.received_on));
            let ts = args.len();
            match cursor.id {
                Some(id) => {
                    args.push(Box::new(id));
                    let id_n = args.len();
                    clauses.push(format!(
                        "(t.latest_received_on < ?{ts} OR (t.latest_received_on = ?{ts} AND t.id < ?{id_n}))"
                    ));
                }
                None => clauses.push(format!("t.latest_received_on < ?{ts}")),
            }
        }

        args.push(Box::new(limit as i64));
        let limit_n = args.len();

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM threads t {} ORDER BY t.latest_received_on DESC, t.id DESC LIMIT ?{}",
            THREAD_COLUMNS, where_sql, limit_n
        );

        let params_refs: Vec<&dyn ToSql> = args.iter().map(|p| p.as_ref()).collect();
        let threads = {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_refs.as_slice(), thread_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        threads
            .into_iter()
            .map(|thread| {
                let label_ids = label_ids_for(&conn, &thread.id)?;
                Ok(ThreadSummary { thread, label_ids })
            })
            .collect()
    }

    pub fn get_thread(&self, id: &str) -> Result<Option<ThreadDetail>> {
        let conn = self.connection()?;

        let thread = conn
            .query_row(
                &format!("SELECT {} FROM threads t WHERE t.id = ?1", THREAD_COLUMNS),
                params![id],
                thread_from_row,
            )
            .optional()?;

        let Some(thread) = thread else {
            return Ok(None);
        };

        let labels = {
            let mut stmt = conn
                .prepare(
                    "SELECT l.id, l.name, l.color FROM labels l
                     JOIN thread_labels tl ON tl.label_id = l.id
                     WHERE tl.thread_id = ?1
                     ORDER BY l.id",
                )
                .map_err(|e| MirrorError::LabelRetrieval(e.to_string()))?;
            let rows = stmt
                .query_map(params![id], label_from_row)
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(|e| MirrorError::LabelRetrieval(e.to_string()))?;
            rows
        };

        Ok(Some(ThreadDetail { thread, labels }))
    }

    pub fn has_thread(&self, id: &str) -> Result<bool> {
        let conn = self.connection()?;
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM threads WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn thread_count(&self) -> Result<u64> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM threads", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Current storage footprint in bytes
    pub fn size_bytes(&self) -> Result<u64> {
        let conn = self.connection()?;
        let size: i64 = conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )?;
        Ok(size.max(0) as u64)
    }

    /// Thread count per label id
    pub fn label_counts(&self) -> Result<HashMap<String, u64>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT label_id, COUNT(*) FROM thread_labels GROUP BY label_id")
            .map_err(|e| MirrorError::LabelRetrieval(e.to_string()))?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| MirrorError::LabelRetrieval(e.to_string()))?;

        Ok(counts
            .into_iter()
            .map(|(label_id, count)| (label_id, count as u64))
            .collect())
    }

    pub fn list_labels(&self) -> Result<Vec<Label>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT id, name, color FROM labels ORDER BY id")
            .map_err(|e| MirrorError::LabelRetrieval(e.to_string()))?;
        let labels = stmt
            .query_map([], label_from_row)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| MirrorError::LabelRetrieval(e.to_string()))?;
        Ok(labels)
    }

    /// Senders of the most recent threads, newest first, possibly repeated
    pub fn recent_senders(&self, limit: usize) -> Result<Vec<Sender>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT latest_sender FROM threads ORDER BY latest_received_on DESC LIMIT ?1",
        )?;
        let raw = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(raw.iter().map(|s| parse_sender(s)).collect())
    }
}

fn insert_label_if_missing(conn: &Connection, label: &Label) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO labels (id, name, color) VALUES (?1, ?2, ?3)",
            params![label.id, label.name, label.color],
        )
        .map_err(|e| MirrorError::LabelCreation(format!("{}: {}", label.id, e)))?;
    Ok(inserted > 0)
}

fn label_ids_for(conn: &Connection, thread_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare_cached("SELECT label_id FROM thread_labels WHERE thread_id = ?1 ORDER BY label_id")
        .map_err(|e| MirrorError::LabelRetrieval(e.to_string()))?;
    let ids = stmt
        .query_map(params![thread_id], |row| row.get(0))
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<String>>>())
        .map_err(|e| MirrorError::LabelRetrieval(e.to_string()))?;
    Ok(ids)
}

fn thread_from_row(row: &Row) -> rusqlite::Result<Thread> {
    let sender: String = row.get(3)?;
    Ok(Thread {
        id: row.get(0)?,
        thread_id: row.get(1)?,
        provider_id: row.get(2)?,
        latest_sender: parse_sender(&sender),
        latest_received_on: row.get(4)?,
        latest_subject: row.get(5)?,
    })
}

fn label_from_row(row: &Row) -> rusqlite::Result<Label> {
    Ok(Label {
        id: row.get(0)?,
        name: row.get(1)?,
        color: row.get(2)?,
    })
}

// Rows written before the sender blob was structured hold a bare address.
fn parse_sender(raw: &str) -> Sender {
    serde_json::from_str(raw).unwrap_or_else(|_| Sender {
        name: None,
        email: raw.to_string(),
    })
}

fn push_all(args: &mut Vec<Box<dyn ToSql>>, values: Vec<String>) -> String {
    let mut placeholders = Vec::with_capacity(values.len());
    for value in values {
        args.push(Box::new(value));
        placeholders.push(format!("?{}", args.len()));
    }
    placeholders.join(",")
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
