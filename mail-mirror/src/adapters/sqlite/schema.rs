use rusqlite::Connection;

use crate::error::Result;

/// Control database: shard directory, canonical labels, connections and
/// durable workflow state. One per mirror.
pub fn initialize_control_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("
        -- Known shards per mailbox, in first-seen order
        CREATE TABLE IF NOT EXISTS shard_registry (
            mailbox_id  TEXT NOT NULL,
            shard_id    TEXT NOT NULL,
            seq         INTEGER NOT NULL,   -- registry order, monotonic per mailbox
            created_at  INTEGER NOT NULL,   -- unix epoch ms
            last_used   INTEGER,            -- unix epoch ms, last time picked for a write
            PRIMARY KEY (mailbox_id, shard_id)
        );

        CREATE INDEX IF NOT EXISTS idx_shard_registry_order ON shard_registry(mailbox_id, seq);

        -- Canonical label identity, shared by every shard of a mailbox
        CREATE TABLE IF NOT EXISTS mailbox_labels (
            mailbox_id  TEXT NOT NULL,
            label_id    TEXT NOT NULL,
            name        TEXT NOT NULL,
            color       TEXT NOT NULL,
            updated_at  INTEGER NOT NULL,
            PRIMARY KEY (mailbox_id, label_id)
        );

        -- Connected mailboxes
        CREATE TABLE IF NOT EXISTS connections (
            mailbox_id      TEXT PRIMARY KEY,
            provider        TEXT NOT NULL,      -- 'google' | 'imap' | ...
            email           TEXT NOT NULL,
            is_aggregate    INTEGER NOT NULL DEFAULT 0,
            max_page_count  INTEGER,            -- NULL = use [sync] default
            loop_enabled    INTEGER,            -- NULL = use [sync] default
            created_at      INTEGER NOT NULL
        );

        -- Coordinator runs and their checkpointed steps
        CREATE TABLE IF NOT EXISTS workflow_runs (
            run_id      TEXT PRIMARY KEY,
            mailbox_id  TEXT NOT NULL,
            folder      TEXT NOT NULL,
            state       TEXT NOT NULL,      -- JSON CoordinatorState
            created_at  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS workflow_steps (
            run_id        TEXT NOT NULL REFERENCES workflow_runs(run_id) ON DELETE CASCADE,
            step_name     TEXT NOT NULL,
            output        TEXT NOT NULL,    -- JSON step output
            completed_at  INTEGER NOT NULL,
            PRIMARY KEY (run_id, step_name)
        );
    ")?;

    Ok(())
}

/// Shard-local relational mirror. One per shard file.
pub fn initialize_shard_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("
        CREATE TABLE IF NOT EXISTS threads (
            id                  TEXT PRIMARY KEY,   -- stable, provider-derived
            thread_id           TEXT NOT NULL,
            provider_id         TEXT NOT NULL,
            latest_sender       TEXT NOT NULL,      -- JSON {name, email}
            latest_received_on  TEXT NOT NULL,      -- UTC ISO-8601, fixed width
            latest_subject      TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_threads_received ON threads(latest_received_on DESC, id DESC);

        CREATE TABLE IF NOT EXISTS labels (
            id      TEXT PRIMARY KEY,
            name    TEXT NOT NULL,
            color   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS thread_labels (
            thread_id   TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            label_id    TEXT NOT NULL REFERENCES labels(id),
            PRIMARY KEY (thread_id, label_id)
        );

        CREATE INDEX IF NOT EXISTS idx_thread_labels_label ON thread_labels(label_id);
    ")?;

    Ok(())
}

pub fn drop_shard_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("
        DROP TABLE IF EXISTS thread_labels;
        DROP TABLE IF EXISTS labels;
        DROP TABLE IF EXISTS threads;
        VACUUM;
    ")?;

    Ok(())
}
