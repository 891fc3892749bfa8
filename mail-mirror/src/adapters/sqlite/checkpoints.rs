//! Durable bookkeeping for coordinator runs
//!
//! A run row carries the coordinator's current state as JSON. Each completed
//! step stores its output under `(run_id, step_name)`, so a re-driven run
//! replays finished steps from here instead of executing them again.

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::DbPool;
use crate::error::Result;

/// Register a run. Existing runs keep their state.
pub fn start_run<S: Serialize>(
    pool: &DbPool,
    run_id: &str,
    mailbox_id: &str,
    folder: &str,
    initial_state: &S,
) -> Result<bool> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp_millis();
    let state = serde_json::to_string(initial_state)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO workflow_runs (run_id, mailbox_id, folder, state, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![run_id, mailbox_id, folder, state, now],
    )?;
    Ok(inserted > 0)
}

pub fn set_run_state<S: Serialize>(pool: &DbPool, run_id: &str, state: &S) -> Result<()> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp_millis();
    let state = serde_json::to_string(state)?;
    conn.execute(
        "UPDATE workflow_runs SET state = ?1, updated_at = ?2 WHERE run_id = ?3",
        params![state, now, run_id],
    )?;
    Ok(())
}

pub fn get_run_state<S: DeserializeOwned>(pool: &DbPool, run_id: &str) -> Result<Option<S>> {
    let conn = pool.get()?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM workflow_runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Output of a completed step, if the step already ran
pub fn load_step<T: DeserializeOwned>(
    pool: &DbPool,
    run_id: &str,
    step_name: &str,
) -> Result<Option<T>> {
    let conn = pool.get()?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT output FROM workflow_steps WHERE run_id = ?1 AND step_name = ?2",
            params![run_id, step_name],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub fn save_step<T: Serialize>(
    pool: &DbPool,
    run_id: &str,
    step_name: &str,
    output: &T,
) -> Result<()> {
    let conn = pool.get()?;
    let now = chrono::Utc::now().timestamp_millis();
    let output = serde_json::to_string(output)?;
    conn.execute(
        "INSERT OR REPLACE INTO workflow_steps (run_id, step_name, output, completed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![run_id, step_name, output, now],
    )?;
    Ok(())
}

pub fn completed_steps(pool: &DbPool, run_id: &str) -> Result<Vec<String>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT step_name FROM workflow_steps WHERE run_id = ?1 ORDER BY completed_at, step_name",
    )?;
    let names = stmt
        .query_map(params![run_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

/// Forget every run of a mailbox along with its steps. Returns the number
/// of runs removed.
pub fn clear_mailbox_runs(pool: &DbPool, mailbox_id: &str) -> Result<usize> {
    let conn = pool.get()?;
    conn.execute(
        "DELETE FROM workflow_steps
         WHERE run_id IN (SELECT run_id FROM workflow_runs WHERE mailbox_id = ?1)",
        params![mailbox_id],
    )?;
    let runs = conn.execute(
        "DELETE FROM workflow_runs WHERE mailbox_id = ?1",
        params![mailbox_id],
    )?;
    Ok(runs)
}
