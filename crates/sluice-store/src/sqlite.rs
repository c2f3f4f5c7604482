use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use sluice_core::checkpoint::CheckpointMap;
use sluice_core::error::{Result, SluiceError};
use sluice_core::traits::{CheckpointStore, RunStore};
use sluice_core::types::{DeadLetter, RunId, RunRecord, RunStatus};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        pipeline_code TEXT NOT NULL,
        status TEXT NOT NULL,
        record TEXT NOT NULL,
        started_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, started_at);

    CREATE TABLE IF NOT EXISTS checkpoints (
        run_id TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (run_id, key)
    );

    CREATE TABLE IF NOT EXISTS dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        step_key TEXT NOT NULL,
        message TEXT NOT NULL,
        record TEXT NOT NULL,
        stack TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_dead_letters_run ON dead_letters(run_id, id);";

fn db_err(e: rusqlite::Error) -> SluiceError {
    SluiceError::Database(e.to_string())
}

/// Fixed-width timestamps so text ordering matches time ordering.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite-backed run, checkpoint and dead-letter store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SluiceError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointStore for SqliteStore {
    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<CheckpointMap>> {
        let run_id = run_id.0.clone();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| SluiceError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare("SELECT key, value FROM checkpoints WHERE run_id = ?1")
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    let key: String = row.get(0)?;
                    let value: String = row.get(1)?;
                    Ok((key, value))
                })
                .map_err(db_err)?;

            let mut map = CheckpointMap::new();
            for row in rows {
                let (key, value) = row.map_err(db_err)?;
                map.insert(key, serde_json::from_str::<Value>(&value)?);
            }
            Ok(map)
        })
    }

    fn save(&self, run_id: &RunId, entries: &CheckpointMap) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.0.clone();
        let rows: Result<Vec<(String, String)>> = entries
            .iter()
            .map(|(k, v)| Ok((k.clone(), serde_json::to_string(v)?)))
            .collect();

        Box::pin(async move {
            let rows = rows?;
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| SluiceError::Database(e.to_string()))?;

            // The map is the whole checkpoint: keys absent from it are gone.
            let tx = conn.transaction().map_err(db_err)?;
            tx.execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id])
                .map_err(db_err)?;
            for (key, value) in &rows {
                tx.execute(
                    "INSERT INTO checkpoints (run_id, key, value) VALUES (?1, ?2, ?3)",
                    params![run_id, key, value],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;

            debug!(run_id = %run_id, entries = rows.len(), "Checkpoint saved");
            Ok(())
        })
    }
}

fn decode_run(json: &str) -> Result<RunRecord> {
    Ok(serde_json::from_str(json)?)
}

impl RunStore for SqliteStore {
    fn save_run(&self, run: &RunRecord) -> BoxFuture<'_, Result<()>> {
        let id = run.id.0.clone();
        let pipeline = run.pipeline_code.clone();
        let status = run.status.as_str();
        let started = timestamp(&run.started_at);
        let updated = timestamp(&run.updated_at);
        let record = serde_json::to_string(run);

        Box::pin(async move {
            let record = record?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| SluiceError::Database(e.to_string()))?;

            conn.execute(
                "INSERT INTO runs (id, pipeline_code, status, record, started_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    record = excluded.record,
                    updated_at = excluded.updated_at",
                params![id, pipeline, status, record, started, updated],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        let run_id = run_id.0.clone();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| SluiceError::Database(e.to_string()))?;

            let json: Option<String> = conn
                .query_row(
                    "SELECT record FROM runs WHERE id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            json.as_deref().map(decode_run).transpose()
        })
    }

    fn list_runs(&self, status: Option<RunStatus>) -> BoxFuture<'_, Result<Vec<RunRecord>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| SluiceError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT record FROM runs
                     WHERE ?1 IS NULL OR status = ?1
                     ORDER BY started_at DESC, rowid DESC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![status.map(|s| s.as_str())], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(db_err)?;

            let mut runs = Vec::new();
            for row in rows {
                runs.push(decode_run(&row.map_err(db_err)?)?);
            }
            Ok(runs)
        })
    }

    fn append_dead_letters(&self, letters: &[DeadLetter]) -> BoxFuture<'_, Result<usize>> {
        let rows: Result<Vec<_>> = letters
            .iter()
            .map(|l| {
                Ok((
                    l.run_id.0.clone(),
                    l.step_key.clone(),
                    l.message.clone(),
                    serde_json::to_string(&l.record)?,
                    l.stack.clone(),
                    timestamp(&l.created_at),
                ))
            })
            .collect();

        Box::pin(async move {
            let rows = rows?;
            if rows.is_empty() {
                return Ok(0);
            }
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| SluiceError::Database(e.to_string()))?;

            let tx = conn.transaction().map_err(db_err)?;
            for (run_id, step_key, message, record, stack, created_at) in &rows {
                tx.execute(
                    "INSERT INTO dead_letters (run_id, step_key, message, record, stack, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![run_id, step_key, message, record, stack, created_at],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(rows.len())
        })
    }

    fn dead_letters(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<DeadLetter>>> {
        let run_id = run_id.0.clone();

        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| SluiceError::Database(e.to_string()))?;

            let mut stmt = conn
                .prepare(
                    "SELECT step_key, message, record, stack, created_at FROM dead_letters
                     WHERE run_id = ?1
                     ORDER BY id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    let step_key: String = row.get(0)?;
                    let message: String = row.get(1)?;
                    let record: String = row.get(2)?;
                    let stack: Option<String> = row.get(3)?;
                    let created_at: String = row.get(4)?;
                    Ok((step_key, message, record, stack, created_at))
                })
                .map_err(db_err)?;

            let mut letters = Vec::new();
            for row in rows {
                let (step_key, message, record, stack, created_at) = row.map_err(db_err)?;
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                letters.push(DeadLetter {
                    run_id: RunId(run_id.clone()),
                    step_key,
                    message,
                    record: serde_json::from_str(&record)?,
                    stack,
                    created_at,
                });
            }
            Ok(letters)
        })
    }
}
