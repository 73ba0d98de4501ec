//! The durable local table of tasks and telescope identity.
//!
//! Backed by a single SQLite file in WAL mode, so the downlink worker (the
//! only writer) and the capture scheduler (a reader) can each hold their own
//! connection without tripping over each other. Every mutation runs inside
//! an immediate transaction, which gives us single-writer serialization
//! across threads and processes; readers that need a consistent view of both
//! tables use [`TaskStore::snapshot`].

use crate::model::{Task, Telescope};

use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const LAST_EVENT_ID_KEY: &str = "last_event_id";

const SCHEMA: &str = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = true;
    PRAGMA temp_store = memory;

    CREATE TABLE IF NOT EXISTS telescope (
        id INTEGER NOT NULL,
        name TEXT NOT NULL,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        elevation REAL NOT NULL
    );

    CREATE TABLE IF NOT EXISTS task (
        id TEXT PRIMARY KEY,
        start_at INTEGER NOT NULL,
        end_at INTEGER NOT NULL,
        frequency INTEGER NOT NULL,
        sample_rate INTEGER NOT NULL,
        sample_size INTEGER NOT NULL,
        ppm INTEGER NOT NULL,
        gain INTEGER NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS task_window ON task (start_at, end_at);

    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

/// Errors raised by the [`TaskStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database refused a statement.
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    /// The database directory could not be created.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A task broke one of its own invariants and was refused.
    #[error("invalid task `{id}`: {reason}")]
    InvalidTask {
        /// The refused task.
        id: String,
        /// The invariant it broke.
        reason: &'static str,
    },

    /// A row could not be turned back into a [`Task`].
    #[error("corrupt row in `{table}`: {reason}")]
    Corrupt {
        /// The table the row came from.
        table: &'static str,
        /// What was wrong with it.
        reason: &'static str,
    },
}

/// One connection to the task database.
#[derive(Debug)]
pub struct TaskStore {
    path: PathBuf,
    conn: Connection,
}

impl TaskStore {
    /// Opens (creating if needed) the database at `path` and brings the
    /// schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        debug!("[Store] Opened {}", path.display());
        Ok(Self { path, conn })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clears both tables and repopulates them in one transaction. Either the
    /// whole new configuration becomes visible or none of it does.
    pub fn replace_all(&mut self, telescope: &Telescope, tasks: &[Task]) -> Result<(), StoreError> {
        for task in tasks {
            check(task)?;
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM task", [])?;
        tx.execute("DELETE FROM telescope", [])?;
        tx.execute(
            "INSERT INTO telescope (id, name, latitude, longitude, elevation)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                telescope.id,
                telescope.name,
                telescope.latitude,
                telescope.longitude,
                telescope.elevation,
            ],
        )?;
        for task in tasks {
            upsert(&tx, task)?;
        }
        tx.commit()?;
        debug!("[Store] Replaced configuration with {} task(s).", tasks.len());
        Ok(())
    }

    /// Adds a task. A task whose id is already present is overwritten, so a
    /// replayed `add-task` is harmless.
    pub fn insert_task(&mut self, task: &Task) -> Result<(), StoreError> {
        check(task)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        upsert(&tx, task)?;
        tx.commit()?;
        Ok(())
    }

    /// Rewrites the task with the same id. Returns `false` when there was no
    /// such task.
    pub fn update_task(&mut self, task: &Task) -> Result<bool, StoreError> {
        check(task)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE task
             SET start_at = ?1, end_at = ?2, frequency = ?3, sample_rate = ?4,
                 sample_size = ?5, ppm = ?6, gain = ?7
             WHERE id = ?8",
            params![
                micros(&task.start_at),
                micros(&task.end_at),
                task.frequency as i64,
                task.sample_rate as i64,
                task.sample_size as i64,
                task.ppm,
                task.gain,
                task.id,
            ],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Removes the task with `id`. Returns `false` when there was no such task.
    pub fn delete_task(&mut self, id: &str) -> Result<bool, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute("DELETE FROM task WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Every task whose window covers `now`, inclusive at both ends.
    pub fn active_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let now = micros(&now);
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, start_at, end_at, frequency, sample_rate, sample_size, ppm, gain
             FROM task
             WHERE start_at <= ?1 AND ?1 <= end_at",
        )?;
        let rows = stmt.query_map(params![now], read_task)?;
        let tasks = rows
            .map(|row| row?)
            .collect::<Result<Vec<Task>, StoreError>>();
        tasks
    }

    /// The stored telescope identity, if a configuration has been loaded.
    pub fn telescope(&self) -> Result<Option<Telescope>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, latitude, longitude, elevation FROM telescope LIMIT 1",
                [],
                read_telescope,
            )
            .optional()?)
    }

    /// Reads the telescope and all tasks inside one read transaction, so the
    /// pair always comes from the same configuration.
    pub fn snapshot(&mut self) -> Result<(Option<Telescope>, Vec<Task>), StoreError> {
        let tx = self.conn.transaction()?;
        let telescope = tx
            .query_row(
                "SELECT id, name, latitude, longitude, elevation FROM telescope LIMIT 1",
                [],
                read_telescope,
            )
            .optional()?;
        let tasks = {
            let mut stmt = tx.prepare(
                "SELECT id, start_at, end_at, frequency, sample_rate, sample_size, ppm, gain
                 FROM task ORDER BY id",
            )?;
            let rows = stmt.query_map([], read_task)?;
            rows.map(|row| row?).collect::<Result<Vec<Task>, StoreError>>()?
        };
        tx.commit()?;
        Ok((telescope, tasks))
    }

    /// The event-stream cursor saved by a previous session.
    pub fn last_event_id(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![LAST_EVENT_ID_KEY],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Persists the event-stream cursor.
    pub fn set_last_event_id(&mut self, id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LAST_EVENT_ID_KEY, id],
        )?;
        Ok(())
    }
}

fn check(task: &Task) -> Result<(), StoreError> {
    task.validate().map_err(|reason| StoreError::InvalidTask {
        id: task.id.clone(),
        reason,
    })
}

fn upsert(conn: &Connection, task: &Task) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO task (id, start_at, end_at, frequency, sample_rate, sample_size, ppm, gain)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
             start_at = excluded.start_at,
             end_at = excluded.end_at,
             frequency = excluded.frequency,
             sample_rate = excluded.sample_rate,
             sample_size = excluded.sample_size,
             ppm = excluded.ppm,
             gain = excluded.gain",
        params![
            task.id,
            micros(&task.start_at),
            micros(&task.end_at),
            task.frequency as i64,
            task.sample_rate as i64,
            task.sample_size as i64,
            task.ppm,
            task.gain,
        ],
    )?;
    Ok(())
}

fn micros(at: &DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

// The inner `Result` carries conversion failures that rusqlite has no
// variant for.
fn read_task(row: &Row<'_>) -> rusqlite::Result<Result<Task, StoreError>> {
    let id: String = row.get(0)?;
    let start_at: i64 = row.get(1)?;
    let end_at: i64 = row.get(2)?;
    let frequency: i64 = row.get(3)?;
    let sample_rate: i64 = row.get(4)?;
    let sample_size: i64 = row.get(5)?;
    let ppm: i32 = row.get(6)?;
    let gain: i64 = row.get(7)?;

    let corrupt = |reason| StoreError::Corrupt {
        table: "task",
        reason,
    };
    let task = (|| -> Result<Task, StoreError> {
        Ok(Task {
            id,
            start_at: DateTime::from_timestamp_micros(start_at).ok_or(corrupt("start_at"))?,
            end_at: DateTime::from_timestamp_micros(end_at).ok_or(corrupt("end_at"))?,
            frequency: u64::try_from(frequency).map_err(|_| corrupt("frequency"))?,
            sample_rate: u64::try_from(sample_rate).map_err(|_| corrupt("sample_rate"))?,
            sample_size: u64::try_from(sample_size).map_err(|_| corrupt("sample_size"))?,
            ppm,
            gain: u8::try_from(gain).map_err(|_| corrupt("gain"))?,
        })
    })();
    Ok(task)
}

fn read_telescope(row: &Row<'_>) -> rusqlite::Result<Telescope> {
    Ok(Telescope {
        id: row.get(0)?,
        name: row.get(1)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        elevation: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn task(id: &str, start: i64, end: i64) -> Task {
        Task {
            id: id.to_owned(),
            start_at: at(start),
            end_at: at(end),
            frequency: 100_000_000,
            sample_rate: 2_048_000,
            sample_size: 1024,
            ppm: 0,
            gain: 10,
        }
    }

    fn telescope(id: i64) -> Telescope {
        Telescope {
            id,
            name: format!("scope-{id}"),
            latitude: 42.0,
            longitude: -71.0,
            elevation: 12.5,
        }
    }

    fn open(dir: &tempfile::TempDir) -> TaskStore {
        TaskStore::open(dir.path().join("db.sqlite")).unwrap()
    }

    #[test]
    fn active_tasks_are_inclusive_at_both_ends() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        store
            .replace_all(
                &telescope(1),
                &[task("early", 0, 100), task("late", 100, 200), task("far", 500, 600)],
            )
            .unwrap();

        let ids = |now| {
            let mut ids: Vec<String> = store
                .active_tasks(at(now))
                .unwrap()
                .into_iter()
                .map(|t| t.id)
                .collect();
            ids.sort();
            ids
        };

        assert_eq!(ids(0), vec!["early"]);
        assert_eq!(ids(100), vec!["early", "late"]);
        assert_eq!(ids(200), vec!["late"]);
        assert!(ids(300).is_empty());
        assert_eq!(ids(600), vec!["far"]);
    }

    #[test]
    fn single_row_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);

        let mut a = task("A", 0, 100);
        store.insert_task(&a).unwrap();
        a.gain = 40;
        assert!(store.update_task(&a).unwrap());
        assert_eq!(store.active_tasks(at(50)).unwrap(), vec![a.clone()]);

        assert!(!store.update_task(&task("missing", 0, 1)).unwrap());
        assert!(store.delete_task("A").unwrap());
        assert!(!store.delete_task("A").unwrap());
        assert!(store.active_tasks(at(50)).unwrap().is_empty());
    }

    #[test]
    fn insert_replaces_existing_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        store.insert_task(&task("A", 0, 100)).unwrap();
        store.insert_task(&task("A", 0, 300)).unwrap();

        let (_, tasks) = store.snapshot().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].end_at, at(300));
    }

    #[test]
    fn invalid_tasks_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(&dir);
        let err = store.insert_task(&task("bad", 100, 0)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTask { .. }));

        store.replace_all(&telescope(1), &[task("A", 0, 1)]).unwrap();
        assert!(store
            .replace_all(&telescope(2), &[task("B", 0, 1), task("bad", 5, 1)])
            .is_err());
        // The failed replace left the previous configuration alone.
        let (scope, tasks) = store.snapshot().unwrap();
        assert_eq!(scope, Some(telescope(1)));
        assert_eq!(tasks, vec![task("A", 0, 1)]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open(&dir);
            store.replace_all(&telescope(7), &[task("A", 0, 100)]).unwrap();
            store.set_last_event_id("42").unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.telescope().unwrap(), Some(telescope(7)));
        assert_eq!(store.active_tasks(at(1)).unwrap().len(), 1);
        assert_eq!(store.last_event_id().unwrap().as_deref(), Some("42"));
    }

    /// A reader on its own connection must never see the telescope of one
    /// configuration next to the tasks of another.
    #[test]
    fn replace_all_is_never_observed_half_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let mut writer = TaskStore::open(&path).unwrap();
        writer.replace_all(&telescope(0), &[task("0-a", 0, 1)]).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader_done = done.clone();
        let reader_path = path.clone();
        let reader = thread::spawn(move || {
            let mut reader = TaskStore::open(reader_path).unwrap();
            let mut checked = 0;
            loop {
                let finished = reader_done.load(Ordering::SeqCst);
                let (scope, tasks) = reader.snapshot().unwrap();
                let scope = scope.expect("a configuration is always present");
                assert_eq!(tasks.len(), scope.id as usize % 3 + 1);
                for t in &tasks {
                    assert!(t.id.starts_with(&format!("{}-", scope.id)));
                }
                checked += 1;
                if finished {
                    break;
                }
            }
            checked
        });

        for generation in 1..60 {
            let tasks: Vec<Task> = (0..(generation % 3 + 1))
                .map(|i| task(&format!("{generation}-{i}"), 0, 1))
                .collect();
            writer.replace_all(&telescope(generation), &tasks).unwrap();
        }
        done.store(true, Ordering::SeqCst);
        assert!(reader.join().unwrap() > 0);
    }
}
