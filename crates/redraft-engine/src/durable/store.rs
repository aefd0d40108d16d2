use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use redraft_core::error::{RedraftError, Result};

/// Lifecycle of a durable run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for one run id.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: String,
    pub status: RunStatus,
    /// Input of the first dispatch, as JSON.
    pub input_json: String,
    /// Fingerprint of the graph the run was started with.
    pub graph: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A recorded unit-of-work result.
#[derive(Debug, Clone)]
pub struct UnitRecord {
    pub run_id: String,
    /// Step index the unit ran at.
    pub step: usize,
    pub unit_id: String,
    /// The node's `StateUpdate`, as JSON.
    pub result_json: String,
    /// Attempts it took to produce the result.
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Durable storage for unit results, keyed by run id.
///
/// `record_unit` is idempotent per `(run_id, unit_id)`: the first write wins
/// and later writes return `false`.
pub trait UnitStore: Send + Sync {
    /// Create the run if absent and return its info (existing or new).
    fn begin_run(&self, run_id: &str, input_json: &str, graph: &str) -> Result<RunInfo>;

    fn set_status(&self, run_id: &str, status: RunStatus, error: Option<&str>) -> Result<()>;

    fn run_info(&self, run_id: &str) -> Result<Option<RunInfo>>;

    fn record_unit(
        &self,
        run_id: &str,
        step: usize,
        unit_id: &str,
        result_json: &str,
        attempts: u32,
    ) -> Result<bool>;

    fn fetch_unit(&self, run_id: &str, unit_id: &str) -> Result<Option<UnitRecord>>;

    /// Recorded unit ids for a run, ordered by step.
    fn completed_units(&self, run_id: &str) -> Result<Vec<String>>;
}

/// Unit store backed by SQLite.
pub struct SqliteUnitStore {
    conn: Mutex<Connection>,
}

impl SqliteUnitStore {
    /// Open or create the store database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| RedraftError::Database(format!("Failed to open unit store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS runs (
                 run_id TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 input_json TEXT NOT NULL,
                 graph TEXT NOT NULL,
                 last_error TEXT,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS units (
                 run_id TEXT NOT NULL,
                 step INTEGER NOT NULL,
                 unit_id TEXT NOT NULL,
                 result_json TEXT NOT NULL,
                 attempts INTEGER NOT NULL,
                 recorded_at TEXT NOT NULL,
                 PRIMARY KEY (run_id, unit_id)
             );",
        )
        .map_err(|e| RedraftError::Database(format!("Failed to initialize unit store: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RedraftError::Database(e.to_string()))
    }
}

fn db_err(e: rusqlite::Error) -> RedraftError {
    RedraftError::Database(e.to_string())
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(RunInfo, String)> {
    let status: String = row.get(1)?;
    let created: String = row.get(5)?;
    let updated: String = row.get(6)?;
    Ok((
        RunInfo {
            run_id: row.get(0)?,
            status: RunStatus::Running,
            input_json: row.get(2)?,
            graph: row.get(3)?,
            last_error: row.get(4)?,
            created_at: parse_ts(&created),
            updated_at: parse_ts(&updated),
        },
        status,
    ))
}

impl UnitStore for SqliteUnitStore {
    fn begin_run(&self, run_id: &str, input_json: &str, graph: &str) -> Result<RunInfo> {
        {
            let conn = self.lock()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT OR IGNORE INTO runs (run_id, status, input_json, graph, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?5)",
                params![run_id, RunStatus::Running.as_str(), input_json, graph, now],
            )
            .map_err(db_err)?;
        }
        self.run_info(run_id)?
            .ok_or_else(|| RedraftError::Database(format!("run '{}' vanished after insert", run_id)))
    }

    fn set_status(&self, run_id: &str, status: RunStatus, error: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE runs SET status = ?2, last_error = ?3, updated_at = ?4 WHERE run_id = ?1",
                params![run_id, status.as_str(), error, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(RedraftError::Database(format!("unknown run '{}'", run_id)));
        }
        Ok(())
    }

    fn run_info(&self, run_id: &str) -> Result<Option<RunInfo>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT run_id, status, input_json, graph, last_error, created_at, updated_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                run_from_row,
            )
            .optional()
            .map_err(db_err)?;

        match row {
            None => Ok(None),
            Some((mut info, status)) => {
                info.status = RunStatus::parse(&status).ok_or_else(|| {
                    RedraftError::Database(format!("run '{}' has unknown status '{}'", run_id, status))
                })?;
                Ok(Some(info))
            }
        }
    }

    fn record_unit(
        &self,
        run_id: &str,
        step: usize,
        unit_id: &str,
        result_json: &str,
        attempts: u32,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO units (run_id, step, unit_id, result_json, attempts, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id,
                    step as i64,
                    unit_id,
                    result_json,
                    attempts as i64,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(db_err)?;
        Ok(inserted == 1)
    }

    fn fetch_unit(&self, run_id: &str, unit_id: &str) -> Result<Option<UnitRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT run_id, step, unit_id, result_json, attempts, recorded_at
             FROM units WHERE run_id = ?1 AND unit_id = ?2",
            params![run_id, unit_id],
            |row| {
                let ts: String = row.get(5)?;
                Ok(UnitRecord {
                    run_id: row.get(0)?,
                    step: row.get::<_, i64>(1)? as usize,
                    unit_id: row.get(2)?,
                    result_json: row.get(3)?,
                    attempts: row.get::<_, i64>(4)? as u32,
                    recorded_at: parse_ts(&ts),
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn completed_units(&self, run_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT unit_id FROM units WHERE run_id = ?1 ORDER BY step, unit_id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let units = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?;
        Ok(units)
    }
}

#[derive(Default)]
struct MemoryInner {
    runs: HashMap<String, RunInfo>,
    units: BTreeMap<(String, String), UnitRecord>,
}

/// In-process unit store. Survives runner restarts, not process restarts.
#[derive(Default)]
pub struct MemoryUnitStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|e| RedraftError::Database(e.to_string()))
    }
}

impl UnitStore for MemoryUnitStore {
    fn begin_run(&self, run_id: &str, input_json: &str, graph: &str) -> Result<RunInfo> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let info = inner
            .runs
            .entry(run_id.to_string())
            .or_insert_with(|| RunInfo {
                run_id: run_id.to_string(),
                status: RunStatus::Running,
                input_json: input_json.to_string(),
                graph: graph.to_string(),
                last_error: None,
                created_at: now,
                updated_at: now,
            });
        Ok(info.clone())
    }

    fn set_status(&self, run_id: &str, status: RunStatus, error: Option<&str>) -> Result<()> {
        let mut inner = self.lock()?;
        let info = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| RedraftError::Database(format!("unknown run '{}'", run_id)))?;
        info.status = status;
        info.last_error = error.map(str::to_string);
        info.updated_at = Utc::now();
        Ok(())
    }

    fn run_info(&self, run_id: &str) -> Result<Option<RunInfo>> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    fn record_unit(
        &self,
        run_id: &str,
        step: usize,
        unit_id: &str,
        result_json: &str,
        attempts: u32,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let key = (run_id.to_string(), unit_id.to_string());
        if inner.units.contains_key(&key) {
            return Ok(false);
        }
        inner.units.insert(
            key,
            UnitRecord {
                run_id: run_id.to_string(),
                step,
                unit_id: unit_id.to_string(),
                result_json: result_json.to_string(),
                attempts,
                recorded_at: Utc::now(),
            },
        );
        Ok(true)
    }

    fn fetch_unit(&self, run_id: &str, unit_id: &str) -> Result<Option<UnitRecord>> {
        let key = (run_id.to_string(), unit_id.to_string());
        Ok(self.lock()?.units.get(&key).cloned())
    }

    fn completed_units(&self, run_id: &str) -> Result<Vec<String>> {
        let inner = self.lock()?;
        let mut records: Vec<&UnitRecord> =
            inner.units.values().filter(|u| u.run_id == run_id).collect();
        records.sort_by_key(|u| u.step);
        Ok(records.into_iter().map(|u| u.unit_id.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_store(dir: &tempfile::TempDir) -> SqliteUnitStore {
        SqliteUnitStore::open(&dir.path().join("nested").join("durable.db")).unwrap()
    }

    fn exercise(store: &dyn UnitStore) {
        let info = store.begin_run("run-1", r#"{"task":"t"}"#, "entry=a;a->END").unwrap();
        assert_eq!(info.status, RunStatus::Running);

        // A second begin keeps the first input and graph
        let again = store.begin_run("run-1", r#"{"task":"other"}"#, "entry=b").unwrap();
        assert_eq!(again.input_json, r#"{"task":"t"}"#);
        assert_eq!(again.graph, "entry=a;a->END");

        assert!(store.record_unit("run-1", 1, "001-research_plan", "{}", 1).unwrap());
        assert!(store.record_unit("run-1", 0, "000-planner", r#"{"plan":"p"}"#, 2).unwrap());
        assert!(!store.record_unit("run-1", 0, "000-planner", r#"{"plan":"late"}"#, 1).unwrap());

        let unit = store.fetch_unit("run-1", "000-planner").unwrap().unwrap();
        assert_eq!(unit.result_json, r#"{"plan":"p"}"#);
        assert_eq!(unit.attempts, 2);
        assert_eq!(unit.step, 0);
        assert!(store.fetch_unit("run-1", "002-generate").unwrap().is_none());
        assert!(store.fetch_unit("run-2", "000-planner").unwrap().is_none());

        assert_eq!(
            store.completed_units("run-1").unwrap(),
            vec!["000-planner", "001-research_plan"]
        );
        assert!(store.completed_units("run-2").unwrap().is_empty());

        store
            .set_status("run-1", RunStatus::Failed, Some("generate exhausted retries"))
            .unwrap();
        let info = store.run_info("run-1").unwrap().unwrap();
        assert_eq!(info.status, RunStatus::Failed);
        assert_eq!(info.last_error.as_deref(), Some("generate exhausted retries"));

        assert!(store.run_info("missing").unwrap().is_none());
        assert!(store.set_status("missing", RunStatus::Completed, None).is_err());
    }

    #[test]
    fn test_sqlite_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&sqlite_store(&dir));
    }

    #[test]
    fn test_memory_store_contract() {
        exercise(&MemoryUnitStore::new());
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = sqlite_store(&dir);
            store.begin_run("run-1", "{}", "g").unwrap();
            store.record_unit("run-1", 0, "000-planner", "{}", 1).unwrap();
        }
        let store = sqlite_store(&dir);
        assert_eq!(store.completed_units("run-1").unwrap(), vec!["000-planner"]);
        assert_eq!(
            store.run_info("run-1").unwrap().unwrap().status,
            RunStatus::Running
        );
    }

    fn exercise_long_run_order(store: &dyn UnitStore) {
        store.begin_run("long", "{}", "g").unwrap();
        for step in [1000, 999, 1001, 10, 2] {
            let id = format!("{:03}-generate", step);
            store.record_unit("long", step, &id, "{}", 1).unwrap();
        }
        assert_eq!(
            store.completed_units("long").unwrap(),
            vec!["002-generate", "010-generate", "999-generate", "1000-generate", "1001-generate"]
        );
    }

    #[test]
    fn test_units_past_step_999_stay_in_step_order() {
        let dir = tempfile::tempdir().unwrap();
        exercise_long_run_order(&sqlite_store(&dir));
        exercise_long_run_order(&MemoryUnitStore::new());
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("paused"), None);
    }
}
