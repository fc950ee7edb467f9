//! SQLite-based persistence for production use.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{SchedError, SchedResult};
use crate::persistence::RunStore;
use crate::registry::{CommittedResult, RunRecord};

/// SQLite-based run store.
///
/// Provides persistent storage with ACID guarantees. Recommended when
/// many workers commit into the same state directory.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new(path: impl AsRef<Path>) -> SchedResult<Self> {
        let conn = Connection::open(path)?;
        // Workers in other processes may hold the write lock briefly.
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema_sync()?;
        Ok(store)
    }

    /// Create a new in-memory SQLite store.
    pub fn in_memory() -> SchedResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema_sync()?;
        Ok(store)
    }

    fn lock(&self) -> SchedResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SchedError::DatabaseError(e.to_string()))
    }

    fn init_schema_sync(&self) -> SchedResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                name TEXT PRIMARY KEY,
                hidden INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS results (
                run TEXT NOT NULL,
                item TEXT NOT NULL,
                confidence REAL NOT NULL,
                data TEXT NOT NULL,
                committed_at TEXT NOT NULL,
                PRIMARY KEY (run, item)
            );

            CREATE INDEX IF NOT EXISTS idx_results_item ON results(item);
            "#,
        )?;
        Ok(())
    }

    fn query_records<T: serde::de::DeserializeOwned>(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> SchedResult<Vec<T>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for data in rows {
            records.push(serde_json::from_str(&data?)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn load_run(&self, name: &str) -> SchedResult<Option<RunRecord>> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM runs WHERE name = ?1",
                rusqlite::params![name],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn create_run(&self, record: &RunRecord) -> SchedResult<()> {
        let conn = self.lock()?;
        let data = serde_json::to_string(record)?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO runs (name, hidden, data, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            rusqlite::params![
                record.name,
                record.hidden,
                data,
                record.created_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    async fn set_hidden(&self, name: &str, hidden: bool) -> SchedResult<()> {
        // Load, update, save
        let mut record = self
            .load_run(name)
            .await?
            .ok_or_else(|| SchedError::PersistenceError(format!("Run '{name}' not found")))?;
        record.hidden = hidden;
        self.create_run(&record).await
    }

    async fn list_runs(&self) -> SchedResult<Vec<RunRecord>> {
        self.query_records("SELECT data FROM runs ORDER BY created_at ASC", rusqlite::params![])
    }

    async fn save_result(&self, committed: &CommittedResult) -> SchedResult<()> {
        let conn = self.lock()?;
        let data = serde_json::to_string(committed)?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO results (run, item, confidence, data, committed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            rusqlite::params![
                committed.run,
                committed.result.item,
                committed.result.confidence,
                data,
                committed.committed_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    async fn load_results(&self, run: &str) -> SchedResult<Vec<CommittedResult>> {
        self.query_records(
            "SELECT data FROM results WHERE run = ?1 ORDER BY committed_at ASC",
            rusqlite::params![run],
        )
    }

    async fn best_result(&self, item: &str) -> SchedResult<Option<CommittedResult>> {
        let mut best: Vec<CommittedResult> = self.query_records(
            r#"
            SELECT data FROM results WHERE item = ?1
            ORDER BY confidence DESC, committed_at ASC
            LIMIT 1
            "#,
            rusqlite::params![item],
        )?;
        Ok(best.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ItemResult, ParamValue, ParameterSet};

    fn committed(run: &str, item: &str, confidence: f64) -> CommittedResult {
        CommittedResult {
            run: run.to_string(),
            result: ItemResult::new(item, confidence),
            committed_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sqlite_store_basic() {
        let store = SqliteStore::in_memory().unwrap();

        let mut parameters = ParameterSet::new();
        parameters.insert("cs".to_string(), ParamValue::Float(2.7));
        parameters.insert("box".to_string(), ParamValue::Int(512));
        let record = RunRecord::new("ctffind4run1", parameters, "/data/ctf/ctffind4run1");

        // Save
        store.create_run(&record).await.unwrap();

        // Load
        let loaded = store.load_run("ctffind4run1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.load_run("other").await.unwrap().is_none());

        // Hide
        store.set_hidden("ctffind4run1", true).await.unwrap();
        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].hidden);
    }

    #[tokio::test]
    async fn test_sqlite_store_results() {
        let store = SqliteStore::in_memory().unwrap();

        store.save_result(&committed("run1", "img1", 0.2)).await.unwrap();
        store.save_result(&committed("run2", "img1", 0.6)).await.unwrap();
        store.save_result(&committed("run1", "img2", 0.9)).await.unwrap();
        store.save_result(&committed("run1", "img1", 0.3)).await.unwrap();

        let results = store.load_results("run1").await.unwrap();
        assert_eq!(results.len(), 2);

        let best = store.best_result("img1").await.unwrap().unwrap();
        assert_eq!(best.run, "run2");
        assert!(store.best_result("img3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        {
            let store = SqliteStore::new(&path).unwrap();
            store.save_result(&committed("run1", "img1", 0.5)).await.unwrap();
        }
        let store = SqliteStore::new(&path).unwrap();
        assert_eq!(store.load_results("run1").await.unwrap().len(), 1);
    }
}
