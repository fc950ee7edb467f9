//! Persistence layer for run records and committed results.

mod json_store;
mod sqlite_store;

pub use json_store::JsonStore;
pub use sqlite_store::SqliteStore;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};
use crate::registry::{CommittedResult, RunRecord};

/// Trait for persistent run storage.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Load a run record by name.
    async fn load_run(&self, name: &str) -> SchedResult<Option<RunRecord>>;

    /// Write a run record, replacing any record of the same name.
    async fn create_run(&self, record: &RunRecord) -> SchedResult<()>;

    /// Hide or unhide a run.
    async fn set_hidden(&self, name: &str, hidden: bool) -> SchedResult<()>;

    /// All run records, oldest first.
    async fn list_runs(&self) -> SchedResult<Vec<RunRecord>>;

    /// Store a result; a later result for the same run and item replaces it.
    async fn save_result(&self, committed: &CommittedResult) -> SchedResult<()>;

    /// All results of one run.
    async fn load_results(&self, run: &str) -> SchedResult<Vec<CommittedResult>>;

    /// Highest-confidence result for an item across all runs.
    async fn best_result(&self, item: &str) -> SchedResult<Option<CommittedResult>>;
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// One JSON file per record under the state directory.
    #[default]
    Json,
    /// A single `runs.db` SQLite database in the state directory.
    Sqlite,
}

impl StoreKind {
    /// Open the store rooted at `state_dir`.
    pub async fn open(&self, state_dir: &Path) -> SchedResult<Arc<dyn RunStore>> {
        Ok(match self {
            StoreKind::Json => Arc::new(JsonStore::new(state_dir).await?),
            StoreKind::Sqlite => {
                tokio::fs::create_dir_all(state_dir).await?;
                Arc::new(SqliteStore::new(state_dir.join("runs.db"))?)
            }
        })
    }
}

impl FromStr for StoreKind {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(StoreKind::Json),
            "sqlite" => Ok(StoreKind::Sqlite),
            other => Err(SchedError::ConfigError(format!(
                "Unknown store '{other}': expected json or sqlite"
            ))),
        }
    }
}

/// Pick the higher-confidence result, keeping `current` on ties.
pub(crate) fn better(
    current: Option<CommittedResult>,
    candidate: CommittedResult,
) -> Option<CommittedResult> {
    match current {
        Some(best) if best.result.confidence >= candidate.result.confidence => Some(best),
        _ => Some(candidate),
    }
}
