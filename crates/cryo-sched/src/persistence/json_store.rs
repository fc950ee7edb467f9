//! JSON file-based persistence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

use crate::error::{SchedError, SchedResult};
use crate::job::file_stem;
use crate::persistence::{RunStore, better};
use crate::registry::{CommittedResult, RunRecord};

/// JSON file-based run store.
///
/// Layout under the base directory:
///
/// ```text
/// runs/<run>.json
/// results/<run>/<item>.json
/// ```
///
/// Names are encoded with [`file_stem`], so every run and item has its
/// own file. Records read back are checked against the name asked for.
///
/// Nothing is cached: several worker processes may share the directory,
/// and each write goes through a temporary file and a rename so readers
/// never see a partial record.
pub struct JsonStore {
    /// Base directory for storage.
    base_dir: PathBuf,
}

impl JsonStore {
    /// Create a new JSON store at the given path.
    pub async fn new(base_dir: impl AsRef<Path>) -> SchedResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();

        fs::create_dir_all(base_dir.join("runs")).await?;
        fs::create_dir_all(base_dir.join("results")).await?;

        Ok(Self { base_dir })
    }

    /// Create a new JSON store in a temporary directory.
    pub async fn temp() -> SchedResult<Self> {
        let temp_dir = std::env::temp_dir().join(format!("cryo-sched-{}", uuid::Uuid::new_v4()));
        Self::new(temp_dir).await
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn run_path(&self, name: &str) -> PathBuf {
        self.base_dir
            .join("runs")
            .join(format!("{}.json", file_stem(name)))
    }

    fn results_dir(&self, run: &str) -> PathBuf {
        self.base_dir.join("results").join(file_stem(run))
    }

    fn result_path(&self, run: &str, item: &str) -> PathBuf {
        self.results_dir(run)
            .join(format!("{}.json", file_stem(item)))
    }
}

/// Write `value` to `path` through a sibling temporary file.
async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> SchedResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    let parent = path
        .parent()
        .ok_or_else(|| SchedError::PersistenceError(format!("No parent for {}", path.display())))?;
    fs::create_dir_all(parent).await?;

    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, json).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(SchedError::IoError(e));
    }
    Ok(())
}

async fn read_optional<T: DeserializeOwned>(path: &Path) -> SchedResult<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SchedError::IoError(e)),
    }
}

/// Every `*.json` record directly inside `dir`; unreadable files are skipped.
async fn read_all<T: DeserializeOwned>(dir: &Path) -> SchedResult<Vec<T>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SchedError::IoError(e)),
    };

    let mut records = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<T>(&content) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!("Failed to parse record {:?}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read record {:?}: {}", path, e);
                }
            }
        }
    }
    Ok(records)
}

#[async_trait]
impl RunStore for JsonStore {
    async fn load_run(&self, name: &str) -> SchedResult<Option<RunRecord>> {
        let path = self.run_path(name);
        match read_optional::<RunRecord>(&path).await? {
            Some(record) if record.name != name => Err(SchedError::PersistenceError(format!(
                "{} holds run '{}', expected '{}'",
                path.display(),
                record.name,
                name
            ))),
            record => Ok(record),
        }
    }

    async fn create_run(&self, record: &RunRecord) -> SchedResult<()> {
        write_atomic(&self.run_path(&record.name), record).await
    }

    async fn set_hidden(&self, name: &str, hidden: bool) -> SchedResult<()> {
        let mut record = self
            .load_run(name)
            .await?
            .ok_or_else(|| SchedError::PersistenceError(format!("Run '{name}' not found")))?;
        record.hidden = hidden;
        write_atomic(&self.run_path(name), &record).await
    }

    async fn list_runs(&self) -> SchedResult<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = read_all(&self.base_dir.join("runs")).await?;
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn save_result(&self, committed: &CommittedResult) -> SchedResult<()> {
        let path = self.result_path(&committed.run, &committed.result.item);
        write_atomic(&path, committed).await
    }

    async fn load_results(&self, run: &str) -> SchedResult<Vec<CommittedResult>> {
        let mut results: Vec<CommittedResult> = read_all(&self.results_dir(run)).await?;
        results.retain(|committed| {
            let matches = committed.run == run;
            if !matches {
                tracing::warn!(
                    "Ignoring result for run '{}' found under run '{}'",
                    committed.run,
                    run
                );
            }
            matches
        });
        results.sort_by(|a, b| a.committed_at.cmp(&b.committed_at));
        Ok(results)
    }

    async fn best_result(&self, item: &str) -> SchedResult<Option<CommittedResult>> {
        let file_name = format!("{}.json", file_stem(item));
        let mut best = None;

        let mut runs = match fs::read_dir(self.base_dir.join("results")).await {
            Ok(runs) => runs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SchedError::IoError(e)),
        };
        while let Some(run_dir) = runs.next_entry().await? {
            let path = run_dir.path().join(&file_name);
            if let Some(committed) = read_optional::<CommittedResult>(&path).await? {
                if committed.result.item == item {
                    best = better(best, committed);
                } else {
                    tracing::warn!(
                        "{:?} holds item '{}', expected '{}'",
                        path,
                        committed.result.item,
                        item
                    );
                }
            }
        }

        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ItemResult, ParameterSet};

    fn committed(run: &str, item: &str, confidence: f64) -> CommittedResult {
        CommittedResult {
            run: run.to_string(),
            result: ItemResult::new(item, confidence).with_field("defocus1", 21500.0),
            committed_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_json_store_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path()).await.unwrap();

        assert!(store.load_run("run1").await.unwrap().is_none());

        let record = RunRecord::new("run1", ParameterSet::new(), dir.path().join("run1"));
        store.create_run(&record).await.unwrap();
        assert_eq!(store.load_run("run1").await.unwrap(), Some(record.clone()));

        store.set_hidden("run1", true).await.unwrap();
        assert!(store.load_run("run1").await.unwrap().unwrap().hidden);
        assert!(store.set_hidden("nope", true).await.is_err());

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].name, "run1");

        // No temporary files are left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("runs"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_json_store_results() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path()).await.unwrap();

        store.save_result(&committed("run1", "img1", 0.2)).await.unwrap();
        store.save_result(&committed("run1", "img2", 0.5)).await.unwrap();
        store.save_result(&committed("run2", "img1", 0.7)).await.unwrap();
        // Re-committing an item replaces its result within the run.
        store.save_result(&committed("run1", "img1", 0.3)).await.unwrap();

        let results = store.load_results("run1").await.unwrap();
        assert_eq!(results.len(), 2);

        let best = store.best_result("img1").await.unwrap().unwrap();
        assert_eq!(best.run, "run2");
        assert_eq!(best.result.confidence, 0.7);
        assert_eq!(best.result.fields["defocus1"], 21500.0);

        assert!(store.best_result("img9").await.unwrap().is_none());
        assert!(store.load_results("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_keeps_similar_names_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path()).await.unwrap();

        store.save_result(&committed("run1", "grid1/mic 7", 0.4)).await.unwrap();
        store.save_result(&committed("run1", "grid1_mic_7", 0.1)).await.unwrap();
        let long_a = format!("{}a", "m".repeat(70));
        let long_b = format!("{}b", "m".repeat(70));
        store.save_result(&committed("run1", &long_a, 0.2)).await.unwrap();
        store.save_result(&committed("run1", &long_b, 0.3)).await.unwrap();

        let mut items: Vec<String> = store
            .load_results("run1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.result.item)
            .collect();
        items.sort();
        assert_eq!(items.len(), 4);
        assert!(items.contains(&"grid1/mic 7".to_string()));

        let best = store.best_result("grid1/mic 7").await.unwrap().unwrap();
        assert_eq!(best.result.item, "grid1/mic 7");
        assert_eq!(best.result.confidence, 0.4);
        assert_eq!(
            store.best_result(&long_b).await.unwrap().unwrap().result.confidence,
            0.3
        );

        // Run names that differ only in punctuation stay separate too.
        for name in ["ctf run", "ctf_run"] {
            let record = RunRecord::new(name, ParameterSet::new(), dir.path().join("r"));
            store.create_run(&record).await.unwrap();
        }
        assert_eq!(store.list_runs().await.unwrap().len(), 2);
        assert_eq!(store.load_run("ctf run").await.unwrap().unwrap().name, "ctf run");
    }

    #[tokio::test]
    async fn test_json_store_rejects_misplaced_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path()).await.unwrap();

        let record = RunRecord::new("run1", ParameterSet::new(), dir.path().join("run1"));
        store.create_run(&record).await.unwrap();
        std::fs::copy(
            dir.path().join("runs").join("run1.json"),
            dir.path().join("runs").join("run2.json"),
        )
        .unwrap();
        assert!(store.load_run("run2").await.is_err());

        store.save_result(&committed("run1", "img1", 0.6)).await.unwrap();
        std::fs::copy(
            dir.path().join("results").join("run1").join("img1.json"),
            dir.path().join("results").join("run1").join("img2.json"),
        )
        .unwrap();
        assert!(store.best_result("img2").await.unwrap().is_none());
    }
}
