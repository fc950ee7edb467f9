//! Named runs, their immutable parameter sets, and committed results.
//!
//! Every result committed under a run name must have been produced with
//! the run's parameters. The first commit creates the run record; every
//! later commit is reconciled against it and rejected on any difference.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{SchedError, SchedResult};
use crate::persistence::RunStore;

/// Absolute tolerance for comparing floating-point parameters.
pub const DEFAULT_FLOAT_TOLERANCE: f64 = 1e-5;

/// A single run parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Text(s) => write!(f, "{s:?}"),
            ParamValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(v: Vec<T>) -> Self {
        ParamValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Run parameters by name.
pub type ParameterSet = BTreeMap<String, ParamValue>;

/// Persistent description of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub name: String,
    pub parameters: ParameterSet,
    /// Output directory of the run.
    pub path: PathBuf,
    pub hidden: bool,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(name: impl Into<String>, parameters: ParameterSet, path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            parameters,
            path: path.as_ref().to_path_buf(),
            hidden: false,
            created_at: Utc::now(),
        }
    }
}

/// The outcome of running the engine on one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub item: String,
    /// Quality score used for reprocessing decisions; higher is better.
    pub confidence: f64,
    /// Engine-specific measurements.
    #[serde(default)]
    pub fields: BTreeMap<String, f64>,
}

impl ItemResult {
    pub fn new(item: impl Into<String>, confidence: f64) -> Self {
        Self {
            item: item.into(),
            confidence,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// A result as stored under its run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedResult {
    pub run: String,
    pub result: ItemResult,
    pub committed_at: DateTime<Utc>,
}

/// The first parameter on which two parameter sets disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterMismatch {
    pub parameter: String,
    pub existing: Option<ParamValue>,
    pub proposed: Option<ParamValue>,
}

/// Compare a proposed parameter set against a run's recorded one.
///
/// Names are compared over the union of both sets; a name present on only
/// one side is a mismatch. A `Float` on either side is compared numerically
/// within `tolerance`; everything else, including the elements of a
/// `List`, must be equal.
pub fn reconcile(
    existing: &ParameterSet,
    proposed: &ParameterSet,
    tolerance: f64,
) -> Result<(), ParameterMismatch> {
    let names = existing.keys().chain(proposed.keys().filter(|k| !existing.contains_key(*k)));

    for name in names {
        let (old, new) = (existing.get(name), proposed.get(name));
        let same = match (old, new) {
            (Some(a), Some(b)) => values_match(a, b, tolerance),
            _ => false,
        };
        if !same {
            return Err(ParameterMismatch {
                parameter: name.clone(),
                existing: old.cloned(),
                proposed: new.cloned(),
            });
        }
    }
    Ok(())
}

fn values_match(a: &ParamValue, b: &ParamValue, tolerance: f64) -> bool {
    match (a, b) {
        (ParamValue::Float(_), _) | (_, ParamValue::Float(_)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() <= tolerance,
            _ => false,
        },
        _ => a == b,
    }
}

/// What a successful commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The run did not exist and was created with this commit.
    CreatedRun,
    /// The result was added to an existing run.
    Appended,
}

/// Commits results under runs, guarding each run's parameter set.
#[derive(Clone)]
pub struct RunRegistry {
    store: Arc<dyn RunStore>,
    tolerance: f64,
}

impl RunRegistry {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            tolerance: DEFAULT_FLOAT_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn store(&self) -> &dyn RunStore {
        self.store.as_ref()
    }

    /// Commit `result` under `run_name`, creating the run on first use.
    ///
    /// Concurrent first commits may both create the record; the last
    /// writer wins. A parameter mismatch against an existing record fails
    /// with `RunParameterConflict` and nothing is written.
    pub async fn reconcile_and_commit(
        &self,
        run_name: &str,
        parameters: &ParameterSet,
        run_path: &Path,
        result: ItemResult,
    ) -> SchedResult<CommitOutcome> {
        let outcome = match self.store.load_run(run_name).await? {
            Some(record) => {
                reconcile(&record.parameters, parameters, self.tolerance).map_err(|m| {
                    SchedError::RunParameterConflict {
                        run: run_name.to_string(),
                        parameter: m.parameter,
                        existing: describe(m.existing.as_ref()),
                        proposed: describe(m.proposed.as_ref()),
                    }
                })?;
                CommitOutcome::Appended
            }
            None => {
                let record = RunRecord::new(run_name, parameters.clone(), run_path);
                self.store.create_run(&record).await?;
                info!("Created run '{}' at {}", run_name, run_path.display());
                CommitOutcome::CreatedRun
            }
        };

        let item = result.item.clone();
        self.store
            .save_result(&CommittedResult {
                run: run_name.to_string(),
                result,
                committed_at: Utc::now(),
            })
            .await?;
        info!("Committed {} to run '{}'", item, run_name);

        Ok(outcome)
    }

    /// Best result recorded for an item across all runs.
    pub async fn best_result(&self, item: &str) -> SchedResult<Option<CommittedResult>> {
        self.store.best_result(item).await
    }
}

fn describe(value: Option<&ParamValue>) -> String {
    value.map_or_else(|| "<missing>".to_string(), ToString::to_string)
}
