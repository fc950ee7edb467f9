//! Per-item processing loop.
//!
//! For each item of a backlog the loop decides whether work is needed,
//! claims the item through an [`ItemLock`], dispatches the engine as a
//! scheduler job and commits the parsed result under the run. Items that
//! fail permanently are recorded as bad and the loop moves on; a run
//! parameter conflict ends the whole run.
//!
//! Besides the claim marker, every finished item leaves an outcome marker
//! in the run directory: `<item>.done` after a commit, `<item>.bad` after a
//! permanent failure. Loops of the same run never touch an item that has
//! one. Delete the marker to have the item processed again.

mod lock;
mod summary;

pub use lock::{Claim, CreateExclusive, ExistenceCheck, ItemLock, LockStrategy};
pub use summary::{ConfidenceStats, ItemOutcome, ItemState, RunSummary};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{SchedError, SchedResult};
use crate::job::{Job, JobState, ResourceRequest, file_stem};
use crate::lifecycle::JobLifecycleManager;
use crate::registry::{ItemResult, RunRegistry};

/// One unit of work: an image and what is known about it.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub source: PathBuf,
    /// Acquisition metadata (pixel size, voltage, nominal defocus).
    pub attributes: BTreeMap<String, f64>,
    /// Best result from earlier runs, if any.
    pub prior: Option<ItemResult>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            attributes: BTreeMap::new(),
            prior: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: f64) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn with_prior(mut self, prior: ItemResult) -> Self {
        self.prior = Some(prior);
        self
    }
}

/// Whether an item needs processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Process,
    Skip,
}

/// Decide from the prior result alone.
///
/// Without a prior the item is processed. With a prior it is skipped,
/// unless a reprocess threshold is set and the prior confidence is at or
/// below it.
pub fn decide(item: &WorkItem, reprocess_threshold: Option<f64>) -> Decision {
    match (&item.prior, reprocess_threshold) {
        (None, _) => Decision::Process,
        (Some(_), None) => Decision::Skip,
        (Some(prior), Some(threshold)) => {
            if prior.confidence <= threshold {
                Decision::Process
            } else {
                Decision::Skip
            }
        }
    }
}

/// Settings for one processing loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub run_name: String,
    /// Where scripts, engine outputs and claim markers live.
    pub run_dir: PathBuf,
    /// Reprocess items whose prior confidence is at or below this value.
    pub reprocess_threshold: Option<f64>,
    pub resources: ResourceRequest,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
}

impl LoopConfig {
    pub fn new(run_name: impl Into<String>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_name: run_name.into(),
            run_dir: run_dir.into(),
            reprocess_threshold: None,
            resources: ResourceRequest::default(),
            poll_interval: Duration::from_secs(15),
            job_timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_reprocess_threshold(mut self, threshold: f64) -> Self {
        self.reprocess_threshold = Some(threshold);
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// Drives a backlog through an engine, one item at a time.
pub struct ProcessingLoop {
    config: LoopConfig,
    engine: Arc<dyn Engine>,
    lifecycle: Arc<JobLifecycleManager>,
    registry: RunRegistry,
    lock: Arc<dyn ItemLock>,
    halt: Arc<AtomicBool>,
}

impl ProcessingLoop {
    /// Create a loop using the default [`ExistenceCheck`] lock.
    pub fn new(
        config: LoopConfig,
        engine: Arc<dyn Engine>,
        lifecycle: Arc<JobLifecycleManager>,
        registry: RunRegistry,
    ) -> Self {
        Self {
            config,
            engine,
            lifecycle,
            registry,
            lock: Arc::new(ExistenceCheck),
            halt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_lock(mut self, lock: Arc<dyn ItemLock>) -> Self {
        self.lock = lock;
        self
    }

    /// Share a stop flag with the other loops of the same run.
    ///
    /// A loop raises the flag when it hits a run-fatal error and checks it
    /// before every item. Once it is raised the remaining items are
    /// reported as [`ItemState::Unvisited`].
    pub fn with_halt(mut self, halt: Arc<AtomicBool>) -> Self {
        self.halt = halt;
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Marker path claimed while an item is being worked on.
    pub fn claim_path(&self, item: &WorkItem) -> PathBuf {
        self.marker_path(&item.id, "claim")
    }

    /// Marker left once an item's result is committed to this run.
    pub fn done_path(&self, item: &WorkItem) -> PathBuf {
        self.marker_path(&item.id, "done")
    }

    /// Marker left once an item failed permanently in this run.
    pub fn bad_path(&self, item: &WorkItem) -> PathBuf {
        self.marker_path(&item.id, "bad")
    }

    fn marker_path(&self, id: &str, extension: &str) -> PathBuf {
        self.config
            .run_dir
            .join(format!("{}.{extension}", file_stem(id)))
    }

    /// Process `items` in order.
    pub async fn run(&self, items: Vec<WorkItem>) -> SchedResult<RunSummary> {
        self.run_with(items, |_| {}).await
    }

    /// Process `items` in order, reporting to `observer` as they go.
    ///
    /// The observer sees a [`ItemState::Dispatched`] outcome when an item is
    /// handed to the scheduler, then the item's final outcome. Only final
    /// outcomes are recorded in the summary.
    ///
    /// Returns early only on errors that are not item-permanent, such as a
    /// run parameter conflict or a store failure.
    pub async fn run_with<F>(&self, items: Vec<WorkItem>, mut observer: F) -> SchedResult<RunSummary>
    where
        F: FnMut(&ItemOutcome) + Send,
    {
        fs::create_dir_all(&self.config.run_dir).await?;
        let mut summary = RunSummary::new(&self.config.run_name);

        let mut items = items.into_iter();
        while let Some(item) = items.next() {
            if self.halt.load(Ordering::SeqCst) {
                warn!(
                    "Run '{}' halted, leaving {} item(s) unvisited",
                    self.config.run_name,
                    items.len() + 1
                );
                for item in std::iter::once(item).chain(items.by_ref()) {
                    let outcome = ItemOutcome::unvisited(&item.id, "run halted");
                    observer(&outcome);
                    summary.record(outcome);
                }
                break;
            }

            match self.process_item(item, &mut observer).await {
                Ok(outcome) => {
                    observer(&outcome);
                    summary.record(outcome);
                }
                Err(e) => {
                    if e.is_run_fatal() {
                        self.halt.store(true, Ordering::SeqCst);
                    }
                    return Err(e);
                }
            }
        }

        info!(
            "Run '{}': {} committed, {} skipped, {} locked, {} bad",
            self.config.run_name,
            summary.committed(),
            summary.skipped(),
            summary.locked(),
            summary.bad()
        );
        Ok(summary)
    }

    async fn process_item<F>(&self, mut item: WorkItem, observer: &mut F) -> SchedResult<ItemOutcome>
    where
        F: FnMut(&ItemOutcome) + Send,
    {
        if let Some(outcome) = self.recorded_outcome(&item).await? {
            return Ok(outcome);
        }

        // Other workers may have committed since the backlog was built.
        if let Some(best) = self.registry.best_result(&item.id).await? {
            let stale = item
                .prior
                .as_ref()
                .is_none_or(|p| best.result.confidence > p.confidence);
            if stale {
                item.prior = Some(best.result);
            }
        }

        if decide(&item, self.config.reprocess_threshold) == Decision::Skip {
            let confidence = item.prior.as_ref().map_or(0.0, |p| p.confidence);
            return Ok(ItemOutcome::skipped(
                &item.id,
                format!("prior result with confidence {confidence}"),
            ));
        }

        let marker = self.claim_path(&item);
        if self.lock.try_claim(&marker).await? == Claim::Busy {
            warn!("Skipping {}: claimed by another worker", item.id);
            return Ok(ItemOutcome::locked(&item.id, "claimed by another worker"));
        }

        // The previous holder of the claim may have just finished the item.
        if let Some(outcome) = self.recorded_outcome(&item).await.transpose() {
            self.release(&marker, &item).await;
            return outcome;
        }

        observer(&ItemOutcome::dispatched(&item.id));
        let outcome = self.dispatch_and_commit(&item).await;
        let written = match &outcome {
            Ok(outcome) => self.record_outcome(&item, outcome).await,
            Err(_) => Ok(()),
        };

        self.release(&marker, &item).await;
        written?;
        outcome
    }

    async fn release(&self, marker: &Path, item: &WorkItem) {
        if let Err(e) = self.lock.release(marker).await {
            warn!("Could not release claim on {}: {}", item.id, e);
        }
    }

    /// Outcome left by an earlier visit of this run, if any.
    async fn recorded_outcome(&self, item: &WorkItem) -> SchedResult<Option<ItemOutcome>> {
        if fs::try_exists(self.done_path(item)).await? {
            return Ok(Some(ItemOutcome::skipped(
                &item.id,
                "already committed in this run",
            )));
        }
        match fs::read_to_string(self.bad_path(item)).await {
            Ok(reason) => Ok(Some(ItemOutcome::bad(
                &item.id,
                format!("marked bad earlier in this run: {}", reason.trim()),
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SchedError::IoError(e)),
        }
    }

    async fn record_outcome(&self, item: &WorkItem, outcome: &ItemOutcome) -> SchedResult<()> {
        match outcome.state {
            ItemState::Committed => {
                fs::write(
                    self.done_path(item),
                    format!("committed at {}\n", Utc::now().to_rfc3339()),
                )
                .await?;
            }
            ItemState::BadResult => {
                let reason = outcome.message.as_deref().unwrap_or_default();
                fs::write(self.bad_path(item), format!("{reason}\n")).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn dispatch_and_commit(&self, item: &WorkItem) -> SchedResult<ItemOutcome> {
        let result = match self.dispatch(item).await {
            Ok(result) => result,
            Err(e) if e.is_item_permanent() => {
                warn!("Item {} is bad: {}", item.id, e);
                return Ok(ItemOutcome::bad(&item.id, e.to_string()));
            }
            Err(e) => return Err(e),
        };

        self.registry
            .reconcile_and_commit(
                &self.config.run_name,
                &self.engine.run_parameters(),
                &self.config.run_dir,
                result.clone(),
            )
            .await?;
        Ok(ItemOutcome::committed(result))
    }

    /// Run the engine for one item through the scheduler and parse its output.
    async fn dispatch(&self, item: &WorkItem) -> SchedResult<ItemResult> {
        let invocation = self.engine.prepare(item, &self.config.run_dir)?;
        let mut job = Job::new(
            format!("{}-{}", self.engine.name(), item.id),
            invocation.command,
            &self.config.run_dir,
        )
        .with_resources(self.config.resources.clone());

        let state = self
            .lifecycle
            .run(&mut job, self.config.poll_interval, self.config.job_timeout)
            .await?;
        if state == JobState::Failed {
            return Err(SchedError::JobFailed {
                job: job.name.clone(),
                native_id: job.native_id().map_or_else(String::new, |id| id.to_string()),
            });
        }

        let contents = match fs::read_to_string(&invocation.output_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SchedError::MissingOutput(invocation.output_path));
            }
            Err(e) => return Err(SchedError::IoError(e)),
        };
        self.engine
            .parse_output(item, &invocation.output_path, &contents)
    }
}
