//! Shared helpers for CLI commands.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;

use cryo_sched::engine::{ATTR_NOMINAL_DEFOCUS_UM, ATTR_PIXEL_SIZE, ATTR_VOLTAGE_KV};
use cryo_sched::{PipelineConfig, ResourceRequest, RunStore, WorkItem};

/// Resource directive flags shared by commands that build jobs.
#[derive(Args, Debug, Clone, Default)]
pub struct ResourceArgs {
    /// Wall time limit in hours
    #[arg(long)]
    pub walltime_hours: Option<u32>,

    /// Number of nodes
    #[arg(long)]
    pub nodes: Option<u32>,

    /// Total memory in GB
    #[arg(long)]
    pub memory_gb: Option<u32>,

    /// Memory per core in MB
    #[arg(long)]
    pub mem_per_cpu_mb: Option<u32>,

    /// Queue or partition name
    #[arg(long, alias = "partition")]
    pub queue: Option<String>,

    /// Account or project charged for jobs
    #[arg(long)]
    pub account: Option<String>,
}

impl ResourceArgs {
    /// Overlay the flags that were given on `base`.
    pub fn apply(&self, base: &ResourceRequest) -> ResourceRequest {
        base.merged_with(&ResourceRequest {
            walltime_hours: self.walltime_hours,
            nodes: self.nodes,
            memory_gb: self.memory_gb,
            mem_per_cpu_mb: self.mem_per_cpu_mb,
            queue: self.queue.clone(),
            account: self.account.clone(),
        })
    }
}

/// Flags that override configuration file values.
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Batch scheduler (slurm, pbs)
    #[arg(long)]
    pub scheduler: Option<String>,

    /// Store backend (json, sqlite)
    #[arg(long)]
    pub store: Option<String>,

    /// Claim strategy (existence, exclusive)
    #[arg(long)]
    pub lock: Option<String>,

    /// Directory holding run records and results
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Path to the ctffind4 executable
    #[arg(long)]
    pub ctffind4: Option<PathBuf>,
}

/// Load the configuration and apply command-line overrides.
pub fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(path)?;

    if let Some(scheduler) = &overrides.scheduler {
        config.scheduler = scheduler.parse()?;
    }
    if let Some(store) = &overrides.store {
        config.store = store.parse()?;
    }
    if let Some(lock) = &overrides.lock {
        config.lock = lock.parse()?;
    }
    if let Some(dir) = &overrides.state_dir {
        config.state_dir.clone_from(dir);
    }
    if let Some(exe) = &overrides.ctffind4 {
        config.ctffind4.executable.clone_from(exe);
    }

    Ok(config)
}

/// Open the configured run store, creating the state directory if needed.
pub async fn open_store(config: &PipelineConfig) -> Result<Arc<dyn RunStore>> {
    config.store.open(&config.state_dir).await.with_context(|| {
        format!(
            "Failed to open {:?} store in {}",
            config.store,
            config.state_dir.display()
        )
    })
}

/// One micrograph in a backlog file.
#[derive(Debug, Clone, Deserialize)]
pub struct BacklogEntry {
    pub id: String,
    pub source: PathBuf,
    /// Pixel size in Å
    pub pixel_size: f64,
    /// Acceleration voltage in kV
    pub voltage_kv: f64,
    /// Nominal defocus in µm
    #[serde(default)]
    pub nominal_defocus_um: Option<f64>,
}

impl From<BacklogEntry> for WorkItem {
    fn from(entry: BacklogEntry) -> Self {
        let item = WorkItem::new(entry.id, entry.source)
            .with_attribute(ATTR_PIXEL_SIZE, entry.pixel_size)
            .with_attribute(ATTR_VOLTAGE_KV, entry.voltage_kv);
        match entry.nominal_defocus_um {
            Some(defocus) => item.with_attribute(ATTR_NOMINAL_DEFOCUS_UM, defocus),
            None => item,
        }
    }
}

/// Parse a backlog (YAML, or JSON which YAML accepts).
pub fn parse_backlog(contents: &str) -> Result<Vec<WorkItem>> {
    let entries: Vec<BacklogEntry> =
        serde_yaml_ng::from_str(contents).context("Invalid backlog")?;

    let mut seen = std::collections::BTreeSet::new();
    for entry in &entries {
        if !seen.insert(entry.id.as_str()) {
            anyhow::bail!("Duplicate micrograph id in backlog: '{}'", entry.id);
        }
    }

    Ok(entries.into_iter().map(WorkItem::from).collect())
}

/// Load a backlog file.
pub fn load_backlog(path: &Path) -> Result<Vec<WorkItem>> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    parse_backlog(&contents)
}
