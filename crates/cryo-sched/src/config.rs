//! Pipeline configuration.
//!
//! Values come from, lowest to highest precedence:
//! 1. Defaults
//! 2. A YAML configuration file
//! 3. Environment variables (`CRYO_STATE_DIR`, `CRYO_PROCESSES`,
//!    `CTFFIND4_PATH`)
//!
//! Command-line flags are applied on top by the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{CtfFind4Engine, CtfFind4Params};
use crate::error::{SchedError, SchedResult};
use crate::job::ResourceRequest;
use crate::lifecycle::LifecycleConfig;
use crate::persistence::StoreKind;
use crate::processing::{LockStrategy, LoopConfig};
use crate::runner::CommandRunner;
use crate::scheduler::{SchedulerAdapter, SchedulerKind, SchedulerProfile};

/// Complete pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Scheduler family: "slurm" or "pbs"
    #[serde(default)]
    pub scheduler: SchedulerKind,

    /// Site override of the scheduler family's default profile
    #[serde(default)]
    pub profile: Option<SchedulerProfile>,

    /// Wait between failed submissions in seconds
    #[serde(default = "default_submit_retry")]
    pub submit_retry_secs: u64,

    /// Give up submitting after this many attempts (unset retries forever)
    #[serde(default)]
    pub max_submit_attempts: Option<u32>,

    /// Wait between status polls in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Overall limit for one job in seconds
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Directory holding run records and results
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Store backend: "json" or "sqlite"
    #[serde(default)]
    pub store: StoreKind,

    /// Claim strategy: "existence" or "exclusive"
    #[serde(default)]
    pub lock: LockStrategy,

    /// Reprocess items whose best confidence is at or below this value
    #[serde(default)]
    pub reprocess_threshold: Option<f64>,

    /// Number of parallel workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Resource directives for every job
    #[serde(default)]
    pub resources: ResourceRequest,

    /// CTF engine settings
    #[serde(default)]
    pub ctffind4: EngineConfig,
}

/// Engine executable and search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the ctffind4 executable
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    #[serde(flatten)]
    pub params: CtfFind4Params,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            params: CtfFind4Params::default(),
        }
    }
}

fn default_submit_retry() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    15
}

fn default_job_timeout() -> u64 {
    3600 // 1 hour
}

fn default_workers() -> usize {
    1
}

fn default_executable() -> PathBuf {
    PathBuf::from("ctffind4")
}

/// `~/.cryo`, or `.cryo` when there is no home directory.
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cryo")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::default(),
            profile: None,
            submit_retry_secs: default_submit_retry(),
            max_submit_attempts: None,
            poll_interval_secs: default_poll_interval(),
            job_timeout_secs: default_job_timeout(),
            state_dir: default_state_dir(),
            store: StoreKind::default(),
            lock: LockStrategy::default(),
            reprocess_threshold: None,
            workers: default_workers(),
            resources: ResourceRequest::default(),
            ctffind4: EngineConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse configuration from YAML text.
    pub fn from_yaml(contents: &str) -> SchedResult<Self> {
        let config: PipelineConfig = serde_yaml_ng::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> SchedResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SchedError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> SchedResult<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Unparseable numeric values are ignored.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("CRYO_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(workers) = lookup("CRYO_PROCESSES") {
            if let Ok(val) = workers.parse() {
                self.workers = val;
            }
        }
        if let Some(exe) = lookup("CTFFIND4_PATH") {
            self.ctffind4.executable = PathBuf::from(exe);
        }
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> SchedResult<()> {
        if self.workers == 0 {
            return Err(SchedError::ConfigError(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(SchedError::ConfigError(
                "poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.job_timeout_secs < self.poll_interval_secs {
            return Err(SchedError::ConfigError(format!(
                "job_timeout_secs ({}) is shorter than poll_interval_secs ({})",
                self.job_timeout_secs, self.poll_interval_secs
            )));
        }
        if self.max_submit_attempts == Some(0) {
            return Err(SchedError::ConfigError(
                "max_submit_attempts must be at least 1".to_string(),
            ));
        }
        self.ctffind4.params.validate()
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            submit_retry_interval: Duration::from_secs(self.submit_retry_secs),
            max_submit_attempts: self.max_submit_attempts,
        }
    }

    /// Loop settings for `run_name`, with outputs under `run_dir`.
    pub fn loop_config(&self, run_name: &str, run_dir: impl Into<PathBuf>) -> LoopConfig {
        let mut config = LoopConfig::new(run_name, run_dir)
            .with_resources(self.resources.clone())
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_job_timeout(Duration::from_secs(self.job_timeout_secs));
        config.reprocess_threshold = self.reprocess_threshold;
        config
    }

    pub fn build_adapter(&self, runner: Arc<dyn CommandRunner>) -> Arc<dyn SchedulerAdapter> {
        self.scheduler.build_adapter(self.profile.clone(), runner)
    }

    pub fn build_engine(&self) -> CtfFind4Engine {
        CtfFind4Engine::new(
            self.ctffind4.executable.clone(),
            self.ctffind4.params.clone(),
        )
    }
}
