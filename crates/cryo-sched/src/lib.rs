//! Cryo-EM Processing on SLURM and PBS Clusters
//!
//! This crate drives an external image-processing engine (ctffind4 CTF
//! estimation) over a backlog of micrographs, running every computation as
//! a batch job on a shared HPC cluster and committing the results under a
//! named run with a fixed parameter set.
//!
//! # Overview
//!
//! Each item goes through the same steps:
//! 1. **Decision**: skip items that already have a good enough result
//! 2. **Claim**: mark the item in the run directory so parallel workers leave it alone
//! 3. **Submission**: write a scheduler script and submit it, retrying through outages
//! 4. **Polling**: translate native status codes into one [`JobState`] model
//! 5. **Commit**: parse the engine output and store it once the run parameters agree
//!
//! # Supported Schedulers
//!
//! | Scheduler | Commands | Directive |
//! |-----------|----------|-----------|
//! | SLURM | sbatch, squeue, sacct, scancel | `#SBATCH` |
//! | PBS/Torque | qsub, qstat, qdel | `#PBS` |
//!
//! Site differences (extra directives, module loads, status codes) are
//! expressed as a [`SchedulerProfile`] loaded from the configuration file.
//!
//! # Failure Handling
//!
//! - **Transient**: submission failures are retried at a fixed interval; poll
//!   failures read as [`JobState::Unknown`] and are polled again
//! - **Item-permanent**: failed jobs, timeouts, missing or malformed output mark
//!   the item bad and the loop continues
//! - **Run-fatal**: a parameter conflict with the stored run record ends the run
//!
//! # Example: Processing a Backlog
//!
//! ```ignore
//! use std::sync::Arc;
//! use cryo_sched::{
//!     JobLifecycleManager, PipelineConfig, ProcessingLoop, RunRegistry, SystemRunner, WorkItem,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load(None)?;
//!     let adapter = config.build_adapter(Arc::new(SystemRunner::default()));
//!     let lifecycle = JobLifecycleManager::new(adapter).with_config(config.lifecycle_config());
//!     let store = config.store.open(&config.state_dir).await?;
//!
//!     let processing = ProcessingLoop::new(
//!         config.loop_config("ctffind4run1", "/data/ctf/ctffind4run1"),
//!         Arc::new(config.build_engine()),
//!         Arc::new(lifecycle),
//!         RunRegistry::new(store),
//!     )
//!     .with_lock(config.lock.build());
//!
//!     let items = vec![
//!         WorkItem::new("mic001", "/data/raw/mic001.mrc")
//!             .with_attribute("pixel_size", 1.06)
//!             .with_attribute("voltage_kv", 300.0)
//!             .with_attribute("nominal_defocus_um", -2.0),
//!     ];
//!     let summary = processing.run(items).await?;
//!     println!("{} committed, {} bad", summary.committed(), summary.bad());
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod pbs;
pub mod persistence;
pub mod processing;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod slurm;

// Re-exports
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{EngineConfig, PipelineConfig};
pub use engine::{CtfFind4Engine, CtfFind4Params, Engine, EngineInvocation};
pub use error::{SchedError, SchedResult};
pub use job::{Job, JobState, NativeJobId, ResourceRequest};
pub use lifecycle::{JobLifecycleManager, LifecycleConfig};
pub use pbs::PbsAdapter;
pub use persistence::{JsonStore, RunStore, SqliteStore, StoreKind};
pub use processing::{
    Claim, CreateExclusive, Decision, ExistenceCheck, ItemLock, ItemOutcome, ItemState,
    LockStrategy, LoopConfig, ProcessingLoop, RunSummary, WorkItem, decide,
};
pub use registry::{
    CommitOutcome, CommittedResult, ItemResult, ParamValue, ParameterSet, RunRecord, RunRegistry,
    reconcile,
};
pub use runner::{CommandOutput, CommandRunner, ScriptedRunner, SystemRunner};
pub use scheduler::{CommandTemplate, SchedulerAdapter, SchedulerKind, SchedulerProfile};
pub use slurm::SlurmAdapter;
