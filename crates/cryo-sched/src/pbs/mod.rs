//! PBS (Portable Batch System) integration for HPC job submission.
//!
//! Covers Torque and PBS Pro, which share the `qsub`/`qstat`/`qdel` tool
//! set and the `#PBS -l` resource syntax.

mod adapter;
mod parser;
mod templates;

pub use adapter::{PbsAdapter, default_profile};
