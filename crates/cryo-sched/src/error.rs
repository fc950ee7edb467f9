//! Error handling for the processing pipeline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for scheduler and pipeline operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur while submitting jobs, processing items or
/// committing results.
#[derive(Error, Debug)]
pub enum SchedError {
    /// The submission command ran but its output carried no usable job id.
    #[error("Could not parse job id from {command} output: {output:?}")]
    SubmissionParse { command: String, output: String },

    /// The submission command could not be run or exited non-zero.
    #[error("Submission via {command} failed: {message}")]
    SubmitFailed { command: String, message: String },

    /// Submission kept failing until the configured attempt limit.
    #[error("Submission of job {job} abandoned after {attempts} attempts: {last_error}")]
    SubmissionExhausted {
        job: String,
        attempts: u32,
        last_error: String,
    },

    /// A scheduler command could not be executed.
    #[error("Scheduler command failed: {command} - {message}")]
    CommandError { command: String, message: String },

    /// The job did not reach a terminal state within the allowed time.
    #[error("Job {job} (scheduler id {native_id}) still not finished after {waited:?}")]
    PollTimeout {
        job: String,
        native_id: String,
        waited: Duration,
    },

    /// The scheduler reported the job as failed.
    #[error("Job {job} (scheduler id {native_id}) failed")]
    JobFailed { job: String, native_id: String },

    /// Invalid job state for the requested operation.
    #[error("Invalid job state: expected {expected}, found {found}")]
    InvalidJobState { expected: String, found: String },

    /// The engine finished but left no result artifact behind.
    #[error("Engine output missing: {0}")]
    MissingOutput(PathBuf),

    /// The engine's result artifact could not be interpreted.
    #[error("Invalid engine output in {path}: {message}")]
    InvalidOutput { path: PathBuf, message: String },

    /// The engine cannot be prepared for this particular item.
    #[error("Cannot prepare engine input: {0}")]
    EngineInput(String),

    /// An item was processed with parameters that differ from its run.
    #[error(
        "All parameters for run '{run}' must be identical: '{parameter}' was {existing}, now {proposed}"
    )]
    RunParameterConflict {
        run: String,
        parameter: String,
        existing: String,
        proposed: String,
    },

    /// Persistence error.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// SQLite database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML configuration error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml_ng::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl SchedError {
    /// Failures of the scheduler front-end that are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedError::SubmissionParse { .. }
                | SchedError::SubmitFailed { .. }
                | SchedError::CommandError { .. }
        )
    }

    /// Failures that doom one work item but leave the run intact.
    pub fn is_item_permanent(&self) -> bool {
        matches!(
            self,
            SchedError::MissingOutput(_)
                | SchedError::InvalidOutput { .. }
                | SchedError::EngineInput(_)
                | SchedError::PollTimeout { .. }
                | SchedError::JobFailed { .. }
                | SchedError::SubmissionExhausted { .. }
        )
    }

    /// Failures that must terminate the whole run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, SchedError::RunParameterConflict { .. })
    }
}

impl From<rusqlite::Error> for SchedError {
    fn from(e: rusqlite::Error) -> Self {
        SchedError::DatabaseError(e.to_string())
    }
}
