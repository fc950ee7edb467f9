//! Job types for batch scheduler submission.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Job identifier assigned by the batch scheduler on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeJobId(pub u64);

impl NativeJobId {
    /// Get the numeric value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NativeJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Uniform state of a batch job, independent of the scheduler family.
///
/// States are ordered by progress: a job only moves forward through
/// `Pending`, `Submitted`, `Queued`, `Running` and one of the terminal
/// states. `Unknown` records a failed poll and never counts as progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Created but not yet handed to the scheduler.
    Pending,
    /// Accepted by the scheduler, not yet observed by a poll.
    Submitted,
    /// Waiting in the scheduler queue (or any non-terminal native state).
    Queued,
    /// Running on a compute node.
    Running,
    /// Finished; output can be collected.
    Done,
    /// Finished unsuccessfully.
    Failed,
    /// The last poll could not determine the state.
    Unknown,
}

impl JobState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    /// Get a human-readable state name.
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Submitted => "Submitted",
            JobState::Queued => "Queued",
            JobState::Running => "Running",
            JobState::Done => "Done",
            JobState::Failed => "Failed",
            JobState::Unknown => "Unknown",
        }
    }

    /// Position in the lifecycle; `None` for the observation-only `Unknown`.
    fn rank(&self) -> Option<u8> {
        match self {
            JobState::Pending => Some(0),
            JobState::Submitted => Some(1),
            JobState::Queued => Some(2),
            JobState::Running => Some(3),
            JobState::Done | JobState::Failed => Some(4),
            JobState::Unknown => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resource directives requested for a job.
///
/// Every field is optional; unset fields produce no directive in the
/// submission script, so the scheduler's own defaults apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    /// Wall time limit in whole hours.
    pub walltime_hours: Option<u32>,

    /// Number of nodes.
    pub nodes: Option<u32>,

    /// Total memory in GB.
    pub memory_gb: Option<u32>,

    /// Memory per core in MB.
    pub mem_per_cpu_mb: Option<u32>,

    /// Queue or partition name.
    pub queue: Option<String>,

    /// Account charged for the job.
    pub account: Option<String>,
}

impl ResourceRequest {
    pub fn with_walltime_hours(mut self, hours: u32) -> Self {
        self.walltime_hours = Some(hours);
        self
    }

    pub fn with_nodes(mut self, nodes: u32) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn with_memory_gb(mut self, gb: u32) -> Self {
        self.memory_gb = Some(gb);
        self
    }

    pub fn with_mem_per_cpu_mb(mut self, mb: u32) -> Self {
        self.mem_per_cpu_mb = Some(mb);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Overlay `other` on top of `self`: fields set in `other` win.
    pub fn merged_with(&self, other: &ResourceRequest) -> ResourceRequest {
        ResourceRequest {
            walltime_hours: other.walltime_hours.or(self.walltime_hours),
            nodes: other.nodes.or(self.nodes),
            memory_gb: other.memory_gb.or(self.memory_gb),
            mem_per_cpu_mb: other.mem_per_cpu_mb.or(self.mem_per_cpu_mb),
            queue: other.queue.clone().or_else(|| self.queue.clone()),
            account: other.account.clone().or_else(|| self.account.clone()),
        }
    }
}

/// A unit of work handed to a batch scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Human-readable job name, also used for the script file name.
    pub name: String,

    /// Resource directives.
    pub resources: ResourceRequest,

    /// Shell command executed by the job.
    pub command: String,

    /// Directory the script is written to and the job runs in.
    pub working_dir: PathBuf,

    native_id: Option<NativeJobId>,
    state: JobState,
    progress: JobState,
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            resources: ResourceRequest::default(),
            command: command.into(),
            working_dir: working_dir.into(),
            native_id: None,
            state: JobState::Pending,
            progress: JobState::Pending,
        }
    }

    /// Set resource directives.
    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    /// Scheduler-assigned id, present once the job has been submitted.
    pub fn native_id(&self) -> Option<NativeJobId> {
        self.native_id
    }

    /// Most recently observed state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Path of the submission script for this job.
    pub fn script_path(&self, extension: &str) -> PathBuf {
        self.working_dir
            .join(format!("{}.{extension}", file_stem(&self.name)))
    }

    pub(crate) fn mark_submitted(&mut self, id: NativeJobId) {
        self.native_id = Some(id);
        self.state = JobState::Submitted;
        self.progress = JobState::Submitted;
    }

    /// Record a polled state.
    ///
    /// `Unknown` is kept as the current observation without losing
    /// progress; observations that would move the job backwards are
    /// ignored. Returns whether the observation was applied.
    pub(crate) fn observe(&mut self, observed: JobState) -> bool {
        match (observed.rank(), self.progress.rank()) {
            (None, _) if !self.progress.is_terminal() => {
                self.state = JobState::Unknown;
                true
            }
            (Some(new), Some(current)) if new >= current && !self.progress.is_terminal() => {
                self.state = observed;
                self.progress = observed;
                true
            }
            _ => {
                self.state = self.progress;
                false
            }
        }
    }
}

/// Encode a name as a file stem, one name per stem.
///
/// ASCII letters, digits, `_`, `-` and `.` (except in first position) are
/// kept; every other byte becomes `%XX`. Distinct names never share a file.
pub fn file_stem(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'_'
            || byte == b'-'
            || (byte == b'.' && i > 0);
        if keep {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_terminal() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Unknown.is_terminal());
    }

    #[test]
    fn test_job_observe_is_monotonic() {
        let mut job = Job::new("ctf", "true", "/tmp");
        job.mark_submitted(NativeJobId(7));

        assert!(job.observe(JobState::Running));
        assert_eq!(job.state(), JobState::Running);

        // A stale queue report does not move the job backwards.
        assert!(!job.observe(JobState::Queued));
        assert_eq!(job.state(), JobState::Running);

        // Unknown is recorded but recoverable.
        assert!(job.observe(JobState::Unknown));
        assert_eq!(job.state(), JobState::Unknown);
        assert!(job.observe(JobState::Done));
        assert_eq!(job.state(), JobState::Done);

        // Nothing leaves a terminal state.
        assert!(!job.observe(JobState::Failed));
        assert_eq!(job.state(), JobState::Done);
    }

    #[test]
    fn test_resource_merge() {
        let base = ResourceRequest::default()
            .with_walltime_hours(2)
            .with_queue("batch");
        let overlay = ResourceRequest::default().with_queue("gpu").with_nodes(1);
        let merged = base.merged_with(&overlay);
        assert_eq!(merged.walltime_hours, Some(2));
        assert_eq!(merged.queue.as_deref(), Some("gpu"));
        assert_eq!(merged.nodes, Some(1));
        assert_eq!(merged.account, None);
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("ctffind4-img_001"), "ctffind4-img_001");
        assert_eq!(file_stem("mic.0001"), "mic.0001");
        assert_eq!(file_stem("grid1/mic 7"), "grid1%2Fmic%207");
        assert_eq!(file_stem("../up"), "%2E.%2Fup");
        assert_eq!(file_stem("50%"), "50%25");
        assert_eq!(file_stem("µ"), "%C2%B5");

        // Names that differ anywhere get different stems.
        assert_ne!(file_stem("grid1/mic 7"), file_stem("grid1_mic_7"));
        let long_a = format!("{}a", "m".repeat(70));
        let long_b = format!("{}b", "m".repeat(70));
        assert_ne!(file_stem(&long_a), file_stem(&long_b));
    }

    #[test]
    fn test_script_path_keeps_names_apart() {
        let a = Job::new("ctffind4-grid1/mic 7", "true", "/run");
        let b = Job::new("ctffind4-grid1_mic_7", "true", "/run");
        assert_ne!(a.script_path("sh"), b.script_path("sh"));
        assert_eq!(b.script_path("sh"), PathBuf::from("/run/ctffind4-grid1_mic_7.sh"));
    }
}
