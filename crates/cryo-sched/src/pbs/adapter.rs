//! PBS adapter for job submission and tracking.

use std::sync::Arc;

use crate::job::{JobState, ResourceRequest};
use crate::pbs::{parser, templates};
use crate::runner::{CommandRunner, SystemRunner};
use crate::scheduler::{
    CommandTemplate, SchedulerAdapter, SchedulerKind, SchedulerProfile, status_table,
};

/// Built-in Torque/PBS profile.
///
/// PBS uses single-letter state codes:
/// - Q: Queued (waiting in queue)
/// - R: Running
/// - E: Exiting (job completing)
/// - C: Completed
/// - H: Held
///
/// Anything else (W, S, T, B, ...) is still a live job and maps to
/// `Queued`. No finished-job command is set: Torque drops completed jobs
/// from `qstat` after `keep_completed`, and the accounting tools differ per
/// site.
pub fn default_profile() -> SchedulerProfile {
    SchedulerProfile {
        shell: "/bin/bash".to_string(),
        directive_prefix: "#PBS".to_string(),
        submit_command: CommandTemplate::new(["qsub", "{script}"]),
        status_command: CommandTemplate::new(["qstat", "{id}"]),
        finished_status_command: None,
        cancel_command: Some(CommandTemplate::new(["qdel", "{id}"])),
        // "12345.pbs-server"
        job_id_token: 0,
        additional_directives: Vec::new(),
        pre_exec_lines: Vec::new(),
        status_codes: status_table(&[
            ("R", JobState::Running),
            ("E", JobState::Done),
            ("C", JobState::Done),
            ("Q", JobState::Queued),
            ("H", JobState::Queued),
        ]),
    }
}

/// Adapter for PBS/Torque HPC scheduler.
pub struct PbsAdapter {
    profile: SchedulerProfile,
    runner: Arc<dyn CommandRunner>,
}

impl PbsAdapter {
    /// Create a PBS adapter running commands as local subprocesses.
    pub fn new(profile: SchedulerProfile) -> Self {
        Self::with_runner(profile, Arc::new(SystemRunner::default()))
    }

    /// Create a PBS adapter with a custom command runner.
    pub fn with_runner(profile: SchedulerProfile, runner: Arc<dyn CommandRunner>) -> Self {
        Self { profile, runner }
    }
}

impl Default for PbsAdapter {
    fn default() -> Self {
        Self::new(default_profile())
    }
}

impl SchedulerAdapter for PbsAdapter {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Pbs
    }

    fn profile(&self) -> &SchedulerProfile {
        &self.profile
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    fn script_extension(&self) -> &'static str {
        "pbs"
    }

    fn resource_directives(&self, resources: &ResourceRequest) -> Vec<String> {
        templates::resource_directives(resources)
    }

    fn apply_directive(&self, directive: &str, resources: &mut ResourceRequest) {
        templates::apply_directive(directive, resources);
    }

    fn parse_status_token(&self, output: &str) -> Option<String> {
        parser::parse_qstat_state(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;

    use crate::error::{SchedError, SchedResult};
    use crate::job::{Job, NativeJobId};
    use crate::runner::CommandOutput;

    /// Replies to every command with the same output.
    struct FixedRunner(CommandOutput);

    #[async_trait]
    impl CommandRunner for FixedRunner {
        async fn run(&self, _program: &str, _args: &[String]) -> SchedResult<CommandOutput> {
            Ok(self.0.clone())
        }
    }

    fn fixed(output: CommandOutput) -> PbsAdapter {
        PbsAdapter::with_runner(default_profile(), Arc::new(FixedRunner(output)))
    }

    const QSTAT_RUNNING: &str = "\
Job id            Name             User              Time Use S Queue
----------------  ---------------- ----------------  -------- - -----
12345.pbs-server  ctf-img1         cryo              00:05:23 R batch
";

    #[test]
    fn test_build_submission_script() {
        let adapter = PbsAdapter::default();
        let job = Job::new("ctf-img1", "ctffind4 < answers.txt", "/scratch/run1").with_resources(
            ResourceRequest::default()
                .with_walltime_hours(4)
                .with_nodes(2)
                .with_memory_gb(16)
                .with_mem_per_cpu_mb(2000)
                .with_queue("batch")
                .with_account("proj"),
        );

        let script = adapter.build_submission_script(&job);
        let expected = "#!/bin/bash\n\
            #PBS -l walltime=04:00:00\n\
            #PBS -l nodes=2\n\
            #PBS -l mem=16gb\n\
            #PBS -l pmem=2000mb\n\
            #PBS -q batch\n\
            #PBS -A proj\n\
            \n\
            ctffind4 < answers.txt\n";
        assert_eq!(script, expected);
        assert_eq!(
            job.script_path(adapter.script_extension()),
            Path::new("/scratch/run1/ctf-img1.pbs")
        );
    }

    #[test]
    fn test_parse_job_id() {
        let adapter = PbsAdapter::default();
        assert_eq!(
            adapter.parse_job_id("12345.pbs-server\n").unwrap(),
            NativeJobId(12345)
        );
        assert_eq!(adapter.parse_job_id("678").unwrap(), NativeJobId(678));
        assert!(matches!(
            adapter.parse_job_id(""),
            Err(SchedError::SubmissionParse { .. })
        ));
        assert!(adapter.parse_job_id("qsub: Bad UID for job execution").is_err());
    }

    #[tokio::test]
    async fn test_poll_status() {
        let adapter = fixed(CommandOutput::ok(QSTAT_RUNNING));
        assert_eq!(adapter.poll_status(NativeJobId(12345)).await, JobState::Running);

        let adapter = fixed(CommandOutput::ok(QSTAT_RUNNING.replace(" R ", " C ")));
        assert_eq!(adapter.poll_status(NativeJobId(12345)).await, JobState::Done);

        let adapter = fixed(CommandOutput::ok(QSTAT_RUNNING.replace(" R ", " W ")));
        assert_eq!(adapter.poll_status(NativeJobId(12345)).await, JobState::Queued);
    }

    #[tokio::test]
    async fn test_poll_status_unknown_job() {
        let adapter = fixed(CommandOutput::failed(
            153,
            "qstat: Unknown Job Id 12345.pbs-server",
        ));
        assert_eq!(adapter.poll_status(NativeJobId(12345)).await, JobState::Unknown);

        let adapter = fixed(CommandOutput::ok("garbage"));
        assert_eq!(adapter.poll_status(NativeJobId(12345)).await, JobState::Unknown);
    }
}
