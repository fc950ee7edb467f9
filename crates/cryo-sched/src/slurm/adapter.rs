//! SLURM adapter for job submission and tracking.

use std::sync::Arc;

use crate::job::{JobState, ResourceRequest};
use crate::runner::{CommandRunner, SystemRunner};
use crate::scheduler::{
    CommandTemplate, SchedulerAdapter, SchedulerKind, SchedulerProfile, status_table,
};
use crate::slurm::{parser, templates};

/// Built-in SLURM profile.
///
/// Status is read with `squeue -h -o %t`, which prints the compact state
/// code only. Once a job has aged out of `squeue`, `sacct` supplies the
/// final state in its long form.
pub fn default_profile() -> SchedulerProfile {
    SchedulerProfile {
        shell: "/bin/bash".to_string(),
        directive_prefix: "#SBATCH".to_string(),
        submit_command: CommandTemplate::new(["sbatch", "{script}"]),
        status_command: CommandTemplate::new(["squeue", "-h", "-o", "%t", "-j", "{id}"]),
        finished_status_command: Some(CommandTemplate::new([
            "sacct", "-n", "-X", "-P", "-o", "State", "-j", "{id}",
        ])),
        cancel_command: Some(CommandTemplate::new(["scancel", "{id}"])),
        // "Submitted batch job <ID>"
        job_id_token: 3,
        additional_directives: Vec::new(),
        pre_exec_lines: Vec::new(),
        status_codes: status_table(&[
            ("PD", JobState::Queued),
            ("PENDING", JobState::Queued),
            ("R", JobState::Running),
            ("RUNNING", JobState::Running),
            ("CG", JobState::Done),
            ("COMPLETING", JobState::Done),
            ("CD", JobState::Done),
            ("COMPLETED", JobState::Done),
            ("F", JobState::Failed),
            ("FAILED", JobState::Failed),
            ("CA", JobState::Failed),
            ("CANCELLED", JobState::Failed),
            ("TO", JobState::Failed),
            ("TIMEOUT", JobState::Failed),
            ("NF", JobState::Failed),
            ("NODE_FAIL", JobState::Failed),
            ("OOM", JobState::Failed),
            ("OUT_OF_MEMORY", JobState::Failed),
        ]),
    }
}

/// Adapter for SLURM HPC scheduler.
pub struct SlurmAdapter {
    profile: SchedulerProfile,
    runner: Arc<dyn CommandRunner>,
}

impl SlurmAdapter {
    /// Create a SLURM adapter running commands as local subprocesses.
    pub fn new(profile: SchedulerProfile) -> Self {
        Self::with_runner(profile, Arc::new(SystemRunner::default()))
    }

    /// Create a SLURM adapter with a custom command runner.
    pub fn with_runner(profile: SchedulerProfile, runner: Arc<dyn CommandRunner>) -> Self {
        Self { profile, runner }
    }
}

impl Default for SlurmAdapter {
    fn default() -> Self {
        Self::new(default_profile())
    }
}

impl SchedulerAdapter for SlurmAdapter {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Slurm
    }

    fn profile(&self) -> &SchedulerProfile {
        &self.profile
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    fn resource_directives(&self, resources: &ResourceRequest) -> Vec<String> {
        templates::resource_directives(resources)
    }

    fn apply_directive(&self, directive: &str, resources: &mut ResourceRequest) {
        templates::apply_directive(directive, resources);
    }

    fn parse_status_token(&self, output: &str) -> Option<String> {
        parser::parse_state_token(output)
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

    /// Answers each program with a canned output.
    struct CannedRunner {
        answers: Vec<(&'static str, SchedResult<CommandOutput>)>,
    }

    impl CannedRunner {
        fn new(answers: Vec<(&'static str, SchedResult<CommandOutput>)>) -> Self {
            Self { answers }
        }
    }

    #[async_trait]
    impl CommandRunner for CannedRunner {
        async fn run(&self, program: &str, _args: &[String]) -> SchedResult<CommandOutput> {
            for (name, answer) in &self.answers {
                if *name == program {
                    return match answer {
                        Ok(output) => Ok(output.clone()),
                        Err(e) => Err(SchedError::CommandError {
                            command: program.to_string(),
                            message: e.to_string(),
                        }),
                    };
                }
            }
            Ok(CommandOutput::failed(127, "command not found"))
        }
    }

    fn canned(answers: Vec<(&'static str, SchedResult<CommandOutput>)>) -> SlurmAdapter {
        SlurmAdapter::with_runner(default_profile(), Arc::new(CannedRunner::new(answers)))
    }

    #[test]
    fn test_build_submission_script() {
        let adapter = SlurmAdapter::with_runner(
            default_profile()
                .with_additional_directive("--gres=gpu:1")
                .with_pre_exec_line("module load ctffind/4.1.14"),
            Arc::new(CannedRunner::new(Vec::new())),
        );
        let job = Job::new("ctf-img1", "ctffind4 < answers.txt", "/scratch/run1").with_resources(
            ResourceRequest::default()
                .with_walltime_hours(2)
                .with_nodes(1)
                .with_memory_gb(8)
                .with_mem_per_cpu_mb(2000)
                .with_queue("gpu")
                .with_account("emlab"),
        );

        let script = adapter.build_submission_script(&job);
        let expected = "#!/bin/bash\n\
            #SBATCH -t 02:00:00\n\
            #SBATCH -N 1\n\
            #SBATCH --mem=8gb\n\
            #SBATCH --mem-per-cpu=2000M\n\
            #SBATCH -p gpu\n\
            #SBATCH -A emlab\n\
            #SBATCH --gres=gpu:1\n\
            \n\
            module load ctffind/4.1.14\n\
            \n\
            ctffind4 < answers.txt\n";
        assert_eq!(script, expected);
    }

    #[test]
    fn test_script_omits_unset_fields() {
        let adapter = SlurmAdapter::default();
        let job = Job::new("j", "true", "/tmp")
            .with_resources(ResourceRequest::default().with_queue("short"));
        let script = adapter.build_submission_script(&job);
        let directives: Vec<&str> = script
            .lines()
            .filter(|l| l.starts_with("#SBATCH"))
            .collect();
        assert_eq!(directives, vec!["#SBATCH -p short"]);
    }

    #[test]
    fn test_parse_job_id() {
        let adapter = SlurmAdapter::default();
        assert_eq!(
            adapter.parse_job_id("Submitted batch job 12345\n").unwrap(),
            NativeJobId(12345)
        );
        assert!(matches!(
            adapter.parse_job_id("sbatch: error: Batch job submission failed"),
            Err(SchedError::SubmissionParse { .. })
        ));
        assert!(matches!(
            adapter.parse_job_id("Submitted batch job"),
            Err(SchedError::SubmissionParse { .. })
        ));
        assert!(adapter.parse_job_id("Submitted batch job abc").is_err());
    }

    #[tokio::test]
    async fn test_submit() {
        let adapter = canned(vec![(
            "sbatch",
            Ok(CommandOutput::ok("Submitted batch job 991\n")),
        )]);
        let id = adapter.submit(Path::new("/scratch/a.sh")).await.unwrap();
        assert_eq!(id, NativeJobId(991));
    }

    #[tokio::test]
    async fn test_submit_reports_failure() {
        let adapter = canned(vec![(
            "sbatch",
            Ok(CommandOutput::failed(1, "Socket timed out on send/recv operation")),
        )]);
        let err = adapter.submit(Path::new("/scratch/a.sh")).await.unwrap_err();
        assert!(matches!(err, SchedError::SubmitFailed { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_poll_status_codes() {
        for (code, expected) in [
            ("R\n", JobState::Running),
            ("CG\n", JobState::Done),
            ("PD\n", JobState::Queued),
            ("S\n", JobState::Queued),
        ] {
            let adapter = canned(vec![("squeue", Ok(CommandOutput::ok(code)))]);
            assert_eq!(adapter.poll_status(NativeJobId(1)).await, expected);
        }
    }

    #[tokio::test]
    async fn test_poll_status_falls_back_to_sacct() {
        let adapter = canned(vec![
            ("squeue", Ok(CommandOutput::ok(""))),
            ("sacct", Ok(CommandOutput::ok("COMPLETED\n"))),
        ]);
        assert_eq!(adapter.poll_status(NativeJobId(5)).await, JobState::Done);

        let adapter = canned(vec![
            (
                "squeue",
                Ok(CommandOutput::failed(1, "slurm_load_jobs error: Invalid job id")),
            ),
            ("sacct", Ok(CommandOutput::ok("CANCELLED by 1001\n"))),
        ]);
        assert_eq!(adapter.poll_status(NativeJobId(5)).await, JobState::Failed);
    }

    #[tokio::test]
    async fn test_poll_status_never_raises() {
        let adapter = canned(vec![
            (
                "squeue",
                Err(SchedError::CommandError {
                    command: "squeue".to_string(),
                    message: "connection refused".to_string(),
                }),
            ),
            ("sacct", Ok(CommandOutput::failed(1, "sacct: error"))),
        ]);
        assert_eq!(adapter.poll_status(NativeJobId(5)).await, JobState::Unknown);

        let adapter = canned(vec![
            ("squeue", Ok(CommandOutput::ok("\n\n"))),
            ("sacct", Ok(CommandOutput::ok(""))),
        ]);
        assert_eq!(adapter.poll_status(NativeJobId(5)).await, JobState::Unknown);
    }

    #[tokio::test]
    async fn test_cancel() {
        let adapter = canned(vec![("scancel", Ok(CommandOutput::ok("")))]);
        adapter.cancel(NativeJobId(3)).await.unwrap();

        let adapter = canned(vec![(
            "scancel",
            Ok(CommandOutput::failed(1, "Invalid job id specified")),
        )]);
        assert!(adapter.cancel(NativeJobId(3)).await.is_err());
    }
}
