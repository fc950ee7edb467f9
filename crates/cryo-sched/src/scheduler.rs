//! Batch scheduler abstraction.
//!
//! A [`SchedulerAdapter`] knows three things about one scheduler family:
//! how resource requests are spelled as script directives, where the job id
//! sits in the submission output, and where the state code sits in the
//! status output. Everything else (script layout, running the submission
//! and status commands, translating codes through the
//! [`SchedulerProfile`]) is shared through default methods.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};
use crate::job::{Job, JobState, NativeJobId, ResourceRequest};
use crate::pbs::PbsAdapter;
use crate::runner::CommandRunner;
use crate::slurm::SlurmAdapter;

/// The family of HPC batch scheduler to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// SLURM (`sbatch`, `squeue`, `sacct`, `scancel`).
    #[default]
    Slurm,
    /// PBS / Torque (`qsub`, `qstat`, `qdel`).
    Pbs,
}

impl SchedulerKind {
    /// Built-in profile for this scheduler family.
    pub fn default_profile(&self) -> SchedulerProfile {
        match self {
            SchedulerKind::Slurm => crate::slurm::default_profile(),
            SchedulerKind::Pbs => crate::pbs::default_profile(),
        }
    }

    /// Build an adapter, optionally overriding the built-in profile.
    pub fn build_adapter(
        &self,
        profile: Option<SchedulerProfile>,
        runner: Arc<dyn CommandRunner>,
    ) -> Arc<dyn SchedulerAdapter> {
        let profile = profile.unwrap_or_else(|| self.default_profile());
        match self {
            SchedulerKind::Slurm => Arc::new(SlurmAdapter::with_runner(profile, runner)),
            SchedulerKind::Pbs => Arc::new(PbsAdapter::with_runner(profile, runner)),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slurm" => Ok(SchedulerKind::Slurm),
            "pbs" | "torque" => Ok(SchedulerKind::Pbs),
            other => Err(SchedError::ConfigError(format!(
                "Unknown scheduler '{other}': expected slurm or pbs"
            ))),
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerKind::Slurm => f.write_str("slurm"),
            SchedulerKind::Pbs => f.write_str("pbs"),
        }
    }
}

/// A command line with one placeholder (`{script}` or `{id}`).
///
/// If no argument contains the placeholder the value is appended as the
/// last argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(pub Vec<String>);

impl CommandTemplate {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(argv.into_iter().map(Into::into).collect())
    }

    /// Program name, for error messages.
    pub fn program(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or("")
    }

    /// Substitute `placeholder` and split into program and arguments.
    pub fn render(&self, placeholder: &str, value: &str) -> SchedResult<(String, Vec<String>)> {
        let (program, rest) = self
            .0
            .split_first()
            .ok_or_else(|| SchedError::ConfigError("Empty scheduler command".to_string()))?;

        let mut substituted = false;
        let mut args: Vec<String> = rest
            .iter()
            .map(|arg| {
                if arg.contains(placeholder) {
                    substituted = true;
                    arg.replace(placeholder, value)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(value.to_string());
        }

        Ok((program.clone(), args))
    }
}

impl std::fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Immutable per-scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerProfile {
    /// Interpreter named on the first script line.
    pub shell: String,

    /// Comment token that marks a directive line (e.g. `#SBATCH`).
    pub directive_prefix: String,

    /// Submission command; `{script}` is replaced by the script path.
    pub submit_command: CommandTemplate,

    /// Single-job status command; `{id}` is replaced by the job id.
    pub status_command: CommandTemplate,

    /// Consulted when the live status command reports nothing, e.g. after
    /// the job has left the queue.
    #[serde(default)]
    pub finished_status_command: Option<CommandTemplate>,

    /// Cancellation command used after a poll timeout.
    #[serde(default)]
    pub cancel_command: Option<CommandTemplate>,

    /// Whitespace-separated position of the job id in the submission output.
    #[serde(default)]
    pub job_id_token: usize,

    /// Extra directive lines, written after the resource directives.
    #[serde(default)]
    pub additional_directives: Vec<String>,

    /// Shell lines run before the command (module loads and the like).
    #[serde(default)]
    pub pre_exec_lines: Vec<String>,

    /// Native status code to uniform state.
    pub status_codes: FxHashMap<String, JobState>,
}

impl SchedulerProfile {
    /// Translate a native status code.
    ///
    /// Codes missing from the table mean the job is still known to the
    /// scheduler, so they count as `Queued` and never as a terminal state.
    pub fn translate(&self, code: &str) -> JobState {
        let code = code.trim();
        self.status_codes
            .get(code)
            .or_else(|| self.status_codes.get(&code.to_uppercase()))
            .copied()
            .unwrap_or(JobState::Queued)
    }

    pub fn with_additional_directive(mut self, directive: impl Into<String>) -> Self {
        self.additional_directives.push(directive.into());
        self
    }

    pub fn with_pre_exec_line(mut self, line: impl Into<String>) -> Self {
        self.pre_exec_lines.push(line.into());
        self
    }
}

pub(crate) fn status_table(entries: &[(&str, JobState)]) -> FxHashMap<String, JobState> {
    entries
        .iter()
        .map(|(code, state)| ((*code).to_string(), *state))
        .collect()
}

/// Translation between jobs and one scheduler family.
#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    /// Scheduler family.
    fn kind(&self) -> SchedulerKind;

    /// Profile in effect.
    fn profile(&self) -> &SchedulerProfile;

    /// Executes scheduler commands.
    fn runner(&self) -> &dyn CommandRunner;

    /// File extension for submission scripts.
    fn script_extension(&self) -> &'static str {
        "sh"
    }

    /// Directive bodies (without prefix) for the populated resource fields,
    /// in the fixed order: wall time, nodes, memory, memory per core,
    /// queue, account.
    fn resource_directives(&self, resources: &ResourceRequest) -> Vec<String>;

    /// Apply one directive body (without prefix) to `resources`.
    /// Unrecognised directives are ignored.
    fn apply_directive(&self, directive: &str, resources: &mut ResourceRequest);

    /// Extract the single status token from status command output.
    fn parse_status_token(&self, output: &str) -> Option<String>;

    /// Render the submission script for a job.
    fn build_submission_script(&self, job: &Job) -> String {
        let profile = self.profile();
        let prefix = &profile.directive_prefix;
        let mut script = format!("#!{}\n", profile.shell);

        for directive in self.resource_directives(&job.resources) {
            script.push_str(&format!("{prefix} {directive}\n"));
        }
        for directive in &profile.additional_directives {
            script.push_str(&format!("{prefix} {directive}\n"));
        }

        script.push('\n');
        if !profile.pre_exec_lines.is_empty() {
            for line in &profile.pre_exec_lines {
                script.push_str(line);
                script.push('\n');
            }
            script.push('\n');
        }

        script.push_str(&job.command);
        script.push('\n');
        script
    }

    /// Recover the resource request from a script's directive lines.
    fn parse_directives(&self, script: &str) -> ResourceRequest {
        let prefix = self.profile().directive_prefix.as_str();
        let mut resources = ResourceRequest::default();
        for line in script.lines() {
            if let Some(body) = line.trim().strip_prefix(prefix) {
                if body.starts_with(char::is_whitespace) {
                    self.apply_directive(body.trim(), &mut resources);
                }
            }
        }
        resources
    }

    /// Parse the submission output into a job id.
    ///
    /// The configured whitespace-separated token is used; anything after a
    /// `.` (Torque appends the server name) is dropped before the numeric
    /// parse.
    fn parse_job_id(&self, output: &str) -> SchedResult<NativeJobId> {
        let profile = self.profile();
        output
            .split_whitespace()
            .nth(profile.job_id_token)
            .and_then(|token| token.split('.').next())
            .and_then(|digits| digits.parse::<u64>().ok())
            .map(NativeJobId)
            .ok_or_else(|| SchedError::SubmissionParse {
                command: profile.submit_command.program().to_string(),
                output: output.trim().to_string(),
            })
    }

    /// Hand a written script to the scheduler.
    async fn submit(&self, script_path: &Path) -> SchedResult<NativeJobId> {
        let profile = self.profile();
        let script = script_path.display().to_string();
        let (program, args) = profile.submit_command.render("{script}", &script)?;

        let output = self
            .runner()
            .run(&program, &args)
            .await
            .map_err(|e| SchedError::SubmitFailed {
                command: program.clone(),
                message: e.to_string(),
            })?;

        if !output.success() {
            return Err(SchedError::SubmitFailed {
                command: program,
                message: output.failure_message(),
            });
        }

        self.parse_job_id(&output.stdout)
    }

    /// Poll the state of one job. Never fails: any trouble reading the
    /// scheduler yields [`JobState::Unknown`].
    async fn poll_status(&self, id: NativeJobId) -> JobState {
        let profile = self.profile();
        if let Some(token) = self.query_status_token(&profile.status_command, id).await {
            return profile.translate(&token);
        }
        if let Some(command) = &profile.finished_status_command {
            if let Some(token) = self.query_status_token(command, id).await {
                return profile.translate(&token);
            }
        }
        JobState::Unknown
    }

    /// Run one status command and extract its token.
    async fn query_status_token(&self, command: &CommandTemplate, id: NativeJobId) -> Option<String> {
        let (program, args) = command.render("{id}", &id.to_string()).ok()?;
        match self.runner().run(&program, &args).await {
            Ok(output) if output.success() => {
                let token = self.parse_status_token(&output.stdout);
                if token.is_none() {
                    tracing::debug!("{} reported nothing for job {}", program, id);
                }
                token
            }
            Ok(output) => {
                tracing::debug!(
                    "{} for job {} exited with {:?}: {}",
                    program,
                    id,
                    output.exit_code,
                    output.stderr.trim()
                );
                None
            }
            Err(e) => {
                tracing::debug!("{} for job {} could not run: {}", program, id, e);
                None
            }
        }
    }

    /// Ask the scheduler to drop a job.
    async fn cancel(&self, id: NativeJobId) -> SchedResult<()> {
        let Some(command) = &self.profile().cancel_command else {
            return Ok(());
        };
        let (program, args) = command.render("{id}", &id.to_string())?;
        let output = self.runner().run(&program, &args).await?;
        if output.success() {
            Ok(())
        } else {
            Err(SchedError::CommandError {
                command: program,
                message: output.failure_message(),
            })
        }
    }
}
