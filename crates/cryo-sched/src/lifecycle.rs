//! Job lifecycle: script, submission with retry, and polling to completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::clock::{Clock, TokioClock};
use crate::error::{SchedError, SchedResult};
use crate::job::{Job, JobState, NativeJobId};
use crate::scheduler::SchedulerAdapter;

/// Submission retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Wait between failed submission attempts.
    pub submit_retry_interval: Duration,

    /// Give up after this many attempts; `None` retries forever.
    pub max_submit_attempts: Option<u32>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            submit_retry_interval: Duration::from_secs(30),
            max_submit_attempts: None,
        }
    }
}

/// Drives one job at a time through its scheduler.
pub struct JobLifecycleManager {
    adapter: Arc<dyn SchedulerAdapter>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl JobLifecycleManager {
    /// Create a manager using the wall clock and the default retry policy.
    pub fn new(adapter: Arc<dyn SchedulerAdapter>) -> Self {
        Self {
            adapter,
            clock: Arc::new(TokioClock),
            config: LifecycleConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn adapter(&self) -> &dyn SchedulerAdapter {
        self.adapter.as_ref()
    }

    /// Render the job's script into its working directory.
    pub async fn write_script(&self, job: &Job) -> SchedResult<PathBuf> {
        let path = job.script_path(self.adapter.script_extension());
        fs::create_dir_all(&job.working_dir).await?;
        fs::write(&path, self.adapter.build_submission_script(job)).await?;
        Ok(path)
    }

    /// Submit a pending job, retrying through scheduler outages.
    ///
    /// Only transient failures are retried. The script is written once,
    /// before the first attempt.
    pub async fn submit(&self, job: &mut Job) -> SchedResult<NativeJobId> {
        if job.state() != JobState::Pending {
            return Err(SchedError::InvalidJobState {
                expected: JobState::Pending.to_string(),
                found: job.state().to_string(),
            });
        }

        let script_path = self.write_script(job).await?;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.adapter.submit(&script_path).await {
                Ok(id) => {
                    job.mark_submitted(id);
                    info!(
                        "Submitted job {} to {} as {} (attempt {})",
                        job.name,
                        self.adapter.kind(),
                        id,
                        attempts
                    );
                    return Ok(id);
                }
                Err(e) if e.is_transient() => {
                    if let Some(max) = self.config.max_submit_attempts {
                        if attempts >= max {
                            return Err(SchedError::SubmissionExhausted {
                                job: job.name.clone(),
                                attempts,
                                last_error: e.to_string(),
                            });
                        }
                    }
                    warn!(
                        "Submission of job {} failed (attempt {}): {}; retrying in {:?}",
                        job.name, attempts, e, self.config.submit_retry_interval
                    );
                    self.clock.sleep(self.config.submit_retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll a submitted job until it finishes.
    ///
    /// `Unknown` observations are tolerated. Past `timeout` the job is
    /// cancelled (best effort) and `PollTimeout` is returned.
    pub async fn await_completion(
        &self,
        job: &mut Job,
        poll_interval: Duration,
        timeout: Duration,
    ) -> SchedResult<JobState> {
        let Some(id) = job.native_id() else {
            return Err(SchedError::InvalidJobState {
                expected: "submitted".to_string(),
                found: job.state().to_string(),
            });
        };

        let start = self.clock.now();
        loop {
            let observed = self.adapter.poll_status(id).await;
            job.observe(observed);
            debug!("Job {} ({}) is {}", job.name, id, job.state());

            if job.state().is_terminal() {
                return Ok(job.state());
            }

            let waited = self.clock.now().saturating_duration_since(start);
            if waited >= timeout {
                if let Err(e) = self.adapter.cancel(id).await {
                    warn!("Could not cancel job {} ({}): {}", job.name, id, e);
                }
                return Err(SchedError::PollTimeout {
                    job: job.name.clone(),
                    native_id: id.to_string(),
                    waited,
                });
            }

            self.clock.sleep(poll_interval).await;
        }
    }

    /// Submit and wait in one step.
    pub async fn run(
        &self,
        job: &mut Job,
        poll_interval: Duration,
        timeout: Duration,
    ) -> SchedResult<JobState> {
        self.submit(job).await?;
        self.await_completion(job, poll_interval, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::clock::ManualClock;
    use crate::runner::{CommandOutput, ScriptedRunner};
    use crate::scheduler::SchedulerKind;

    fn manager(runner: Arc<ScriptedRunner>, clock: Arc<ManualClock>) -> JobLifecycleManager {
        let adapter = SchedulerKind::Slurm.build_adapter(None, runner);
        JobLifecycleManager::new(adapter).with_clock(clock)
    }

    fn job(dir: &tempfile::TempDir) -> Job {
        Job::new("ctf-img1", "ctffind4 < answers", dir.path())
    }

    #[tokio::test]
    async fn test_submit_retries_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .reply("sbatch", CommandOutput::failed(1, "Socket timed out"))
                .unavailable("sbatch", "sbatch: not reachable")
                .reply("sbatch", CommandOutput::ok("Submitted batch job 4242\n")),
        );
        let clock = Arc::new(ManualClock::new());
        let lifecycle = manager(runner.clone(), clock.clone());

        let mut job = job(&dir);
        let id = lifecycle.submit(&mut job).await.unwrap();

        assert_eq!(id, NativeJobId(4242));
        assert_eq!(job.native_id(), Some(id));
        assert_eq!(job.state(), JobState::Submitted);
        assert_eq!(runner.call_count("sbatch"), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30); 2]);

        let script = std::fs::read_to_string(dir.path().join("ctf-img1.sh")).unwrap();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.ends_with("ctffind4 < answers\n"));
    }

    #[tokio::test]
    async fn test_submit_gives_up_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new().reply("sbatch", CommandOutput::ok("sbatch: error: invalid")),
        );
        let clock = Arc::new(ManualClock::new());
        let lifecycle = manager(runner.clone(), clock.clone()).with_config(LifecycleConfig {
            submit_retry_interval: Duration::from_secs(5),
            max_submit_attempts: Some(3),
        });

        let mut job = job(&dir);
        let err = lifecycle.submit(&mut job).await.unwrap_err();
        assert!(matches!(err, SchedError::SubmissionExhausted { attempts: 3, .. }));
        assert!(err.is_item_permanent());
        assert_eq!(clock.sleeps().len(), 2);
        assert_eq!(job.native_id(), None);
    }

    #[tokio::test]
    async fn test_submit_requires_pending() {
        let dir = tempfile::tempdir().unwrap();
        let runner =
            Arc::new(ScriptedRunner::new().reply("sbatch", CommandOutput::ok("Submitted batch job 1")));
        let lifecycle = manager(runner.clone(), Arc::new(ManualClock::new()));

        let mut job = job(&dir);
        lifecycle.submit(&mut job).await.unwrap();
        assert!(matches!(
            lifecycle.submit(&mut job).await,
            Err(SchedError::InvalidJobState { .. })
        ));
        assert_eq!(runner.call_count("sbatch"), 1);
    }

    #[tokio::test]
    async fn test_never_polls_before_submission() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new().reply("squeue", CommandOutput::ok("R")));
        let lifecycle = manager(runner.clone(), Arc::new(ManualClock::new()));

        let mut job = job(&dir);
        let result = lifecycle
            .await_completion(&mut job, Duration::from_secs(15), Duration::from_secs(60))
            .await;

        assert!(matches!(result, Err(SchedError::InvalidJobState { .. })));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_await_completion_through_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .reply("sbatch", CommandOutput::ok("Submitted batch job 77"))
                .reply("squeue", CommandOutput::failed(1, "slurm_load_jobs error"))
                .reply("squeue", CommandOutput::ok("R\n"))
                .reply("squeue", CommandOutput::ok(""))
                .reply("sacct", CommandOutput::ok(""))
                .reply("sacct", CommandOutput::ok("COMPLETED\n")),
        );
        let clock = Arc::new(ManualClock::new());
        let lifecycle = manager(runner.clone(), clock.clone());

        let mut job = job(&dir);
        let state = lifecycle
            .run(&mut job, Duration::from_secs(15), Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(state, JobState::Done);
        assert_eq!(runner.call_count("squeue"), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(15); 2]);
    }

    #[tokio::test]
    async fn test_await_completion_times_out_and_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .reply("sbatch", CommandOutput::ok("Submitted batch job 9"))
                .reply("squeue", CommandOutput::ok("PD\n"))
                .reply("scancel", CommandOutput::ok("")),
        );
        let clock = Arc::new(ManualClock::new());
        let lifecycle = manager(runner.clone(), clock.clone());

        let mut job = job(&dir);
        let err = lifecycle
            .run(&mut job, Duration::from_secs(10), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, SchedError::PollTimeout { .. }));
        assert_eq!(runner.call_count("squeue"), 4);
        assert_eq!(runner.call_count("scancel"), 1);
        assert_eq!(job.state(), JobState::Queued);
    }
}
