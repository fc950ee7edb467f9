//! Execution of scheduler command-line tools.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::process::Command;

use crate::error::{SchedError, SchedResult};

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Best description of why the command failed.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {:?}", self.exit_code)
        } else {
            stderr.to_string()
        }
    }
}

/// Runs external programs on behalf of an adapter.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and capture its output.
    ///
    /// A non-zero exit is not an error here; only failing to run the
    /// program at all is.
    async fn run(&self, program: &str, args: &[String]) -> SchedResult<CommandOutput>;
}

/// Runs commands as local subprocesses, killing them after a timeout.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> SchedResult<CommandOutput> {
        tracing::trace!("running {} {}", program, args.join(" "));

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| SchedError::CommandError {
            command: program.to_string(),
            message: format!("timed out after {:?}", self.timeout),
        })?
        .map_err(|e| SchedError::CommandError {
            command: program.to_string(),
            message: e.to_string(),
        })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Replays canned replies per program instead of running anything.
///
/// Replies for a program are consumed in order; the last one repeats.
/// Programs without replies behave like a missing binary (exit 127).
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    state: Mutex<ScriptState>,
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: FxHashMap<String, VecDeque<Reply>>,
    calls: Vec<String>,
}

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    Unavailable(String),
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an output for `program`.
    pub fn reply(self, program: &str, output: CommandOutput) -> Self {
        self.push(program, Reply::Output(output));
        self
    }

    /// Queue a failure to run `program` at all.
    pub fn unavailable(self, program: &str, message: &str) -> Self {
        self.push(program, Reply::Unavailable(message.to_string()));
        self
    }

    /// Every command line run so far.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of times `program` was run.
    pub fn call_count(&self, program: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.split(' ').next() == Some(program))
            .count()
    }

    fn push(&self, program: &str, reply: Reply) {
        self.lock()
            .replies
            .entry(program.to_string())
            .or_default()
            .push_back(reply);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> SchedResult<CommandOutput> {
        let reply = {
            let mut state = self.lock();
            let mut line = program.to_string();
            for arg in args {
                line.push(' ');
                line.push_str(arg);
            }
            state.calls.push(line);

            match state.replies.get_mut(program) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Unavailable(message)) => Err(SchedError::CommandError {
                command: program.to_string(),
                message,
            }),
            None => Ok(CommandOutput::failed(
                127,
                format!("{program}: command not found"),
            )),
        }
    }
}
