pub mod deadline;
pub mod docker;
pub mod framing;
pub mod local;
pub mod scp;
pub mod ssh;
pub mod sudo;

pub use docker::{DockerExecutor, DockerTarget};
pub use local::LocalExecutor;
pub use ssh::{SshExecutor, SshTarget};

use async_trait::async_trait;
use shellbeat_core::ShellError;
use std::time::Duration;
use thiserror::Error;

/// Client trait: one live session to a target that can run a single command at a time.
///
/// Implementors:
/// - `LocalExecutor`: child process on this machine
/// - `SshExecutor`: persistent SSH connection, one session per command
/// - `DockerExecutor`: long-lived attached exec stream inside a container
#[async_trait]
pub trait Client: Send + Sync {
    /// Executor label (for logs and events)
    fn name(&self) -> &str;

    /// Establish the transport. No-op when already connected; a failure is
    /// cached and returned to every caller until `reconnect` or `close`.
    async fn connect(&self) -> Result<(), ShellError>;

    /// Tear down and connect again from scratch.
    async fn reconnect(&self) -> Result<(), ShellError> {
        self.close().await;
        self.connect().await
    }

    /// Release the transport and reset cached state. Safe when already closed.
    async fn close(&self);

    /// Run exactly one command. Calls on the same client are serialized.
    /// A failure still carries the output read before it happened.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionFailure>;

    /// Convenience form of `execute` returning only the output text.
    async fn run(&self, dir: &str, command: &str, args: &[String]) -> Result<String, ShellError> {
        let request = ExecutionRequest::new(command).with_dir(dir).with_args(args.to_vec());
        self.execute(&request)
            .await
            .map(|result| result.output)
            .map_err(|failure| failure.error)
    }

    /// Upload capability, if this executor has one.
    fn as_uploader(&self) -> Option<&dyn UploadClient> {
        None
    }
}

/// Optional capability: stage a local file on the target.
#[async_trait]
pub trait UploadClient: Send + Sync {
    async fn upload_file(&self, source: &str, dest: &str, mode: &str) -> Result<(), ShellError>;
}

/// One command to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub command: String,
    pub args: Vec<String>,
    pub dir: String,
    /// Overrides the executor's configured timeout.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell command line for remote executors.
    pub fn command_line(&self) -> String {
        build_command(&self.dir, &self.command, &self.args)
    }
}

/// How a command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    /// Clean exit with a non-zero code. The description is already in the output.
    NonZeroExit(i32),
    TimedOut,
    TransportError,
}

impl ExecStatus {
    /// Status for a failed `execute` call.
    pub fn of_error(err: &ShellError) -> Self {
        match err {
            ShellError::Timeout(_) => ExecStatus::TimedOut,
            _ => ExecStatus::TransportError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub output: String,
    pub status: ExecStatus,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            status: ExecStatus::Success,
        }
    }

    /// Non-zero exit: the exit description is appended to the output.
    pub fn exited(output: &str, code: i32, description: &str) -> Self {
        Self {
            output: format!("{}. {}", output, description),
            status: ExecStatus::NonZeroExit(code),
        }
    }
}

/// A failed `execute` together with the partial output gathered so far.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    pub error: ShellError,
    /// Status is `TimedOut` or `TransportError`.
    pub partial: ExecutionResult,
}

impl ExecutionFailure {
    pub fn new(error: ShellError, output: impl Into<String>) -> Self {
        let partial = ExecutionResult {
            output: output.into(),
            status: ExecStatus::of_error(&error),
        };
        Self { error, partial }
    }
}

impl From<ShellError> for ExecutionFailure {
    fn from(error: ShellError) -> Self {
        Self::new(error, String::new())
    }
}

/// `cd <dir> && <command> <args...>`, or just the command when `dir` is empty.
pub fn build_command(dir: &str, command: &str, args: &[String]) -> String {
    let mut line = String::new();
    if !dir.is_empty() {
        line.push_str("cd ");
        line.push_str(dir);
        line.push_str(" && ");
    }
    line.push_str(command);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Strip the newlines that surround captured output.
pub fn trim_output(output: &str) -> &str {
    output.trim_matches(|c| c == '\n' || c == '\r')
}
