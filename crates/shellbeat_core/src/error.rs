//! Error taxonomy shared by every executor and the job orchestrator.
//!
//! A non-zero exit of the checked command is deliberately absent: executors
//! fold the exit description into the output text and let the validator judge.

use thiserror::Error;

/// Transport, configuration and upload failures reported by a `Client`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShellError {
    /// Ambiguous or missing container, malformed upload spec, missing credentials.
    #[error("configuration error: {0}")]
    Config(String),

    /// Dial or authentication failure.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A dial, read, write or process deadline passed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The remote side closed the stream before reporting an exit status.
    #[error("Connection is disconnected by the timeout or lost")]
    ConnectionLost,

    /// Any other session or stream failure, surfaced verbatim.
    #[error("{0}")]
    Transport(String),

    /// Local process could not be spawned or read.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("{0} doesn't have the upload function")]
    UploadNotSupported(String),
}

impl ShellError {
    /// Whether running the same check again could plausibly succeed.
    ///
    /// Configuration errors are the only ones retrying can never fix.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ShellError::Config(_))
    }

    /// Transport-level failures invalidate a cached connection.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ShellError::Connection(_)
                | ShellError::Timeout(_)
                | ShellError::ConnectionLost
                | ShellError::Transport(_)
        )
    }
}

impl From<std::io::Error> for ShellError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => ShellError::Timeout(e.to_string()),
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => ShellError::ConnectionLost,
            _ => ShellError::Transport(e.to_string()),
        }
    }
}

/// The validator rejected the command output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
