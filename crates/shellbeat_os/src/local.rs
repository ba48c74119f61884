use crate::{trim_output, Client, ExecutionFailure, ExecutionRequest, ExecutionResult};
use async_trait::async_trait;
use shellbeat_core::ShellError;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// Runs the check as a child process on this machine. Holds no connection,
/// so `connect`, `reconnect` and `close` do nothing.
pub struct LocalExecutor {
    timeout: Duration,
}

impl LocalExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(16))
    }
}

#[async_trait]
impl Client for LocalExecutor {
    fn name(&self) -> &str {
        "localhost"
    }

    async fn connect(&self) -> Result<(), ShellError> {
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), ShellError> {
        Ok(())
    }

    async fn close(&self) {}

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionFailure> {
        let timeout = request.timeout.unwrap_or(self.timeout);

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take down grandchildren too.
        #[cfg(unix)]
        cmd.process_group(0);
        if !request.dir.is_empty() {
            cmd.current_dir(&request.dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ShellError::Execution(format!("{}: {}", request.command, e)))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut output = Vec::new();
        let work = async {
            read_combined(stdout, stderr, &mut output).await?;
            child.wait().await
        };
        let outcome = tokio::time::timeout(timeout, work).await;

        let text = String::from_utf8_lossy(&output);
        let text = trim_output(&text);
        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ExecutionFailure::new(ShellError::Execution(e.to_string()), text));
            }
            Err(_) => {
                kill_tree(&mut child).await;
                return Err(ExecutionFailure::new(
                    ShellError::Timeout(format!("{} killed after {:?}", request.command, timeout)),
                    text,
                ));
            }
        };

        match status.code() {
            Some(0) => Ok(ExecutionResult::success(text)),
            Some(code) => {
                tracing::debug!("{} exited with status {}", request.command, code);
                Ok(ExecutionResult::exited(text, code, &format!("exit status {}", code)))
            }
            // Terminated by a signal we did not send
            None => Err(ExecutionFailure::new(
                ShellError::Execution(format!("{}: {}", request.command, status)),
                text,
            )),
        }
    }
}

/// Kill the child and everything in its process group.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain syscall on a pgid we created; no memory is touched.
        if unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) } != 0 {
            tracing::debug!("killpg {} failed: {}", pid, std::io::Error::last_os_error());
        }
    }
    let _ = child.kill().await;
}

/// Drain stdout and stderr concurrently into `combined`, in arrival order.
/// Whatever arrived stays in `combined` if the caller gives up early.
async fn read_combined<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
    combined: &mut Vec<u8>,
) -> std::io::Result<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let (mut out_open, mut err_open) = (stdout.is_some(), stderr.is_some());
    let (mut stdout, mut stderr) = (stdout, stderr);
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];

    while out_open || err_open {
        tokio::select! {
            n = read_opt(&mut stdout, &mut out_buf), if out_open => {
                match n? {
                    0 => out_open = false,
                    n => combined.extend_from_slice(&out_buf[..n]),
                }
            }
            n = read_opt(&mut stderr, &mut err_buf), if err_open => {
                match n? {
                    0 => err_open = false,
                    n => combined.extend_from_slice(&err_buf[..n]),
                }
            }
        }
    }
    Ok(())
}

async fn read_opt<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => Ok(0),
    }
}
