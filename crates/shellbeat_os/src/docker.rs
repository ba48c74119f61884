//! Container checks over one long-lived attached `/bin/sh` exec.

use crate::framing::{eof_token, read_until_sentinel, sentinel_script, tar_archive};
use crate::{
    trim_output, Client, ExecutionFailure, ExecutionRequest, ExecutionResult, UploadClient,
};
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, LogOutput, UploadToContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::ContainerSummary;
use bollard::Docker;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use shellbeat_core::upload::{parse_mode, split_destination};
use shellbeat_core::ShellError;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

/// Which Docker daemon to talk to and how to find the container.
#[derive(Debug, Clone)]
pub struct DockerTarget {
    /// Empty for local defaults, `unix://...` for a socket, otherwise an HTTP endpoint.
    pub endpoint: String,
    /// `key:value` list filters, e.g. `label:app=web` or `name:nginx`.
    pub filters: Vec<String>,
    pub timeout: Duration,
}

struct ExecSession {
    container_id: String,
    output: BoxStream<'static, Result<Bytes, bollard::errors::Error>>,
    input: Pin<Box<dyn AsyncWrite + Send>>,
    /// Bytes read past the last sentinel.
    carry: Vec<u8>,
}

impl ExecSession {
    /// Send one framed script and read up to its sentinel, returning the
    /// echoed exit status. Output lands in `output` as it arrives.
    async fn exchange(
        &mut self,
        script: &str,
        token: &str,
        output: &mut String,
    ) -> Result<Option<i32>, ShellError> {
        self.input.write_all(script.as_bytes()).await?;
        self.input.flush().await?;
        read_until_sentinel(&mut self.output, &mut self.carry, token, output).await
    }
}

enum SessionState {
    Disconnected,
    Connected(ExecSession),
    Failed(ShellError),
}

pub struct DockerExecutor {
    target: DockerTarget,
    name: String,
    /// Cached API handle; lookups hold the read side, reconnect takes the write side.
    api: RwLock<Option<Docker>>,
    /// Exec session; holding it serializes commands.
    session: Mutex<SessionState>,
}

impl DockerExecutor {
    pub fn new(target: DockerTarget) -> Self {
        let name = format!("docker:{}", target.filters.join(","));
        Self {
            target,
            name,
            api: RwLock::new(None),
            session: Mutex::new(SessionState::Disconnected),
        }
    }

    /// Get or create the Docker API handle.
    async fn docker(&self) -> Result<Docker, ShellError> {
        {
            let guard = self.api.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = connect_api(&self.target.endpoint, self.target.timeout)?;
        *self.api.write().await = Some(docker.clone());
        Ok(docker)
    }

    /// The single container matching the configured filters.
    pub async fn resolve_container(&self) -> Result<ContainerSummary, ShellError> {
        let filters = parse_filters(&self.target.filters)?;
        let docker = self.docker().await?;
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = {
            let _lookup = self.api.read().await;
            tokio::time::timeout(self.target.timeout, docker.list_containers(Some(options)))
                .await
                .map_err(|_| ShellError::Timeout(format!("listing containers for {}", self.name)))?
                .map_err(|e| ShellError::Connection(format!("listing containers: {}", e)))?
        };
        select_single(containers, &self.target.filters)
    }

    async fn open_session(&self) -> Result<ExecSession, ShellError> {
        let container = self.resolve_container().await?;
        let container_id = container.id.unwrap_or_default();
        let docker = self.docker().await?;

        let open = async {
            let exec = docker
                .create_exec(
                    &container_id,
                    CreateExecOptions {
                        attach_stdin: Some(true),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        tty: Some(false),
                        cmd: Some(vec!["/bin/sh".to_string()]),
                        ..Default::default()
                    },
                )
                .await?;
            docker
                .start_exec(
                    &exec.id,
                    Some(StartExecOptions {
                        detach: false,
                        ..Default::default()
                    }),
                )
                .await
        };

        let started = tokio::time::timeout(self.target.timeout, open)
            .await
            .map_err(|_| ShellError::Timeout(format!("attaching to {}", container_id)))?
            .map_err(|e| ShellError::Connection(format!("attaching to {}: {}", container_id, e)))?;

        match started {
            StartExecResults::Attached { output, input } => Ok(ExecSession {
                container_id,
                output: output.map(|frame| frame.map(LogOutput::into_bytes)).boxed(),
                input,
                carry: Vec::new(),
            }),
            StartExecResults::Detached => Err(ShellError::Connection(format!(
                "exec in {} started detached",
                container_id
            ))),
        }
    }

    async fn connect_locked(&self, state: &mut SessionState) -> Result<(), ShellError> {
        match state {
            SessionState::Connected(_) => return Ok(()),
            SessionState::Failed(e) => return Err(e.clone()),
            SessionState::Disconnected => {}
        }
        match self.open_session().await {
            Ok(session) => {
                tracing::info!("Attached to container {} for {}", session.container_id, self.name);
                *state = SessionState::Connected(session);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to attach for {}: {}", self.name, e);
                *state = SessionState::Failed(e.clone());
                Err(e)
            }
        }
    }

    /// Forget the session and the API handle so the container is looked up again.
    async fn reset_locked(&self, state: &mut SessionState) {
        *state = SessionState::Disconnected;
        *self.api.write().await = None;
    }
}

#[async_trait]
impl Client for DockerExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), ShellError> {
        let mut state = self.session.lock().await;
        self.connect_locked(&mut state).await
    }

    async fn reconnect(&self) -> Result<(), ShellError> {
        let mut state = self.session.lock().await;
        tracing::info!("Reconnect for {}", self.name);
        self.reset_locked(&mut state).await;
        self.connect_locked(&mut state).await
    }

    async fn close(&self) {
        let mut state = self.session.lock().await;
        if matches!(*state, SessionState::Connected(_)) {
            tracing::info!("Close the exec session for {}", self.name);
        }
        self.reset_locked(&mut state).await;
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionFailure> {
        let mut state = self.session.lock().await;

        if self.connect_locked(&mut state).await.is_err() {
            tracing::info!("Reconnect for {}", self.name);
            self.reset_locked(&mut state).await;
            if let Err(e) = self.connect_locked(&mut state).await {
                tracing::error!("Reconnect failed for {}, reason is {}", self.name, e);
                return Err(e.into());
            }
        }
        let SessionState::Connected(session) = &mut *state else {
            return Err(ShellError::ConnectionLost.into());
        };

        let token = eof_token();
        let script = sentinel_script(&request.command_line(), &token);
        tracing::debug!("Run command {} for {}", request.command_line(), self.name);

        let timeout = request.timeout.unwrap_or(self.target.timeout);
        let mut output = String::new();
        let read = tokio::time::timeout(timeout, session.exchange(&script, &token, &mut output))
            .await;
        let text = trim_output(&output);

        let error = match read {
            Ok(Ok(Some(code))) if code != 0 => {
                return Ok(ExecutionResult::exited(text, code, &format!("exit status {}", code)));
            }
            Ok(Ok(_)) => return Ok(ExecutionResult::success(text)),
            Ok(Err(e)) => e,
            Err(_) => ShellError::Timeout(format!(
                "no end-of-output marker from {} within {:?}",
                request.command, timeout
            )),
        };

        tracing::warn!("Exec session for {} broke: {}", self.name, error);
        // The stream position is unknown now; start over next time.
        *state = SessionState::Failed(error.clone());
        Err(ExecutionFailure::new(error, text))
    }

    fn as_uploader(&self) -> Option<&dyn UploadClient> {
        Some(self)
    }
}

#[async_trait]
impl UploadClient for DockerExecutor {
    async fn upload_file(&self, source: &str, dest: &str, mode: &str) -> Result<(), ShellError> {
        let content = tokio::fs::read(source)
            .await
            .map_err(|e| ShellError::Upload(format!("read {}: {}", source, e)))?;
        let (dir, name) = split_destination(source, dest);
        let dir = if dir.is_empty() { "/".to_string() } else { dir };

        self.run("", "mkdir", &["-p".to_string(), dir.clone()]).await?;

        let archive = tar_archive(&name, &content, parse_mode(mode).unwrap_or(0o755))?;
        let container_id = self.resolve_container().await?.id.unwrap_or_default();
        let docker = self.docker().await?;

        tracing::info!(
            "Upload {} ({} bytes) to {}:{}{} mode {}",
            source,
            content.len(),
            container_id,
            dir,
            name,
            mode
        );
        let options = UploadToContainerOptions {
            path: dir,
            ..Default::default()
        };
        tokio::time::timeout(
            self.target.timeout,
            docker.upload_to_container(&container_id, Some(options), archive.into()),
        )
        .await
        .map_err(|_| ShellError::Timeout(format!("uploading {} to {}", source, container_id)))?
        .map_err(|e| ShellError::Upload(e.to_string()))
    }
}

fn connect_api(endpoint: &str, timeout: Duration) -> Result<Docker, ShellError> {
    let secs = timeout.as_secs().max(1);
    let docker = if endpoint.is_empty() {
        Docker::connect_with_local_defaults()
    } else if endpoint.starts_with("unix://") {
        Docker::connect_with_unix(endpoint, secs, bollard::API_DEFAULT_VERSION)
    } else {
        Docker::connect_with_http(endpoint, secs, bollard::API_DEFAULT_VERSION)
    };
    docker.map_err(|e| ShellError::Connection(format!("docker endpoint '{}': {}", endpoint, e)))
}

/// `key:value` strings into list filters. Values may themselves contain `:`.
pub fn parse_filters(filters: &[String]) -> Result<HashMap<String, Vec<String>>, ShellError> {
    let mut parsed: HashMap<String, Vec<String>> = HashMap::new();
    for filter in filters {
        match filter.split_once(':') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
                parsed
                    .entry(key.trim().to_string())
                    .or_default()
                    .push(value.trim().to_string());
            }
            _ => tracing::warn!("Ignoring malformed docker filter '{}'", filter),
        }
    }
    if parsed.is_empty() {
        return Err(ShellError::Config(format!(
            "no usable docker filter in {:?}",
            filters
        )));
    }
    Ok(parsed)
}

/// Exactly one container must match; anything else is a configuration problem.
pub fn select_single(
    mut containers: Vec<ContainerSummary>,
    filters: &[String],
) -> Result<ContainerSummary, ShellError> {
    match containers.len() {
        0 => Err(ShellError::Config(format!(
            "Container {:?} does not exist",
            filters
        ))),
        1 => Ok(containers.remove(0)),
        n => Err(ShellError::Config(format!(
            "Return {} containers with filter {:?}, expected 1",
            n, filters
        ))),
    }
}
