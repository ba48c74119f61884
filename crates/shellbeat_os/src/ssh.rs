use crate::deadline::{Deadline, DeadlineStream};
use crate::scp::{parse_scp_ack, scp_payload, truncated_ack_message, ScpAck};
use crate::sudo::{PasswordWatcher, PromptReply};
use crate::{
    trim_output, Client, ExecutionFailure, ExecutionRequest, ExecutionResult, UploadClient,
};
use async_trait::async_trait;
use russh::client::Handle;
use russh::*;
use russh_keys::*;
use shellbeat_core::config::expand_home;
use shellbeat_core::upload::split_destination;
use shellbeat_core::ShellError;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Probed hosts are configured by address only, there is no known_hosts to check against.
        Ok(true)
    }
}

/// Where and how to log in.
#[derive(Debug, Clone)]
pub struct SshTarget {
    /// `host:port`
    pub addr: String,
    pub username: String,
    pub password: String,
    /// Inline private key, or `@path` to read it from disk.
    pub key: String,
    /// Run through `sudo` on a PTY, answering the password prompt.
    pub sudo: bool,
    pub timeout: Duration,
}

enum Auth {
    Password(String),
    Key(key::KeyPair),
}

struct Connection {
    handle: Arc<Handle<ClientHandler>>,
}

impl Connection {
    async fn shutdown(self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }
}

enum ConnState {
    Disconnected,
    Connected(Connection),
    Failed(ShellError),
}

/// One persistent authenticated SSH connection; every `run` opens a fresh
/// session on it.
pub struct SshExecutor {
    target: SshTarget,
    name: String,
    state: Mutex<ConnState>,
    run_lock: Mutex<()>,
    deadline: Deadline,
}

impl SshExecutor {
    pub fn new(target: SshTarget) -> Self {
        let name = format!("ssh:{}@{}", target.username, target.addr);
        let deadline = Deadline::new(target.timeout);
        Self {
            target,
            name,
            state: Mutex::new(ConnState::Disconnected),
            run_lock: Mutex::new(()),
            deadline,
        }
    }

    fn auth_method(&self) -> Result<Auth, ShellError> {
        if self.target.key.is_empty() {
            if self.target.password.is_empty() {
                return Err(ShellError::Config(format!(
                    "no password or key configured for {}",
                    self.target.addr
                )));
            }
            return Ok(Auth::Password(self.target.password.clone()));
        }

        let key_pair = match self.target.key.strip_prefix('@') {
            Some(path) => load_secret_key(expand_home(path), None),
            None => decode_secret_key(&self.target.key, None),
        }
        .map_err(|e| ShellError::Config(format!("invalid private key: {}", e)))?;
        Ok(Auth::Key(key_pair))
    }

    async fn establish(&self) -> Result<Connection, ShellError> {
        let auth = self.auth_method()?;
        let addr = &self.target.addr;
        let timeout = self.target.timeout;

        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ShellError::Timeout(format!("dial {} after {:?}", addr, timeout)))?
            .map_err(|e| ShellError::Connection(format!("dial {}: {}", addr, e)))?;
        let stream = DeadlineStream::new(tcp, self.deadline.clone());

        let config = Arc::new(client_config(timeout));
        let handshake = async {
            let mut session = client::connect_stream(config, stream, ClientHandler).await?;
            let authenticated = match auth {
                Auth::Password(password) => {
                    session
                        .authenticate_password(&self.target.username, password)
                        .await?
                }
                Auth::Key(key_pair) => {
                    session
                        .authenticate_publickey(&self.target.username, Arc::new(key_pair))
                        .await?
                }
            };
            Ok::<_, russh::Error>((session, authenticated))
        };

        let (session, authenticated) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| ShellError::Timeout(format!("handshake with {} after {:?}", addr, timeout)))?
            .map_err(|e| ShellError::Connection(format!("handshake with {}: {}", addr, e)))?;
        if !authenticated {
            return Err(ShellError::Connection(format!(
                "authentication failed for {}@{}",
                self.target.username, addr
            )));
        }

        Ok(Connection {
            handle: Arc::new(session),
        })
    }

    /// `connect`, then one `reconnect`; a second failure closes and surfaces.
    async fn ensure_connected(&self) -> Result<Arc<Handle<ClientHandler>>, ShellError> {
        if self.connect().await.is_err() {
            tracing::info!("Reconnect for {}", self.target.addr);
            if let Err(e) = self.reconnect().await {
                self.close().await;
                return Err(e);
            }
        }
        match &*self.state.lock().await {
            ConnState::Connected(conn) => Ok(conn.handle.clone()),
            ConnState::Failed(e) => Err(e.clone()),
            ConnState::Disconnected => Err(ShellError::ConnectionLost),
        }
    }

    /// Drop a connection that failed mid-command so the next call reconnects.
    async fn mark_failed(&self, err: &ShellError) {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, ConnState::Failed(err.clone()));
        if let ConnState::Connected(conn) = previous {
            conn.shutdown().await;
        }
    }

    /// Run one command on a fresh session and report how it ended, or `None`
    /// when the session closed without an exit status. Output and the sudo
    /// watcher belong to the caller so both outlive a timeout.
    async fn exec_session(
        &self,
        handle: &Arc<Handle<ClientHandler>>,
        request: &ExecutionRequest,
        output: &mut Vec<u8>,
        watcher: &mut Option<PasswordWatcher>,
    ) -> Result<Option<(i32, String)>, ShellError> {
        let mut channel = handle.channel_open_session().await.map_err(transport)?;

        let mut command = request.command_line();
        if self.target.sudo {
            channel
                .request_pty(
                    false,
                    "xterm",
                    80,
                    40,
                    0,
                    0,
                    &[
                        (Pty::ECHO, 0),
                        (Pty::TTY_OP_ISPEED, 14400),
                        (Pty::TTY_OP_OSPEED, 14400),
                    ],
                )
                .await
                .map_err(transport)?;
            command = sudo_command(&command);

            let input = SessionInput {
                handle: handle.clone(),
                channel: channel.id(),
            };
            *watcher = Some(PasswordWatcher::spawn(input, self.target.password.clone()));
        }

        tracing::debug!("Run command {} on {}", command, self.target.addr);
        channel.exec(true, command).await.map_err(transport)?;

        let mut exit = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. } => {
                    output.extend_from_slice(data);
                    if let Some(w) = watcher.as_ref() {
                        w.feed(data);
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit = Some((
                        exit_status as i32,
                        format!("Process exited with status {}", exit_status),
                    ));
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    exit = Some((-1, format!("Process exited with signal {:?}", signal_name)));
                }
                _ => {}
            }
        }
        Ok(exit)
    }

    async fn scp_send(
        &self,
        handle: &Arc<Handle<ClientHandler>>,
        dir: &str,
        name: &str,
        mode: &str,
        content: &[u8],
    ) -> Result<(), ShellError> {
        let mut channel = handle.channel_open_session().await.map_err(upload)?;
        let sink_dir = if dir.is_empty() { "." } else { dir };
        channel
            .exec(true, format!("scp -t {}", sink_dir))
            .await
            .map_err(upload)?;

        let payload = scp_payload(mode, name, content);
        channel.data(&payload[..]).await.map_err(upload)?;

        let mut acks = Vec::new();
        let result = loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { ref data }) => {
                    acks.extend_from_slice(data);
                    match parse_scp_ack(&acks) {
                        ScpAck::Pending => continue,
                        ScpAck::Ok => break Ok(()),
                        ScpAck::Failed(message) => break Err(ShellError::Upload(message)),
                    }
                }
                Some(_) => continue,
                None => break Err(ShellError::Upload(truncated_ack_message(&acks))),
            }
        };

        let _ = channel.eof().await;
        result
    }
}

#[async_trait]
impl Client for SshExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), ShellError> {
        let mut state = self.state.lock().await;
        match &*state {
            ConnState::Connected(_) => return Ok(()),
            ConnState::Failed(e) => return Err(e.clone()),
            ConnState::Disconnected => {}
        }

        match self.establish().await {
            Ok(conn) => {
                tracing::info!("Connected to {}", self.name);
                *state = ConnState::Connected(conn);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", self.name, e);
                *state = ConnState::Failed(e.clone());
                Err(e)
            }
        }
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        // Also clears a cached failure so the next connect dials again.
        if let ConnState::Connected(conn) = std::mem::replace(&mut *state, ConnState::Disconnected) {
            tracing::info!("Close the connection for {}", self.target.addr);
            conn.shutdown().await;
        }
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionFailure> {
        let _serial = self.run_lock.lock().await;
        let handle = self.ensure_connected().await?;

        let timeout = request.timeout.unwrap_or(self.target.timeout);
        let mut output = Vec::new();
        let mut watcher = None;
        let finished = tokio::time::timeout(
            timeout,
            self.exec_session(&handle, request, &mut output, &mut watcher),
        )
        .await;
        if let Some(w) = watcher.take() {
            w.finish().await;
        }

        let text = String::from_utf8_lossy(&output);
        let text = trim_output(&text);
        let error = match finished {
            Ok(Ok(Some((0, _)))) => return Ok(ExecutionResult::success(text)),
            Ok(Ok(Some((code, description)))) => {
                return Ok(ExecutionResult::exited(text, code, &description));
            }
            Ok(Ok(None)) => ShellError::ConnectionLost,
            Ok(Err(e)) => e,
            Err(_) => ShellError::Timeout(format!(
                "{} did not finish within {:?}",
                request.command, timeout
            )),
        };

        if error.is_transport() {
            self.mark_failed(&error).await;
        }
        Err(ExecutionFailure::new(error, text))
    }

    fn as_uploader(&self) -> Option<&dyn UploadClient> {
        Some(self)
    }
}

#[async_trait]
impl UploadClient for SshExecutor {
    async fn upload_file(&self, source: &str, dest: &str, mode: &str) -> Result<(), ShellError> {
        let content = tokio::fs::read(source)
            .await
            .map_err(|e| ShellError::Upload(format!("read {}: {}", source, e)))?;
        let (dir, name) = split_destination(source, dest);

        let _serial = self.run_lock.lock().await;
        let _raised = self.deadline.raise(UPLOAD_TIMEOUT);
        let handle = self.ensure_connected().await?;

        tracing::info!(
            "Upload {} ({} bytes) to {}:{}{} mode {}",
            source,
            content.len(),
            self.target.addr,
            dir,
            name,
            mode
        );
        tokio::time::timeout(
            UPLOAD_TIMEOUT,
            self.scp_send(&handle, &dir, &name, mode, &content),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ShellError::Timeout(format!(
                "upload of {} did not finish within {:?}",
                source, UPLOAD_TIMEOUT
            )))
        })
    }
}

/// Session stdin for the sudo watcher.
struct SessionInput {
    handle: Arc<Handle<ClientHandler>>,
    channel: ChannelId,
}

#[async_trait]
impl PromptReply for SessionInput {
    async fn send(&self, data: &[u8]) -> Result<(), ShellError> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| ShellError::Transport("session input closed".to_string()))
    }
}

/// Keepalives are sent after `keepalive_interval` of silence. They must land
/// inside the socket read deadline or an idle connection is torn down.
fn client_config(timeout: Duration) -> client::Config {
    client::Config {
        keepalive_interval: Some(keepalive_interval(timeout)),
        // A peer that stops answering trips the read deadline instead.
        keepalive_max: 0,
        ..Default::default()
    }
}

fn keepalive_interval(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        return KEEPALIVE_INTERVAL;
    }
    KEEPALIVE_INTERVAL.min(timeout / 2)
}

/// Wrap a command line as `sudo sh -c '<command>'` unless it already uses sudo.
pub fn sudo_command(command: &str) -> String {
    if command.trim_start().starts_with("sudo") {
        return command.to_string();
    }
    format!("sudo sh -c '{}'", command.replace('\'', r"'\''"))
}

fn transport(e: russh::Error) -> ShellError {
    ShellError::Transport(e.to_string())
}

fn upload(e: russh::Error) -> ShellError {
    ShellError::Upload(e.to_string())
}
