use shellbeat_core::{MonitorConfig, ShellError, TargetKind};
use shellbeat_os::{Client, DockerExecutor, DockerTarget, LocalExecutor, SshExecutor, SshTarget};
use std::sync::Arc;

/// Build the executor a monitor uses for one of its hosts.
///
/// Docker monitors treat `addr` as the daemon endpoint; otherwise a
/// `localhost` host runs locally and anything else goes over SSH.
pub fn create_client(addr: &str, config: &MonitorConfig) -> Result<Arc<dyn Client>, ShellError> {
    let client: Arc<dyn Client> = match config.target_kind(addr)? {
        TargetKind::Docker => Arc::new(DockerExecutor::new(DockerTarget {
            endpoint: addr.to_string(),
            filters: config.docker_filter.clone(),
            timeout: config.timeout(),
        })),
        TargetKind::Local => Arc::new(LocalExecutor::new(config.timeout())),
        TargetKind::Ssh => Arc::new(SshExecutor::new(SshTarget {
            addr: addr.to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            key: config.key.clone(),
            sudo: config.sudo,
            timeout: config.timeout(),
        })),
    };
    tracing::debug!("Created {} for {}", client.name(), config.name);
    Ok(client)
}
