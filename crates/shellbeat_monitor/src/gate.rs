//! Exactly-once-unless-failed file staging, one gate per client.

use shellbeat_core::{ShellError, UploadSpec};
use shellbeat_os::Client;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    NotAttempted,
    Done,
    Failed,
}

pub struct UploadGate {
    state: Mutex<GateState>,
}

impl Default for UploadGate {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::NotAttempted),
        }
    }

    pub async fn state(&self) -> GateState {
        *self.state.lock().await
    }

    /// Upload every spec unless a previous pass already succeeded.
    ///
    /// The lock is held for the whole pass, so concurrent callers wait and then
    /// observe the outcome. Returns whether files were uploaded by this call.
    pub async fn pass(
        &self,
        monitor: &str,
        client: &dyn Client,
        specs: &[UploadSpec],
    ) -> Result<bool, ShellError> {
        let mut state = self.state.lock().await;
        if *state == GateState::Done || specs.is_empty() {
            return Ok(false);
        }

        let Some(uploader) = client.as_uploader() else {
            *state = GateState::Failed;
            return Err(ShellError::UploadNotSupported(monitor.to_string()));
        };

        for spec in specs {
            tracing::info!(
                "Upload file from {} to {} mode is {}",
                spec.source,
                spec.dest,
                spec.mode
            );
            if let Err(e) = uploader.upload_file(&spec.source, &spec.dest, &spec.mode).await {
                tracing::warn!("Failed to upload {} for {}: {}", spec, monitor, e);
                *state = GateState::Failed;
                return Err(e);
            }
        }

        *state = GateState::Done;
        Ok(true)
    }
}
