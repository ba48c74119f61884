//! One monitor against one host: upload gate, retry loop, outcome.

use crate::factory::create_client;
use crate::gate::UploadGate;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shellbeat_core::{MonitorConfig, OutputCheck, OutputValidator, ShellError, UploadSpec};
use shellbeat_os::{Client, ExecutionRequest};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
}

/// Result of one scheduled invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    /// Last output, with `". Error:<error> "` appended when the check failed.
    pub output: String,
    pub error: Option<String>,
    /// Number of times the command ran.
    pub attempts: u32,
    pub down_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CheckOutcome {
    fn finish(
        output: String,
        error: Option<String>,
        attempts: u32,
        down_count: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        let (status, output) = match &error {
            Some(e) => (CheckStatus::Down, format!("{}. Error:{} ", output, e)),
            None => (CheckStatus::Up, output),
        };
        Self {
            status,
            output,
            error,
            attempts,
            down_count,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.status == CheckStatus::Up
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

pub struct ShellJob {
    monitor: MonitorConfig,
    host: String,
    client: Arc<dyn Client>,
    validator: Arc<dyn OutputValidator>,
    uploads: Vec<UploadSpec>,
    gate: UploadGate,
    retry_delay: Duration,
}

impl ShellJob {
    pub fn new(
        monitor: MonitorConfig,
        host: impl Into<String>,
        client: Arc<dyn Client>,
        validator: Arc<dyn OutputValidator>,
    ) -> Result<Self, ShellError> {
        let uploads = monitor.upload_specs()?;
        Ok(Self {
            monitor,
            host: host.into(),
            client,
            validator,
            uploads,
            gate: UploadGate::new(),
            retry_delay: Duration::from_secs(5),
        })
    }

    /// Job with the executor and regex validator the monitor config describes.
    pub fn from_config(monitor: &MonitorConfig, host: &str) -> Result<Self, ShellError> {
        let client = create_client(host, monitor)?;
        let response = &monitor.check.response;
        let validator = OutputCheck::new(&response.ok, &response.critical)?;
        Self::new(monitor.clone(), host, client, Arc::new(validator))
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn monitor(&self) -> &MonitorConfig {
        &self.monitor
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn gate(&self) -> &UploadGate {
        &self.gate
    }

    /// Run the check once, retrying up to `occurrence` times.
    pub async fn run_once(&self) -> CheckOutcome {
        let started_at = Utc::now();
        tracing::info!("Start to check {} on {}", self.monitor.name, self.host);

        let outcome = match self.gate.pass(&self.monitor.name, self.client.as_ref(), &self.uploads).await {
            Ok(_) => self.run_attempts(started_at).await,
            Err(e) => {
                tracing::error!("Upload failed for {}: {}", self.monitor.name, e);
                CheckOutcome::finish(String::new(), Some(e.to_string()), 0, 1, started_at)
            }
        };

        if !self.monitor.live_connection {
            self.client.close().await;
        }
        tracing::info!(
            "Finish check {} on {}: {:?} after {} attempt(s)",
            self.monitor.name,
            self.host,
            outcome.status,
            outcome.attempts
        );
        outcome
    }

    async fn run_attempts(&self, started_at: DateTime<Utc>) -> CheckOutcome {
        let check = &self.monitor.check.request;
        let request = ExecutionRequest::new(check.command.clone())
            .with_dir(check.dir.clone())
            .with_args(check.args.clone());
        let occurrence = self.monitor.occurrence.max(1);

        let mut output = String::new();
        let mut error: Option<String> = None;
        let mut attempts = 0;
        let mut down_count = 0;

        while attempts < occurrence {
            attempts += 1;
            match self.client.execute(&request).await {
                Ok(result) => {
                    output = result.output;
                    match self.validator.validate(&output) {
                        Ok(()) => {
                            error = None;
                            break;
                        }
                        Err(rejected) => {
                            tracing::warn!(
                                "Check {} attempt {} rejected: {}",
                                self.monitor.name,
                                attempts,
                                rejected
                            );
                            error = Some(rejected.to_string());
                        }
                    }
                }
                Err(failure) => {
                    tracing::warn!(
                        "Check {} attempt {} failed: {}",
                        self.monitor.name,
                        attempts,
                        failure.error
                    );
                    let fatal = !failure.error.is_retryable();
                    error = Some(failure.error.to_string());
                    output = failure.partial.output;
                    if fatal {
                        down_count += 1;
                        break;
                    }
                }
            }
            down_count += 1;
            if attempts < occurrence {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        CheckOutcome::finish(output, error, attempts, down_count, started_at)
    }

    /// Release the client's transport.
    pub async fn close(&self) {
        self.client.close().await;
    }
}
