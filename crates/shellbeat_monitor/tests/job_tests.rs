//! Integration tests for ShellJob.
//!
//! A scripted mock client stands in for the executors so the retry loop,
//! upload gate and connection lifecycle can be checked under paused time.

use async_trait::async_trait;
use shellbeat_core::{MonitorConfig, ShellError, ValidationError};
use shellbeat_monitor::{CheckEvent, CheckStatus, GateState, ShellJob};
use shellbeat_os::{Client, ExecutionFailure, ExecutionRequest, ExecutionResult, UploadClient};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Mock client
// ============================================================================

/// Pops one scripted result per `execute`; repeats the last one when exhausted.
struct MockClient {
    script: Mutex<Vec<Result<String, ExecutionFailure>>>,
    calls: Mutex<Vec<Instant>>,
    closes: AtomicUsize,
    upload: Option<MockUploader>,
}

#[derive(Default)]
struct MockUploader {
    /// Upload fails while this is non-zero, counting down per call.
    fail_next: AtomicUsize,
    uploads: Mutex<Vec<(String, String, String)>>,
}

impl MockClient {
    fn new(script: Vec<Result<String, ShellError>>) -> Self {
        Self::scripted(
            script
                .into_iter()
                .map(|step| step.map_err(ExecutionFailure::from))
                .collect(),
        )
    }

    fn scripted(script: Vec<Result<String, ExecutionFailure>>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            upload: None,
        }
    }

    fn with_uploader(mut self, failures: usize) -> Self {
        let uploader = MockUploader::default();
        uploader.fail_next.store(failures, Ordering::SeqCst);
        self.upload = Some(uploader);
        self
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }

    fn uploads(&self) -> usize {
        self.upload
            .as_ref()
            .map(|u| u.uploads.lock().unwrap().len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Client for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<(), ShellError> {
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        assert_eq!(request.command, "df");
        self.calls.lock().unwrap().push(Instant::now());
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.remove(0)
        } else {
            script
                .first()
                .cloned()
                .unwrap_or_else(|| Ok(String::new()))
        };
        next.map(ExecutionResult::success)
    }

    fn as_uploader(&self) -> Option<&dyn UploadClient> {
        self.upload.as_ref().map(|u| u as &dyn UploadClient)
    }
}

#[async_trait]
impl UploadClient for MockUploader {
    async fn upload_file(&self, source: &str, dest: &str, mode: &str) -> Result<(), ShellError> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ShellError::Upload(format!("disk full writing {}", dest)));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((source.to_string(), dest.to_string(), mode.to_string()));
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn monitor() -> MonitorConfig {
    let mut m = MonitorConfig {
        name: "disk".into(),
        hosts: vec!["10.0.0.5:22".into()],
        occurrence: 3,
        ..Default::default()
    };
    m.check.request.command = "df".into();
    m
}

fn accept_ok() -> Arc<dyn shellbeat_core::OutputValidator> {
    Arc::new(|out: &str| -> Result<(), ValidationError> {
        if out.contains("ok") {
            Ok(())
        } else {
            Err(ValidationError::new(format!("unexpected output '{}'", out)))
        }
    })
}

fn job(monitor: MonitorConfig, client: Arc<MockClient>) -> ShellJob {
    ShellJob::new(monitor, "10.0.0.5:22", client, accept_ok()).unwrap()
}

// ============================================================================
// Retry loop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_always_rejected_runs_occurrence_times() {
    let client = Arc::new(MockClient::new(vec![Ok("bad".into())]));
    let job = job(monitor(), client.clone());

    let outcome = job.run_once().await;

    let times = client.call_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_secs(5));
    }
    assert_eq!(outcome.status, CheckStatus::Down);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.down_count, 3);
    assert_eq!(outcome.output, "bad. Error:unexpected output 'bad' ");
}

#[tokio::test(start_paused = true)]
async fn test_stops_on_first_accepted_output() {
    let client = Arc::new(MockClient::new(vec![
        Ok("bad".into()),
        Ok("ok".into()),
        Ok("never".into()),
    ]));
    let job = job(monitor(), client.clone());

    let outcome = job.run_once().await;

    assert_eq!(client.call_times().len(), 2);
    assert!(outcome.is_up());
    assert_eq!(outcome.output, "ok");
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.down_count, 1);
    assert!(outcome.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_no_sleep_after_final_attempt() {
    let client = Arc::new(MockClient::new(vec![Ok("bad".into())]));
    let mut cfg = monitor();
    cfg.occurrence = 1;
    let job = job(cfg, client.clone()).with_retry_delay(Duration::from_secs(30));

    let start = Instant::now();
    let outcome = job.run_once().await;

    assert_eq!(outcome.attempts, 1);
    assert!(Instant::now() - start < Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_transport_errors_are_retried() {
    let client = Arc::new(MockClient::new(vec![
        Err(ShellError::ConnectionLost),
        Ok("ok".into()),
    ]));
    let job = job(monitor(), client.clone());

    let outcome = job.run_once().await;

    assert!(outcome.is_up());
    assert_eq!(outcome.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_config_error_aborts_retries() {
    let client = Arc::new(MockClient::new(vec![Err(ShellError::Config(
        "Return 2 containers".into(),
    ))]));
    let job = job(monitor(), client.clone());

    let outcome = job.run_once().await;

    assert_eq!(client.call_times().len(), 1);
    assert_eq!(outcome.status, CheckStatus::Down);
    assert_eq!(outcome.down_count, 1);
    assert!(outcome.output.starts_with(". Error:configuration error"));
}

#[tokio::test(start_paused = true)]
async fn test_partial_output_kept_on_dropped_connection() {
    let client = Arc::new(MockClient::scripted(vec![Err(ExecutionFailure::new(
        ShellError::ConnectionLost,
        "Filesystem Use%\n/dev/sda1 4",
    ))]));
    let mut cfg = monitor();
    cfg.occurrence = 1;
    let job = job(cfg, client);

    let outcome = job.run_once().await;

    assert_eq!(outcome.status, CheckStatus::Down);
    assert_eq!(
        outcome.output,
        "Filesystem Use%\n/dev/sda1 4. Error:Connection is disconnected by the timeout or lost "
    );
}

// ============================================================================
// Upload gate
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_upload_retried_next_invocation() {
    let client = Arc::new(MockClient::new(vec![Ok("ok".into())]).with_uploader(1));
    let mut cfg = monitor();
    cfg.upload = vec!["./check.sh:/opt/check.sh".into()];
    let job = job(cfg, client.clone());

    let first = job.run_once().await;
    assert_eq!(first.status, CheckStatus::Down);
    assert_eq!(first.attempts, 0);
    assert!(first.error.as_deref().unwrap().contains("disk full"));
    assert_eq!(job.gate().state().await, GateState::Failed);
    assert!(client.call_times().is_empty());

    let second = job.run_once().await;
    assert!(second.is_up());
    assert_eq!(job.gate().state().await, GateState::Done);
    assert_eq!(client.uploads(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_successful_upload_never_repeated() {
    let client = Arc::new(MockClient::new(vec![Ok("ok".into())]).with_uploader(0));
    let mut cfg = monitor();
    cfg.upload = vec![
        "./a.sh:/opt/a.sh".into(),
        "./b.sh : /opt/ : 0700".into(),
    ];
    let job = job(cfg, client.clone());

    for _ in 0..3 {
        assert!(job.run_once().await.is_up());
    }

    assert_eq!(client.uploads(), 2);
    let uploads = client.upload.as_ref().unwrap().uploads.lock().unwrap().clone();
    assert_eq!(uploads[1], ("./b.sh".into(), "/opt/".into(), "0700".into()));
}

#[tokio::test(start_paused = true)]
async fn test_upload_not_supported() {
    let client = Arc::new(MockClient::new(vec![Ok("ok".into())]));
    let mut cfg = monitor();
    cfg.upload = vec!["./a.sh:/opt/a.sh".into()];
    let job = job(cfg, client.clone());

    let outcome = job.run_once().await;

    assert_eq!(outcome.status, CheckStatus::Down);
    assert_eq!(
        outcome.error.as_deref(),
        Some("disk doesn't have the upload function")
    );
    assert!(client.call_times().is_empty());
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_closes_unless_live_connection() {
    let client = Arc::new(MockClient::new(vec![Ok("ok".into())]));
    let job1 = job(monitor(), client.clone());
    job1.run_once().await;
    assert_eq!(client.closes.load(Ordering::SeqCst), 1);

    let client = Arc::new(MockClient::new(vec![Ok("ok".into())]));
    let mut cfg = monitor();
    cfg.live_connection = true;
    let job2 = job(cfg, client.clone());
    job2.run_once().await;
    assert_eq!(client.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_event_from_outcome() {
    let client = Arc::new(MockClient::new(vec![Ok("ok".into())]));
    let job = job(monitor(), client);

    let outcome = job.run_once().await;
    let event = CheckEvent::new(job.monitor(), job.host(), &outcome);

    assert_eq!(event.shell.response.output, "ok");
    assert_eq!(event.monitor.host, "10.0.0.5:22");
    assert!(event.to_json().unwrap().contains("\"status\":\"up\""));
}

#[test]
fn test_from_config_rejects_bad_regex() {
    let mut cfg = monitor();
    cfg.check.response.ok = vec!["([unclosed".into()];
    let err = ShellJob::from_config(&cfg, "localhost:0").err().unwrap();
    assert!(matches!(err, ShellError::Config(_)));
}
