//! Client side of the build-report protocol.
//!
//! A report is created once per command with the host details, the stage
//! list and the resolved graph. Afterwards [`RemoteSink`] streams LogSource
//! deltas to it from a background task. Delivery problems are logged and
//! never fail the build.

use crate::build_log::{DeltaRecorder, LogDelta, LogEvent, LogSink};
use crate::constants::{REMOTE_SINK_CHANNEL_SIZE, REPORT_REQUEST_TIMEOUT_SECS};
use crate::error::{calculate_backoff, ReportError, RetryConfig};
use crate::graph::GraphPayload;
use crate::session::BuildSession;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub name: String,
    pub platform: String,
    pub processors: usize,
    /// Any further host details a client sends, kept as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl HostInfo {
    pub fn current() -> Self {
        let name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let mut extra = serde_json::Map::new();
        extra.insert("arch".to_string(), std::env::consts::ARCH.into());
        Self {
            name,
            platform: std::env::consts::OS.to_string(),
            processors: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            extra,
        }
    }
}

/// Body of `POST /report/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub host: HostInfo,
    pub working_dir: String,
    pub command_line: String,
    pub command: String,
    pub stages: Vec<String>,
    #[serde(default)]
    pub configuration: serde_json::Value,
    pub targets: Vec<String>,
    pub graph: GraphPayload,
}

impl ReportRequest {
    pub fn for_session(
        session: &BuildSession,
        command: &str,
        stages: Vec<String>,
        graph: GraphPayload,
        command_line: String,
    ) -> Self {
        Self {
            host: HostInfo::current(),
            working_dir: session.env.root_path().display().to_string(),
            command_line,
            command: command.to_string(),
            stages,
            configuration: serde_json::json!({
                "session": session.id.to_string(),
                "jobs": session.jobs,
                "force": session.force,
                "deploy_dir": session.deploy_dir.as_ref().map(|p| p.display().to_string()),
            }),
            targets: session.targets.clone(),
            graph,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedReport {
    pub id: u64,
}

/// Transport for report creation and delta delivery.
#[async_trait]
pub trait ReportTransport: Send + Sync {
    async fn create_report(&self, request: &ReportRequest) -> Result<u64, ReportError>;
    async fn post_delta(&self, id: u64, delta: &LogDelta) -> Result<(), ReportError>;
}

/// HTTP client for the report server.
pub struct ReportClient {
    base_url: String,
    client: reqwest::Client,
}

impl ReportClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REPORT_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ReportError::Transport {
                message: e.to_string(),
                retryable: false,
            })?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn transport_error(e: reqwest::Error) -> ReportError {
        ReportError::Transport {
            retryable: e.is_timeout() || e.is_connect() || e.is_request(),
            message: e.to_string(),
        }
    }

    fn status_error(id: u64, status: StatusCode) -> ReportError {
        match status {
            StatusCode::NOT_FOUND => ReportError::NotFound { id },
            StatusCode::CONFLICT => ReportError::Finished { id },
            s => ReportError::Transport {
                message: format!("report server returned {}", s),
                retryable: s.is_server_error(),
            },
        }
    }
}

#[async_trait]
impl ReportTransport for ReportClient {
    async fn create_report(&self, request: &ReportRequest) -> Result<u64, ReportError> {
        let url = format!("{}/report/", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(Self::transport_error)?;
        if !resp.status().is_success() {
            return Err(Self::status_error(0, resp.status()));
        }
        let created: CreatedReport = resp.json().await.map_err(Self::transport_error)?;
        tracing::info!(id = created.id, url = %self.base_url, "Created build report");
        Ok(created.id)
    }

    async fn post_delta(&self, id: u64, delta: &LogDelta) -> Result<(), ReportError> {
        let url = format!("{}/report/{}/", self.base_url, id);
        let resp = self
            .client
            .post(&url)
            .json(delta)
            .send()
            .await
            .map_err(Self::transport_error)?;
        if !resp.status().is_success() {
            return Err(Self::status_error(id, resp.status()));
        }
        Ok(())
    }
}

/// Posts `delta`, retrying retryable failures with exponential backoff.
pub async fn post_with_retry(
    transport: &dyn ReportTransport,
    id: u64,
    delta: &LogDelta,
    retry: &RetryConfig,
) -> Result<(), ReportError> {
    let mut attempt = 0;
    loop {
        match transport.post_delta(id, delta).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                let backoff = calculate_backoff(attempt, retry);
                tracing::debug!(id, attempt, backoff_ms = backoff, error = %e, "Retrying report delta");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

enum Signal {
    Changed,
    Flush(oneshot::Sender<()>),
}

/// Streams LogSource changes to a report as deltas.
///
/// Events are folded into a [`DeltaRecorder`]; a background task sends
/// whatever accumulated each time it wakes up, one request at a time, so
/// the server sees deltas in the order they were recorded.
pub struct RemoteSink {
    recorder: Arc<DeltaRecorder>,
    signal: mpsc::Sender<Signal>,
    disabled: Arc<AtomicBool>,
}

impl RemoteSink {
    /// Starts the delivery task. Must be called inside a tokio runtime.
    pub fn spawn(transport: Arc<dyn ReportTransport>, report_id: u64, retry: RetryConfig) -> Arc<Self> {
        let recorder = Arc::new(DeltaRecorder::new());
        let disabled = Arc::new(AtomicBool::new(false));
        let (signal, mut rx) = mpsc::channel(REMOTE_SINK_CHANNEL_SIZE);

        let task_recorder = recorder.clone();
        let task_disabled = disabled.clone();
        tokio::spawn(async move {
            while let Some(wake) = rx.recv().await {
                deliver(&*transport, report_id, &task_recorder, &retry, &task_disabled).await;
                if let Signal::Flush(done) = wake {
                    let _ = done.send(());
                }
            }
            deliver(&*transport, report_id, &task_recorder, &retry, &task_disabled).await;
        });

        Arc::new(Self {
            recorder,
            signal,
            disabled,
        })
    }

    /// Waits until everything recorded so far was sent (or given up on).
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.signal.send(Signal::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// False once the server rejected the report for good.
    pub fn is_active(&self) -> bool {
        !self.disabled.load(Ordering::Relaxed)
    }
}

impl LogSink for RemoteSink {
    fn on_event(&self, event: &LogEvent) {
        if !self.is_active() {
            return;
        }
        self.recorder.on_event(event);
        // A full channel already holds a wake-up that will pick this change up
        let _ = self.signal.try_send(Signal::Changed);
    }
}

async fn deliver(
    transport: &dyn ReportTransport,
    id: u64,
    recorder: &DeltaRecorder,
    retry: &RetryConfig,
    disabled: &AtomicBool,
) {
    if disabled.load(Ordering::Relaxed) {
        return;
    }
    let Some(delta) = recorder.take() else {
        return;
    };
    if let Err(e) = post_with_retry(transport, id, &delta, retry).await {
        if e.is_retryable() {
            tracing::warn!(id, error = %e, "Report delta not delivered, keeping it for the next attempt");
            recorder.restore(delta);
        } else {
            tracing::warn!(id, error = %e, "Report rejected updates, remote logging disabled");
            disabled.store(true, Ordering::Relaxed);
        }
    }
}
