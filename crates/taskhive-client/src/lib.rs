//! Async client for the coordinator's one-request-per-connection JSON API.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use taskhive_protocol::{
    AddNote, BulkComplete, BulkReopen, BulkResult, CompleteTask, CreateSubtask, CreateTask,
    DEFAULT_PORT, DeleteOutcome, DeleteTask, EditTask, EndOutcome, EndSession, Heartbeat,
    ParallelMarker, ParallelSummary, RegisterSession, ReopenTask, ReportGrouping, RequestTask,
    Session, StatusSummary, SubtaskProgress, Task, TaskStatus, TaskTime, TimeReport,
    TimerRequest, paths,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("request timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed response: {0}")]
    BadResponse(String),

    #[error("coordinator returned {status}: {message}")]
    Status {
        status: u16,
        message: String,
        body: Value,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no coordinator marker at {path}: {source}")]
    NoMarker { path: PathBuf, source: io::Error },

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },
}

impl ClientError {
    /// Worth retrying: the coordinator may be starting, busy or restarting.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Connect { .. }
            | ClientError::ConnectTimeout(_)
            | ClientError::Timeout
            | ClientError::Io(_)
            | ClientError::BadResponse(_) => true,
            ClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The request never reached the coordinator, so retrying cannot apply
    /// it twice.
    pub fn is_before_send(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. } | ClientError::ConnectTimeout(_)
        )
    }

    /// HTTP status for errors reported by the coordinator.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
    pub min_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            jitter: 0.25,
            min_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let spread = base * self.jitter;
        let jittered = if spread > 0.0 {
            base + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            base
        };
        Duration::from_secs_f64(jittered.max(0.0)).max(self.min_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Post,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    host: String,
    port: u16,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Default for CoordinatorClient {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

impl CoordinatorClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Connect to the coordinator announced by `<state_dir>/.parallel-mode`.
    pub fn discover(state_dir: &Path) -> Result<Self> {
        let path = paths::marker_path(state_dir);
        let raw = std::fs::read(&path).map_err(|source| ClientError::NoMarker {
            path: path.clone(),
            source,
        })?;
        let marker: ParallelMarker = serde_json::from_slice(&raw)?;
        debug!(host = %marker.host, port = marker.port, pid = marker.pid, "discovered coordinator");
        Ok(Self::new(marker.host, marker.port))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    /// GET `path`, retrying any transient failure.
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::Get, path, None).await
    }

    /// POST `body` to `path`. Only failures that happened before the
    /// request was written are retried, so a claim is never sent twice.
    pub async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<Value> {
        let body = serde_json::to_vec(body)?;
        self.request(Method::Post, path, Some(body)).await
    }

    async fn request(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Value> {
        let mut attempt = 0;
        loop {
            let err = match self.send_once(method, path, body.as_deref()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retryable = match method {
                Method::Get => err.is_transient(),
                Method::Post => err.is_before_send(),
            };
            if !retryable {
                return Err(err);
            }
            if attempt >= self.retry.max_retries {
                return Err(if self.retry.max_retries == 0 {
                    err
                } else {
                    ClientError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(err),
                    }
                });
            }

            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                method = method.as_str(),
                path,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "coordinator request failed, retrying: {err}"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn send_once(&self, method: Method, path: &str, body: Option<&[u8]>) -> Result<Value> {
        let addr = self.addr();
        let mut stream = match timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ClientError::Connect { addr, source }),
            Err(_) => return Err(ClientError::ConnectTimeout(addr)),
        };

        let body = body.unwrap_or_default();
        let mut raw = format!(
            "{} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            method.as_str(),
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);

        let exchange = async {
            stream.write_all(&raw).await?;
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await?;
            Ok::<_, io::Error>(response)
        };
        let response = timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout)??;

        parse_response(&response)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub async fn register(&self, req: &RegisterSession) -> Result<Session> {
        field(self.post("/session/register", req).await?, "session")
    }

    /// Returns false when the coordinator no longer knows the session.
    pub async fn heartbeat(&self, session_id: &str) -> Result<bool> {
        let body = self
            .post(
                "/session/heartbeat",
                &Heartbeat {
                    session_id: session_id.to_string(),
                },
            )
            .await?;
        Ok(body["success"].as_bool().unwrap_or(false))
    }

    pub async fn end_session(&self, session_id: &str, release_tasks: bool) -> Result<EndOutcome> {
        let req = EndSession {
            session_id: session_id.to_string(),
            release_tasks,
        };
        Ok(serde_json::from_value(self.post("/session/end", &req).await?)?)
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn create_task(&self, req: &CreateTask) -> Result<Task> {
        field(self.post("/task/create", req).await?, "task")
    }

    pub async fn create_subtask(&self, req: &CreateSubtask) -> Result<Task> {
        field(self.post("/task/create-subtask", req).await?, "task")
    }

    /// Claim the best ready task, or `None` when nothing is ready.
    pub async fn request_task(&self, req: &RequestTask) -> Result<Option<Task>> {
        field(self.post("/task/request", req).await?, "task")
    }

    pub async fn complete_task(&self, req: &CompleteTask) -> Result<Task> {
        field(self.post("/task/complete", req).await?, "task")
    }

    pub async fn reopen_task(&self, req: &ReopenTask) -> Result<Task> {
        field(self.post("/task/reopen", req).await?, "task")
    }

    pub async fn bulk_complete(&self, req: &BulkComplete) -> Result<BulkResult> {
        Ok(serde_json::from_value(self.post("/task/bulk-complete", req).await?)?)
    }

    pub async fn bulk_reopen(&self, req: &BulkReopen) -> Result<BulkResult> {
        Ok(serde_json::from_value(self.post("/task/bulk-reopen", req).await?)?)
    }

    pub async fn add_note(&self, req: &AddNote) -> Result<Task> {
        field(self.post("/task/note", req).await?, "task")
    }

    pub async fn edit_task(&self, req: &EditTask) -> Result<Task> {
        field(self.post("/task/edit", req).await?, "task")
    }

    pub async fn delete_task(&self, req: &DeleteTask) -> Result<DeleteOutcome> {
        Ok(serde_json::from_value(self.post("/task/delete", req).await?)?)
    }

    pub async fn timer_start(&self, task_id: &str) -> Result<Task> {
        self.timer("/task/timer/start", task_id).await
    }

    pub async fn timer_pause(&self, task_id: &str) -> Result<Task> {
        self.timer("/task/timer/pause", task_id).await
    }

    pub async fn timer_stop(&self, task_id: &str) -> Result<Task> {
        self.timer("/task/timer/stop", task_id).await
    }

    async fn timer(&self, path: &str, task_id: &str) -> Result<Task> {
        let req = TimerRequest {
            task_id: task_id.to_string(),
            ..Default::default()
        };
        field(self.post(path, &req).await?, "task")
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn status(&self) -> Result<StatusSummary> {
        Ok(serde_json::from_value(self.get("/status").await?)?)
    }

    pub async fn parallel_summary(&self) -> Result<ParallelSummary> {
        Ok(serde_json::from_value(self.get("/parallel-summary").await?)?)
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let path = match status {
            Some(status) => format!("/tasks?status={status}"),
            None => "/tasks".to_string(),
        };
        field(self.get(&path).await?, "tasks")
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        field(self.get(&format!("/task/{task_id}")).await?, "task")
    }

    pub async fn subtasks(&self, task_id: &str) -> Result<Vec<Task>> {
        field(self.get(&format!("/task/{task_id}/subtasks")).await?, "subtasks")
    }

    pub async fn subtask_progress(&self, task_id: &str) -> Result<SubtaskProgress> {
        let body = self.get(&format!("/task/{task_id}/subtask-progress")).await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn task_time(&self, task_id: &str) -> Result<TaskTime> {
        Ok(serde_json::from_value(self.get(&format!("/task/{task_id}/time")).await?)?)
    }

    pub async fn time_report(&self, by: ReportGrouping, labels: &[String]) -> Result<TimeReport> {
        let by = match by {
            ReportGrouping::Task => "task",
            ReportGrouping::Label => "label",
            ReportGrouping::Day => "day",
        };
        let mut path = format!("/time-report?by={by}");
        if !labels.is_empty() {
            path.push_str("&labels=");
            path.push_str(&labels.join(","));
        }
        Ok(serde_json::from_value(self.get(&path).await?)?)
    }
}

fn field<T: DeserializeOwned>(mut body: Value, name: &str) -> Result<T> {
    let value = body
        .get_mut(name)
        .map(Value::take)
        .ok_or_else(|| ClientError::BadResponse(format!("missing `{name}` in response")))?;
    Ok(serde_json::from_value(value)?)
}

/// Parse a complete `HTTP/1.1` response. Non-2xx statuses become
/// [`ClientError::Status`].
fn parse_response(raw: &[u8]) -> Result<Value> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| ClientError::BadResponse("missing header terminator".to_string()))?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let mut body = &raw[split + 4..];

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status: u16 = status_line
        .strip_prefix("HTTP/1.")
        .and_then(|rest| rest.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| ClientError::BadResponse(format!("bad status line: {status_line:?}")))?;

    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let length: usize = value
                .trim()
                .parse()
                .map_err(|_| ClientError::BadResponse(format!("bad Content-Length: {value}")))?;
            if body.len() < length {
                return Err(ClientError::BadResponse(format!(
                    "truncated body: {} of {length} bytes",
                    body.len()
                )));
            }
            body = &body[..length];
        }
    }

    let value: Value = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(body)?
    };

    if (200..300).contains(&status) {
        return Ok(value);
    }
    let message = value["message"]
        .as_str()
        .or_else(|| value["error"].as_str())
        .unwrap_or("request failed")
        .to_string();
    Err(ClientError::Status {
        status,
        message,
        body: value,
    })
}
