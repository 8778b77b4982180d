pub mod paths;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

pub type TaskId = String;
pub type SessionId = String;

/// Current on-disk schema version of the backlog document.
pub const SCHEMA_VERSION: u32 = 2;

/// Only the most recent notes of a task are written out.
pub const MAX_PERSISTED_NOTES: usize = 50;

/// Largest request body the coordinator accepts.
pub const MAX_BODY_BYTES: usize = 1_000_000;

pub const DEFAULT_PORT: u16 = 8765;

/// Author recorded on notes the coordinator writes on its own behalf.
pub const SYSTEM_AUTHOR: &str = "system";

// ---------------------------------------------------------------------------
// Tasks and sessions
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Done,
    Blocked,
    /// Unrecognised persisted statuses read as open.
    #[default]
    #[serde(other)]
    Open,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Open,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Main,
    #[default]
    Worker,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionRole::Main => "main",
            SessionRole::Worker => "worker",
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Note {
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    pub note: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TimeTracking {
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_seconds: f64,
}

impl TimeTracking {
    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }
}

/// A unit of work in the backlog.
///
/// `notes` keeps the full history in memory; serialization writes only the
/// last [`MAX_PERSISTED_NOTES`] entries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub blocked_by: Vec<TaskId>,
    #[serde(default)]
    pub assignee: Option<SessionId>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, serialize_with = "serialize_recent_notes")]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub subtasks: Vec<TaskId>,
    #[serde(default)]
    pub is_subtask: bool,
    #[serde(default)]
    pub time_tracking: Option<TimeTracking>,
}

impl Task {
    pub fn new(id: TaskId, title: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title,
            description: String::new(),
            status: TaskStatus::Open,
            priority: default_priority(),
            blocked_by: Vec::new(),
            assignee: None,
            labels: Vec::new(),
            branch: None,
            created_at: now,
            updated_at: now,
            notes: Vec::new(),
            parent_id: None,
            subtasks: Vec::new(),
            is_subtask: false,
            time_tracking: None,
        }
    }

    pub fn push_note(&mut self, session_id: &str, note: impl Into<String>, now: DateTime<Utc>) {
        self.notes.push(Note {
            timestamp: now,
            session_id: session_id.to_string(),
            note: note.into(),
        });
        self.updated_at = now;
    }

    pub fn summary(&self) -> SubtaskSummary {
        SubtaskSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            status: self.status,
        }
    }
}

pub const DEFAULT_PRIORITY: u8 = 2;
pub const MAX_PRIORITY: u8 = 3;

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn serialize_recent_notes<S: Serializer>(notes: &[Note], s: S) -> Result<S::Ok, S::Error> {
    let start = notes.len().saturating_sub(MAX_PERSISTED_NOTES);
    notes[start..].serialize(s)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub role: SessionRole,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub working_on: Vec<TaskId>,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

/// The whole persisted backlog: one document per state directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BacklogDocument {
    pub version: u32,
    pub next_id: u64,
    pub tasks: Vec<Task>,
}

impl Default for BacklogDocument {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            next_id: 1,
            tasks: Vec::new(),
        }
    }
}

/// Contents of the `.parallel-mode` marker announcing a running coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParallelMarker {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    SessionRegistered {
        session_id: SessionId,
        role: SessionRole,
    },
    SessionEnded {
        session_id: SessionId,
        role: SessionRole,
        released: Vec<TaskId>,
        stale: bool,
    },
    TaskCreated {
        task_id: TaskId,
        title: String,
        #[serde(default)]
        parent_id: Option<TaskId>,
    },
    TaskClaimed {
        task_id: TaskId,
        session_id: SessionId,
    },
    TaskCompleted {
        task_id: TaskId,
        session_id: SessionId,
        #[serde(default)]
        branch: Option<String>,
    },
    TaskReopened {
        task_id: TaskId,
        previous: TaskStatus,
    },
    TaskUpdated {
        task_id: TaskId,
        changes: Vec<String>,
    },
    TaskDeleted {
        task_id: TaskId,
        #[serde(default)]
        subtasks: Vec<TaskId>,
    },
    ParallelComplete {
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Wire status codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    PayloadTooLarge,
    UnprocessableEntity,
    InternalError,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::UnprocessableEntity => 422,
            StatusCode::InternalError => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::UnprocessableEntity => "Unprocessable Entity",
            StatusCode::InternalError => "Internal Server Error",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(StatusCode::Ok),
            400 => Some(StatusCode::BadRequest),
            404 => Some(StatusCode::NotFound),
            413 => Some(StatusCode::PayloadTooLarge),
            422 => Some(StatusCode::UnprocessableEntity),
            500 => Some(StatusCode::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RegisterSession {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub role: SessionRole,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Heartbeat {
    pub session_id: SessionId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EndSession {
    pub session_id: SessionId,
    #[serde(default = "default_true")]
    pub release_tasks: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CreateTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub blocked_by: Vec<TaskId>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CreateSubtask {
    pub parent_id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RequestTask {
    pub session_id: SessionId,
    #[serde(default)]
    pub preferred_labels: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CompleteTask {
    pub task_id: TaskId,
    pub session_id: SessionId,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReopenTask {
    pub task_id: TaskId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BulkComplete {
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BulkReopen {
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AddNote {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub note: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EditTask {
    pub task_id: TaskId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DeleteTask {
    pub task_id: TaskId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TimerRequest {
    pub task_id: TaskId,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubtaskSummary {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubtaskProgress {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub open: usize,
    pub blocked: usize,
    pub percentage: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BulkFailure {
    pub id: TaskId,
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incomplete_subtasks: Vec<SubtaskSummary>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BulkResult {
    pub succeeded: Vec<TaskId>,
    pub failed: Vec<BulkFailure>,
    pub total_succeeded: usize,
    pub total_failed: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeleteOutcome {
    pub deleted: TaskId,
    pub deleted_subtasks: Vec<TaskId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EndOutcome {
    pub released: Vec<TaskId>,
    pub parallel_complete: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StatusCounts {
    pub open: usize,
    pub in_progress: usize,
    pub done: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Open => self.open += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Done => self.done += 1,
            TaskStatus::Blocked => self.blocked += 1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub working_on: Vec<TaskId>,
    pub context: String,
    pub labels: Vec<String>,
    pub branch: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BranchedTask {
    pub id: TaskId,
    pub title: String,
    pub branch: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusSummary {
    pub total_tasks: usize,
    pub tasks_by_status: StatusCounts,
    pub ready_tasks: usize,
    pub main_session: Option<SessionInfo>,
    pub worker_sessions: Vec<SessionInfo>,
    pub active_workers: usize,
    pub completed_with_branches: Vec<BranchedTask>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MergeItem {
    pub id: TaskId,
    pub title: String,
    pub notes: Vec<Note>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParallelSummary {
    pub total_completed: usize,
    pub branches: BTreeMap<String, Vec<MergeItem>>,
    pub branches_to_merge: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskTime {
    pub task_id: TaskId,
    pub total_seconds: f64,
    pub is_running: bool,
    pub is_paused: bool,
    pub current_elapsed: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportGrouping {
    #[default]
    Task,
    Label,
    Day,
}

impl FromStr for ReportGrouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(ReportGrouping::Task),
            "label" => Ok(ReportGrouping::Label),
            "day" => Ok(ReportGrouping::Day),
            other => Err(format!("unknown report grouping: {other}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimeReportItem {
    /// Task id, label or `YYYY-MM-DD` depending on the grouping.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub seconds: f64,
    pub hours: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimeReport {
    pub by: ReportGrouping,
    pub total_seconds: f64,
    pub total_hours: f64,
    pub items: Vec<TimeReportItem>,
}

/// Rounds seconds to hours with two decimals.
pub fn hours(seconds: f64) -> f64 {
    (seconds / 36.0).round() / 100.0
}
