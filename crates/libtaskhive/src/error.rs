use serde_json::{Value, json};
use taskhive_protocol::{BulkFailure, SessionId, StatusCode, SubtaskSummary, TaskId, TaskStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("backlog io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backlog encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("parent task not found: {0}")]
    ParentNotFound(TaskId),

    #[error("task {task_id} has {} incomplete subtask(s)", incomplete.len())]
    IncompleteSubtasks {
        task_id: TaskId,
        incomplete: Vec<SubtaskSummary>,
    },

    #[error("task {task_id} has {} subtask(s); delete with force to remove them", subtasks.len())]
    HasSubtasks { task_id: TaskId, subtasks: Vec<TaskId> },

    #[error("task is already open: {0}")]
    AlreadyOpen(TaskId),

    #[error("invalid priority {0}: expected 0-3")]
    InvalidPriority(i64),

    #[error("status cannot be set to {0} by editing")]
    InvalidStatusChange(TaskStatus),

    #[error("session id {0:?} is reserved")]
    ReservedSessionId(SessionId),

    #[error("failed to persist backlog: {0}")]
    Persist(#[from] PersistError),
}

impl CoordError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoordError::TaskNotFound(_)
            | CoordError::SessionNotFound(_)
            | CoordError::ParentNotFound(_) => StatusCode::NotFound,
            CoordError::IncompleteSubtasks { .. }
            | CoordError::HasSubtasks { .. }
            | CoordError::AlreadyOpen(_)
            | CoordError::InvalidPriority(_)
            | CoordError::InvalidStatusChange(_)
            | CoordError::ReservedSessionId(_) => StatusCode::BadRequest,
            CoordError::Persist(_) => StatusCode::InternalError,
        }
    }

    /// Stable machine-readable tag carried in the `error` field.
    pub fn tag(&self) -> &'static str {
        match self {
            CoordError::TaskNotFound(_) => "task_not_found",
            CoordError::SessionNotFound(_) => "session_not_found",
            CoordError::ParentNotFound(_) => "parent_not_found",
            CoordError::IncompleteSubtasks { .. } => "incomplete_subtasks",
            CoordError::HasSubtasks { .. } => "has_subtasks",
            CoordError::AlreadyOpen(_) => "already_open",
            CoordError::InvalidPriority(_) => "invalid_priority",
            CoordError::InvalidStatusChange(_) => "invalid_status_change",
            CoordError::ReservedSessionId(_) => "reserved_session_id",
            CoordError::Persist(_) => "persistence_failed",
        }
    }

    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "success": false,
            "error": self.tag(),
            "message": self.to_string(),
        });
        match self {
            CoordError::IncompleteSubtasks { incomplete, .. } => {
                body["incomplete_subtasks"] = json!(incomplete);
            }
            CoordError::HasSubtasks { subtasks, .. } => {
                body["subtasks"] = json!(subtasks);
            }
            _ => {}
        }
        body
    }

    pub fn to_bulk_failure(&self, id: &str) -> BulkFailure {
        BulkFailure {
            id: id.to_string(),
            error: self.tag().to_string(),
            message: self.to_string(),
            incomplete_subtasks: match self {
                CoordError::IncompleteSubtasks { incomplete, .. } => incomplete.clone(),
                _ => Vec::new(),
            },
        }
    }
}
