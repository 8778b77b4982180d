//! Static route table mapping (method, path) onto coordinator operations.

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::error;

use libtaskhive::{CoordError, Coordinator};
use taskhive_protocol::{
    AddNote, BulkComplete, BulkReopen, CompleteTask, CreateSubtask, CreateTask, DeleteTask,
    EditTask, EndSession, Heartbeat, RegisterSession, ReopenTask, ReportGrouping, RequestTask,
    StatusCode, TaskStatus, TimerRequest,
};

use crate::wire::{Method, WireError};

/// A non-200 response: status plus the JSON body to send.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({
                "success": false,
                "error": error,
                "message": message.into(),
            }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BadRequest, "bad_request", message)
    }

    pub fn not_found(method: Method, path: &str) -> Self {
        Self::new(
            StatusCode::NotFound,
            "unknown_route",
            format!("Unknown route: {} {path}", method.as_str()),
        )
    }

    pub fn missing_fields(fields: &[&str]) -> Self {
        let mut err = Self::new(
            StatusCode::UnprocessableEntity,
            "missing_fields",
            format!(
                "Missing required field{}: {}",
                if fields.len() == 1 { "" } else { "s" },
                fields.join(", ")
            ),
        );
        err.body["missing"] = json!(fields);
        err
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InternalError, "internal_error", message)
    }
}

impl From<CoordError> for ApiError {
    fn from(err: CoordError) -> Self {
        if let CoordError::Persist(ref cause) = err {
            error!("persistence failed: {cause}");
        }
        Self {
            status: err.status_code(),
            body: err.to_body(),
        }
    }
}

impl From<WireError> for ApiError {
    fn from(err: WireError) -> Self {
        Self::new(err.status(), err.tag(), err.to_string())
    }
}

/// Everything a handler receives besides the coordinator.
#[derive(Debug, Default)]
pub struct RouteArgs {
    /// Values captured by `{id}` segments, in order.
    pub params: Vec<String>,
    pub query: HashMap<String, String>,
    pub body: Value,
}

impl RouteArgs {
    fn param(&self, index: usize) -> &str {
        self.params.get(index).map_or("", String::as_str)
    }
}

pub type Handler = fn(&mut Coordinator, RouteArgs) -> Result<Value, ApiError>;

struct Route {
    method: Method,
    pattern: &'static str,
    handler: Handler,
}

const fn get(pattern: &'static str, handler: Handler) -> Route {
    Route {
        method: Method::Get,
        pattern,
        handler,
    }
}

const fn post(pattern: &'static str, handler: Handler) -> Route {
    Route {
        method: Method::Post,
        pattern,
        handler,
    }
}

static ROUTES: &[Route] = &[
    get("/status", status),
    get("/parallel-summary", parallel_summary),
    get("/tasks", list_tasks),
    get("/task/{id}", show_task),
    get("/task/{id}/subtasks", subtasks),
    get("/task/{id}/subtask-progress", subtask_progress),
    get("/task/{id}/time", task_time),
    get("/time-report", time_report),
    post("/session/register", register_session),
    post("/session/heartbeat", heartbeat),
    post("/session/end", end_session),
    post("/task/create", create_task),
    post("/task/create-subtask", create_subtask),
    post("/task/request", request_task),
    post("/task/complete", complete_task),
    post("/task/reopen", reopen_task),
    post("/task/bulk-complete", bulk_complete),
    post("/task/bulk-reopen", bulk_reopen),
    post("/task/note", add_note),
    post("/task/edit", edit_task),
    post("/task/delete", delete_task),
    post("/task/timer/start", timer_start),
    post("/task/timer/pause", timer_pause),
    post("/task/timer/stop", timer_stop),
];

/// Find the handler for a request, capturing `{id}` segments.
pub fn resolve(method: Method, path: &str) -> Option<(Handler, Vec<String>)> {
    let path = path.strip_suffix('/').filter(|p| !p.is_empty()).unwrap_or(path);
    ROUTES
        .iter()
        .filter(|route| route.method == method)
        .find_map(|route| match_pattern(route.pattern, path).map(|params| (route.handler, params)))
}

fn match_pattern(pattern: &str, path: &str) -> Option<Vec<String>> {
    let mut want = pattern.split('/');
    let mut got = path.split('/');
    let mut params = Vec::new();
    loop {
        match (want.next(), got.next()) {
            (None, None) => return Some(params),
            (Some("{id}"), Some(segment)) if !segment.is_empty() => {
                params.push(segment.to_string());
            }
            (Some(a), Some(b)) if a == b => {}
            _ => return None,
        }
    }
}

/// Deserialize `body` after checking that every field in `required` is
/// present and non-null.
fn parse<T: DeserializeOwned>(body: Value, required: &[&str]) -> Result<T, ApiError> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|field| body.get(field).is_none_or(Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(ApiError::missing_fields(&missing));
    }
    serde_json::from_value(body).map_err(|err| ApiError::bad_request(format!("Invalid request body: {err}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|err| ApiError::internal(err.to_string()))
}

/// `{"success": true}` merged with the fields of `value`.
fn success_with<T: Serialize>(value: &T) -> Result<Value, ApiError> {
    let mut map = Map::new();
    map.insert("success".to_string(), Value::Bool(true));
    if let Value::Object(fields) = to_json(value)? {
        map.extend(fields);
    }
    Ok(Value::Object(map))
}

fn task_body<T: Serialize>(task: &T) -> Result<Value, ApiError> {
    Ok(json!({ "success": true, "task": to_json(task)? }))
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

fn status(coord: &mut Coordinator, _args: RouteArgs) -> Result<Value, ApiError> {
    to_json(&coord.status_summary())
}

fn parallel_summary(coord: &mut Coordinator, _args: RouteArgs) -> Result<Value, ApiError> {
    to_json(&coord.parallel_summary())
}

fn list_tasks(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let status = args
        .query
        .get("status")
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<TaskStatus>())
        .transpose()
        .map_err(ApiError::bad_request)?;
    Ok(json!({ "tasks": to_json(&coord.list_tasks(status))? }))
}

fn show_task(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    task_body(&coord.get_task(args.param(0))?)
}

fn subtasks(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let task_id = args.param(0);
    let subtasks = coord.subtasks(task_id)?;
    Ok(json!({
        "task_id": task_id,
        "subtasks": to_json(&subtasks)?,
    }))
}

fn subtask_progress(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    to_json(&coord.subtask_progress(args.param(0))?)
}

fn task_time(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    to_json(&coord.task_time(args.param(0))?)
}

fn time_report(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let by = match args.query.get("by").filter(|s| !s.is_empty()) {
        Some(raw) => raw.parse::<ReportGrouping>().map_err(ApiError::bad_request)?,
        None => ReportGrouping::default(),
    };
    let labels: Vec<String> = args
        .query
        .get("labels")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    to_json(&coord.time_report(by, &labels))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

fn register_session(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: RegisterSession = parse(args.body, &[])?;
    let session = coord.register_session(req)?;
    Ok(json!({
        "success": true,
        "session_id": session.session_id.clone(),
        "session": to_json(&session)?,
    }))
}

fn heartbeat(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: Heartbeat = parse(args.body, &["session_id"])?;
    Ok(json!({ "success": coord.heartbeat(&req.session_id) }))
}

fn end_session(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: EndSession = parse(args.body, &["session_id"])?;
    success_with(&coord.end_session(&req.session_id, req.release_tasks)?)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

fn create_task(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: CreateTask = parse(args.body, &["title"])?;
    task_body(&coord.create_task(req)?)
}

fn create_subtask(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: CreateSubtask = parse(args.body, &["parent_id", "title"])?;
    task_body(&coord.create_subtask(req)?)
}

fn request_task(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: RequestTask = parse(args.body, &["session_id"])?;
    match coord.request_task(req)? {
        Some(task) => task_body(&task),
        None => Ok(json!({
            "success": true,
            "task": null,
            "message": "No tasks available",
        })),
    }
}

fn complete_task(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: CompleteTask = parse(args.body, &["task_id", "session_id"])?;
    task_body(&coord.complete_task(req)?)
}

fn reopen_task(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: ReopenTask = parse(args.body, &["task_id"])?;
    task_body(&coord.reopen_task(req)?)
}

fn bulk_complete(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: BulkComplete = parse(args.body, &["task_ids"])?;
    success_with(&coord.bulk_complete(req))
}

fn bulk_reopen(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: BulkReopen = parse(args.body, &["task_ids"])?;
    success_with(&coord.bulk_reopen(req))
}

fn add_note(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: AddNote = parse(args.body, &["task_id", "session_id", "note"])?;
    task_body(&coord.add_note(req)?)
}

fn edit_task(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: EditTask = parse(args.body, &["task_id"])?;
    task_body(&coord.edit_task(req)?)
}

fn delete_task(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: DeleteTask = parse(args.body, &["task_id"])?;
    success_with(&coord.delete_task(req)?)
}

fn timer_start(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: TimerRequest = parse(args.body, &["task_id"])?;
    task_body(&coord.timer_start(&req.task_id)?)
}

fn timer_pause(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: TimerRequest = parse(args.body, &["task_id"])?;
    task_body(&coord.timer_pause(&req.task_id)?)
}

fn timer_stop(coord: &mut Coordinator, args: RouteArgs) -> Result<Value, ApiError> {
    let req: TimerRequest = parse(args.body, &["task_id"])?;
    task_body(&coord.timer_stop(&req.task_id)?)
}

#[cfg(test)]
mod tests {
    use libtaskhive::{BacklogFile, CoordinatorConfig};

    use super::*;

    fn coordinator(dir: &std::path::Path) -> Coordinator {
        Coordinator::open(BacklogFile::in_state_dir(dir), CoordinatorConfig::default()).unwrap()
    }

    fn call(coord: &mut Coordinator, method: Method, path: &str, body: Value) -> Result<Value, ApiError> {
        let (handler, params) = resolve(method, path).expect("route");
        handler(
            coord,
            RouteArgs {
                params,
                body,
                ..Default::default()
            },
        )
    }

    #[test]
    fn resolves_static_and_parameterized_routes() {
        assert!(resolve(Method::Get, "/status").is_some());
        assert!(resolve(Method::Get, "/status/").is_some());
        let (_, params) = resolve(Method::Get, "/task/task-007/subtask-progress").unwrap();
        assert_eq!(params, vec!["task-007".to_string()]);
        assert!(resolve(Method::Post, "/status").is_none());
        assert!(resolve(Method::Get, "/task/").is_none());
        assert!(resolve(Method::Get, "/nope").is_none());
        assert!(resolve(Method::Other, "/status").is_none());
    }

    #[test]
    fn missing_fields_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = coordinator(dir.path());
        let err = call(&mut coord, Method::Post, "/task/complete", json!({"task_id": null})).unwrap_err();
        assert_eq!(err.status, StatusCode::UnprocessableEntity);
        assert_eq!(err.body["message"], "Missing required fields: task_id, session_id");
        assert_eq!(err.body["missing"], json!(["task_id", "session_id"]));

        let err = call(&mut coord, Method::Post, "/task/create", json!({})).unwrap_err();
        assert_eq!(err.body["message"], "Missing required field: title");
    }

    #[test]
    fn wrongly_typed_field_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = coordinator(dir.path());
        let err = call(&mut coord, Method::Post, "/task/create", json!({"title": 5})).unwrap_err();
        assert_eq!(err.status, StatusCode::BadRequest);
    }

    #[test]
    fn create_then_claim_then_show() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = coordinator(dir.path());
        let created = call(&mut coord, Method::Post, "/task/create", json!({"title": "a"})).unwrap();
        assert_eq!(created["success"], true);
        assert_eq!(created["task"]["id"], "task-001");

        let claimed = call(&mut coord, Method::Post, "/task/request", json!({"session_id": "w1"})).unwrap();
        assert_eq!(claimed["task"]["assignee"], "w1");

        let empty = call(&mut coord, Method::Post, "/task/request", json!({"session_id": "w2"})).unwrap();
        assert!(empty["task"].is_null());

        let shown = call(&mut coord, Method::Get, "/task/task-001", json!({})).unwrap();
        assert_eq!(shown["task"]["status"], "in_progress");
    }

    #[test]
    fn registering_as_system_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = coordinator(dir.path());
        let err = call(&mut coord, Method::Post, "/session/register", json!({"session_id": "system"}))
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BadRequest);
        assert_eq!(err.body["error"], "reserved_session_id");
    }

    #[test]
    fn domain_errors_keep_their_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = coordinator(dir.path());
        let err = call(&mut coord, Method::Get, "/task/task-404", json!({})).unwrap_err();
        assert_eq!(err.status, StatusCode::NotFound);
        assert_eq!(err.body["error"], "task_not_found");

        let err = call(
            &mut coord,
            Method::Post,
            "/task/create",
            json!({"title": "a", "priority": 9}),
        )
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BadRequest);
        assert_eq!(err.body["error"], "invalid_priority");
    }

    #[test]
    fn bulk_result_carries_success_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = coordinator(dir.path());
        call(&mut coord, Method::Post, "/task/create", json!({"title": "a"})).unwrap();
        let body = call(
            &mut coord,
            Method::Post,
            "/task/bulk-complete",
            json!({"task_ids": ["task-001", "task-404"], "session_id": "w1"}),
        )
        .unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["total_succeeded"], 1);
        assert_eq!(body["failed"][0]["id"], "task-404");
    }

    #[test]
    fn list_rejects_unknown_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = coordinator(dir.path());
        let (handler, params) = resolve(Method::Get, "/tasks").unwrap();
        let err = handler(
            &mut coord,
            RouteArgs {
                params,
                query: HashMap::from([("status".to_string(), "sleeping".to_string())]),
                body: json!({}),
            },
        )
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BadRequest);
    }
}
