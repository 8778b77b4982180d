use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use taskhive_protocol::{
    AddNote, BacklogDocument, CreateSubtask, CreateTask, DEFAULT_PRIORITY, DeleteOutcome,
    DeleteTask, EditTask, Event, EventKind, MAX_PRIORITY, SCHEMA_VERSION, SYSTEM_AUTHOR, Session,
    SessionId, Task, TaskId, TaskStatus,
};

use crate::broker::{DEFAULT_SUBSCRIBER_QUEUE, EventBroker, SubscriberId, Subscription};
use crate::error::{CoordError, PersistError};
use crate::persist::{BacklogFile, id_number};

/// The coordinator behind its single mutation lock. Every operation that
/// changes state takes `&mut Coordinator`, so it holds the lock for the
/// whole read-modify-persist sequence.
pub type SharedCoordinator = Arc<Mutex<Coordinator>>;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// A session without a heartbeat for this long is reaped.
    pub stale_threshold: TimeDelta,
    /// Broadcast `parallel_complete` when the last worker ends.
    pub auto_shutdown: bool,
    pub subscriber_queue: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stale_threshold: TimeDelta::minutes(10),
            auto_shutdown: true,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

/// Authoritative in-memory state. Cloned as the rollback snapshot of a
/// mutation.
#[derive(Debug, Clone, Default)]
pub(crate) struct Backlog {
    pub(crate) tasks: HashMap<TaskId, Task>,
    pub(crate) sessions: HashMap<SessionId, Session>,
    /// Task ids each session has completed; feeds assignment affinity.
    pub(crate) completed_by: HashMap<SessionId, BTreeSet<TaskId>>,
    pub(crate) next_id: u64,
}

impl Backlog {
    fn from_document(doc: BacklogDocument) -> Self {
        let mut completed_by: HashMap<SessionId, BTreeSet<TaskId>> = HashMap::new();
        // A completion counts even if the task was later reopened.
        for task in &doc.tasks {
            for note in task.notes.iter().filter(|n| n.note.starts_with("Completed")) {
                if note.session_id != SYSTEM_AUTHOR {
                    completed_by
                        .entry(note.session_id.clone())
                        .or_default()
                        .insert(task.id.clone());
                }
            }
        }

        let highest = doc
            .tasks
            .iter()
            .filter_map(|t| id_number(&t.id))
            .max()
            .unwrap_or(0);

        Self {
            tasks: doc.tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            sessions: HashMap::new(),
            completed_by,
            next_id: doc.next_id.max(highest + 1),
        }
    }

    fn to_document(&self) -> BacklogDocument {
        BacklogDocument {
            version: SCHEMA_VERSION,
            next_id: self.next_id,
            tasks: self.ordered_tasks().into_iter().cloned().collect(),
        }
    }

    /// Tasks in creation order.
    pub(crate) fn ordered_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by(|a, b| id_order(&a.id).cmp(&id_order(&b.id)));
        tasks
    }

    pub(crate) fn allocate_id(&mut self) -> TaskId {
        let id = format!("task-{:03}", self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn task(&self, id: &str) -> Result<&Task, CoordError> {
        self.tasks
            .get(id)
            .ok_or_else(|| CoordError::TaskNotFound(id.to_string()))
    }

    pub(crate) fn task_mut(&mut self, id: &str) -> Result<&mut Task, CoordError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| CoordError::TaskNotFound(id.to_string()))
    }

    /// Drop `task_id` from every session's `working_on`.
    pub(crate) fn detach_from_sessions(&mut self, task_id: &str) {
        for session in self.sessions.values_mut() {
            session.working_on.retain(|id| id != task_id);
        }
    }

    /// Return every task assigned to `session_id` to the open pool.
    pub(crate) fn release_held_by(
        &mut self,
        session_id: &str,
        author: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Vec<TaskId> {
        let mut released = Vec::new();
        for task in self.tasks.values_mut() {
            if task.assignee.as_deref() == Some(session_id) {
                task.assignee = None;
                task.status = TaskStatus::Open;
                task.push_note(author, note, now);
                released.push(task.id.clone());
            }
        }
        released.sort_by(|a, b| id_order(a).cmp(&id_order(b)));
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.working_on.retain(|id| !released.contains(id));
        }
        released
    }
}

/// Sort key that keeps `task-1000` after `task-999`.
pub(crate) fn id_order(id: &str) -> (u64, usize, &str) {
    (id_number(id).unwrap_or(u64::MAX), id.len(), id)
}

pub(crate) fn validate_priority(priority: Option<i64>) -> Result<Option<u8>, CoordError> {
    match priority {
        None => Ok(None),
        Some(p) if (0..=i64::from(MAX_PRIORITY)).contains(&p) => Ok(Some(p as u8)),
        Some(p) => Err(CoordError::InvalidPriority(p)),
    }
}

/// Remove duplicates, keeping first occurrences in order.
pub(crate) fn dedup(items: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Task store, assignment engine and session registry behind one lock.
pub struct Coordinator {
    pub(crate) backlog: Backlog,
    file: BacklogFile,
    broker: EventBroker,
    /// Count of `parallel_complete` signals so far. Unlike broker
    /// subscribers, receivers of this channel are never disconnected.
    completions: watch::Sender<u64>,
    pub(crate) config: CoordinatorConfig,
}

impl Coordinator {
    /// Load the backlog from `file` (recovering any interrupted write).
    pub fn open(file: BacklogFile, config: CoordinatorConfig) -> Result<Self, PersistError> {
        let doc = file.load()?;
        info!(
            path = %file.path().display(),
            tasks = doc.tasks.len(),
            "backlog loaded"
        );
        Ok(Self {
            backlog: Backlog::from_document(doc),
            broker: EventBroker::new(config.subscriber_queue),
            completions: watch::Sender::new(0),
            file,
            config,
        })
    }

    pub fn into_shared(self) -> SharedCoordinator {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn subscribe(&mut self) -> Subscription {
        self.broker.subscribe()
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.broker.unsubscribe(id)
    }

    /// Receiver that changes every time the last worker ends.
    pub fn watch_completions(&self) -> watch::Receiver<u64> {
        self.completions.subscribe()
    }

    pub(crate) fn signal_parallel_complete(&mut self) {
        self.completions.send_modify(|count| *count += 1);
        self.emit(EventKind::ParallelComplete {
            message: "All worker sessions have ended".to_string(),
        });
    }

    pub(crate) fn emit(&mut self, kind: EventKind) {
        self.broker.publish(Event::now(kind));
    }

    /// Write the current state to disk.
    pub fn flush(&mut self) -> Result<(), PersistError> {
        self.file.save(&self.backlog.to_document())
    }

    /// Apply `op` and persist. If either fails the backlog is restored to
    /// its state before `op` ran.
    pub(crate) fn commit<T>(
        &mut self,
        op: impl FnOnce(&mut Backlog) -> Result<T, CoordError>,
    ) -> Result<T, CoordError> {
        let snapshot = self.backlog.clone();
        let result = op(&mut self.backlog).and_then(|value| {
            self.file.save(&self.backlog.to_document())?;
            Ok(value)
        });
        if result.is_err() {
            self.backlog = snapshot;
        }
        result
    }

    pub fn create_task(&mut self, req: CreateTask) -> Result<Task, CoordError> {
        let priority = validate_priority(req.priority)?.unwrap_or(DEFAULT_PRIORITY);
        let task = self.commit(|backlog| {
            let now = Utc::now();
            let mut task = Task::new(backlog.allocate_id(), req.title, now);
            task.description = req.description;
            task.priority = priority;
            task.blocked_by = dedup(req.blocked_by);
            task.labels = dedup(req.labels);
            task.branch = req.branch;
            if let Some(session_id) = &req.session_id {
                task.push_note(session_id, "Created task", now);
            }
            backlog.tasks.insert(task.id.clone(), task.clone());
            Ok(task)
        })?;

        info!(task_id = %task.id, priority = task.priority, "task created");
        self.emit(EventKind::TaskCreated {
            task_id: task.id.clone(),
            title: task.title.clone(),
            parent_id: None,
        });
        Ok(task)
    }

    /// Create a child of `parent_id`. Priority and labels default to the
    /// parent's; the branch is always inherited.
    pub fn create_subtask(&mut self, req: CreateSubtask) -> Result<Task, CoordError> {
        let priority = validate_priority(req.priority)?;
        let task = self.commit(|backlog| {
            let parent = backlog
                .tasks
                .get(&req.parent_id)
                .ok_or_else(|| CoordError::ParentNotFound(req.parent_id.clone()))?;
            let inherited_priority = parent.priority;
            let inherited_labels = parent.labels.clone();
            let branch = parent.branch.clone();

            let now = Utc::now();
            let mut task = Task::new(backlog.allocate_id(), req.title, now);
            task.description = req.description;
            task.priority = priority.unwrap_or(inherited_priority);
            task.labels = dedup(req.labels.unwrap_or(inherited_labels));
            task.branch = branch;
            task.parent_id = Some(req.parent_id.clone());
            task.is_subtask = true;
            if let Some(session_id) = &req.session_id {
                task.push_note(session_id, format!("Created as subtask of {}", req.parent_id), now);
            }

            let parent = backlog.task_mut(&req.parent_id)?;
            parent.subtasks.push(task.id.clone());
            parent.updated_at = now;

            backlog.tasks.insert(task.id.clone(), task.clone());
            Ok(task)
        })?;

        info!(task_id = %task.id, parent_id = ?task.parent_id, "subtask created");
        self.emit(EventKind::TaskCreated {
            task_id: task.id.clone(),
            title: task.title.clone(),
            parent_id: task.parent_id.clone(),
        });
        Ok(task)
    }

    pub fn add_note(&mut self, req: AddNote) -> Result<Task, CoordError> {
        let task = self.commit(|backlog| {
            let task = backlog.task_mut(&req.task_id)?;
            task.push_note(&req.session_id, req.note, Utc::now());
            Ok(task.clone())
        })?;

        debug!(task_id = %task.id, session_id = %req.session_id, "note added");
        self.emit(EventKind::TaskUpdated {
            task_id: task.id.clone(),
            changes: vec!["note".to_string()],
        });
        Ok(task)
    }

    /// Update task fields. Status may only move between `open` and
    /// `blocked`; doing so releases any assignee. Returns the task unchanged
    /// when nothing differs.
    pub fn edit_task(&mut self, req: EditTask) -> Result<Task, CoordError> {
        let priority = validate_priority(req.priority)?;
        if let Some(status) = req.status {
            if !matches!(status, TaskStatus::Open | TaskStatus::Blocked) {
                return Err(CoordError::InvalidStatusChange(status));
            }
        }

        let current = self.backlog.task(&req.task_id)?;
        let changes = edit_changes(current, &req, priority);
        if changes.is_empty() {
            return Ok(current.clone());
        }

        let task = self.commit(|backlog| {
            let now = Utc::now();
            let task = backlog.task_mut(&req.task_id)?;
            if let Some(title) = req.title {
                task.title = title;
            }
            if let Some(description) = req.description {
                task.description = description;
            }
            if let Some(priority) = priority {
                task.priority = priority;
            }
            if let Some(labels) = req.labels {
                task.labels = dedup(labels);
            }
            if req.branch.is_some() {
                task.branch = req.branch;
            }
            let mut released = None;
            if let Some(status) = req.status {
                if task.status != status {
                    task.status = status;
                    released = task.assignee.take();
                }
            }
            let author = req.session_id.as_deref().unwrap_or(SYSTEM_AUTHOR);
            task.push_note(author, format!("Edited: {}", changes.join(", ")), now);
            let task = task.clone();
            if released.is_some() {
                backlog.detach_from_sessions(&task.id);
            }
            Ok(task)
        })?;

        info!(task_id = %task.id, changes = %changes.join(", "), "task edited");
        self.emit(EventKind::TaskUpdated {
            task_id: task.id.clone(),
            changes,
        });
        Ok(task)
    }

    /// Delete a task. A task with subtasks needs `force`, which removes the
    /// whole subtree.
    pub fn delete_task(&mut self, req: DeleteTask) -> Result<DeleteOutcome, CoordError> {
        let outcome = self.commit(|backlog| {
            let task = backlog.task(&req.task_id)?;
            if !task.subtasks.is_empty() && !req.force {
                return Err(CoordError::HasSubtasks {
                    task_id: task.id.clone(),
                    subtasks: task.subtasks.clone(),
                });
            }

            let mut deleted_subtasks = Vec::new();
            let mut pending = task.subtasks.clone();
            while let Some(id) = pending.pop() {
                if let Some(child) = backlog.tasks.remove(&id) {
                    pending.extend(child.subtasks);
                    backlog.detach_from_sessions(&id);
                    deleted_subtasks.push(id);
                }
            }
            deleted_subtasks.sort_by(|a, b| id_order(a).cmp(&id_order(b)));

            let task = backlog
                .tasks
                .remove(&req.task_id)
                .ok_or_else(|| CoordError::TaskNotFound(req.task_id.clone()))?;
            if let Some(parent) = task.parent_id.as_ref().and_then(|p| backlog.tasks.get_mut(p)) {
                parent.subtasks.retain(|id| id != &task.id);
                parent.updated_at = Utc::now();
            }
            backlog.detach_from_sessions(&task.id);

            Ok(DeleteOutcome {
                deleted: task.id,
                deleted_subtasks,
            })
        })?;

        info!(
            task_id = %outcome.deleted,
            subtasks = outcome.deleted_subtasks.len(),
            session_id = ?req.session_id,
            "task deleted"
        );
        self.emit(EventKind::TaskDeleted {
            task_id: outcome.deleted.clone(),
            subtasks: outcome.deleted_subtasks.clone(),
        });
        Ok(outcome)
    }
}

fn edit_changes(task: &Task, req: &EditTask, priority: Option<u8>) -> Vec<String> {
    let mut changes = Vec::new();
    if req.title.as_ref().is_some_and(|t| *t != task.title) {
        changes.push("title".to_string());
    }
    if req.description.as_ref().is_some_and(|d| *d != task.description) {
        changes.push("description".to_string());
    }
    if let Some(p) = priority.filter(|p| *p != task.priority) {
        changes.push(format!("priority to P{p}"));
    }
    if req.labels.as_ref().is_some_and(|l| dedup(l.clone()) != task.labels) {
        changes.push("labels".to_string());
    }
    if req.branch.is_some() && req.branch != task.branch {
        changes.push("branch".to_string());
    }
    if let Some(status) = req.status.filter(|s| *s != task.status) {
        changes.push(format!("status to {status}"));
    }
    changes
}

#[cfg(test)]
mod tests {
    use taskhive_protocol::RegisterSession;

    use super::*;
    use crate::testing::{create, open};

    #[test]
    fn ids_are_sequential_and_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let first = create(&mut coord, "a", 2, &[]);
        let second = create(&mut coord, "b", 2, &[]);
        assert_eq!(first.id, "task-001");
        assert_eq!(second.id, "task-002");

        coord
            .delete_task(DeleteTask {
                task_id: second.id.clone(),
                ..Default::default()
            })
            .unwrap();
        let third = create(&mut coord, "c", 2, &[]);
        assert_eq!(third.id, "task-003");

        drop(coord);
        let mut reopened = open(dir.path());
        assert_eq!(create(&mut reopened, "d", 2, &[]).id, "task-004");
    }

    #[test]
    fn priority_out_of_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let err = coord
            .create_task(CreateTask {
                title: "bad".to_string(),
                priority: Some(7),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidPriority(7)));
        assert!(coord.backlog.tasks.is_empty());
    }

    #[test]
    fn failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let file = BacklogFile::new(blocker.join("tasks.json"));
        let mut coord = Coordinator::open(file, CoordinatorConfig::default()).unwrap();

        let err = coord
            .create_task(CreateTask {
                title: "lost".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoordError::Persist(_)));
        assert!(coord.backlog.tasks.is_empty());
        assert_eq!(coord.backlog.next_id, 1);
    }

    #[test]
    fn subtask_inherits_from_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let parent = coord
            .create_task(CreateTask {
                title: "epic".to_string(),
                priority: Some(1),
                labels: vec!["api".to_string()],
                branch: Some("feature/api".to_string()),
                ..Default::default()
            })
            .unwrap();

        let child = coord
            .create_subtask(CreateSubtask {
                parent_id: parent.id.clone(),
                title: "endpoint".to_string(),
                session_id: Some("s1".to_string()),
                ..Default::default()
            })
            .unwrap();

        assert!(child.is_subtask);
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.priority, 1);
        assert_eq!(child.labels, vec!["api".to_string()]);
        assert_eq!(child.branch.as_deref(), Some("feature/api"));
        assert_eq!(child.notes[0].note, format!("Created as subtask of {}", parent.id));
        assert_eq!(coord.backlog.task(&parent.id).unwrap().subtasks, vec![child.id]);
    }

    #[test]
    fn subtask_of_missing_parent_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let err = coord
            .create_subtask(CreateSubtask {
                parent_id: "task-999".to_string(),
                title: "orphan".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoordError::ParentNotFound(_)));
        assert_eq!(coord.backlog.next_id, 1);
    }

    #[test]
    fn edit_records_changes_and_skips_noops() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let task = create(&mut coord, "draft", 2, &[]);

        let unchanged = coord
            .edit_task(EditTask {
                task_id: task.id.clone(),
                title: Some("draft".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(unchanged.notes.is_empty());

        let edited = coord
            .edit_task(EditTask {
                task_id: task.id.clone(),
                title: Some("final".to_string()),
                priority: Some(0),
                status: Some(TaskStatus::Blocked),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(edited.title, "final");
        assert_eq!(edited.priority, 0);
        assert_eq!(edited.status, TaskStatus::Blocked);
        assert_eq!(
            edited.notes.last().unwrap().note,
            "Edited: title, priority to P0, status to blocked"
        );
    }

    #[test]
    fn edit_cannot_mark_done() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let task = create(&mut coord, "x", 2, &[]);
        let err = coord
            .edit_task(EditTask {
                task_id: task.id,
                status: Some(TaskStatus::Done),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoordError::InvalidStatusChange(TaskStatus::Done)));
    }

    #[test]
    fn blocking_a_claimed_task_releases_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let session = coord.register_session(RegisterSession::default()).unwrap();
        let task = create(&mut coord, "x", 2, &[]);
        crate::testing::claim(&mut coord, &session.session_id).unwrap();

        let edited = coord
            .edit_task(EditTask {
                task_id: task.id.clone(),
                status: Some(TaskStatus::Blocked),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(edited.assignee, None);
        assert!(coord.backlog.sessions[&session.session_id].working_on.is_empty());
    }

    #[test]
    fn delete_requires_force_for_parents() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let parent = create(&mut coord, "parent", 2, &[]);
        let child = coord
            .create_subtask(CreateSubtask {
                parent_id: parent.id.clone(),
                title: "child".to_string(),
                ..Default::default()
            })
            .unwrap();
        let grandchild = coord
            .create_subtask(CreateSubtask {
                parent_id: child.id.clone(),
                title: "grandchild".to_string(),
                ..Default::default()
            })
            .unwrap();

        let err = coord
            .delete_task(DeleteTask {
                task_id: parent.id.clone(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, CoordError::HasSubtasks { .. }));

        let outcome = coord
            .delete_task(DeleteTask {
                task_id: parent.id.clone(),
                force: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(outcome.deleted, parent.id);
        assert_eq!(outcome.deleted_subtasks, vec![child.id, grandchild.id]);
        assert!(coord.backlog.tasks.is_empty());
    }

    #[test]
    fn deleting_subtask_detaches_from_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let parent = create(&mut coord, "parent", 2, &[]);
        let child = coord
            .create_subtask(CreateSubtask {
                parent_id: parent.id.clone(),
                title: "child".to_string(),
                ..Default::default()
            })
            .unwrap();

        coord
            .delete_task(DeleteTask {
                task_id: child.id,
                ..Default::default()
            })
            .unwrap();
        assert!(coord.backlog.task(&parent.id).unwrap().subtasks.is_empty());
    }

    #[test]
    fn notes_survive_reload_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let task = create(&mut coord, "chatty", 2, &[]);
        for i in 0..60 {
            coord
                .add_note(AddNote {
                    task_id: task.id.clone(),
                    session_id: "s1".to_string(),
                    note: format!("n{i}"),
                })
                .unwrap();
        }
        assert_eq!(coord.backlog.task(&task.id).unwrap().notes.len(), 60);

        drop(coord);
        let reloaded = open(dir.path());
        let notes = &reloaded.backlog.task(&task.id).unwrap().notes;
        assert_eq!(notes.len(), 50);
        assert_eq!(notes.first().unwrap().note, "n10");
    }

    #[test]
    fn id_order_is_numeric() {
        let mut ids = vec!["task-1000", "task-999", "task-001"];
        ids.sort_by(|a, b| id_order(a).cmp(&id_order(b)));
        assert_eq!(ids, vec!["task-001", "task-999", "task-1000"]);
    }
}
