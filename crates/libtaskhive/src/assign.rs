use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use taskhive_protocol::{
    BulkComplete, BulkReopen, BulkResult, CompleteTask, EventKind, ReopenTask, RequestTask,
    SYSTEM_AUTHOR, Task, TaskId, TaskStatus,
};

use crate::error::CoordError;
use crate::store::{Backlog, Coordinator, id_order};

/// A task is ready when it is open, unassigned, and every blocker that
/// still exists is done.
pub fn is_ready(task: &Task, tasks: &HashMap<TaskId, Task>) -> bool {
    task.status == TaskStatus::Open
        && task.assignee.is_none()
        && task
            .blocked_by
            .iter()
            .filter_map(|id| tasks.get(id))
            .all(|blocker| blocker.status == TaskStatus::Done)
}

/// Ranking of one candidate for one requester. Lower sorts first.
#[derive(Debug, Clone, PartialEq)]
pub struct Score<'a> {
    pub priority: u8,
    pub preference: i64,
    pub affinity: f64,
    pub load: f64,
    pub created_at: DateTime<Utc>,
    pub id: &'a str,
}

impl Score<'_> {
    fn cmp_rank(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.preference.cmp(&other.preference))
            .then((-self.affinity).total_cmp(&-other.affinity))
            .then(self.load.total_cmp(&other.load))
            .then(self.created_at.cmp(&other.created_at))
            .then(id_order(self.id).cmp(&id_order(other.id)))
    }
}

/// What the requester brings to scoring.
struct Requester<'a> {
    preferred: &'a [String],
    labels: &'a [String],
    completed_labels: BTreeSet<&'a str>,
    working_on: usize,
}

impl Requester<'_> {
    fn score<'t>(&self, task: &'t Task) -> Score<'t> {
        let overlap = |set: &[String]| task.labels.iter().filter(|l| set.contains(*l)).count();
        let history = task
            .labels
            .iter()
            .filter(|l| self.completed_labels.contains(l.as_str()))
            .count();
        let load = if task.subtasks.is_empty() {
            0.0
        } else {
            0.5 * self.working_on as f64
        };

        Score {
            priority: task.priority,
            preference: -3 * overlap(self.preferred) as i64,
            affinity: 2.0 * overlap(self.labels) as f64 + 0.5 * history as f64,
            load,
            created_at: task.created_at,
            id: &task.id,
        }
    }
}

impl Backlog {
    /// Best ready task for `session_id`, if any.
    pub(crate) fn best_candidate(&self, session_id: &str, preferred: &[String]) -> Option<TaskId> {
        let session = self.sessions.get(session_id);
        let completed_labels = self
            .completed_by
            .get(session_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tasks.get(id))
            .flat_map(|t| t.labels.iter().map(String::as_str))
            .collect();
        let requester = Requester {
            preferred,
            labels: session.map(|s| s.labels.as_slice()).unwrap_or(&[]),
            completed_labels,
            working_on: session.map_or(0, |s| s.working_on.len()),
        };

        self.tasks
            .values()
            .filter(|t| is_ready(t, &self.tasks))
            .map(|t| requester.score(t))
            .min_by(|a, b| a.cmp_rank(b))
            .map(|score| score.id.to_string())
    }

    /// Mark `task_id` done. Without `force`, every existing subtask must
    /// already be done.
    fn complete(
        &mut self,
        task_id: &str,
        author: &str,
        note: String,
        branch: Option<String>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Task, CoordError> {
        let task = self.task(task_id)?;
        if !force {
            let incomplete: Vec<_> = task
                .subtasks
                .iter()
                .filter_map(|id| self.tasks.get(id))
                .filter(|child| child.status != TaskStatus::Done)
                .map(Task::summary)
                .collect();
            if !incomplete.is_empty() {
                return Err(CoordError::IncompleteSubtasks {
                    task_id: task_id.to_string(),
                    incomplete,
                });
            }
        }

        let task = self.task_mut(task_id)?;
        task.status = TaskStatus::Done;
        task.assignee = None;
        if branch.is_some() {
            task.branch = branch;
        }
        task.push_note(author, note, now);
        let task = task.clone();

        self.detach_from_sessions(task_id);
        if author != SYSTEM_AUTHOR {
            self.completed_by
                .entry(author.to_string())
                .or_default()
                .insert(task.id.clone());
        }
        Ok(task)
    }

    fn reopen(
        &mut self,
        task_id: &str,
        author: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(Task, TaskStatus), CoordError> {
        let task = self.task_mut(task_id)?;
        let previous = task.status;
        if previous == TaskStatus::Open {
            return Err(CoordError::AlreadyOpen(task_id.to_string()));
        }

        task.status = TaskStatus::Open;
        task.assignee = None;
        let text = match note {
            Some(note) => format!("Reopened (was {previous}): {note}"),
            None => format!("Reopened (was {previous})"),
        };
        task.push_note(author, text, now);
        let task = task.clone();
        self.detach_from_sessions(task_id);
        Ok((task, previous))
    }
}

fn completion_note(note: Option<&str>, fallback: &str) -> String {
    match note {
        Some(note) if !note.is_empty() => format!("Completed: {note}"),
        _ => fallback.to_string(),
    }
}

impl Coordinator {
    /// Claim the best ready task for the requesting session.
    ///
    /// Candidates sort by priority, then preferred-label overlap, then
    /// affinity with the session's own labels and past completions, then a
    /// load penalty for parent tasks, then age.
    pub fn request_task(&mut self, req: RequestTask) -> Result<Option<Task>, CoordError> {
        if self
            .backlog
            .best_candidate(&req.session_id, &req.preferred_labels)
            .is_none()
        {
            debug!(session_id = %req.session_id, "no ready task");
            return Ok(None);
        }

        let claimed = self.commit(|backlog| {
            let Some(task_id) = backlog.best_candidate(&req.session_id, &req.preferred_labels)
            else {
                return Ok(None);
            };

            let task = backlog.task_mut(&task_id)?;
            task.assignee = Some(req.session_id.clone());
            task.status = TaskStatus::InProgress;
            task.push_note(&req.session_id, "Claimed task", Utc::now());
            let task = task.clone();

            if let Some(session) = backlog.sessions.get_mut(&req.session_id) {
                session.working_on.push(task_id);
            }
            Ok(Some(task))
        })?;

        if let Some(task) = &claimed {
            info!(task_id = %task.id, session_id = %req.session_id, "task claimed");
            self.emit(EventKind::TaskClaimed {
                task_id: task.id.clone(),
                session_id: req.session_id.clone(),
            });
        }
        Ok(claimed)
    }

    pub fn complete_task(&mut self, req: CompleteTask) -> Result<Task, CoordError> {
        let note = completion_note(req.note.as_deref(), "Completed");
        let task = self.commit(|backlog| {
            backlog.complete(&req.task_id, &req.session_id, note, req.branch, req.force, Utc::now())
        })?;

        info!(task_id = %task.id, session_id = %req.session_id, branch = ?task.branch, "task completed");
        self.emit(EventKind::TaskCompleted {
            task_id: task.id.clone(),
            session_id: req.session_id,
            branch: task.branch.clone(),
        });
        Ok(task)
    }

    /// Complete each task independently; failures do not stop the rest.
    pub fn bulk_complete(&mut self, req: BulkComplete) -> BulkResult {
        let author = req.session_id.as_deref().unwrap_or(SYSTEM_AUTHOR).to_string();
        let note = completion_note(req.note.as_deref(), "Completed (bulk)");
        let mut result = BulkResult::default();

        for task_id in &req.task_ids {
            let outcome = self.commit(|backlog| {
                backlog.complete(
                    task_id,
                    &author,
                    note.clone(),
                    req.branch.clone(),
                    req.force,
                    Utc::now(),
                )
            });
            match outcome {
                Ok(task) => {
                    self.emit(EventKind::TaskCompleted {
                        task_id: task.id.clone(),
                        session_id: author.clone(),
                        branch: task.branch.clone(),
                    });
                    result.succeeded.push(task.id);
                }
                Err(err) => result.failed.push(err.to_bulk_failure(task_id)),
            }
        }

        finish_bulk(&mut result);
        info!(
            succeeded = result.total_succeeded,
            failed = result.total_failed,
            "bulk complete"
        );
        result
    }

    pub fn reopen_task(&mut self, req: ReopenTask) -> Result<Task, CoordError> {
        let author = req.session_id.as_deref().unwrap_or(SYSTEM_AUTHOR);
        let (task, previous) = self.commit(|backlog| {
            backlog.reopen(&req.task_id, author, req.note.as_deref(), Utc::now())
        })?;

        info!(task_id = %task.id, previous = %previous, "task reopened");
        self.emit(EventKind::TaskReopened {
            task_id: task.id.clone(),
            previous,
        });
        Ok(task)
    }

    pub fn bulk_reopen(&mut self, req: BulkReopen) -> BulkResult {
        let author = req.session_id.as_deref().unwrap_or(SYSTEM_AUTHOR);
        let mut result = BulkResult::default();

        for task_id in &req.task_ids {
            let outcome = self.commit(|backlog| {
                backlog.reopen(task_id, author, req.note.as_deref(), Utc::now())
            });
            match outcome {
                Ok((task, previous)) => {
                    self.emit(EventKind::TaskReopened {
                        task_id: task.id.clone(),
                        previous,
                    });
                    result.succeeded.push(task.id);
                }
                Err(err) => result.failed.push(err.to_bulk_failure(task_id)),
            }
        }

        finish_bulk(&mut result);
        info!(
            succeeded = result.total_succeeded,
            failed = result.total_failed,
            "bulk reopen"
        );
        result
    }
}

fn finish_bulk(result: &mut BulkResult) {
    result.total_succeeded = result.succeeded.len();
    result.total_failed = result.failed.len();
}
