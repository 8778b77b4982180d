use std::collections::BTreeMap;

use taskhive_protocol::{
    BranchedTask, MergeItem, ParallelSummary, Session, SessionInfo, SessionRole, StatusCounts,
    StatusSummary, SubtaskProgress, Task, TaskStatus,
};

use crate::assign::is_ready;
use crate::error::CoordError;
use crate::store::Coordinator;

const MERGE_NOTES: usize = 3;
const DEFAULT_BRANCH: &str = "main";

fn session_info(session: &Session) -> SessionInfo {
    SessionInfo {
        session_id: session.session_id.clone(),
        working_on: session.working_on.clone(),
        context: session.context.clone(),
        labels: session.labels.clone(),
        branch: session.branch.clone(),
        last_heartbeat: session.last_heartbeat,
    }
}

impl Coordinator {
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.backlog
            .ordered_tasks()
            .into_iter()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect()
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, CoordError> {
        self.backlog.task(task_id).cloned()
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.backlog.sessions.get(session_id)
    }

    /// Children of `task_id` that still exist, in creation order.
    pub fn subtasks(&self, task_id: &str) -> Result<Vec<Task>, CoordError> {
        let task = self.backlog.task(task_id)?;
        Ok(task
            .subtasks
            .iter()
            .filter_map(|id| self.backlog.tasks.get(id))
            .cloned()
            .collect())
    }

    /// A task with no subtasks counts as fully complete. Halves round to
    /// even, so 1 of 8 reads as 12%.
    pub fn subtask_progress(&self, task_id: &str) -> Result<SubtaskProgress, CoordError> {
        let task = self.backlog.task(task_id)?;
        let mut counts = StatusCounts::default();
        for child in task.subtasks.iter().filter_map(|id| self.backlog.tasks.get(id)) {
            counts.record(child.status);
        }

        let total = task.subtasks.len();
        let percentage = if total == 0 {
            100
        } else {
            (counts.done as f64 / total as f64 * 100.0).round_ties_even() as u32
        };
        Ok(SubtaskProgress {
            total,
            completed: counts.done,
            in_progress: counts.in_progress,
            open: counts.open,
            blocked: counts.blocked,
            percentage,
        })
    }

    pub fn status_summary(&self) -> StatusSummary {
        let tasks = self.backlog.ordered_tasks();
        let mut tasks_by_status = StatusCounts::default();
        for task in &tasks {
            tasks_by_status.record(task.status);
        }

        let mut sessions: Vec<&Session> = self.backlog.sessions.values().collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.session_id.cmp(&b.session_id)));
        let main_session = sessions
            .iter()
            .find(|s| s.role == SessionRole::Main)
            .map(|s| session_info(s));
        let worker_sessions: Vec<SessionInfo> = sessions
            .iter()
            .filter(|s| s.role == SessionRole::Worker)
            .map(|s| session_info(s))
            .collect();

        StatusSummary {
            total_tasks: tasks.len(),
            tasks_by_status,
            ready_tasks: tasks
                .iter()
                .filter(|t| is_ready(t, &self.backlog.tasks))
                .count(),
            main_session,
            active_workers: worker_sessions.len(),
            worker_sessions,
            completed_with_branches: tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Done)
                .filter_map(|t| {
                    t.branch.as_ref().map(|branch| BranchedTask {
                        id: t.id.clone(),
                        title: t.title.clone(),
                        branch: branch.clone(),
                    })
                })
                .collect(),
        }
    }

    /// Completed work grouped by branch, for the merge phase.
    pub fn parallel_summary(&self) -> ParallelSummary {
        let mut branches: BTreeMap<String, Vec<MergeItem>> = BTreeMap::new();
        let mut total_completed = 0;
        for task in self
            .backlog
            .ordered_tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Done)
        {
            total_completed += 1;
            let start = task.notes.len().saturating_sub(MERGE_NOTES);
            branches
                .entry(task.branch.clone().unwrap_or_else(|| DEFAULT_BRANCH.to_string()))
                .or_default()
                .push(MergeItem {
                    id: task.id.clone(),
                    title: task.title.clone(),
                    notes: task.notes[start..].to_vec(),
                });
        }

        ParallelSummary {
            total_completed,
            branches_to_merge: branches
                .keys()
                .filter(|b| b.as_str() != DEFAULT_BRANCH)
                .cloned()
                .collect(),
            branches,
        }
    }
}

#[cfg(test)]
mod tests {
    use taskhive_protocol::{CompleteTask, CreateSubtask};

    use super::*;
    use crate::testing::{claim, create, open, register};

    fn complete(coord: &mut Coordinator, task_id: &str, branch: Option<&str>) {
        coord
            .complete_task(CompleteTask {
                task_id: task_id.to_string(),
                session_id: "s1".to_string(),
                branch: branch.map(str::to_string),
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn progress_counts_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let parent = create(&mut coord, "parent", 2, &[]);
        assert_eq!(coord.subtask_progress(&parent.id).unwrap().percentage, 100);

        let mut children = Vec::new();
        for title in ["a", "b", "c"] {
            children.push(
                coord
                    .create_subtask(CreateSubtask {
                        parent_id: parent.id.clone(),
                        title: title.to_string(),
                        ..Default::default()
                    })
                    .unwrap(),
            );
        }
        complete(&mut coord, &children[0].id, None);

        let progress = coord.subtask_progress(&parent.id).unwrap();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.open, 2);
        assert_eq!(progress.percentage, 33);
        assert_eq!(coord.subtasks(&parent.id).unwrap().len(), 3);
    }

    #[test]
    fn progress_rounds_halves_to_even() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let parent = create(&mut coord, "parent", 2, &[]);
        let children: Vec<Task> = (0..8)
            .map(|i| {
                coord
                    .create_subtask(CreateSubtask {
                        parent_id: parent.id.clone(),
                        title: format!("part {i}"),
                        ..Default::default()
                    })
                    .unwrap()
            })
            .collect();

        complete(&mut coord, &children[0].id, None);
        assert_eq!(coord.subtask_progress(&parent.id).unwrap().percentage, 12);

        complete(&mut coord, &children[1].id, None);
        complete(&mut coord, &children[2].id, None);
        assert_eq!(coord.subtask_progress(&parent.id).unwrap().percentage, 38);
    }

    #[test]
    fn status_counts_sessions_and_ready_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let main = register(&mut coord, SessionRole::Main, &[]);
        let worker = register(&mut coord, SessionRole::Worker, &[]);
        create(&mut coord, "a", 1, &[]);
        create(&mut coord, "b", 2, &[]);
        let c = create(&mut coord, "c", 3, &[]);
        claim(&mut coord, &worker).unwrap();
        complete(&mut coord, &c.id, Some("feature/c"));

        let status = coord.status_summary();
        assert_eq!(status.total_tasks, 3);
        assert_eq!(status.tasks_by_status.in_progress, 1);
        assert_eq!(status.tasks_by_status.open, 1);
        assert_eq!(status.tasks_by_status.done, 1);
        assert_eq!(status.ready_tasks, 1);
        assert_eq!(status.main_session.unwrap().session_id, main);
        assert_eq!(status.active_workers, 1);
        assert_eq!(status.completed_with_branches[0].branch, "feature/c");
    }

    #[test]
    fn parallel_summary_groups_by_branch() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let a = create(&mut coord, "a", 2, &[]);
        let b = create(&mut coord, "b", 2, &[]);
        let c = create(&mut coord, "c", 2, &[]);
        create(&mut coord, "open", 2, &[]);
        complete(&mut coord, &a.id, Some("feature/x"));
        complete(&mut coord, &b.id, Some("feature/x"));
        complete(&mut coord, &c.id, None);

        let summary = coord.parallel_summary();
        assert_eq!(summary.total_completed, 3);
        assert_eq!(summary.branches["feature/x"].len(), 2);
        assert_eq!(summary.branches["main"].len(), 1);
        assert_eq!(summary.branches_to_merge, vec!["feature/x".to_string()]);
    }

    #[test]
    fn list_filters_by_status_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let a = create(&mut coord, "a", 2, &[]);
        let b = create(&mut coord, "b", 2, &[]);
        complete(&mut coord, &a.id, None);

        let ids: Vec<_> = coord.list_tasks(None).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);
        let open: Vec<_> = coord
            .list_tasks(Some(TaskStatus::Open))
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(open, vec![b.id]);
        assert!(matches!(coord.get_task("task-404"), Err(CoordError::TaskNotFound(_))));
    }
}
