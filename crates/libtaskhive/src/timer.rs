use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use taskhive_protocol::{
    EventKind, ReportGrouping, Task, TaskTime, TimeReport, TimeReportItem, TimeTracking, hours,
};

use crate::error::CoordError;
use crate::store::Coordinator;

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    ((now - since).num_milliseconds() as f64 / 1000.0).max(0.0)
}

/// Start or resume. Returns false if already running.
pub fn start(tracking: &mut Option<TimeTracking>, now: DateTime<Utc>) -> bool {
    let tt = tracking.get_or_insert_with(TimeTracking::default);
    if tt.is_running() {
        return false;
    }
    tt.started_at = Some(now);
    tt.paused_at = None;
    true
}

/// Bank the running interval and mark paused. Returns false if not running.
pub fn pause(tracking: &mut Option<TimeTracking>, now: DateTime<Utc>) -> bool {
    match tracking {
        Some(tt) => match tt.started_at.take() {
            Some(started) => {
                tt.total_seconds += elapsed(started, now);
                tt.paused_at = Some(now);
                true
            }
            None => false,
        },
        None => false,
    }
}

/// Bank the running interval and clear the timer. Returns false if not
/// running.
pub fn stop(tracking: &mut Option<TimeTracking>, now: DateTime<Utc>) -> bool {
    match tracking {
        Some(tt) => match tt.started_at.take() {
            Some(started) => {
                tt.total_seconds += elapsed(started, now);
                tt.paused_at = None;
                true
            }
            None => false,
        },
        None => false,
    }
}

pub fn task_time(task: &Task, now: DateTime<Utc>) -> TaskTime {
    let tt = task.time_tracking.clone().unwrap_or_default();
    TaskTime {
        task_id: task.id.clone(),
        total_seconds: tt.total_seconds,
        is_running: tt.is_running(),
        is_paused: tt.paused_at.is_some(),
        current_elapsed: tt.started_at.map_or(0.0, |started| elapsed(started, now)),
    }
}

/// Aggregate banked time over `tasks`, optionally restricted to tasks
/// carrying any of `labels`.
pub fn report<'a>(
    tasks: impl IntoIterator<Item = &'a Task>,
    by: ReportGrouping,
    labels: &[String],
) -> TimeReport {
    let tracked: Vec<(&Task, f64)> = tasks
        .into_iter()
        .filter(|t| labels.is_empty() || t.labels.iter().any(|l| labels.contains(l)))
        .filter_map(|t| {
            let seconds = t.time_tracking.as_ref().map_or(0.0, |tt| tt.total_seconds);
            (seconds > 0.0).then_some((t, seconds))
        })
        .collect();

    let total_seconds: f64 = tracked.iter().map(|(_, s)| s).sum();
    let item = |key: String, title: Option<String>, seconds: f64| TimeReportItem {
        key,
        title,
        seconds,
        hours: hours(seconds),
    };

    let items = match by {
        ReportGrouping::Task => tracked
            .iter()
            .map(|(t, s)| item(t.id.clone(), Some(t.title.clone()), *s))
            .collect(),
        ReportGrouping::Label => {
            let mut per_label: BTreeMap<&str, f64> = BTreeMap::new();
            for (task, seconds) in &tracked {
                if task.labels.is_empty() {
                    *per_label.entry("unlabeled").or_default() += seconds;
                }
                for label in &task.labels {
                    *per_label.entry(label.as_str()).or_default() += seconds;
                }
            }
            let mut rows: Vec<_> = per_label.into_iter().collect();
            rows.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
            rows.into_iter()
                .map(|(label, s)| item(label.to_string(), None, s))
                .collect()
        }
        ReportGrouping::Day => {
            let mut per_day: BTreeMap<String, f64> = BTreeMap::new();
            for (task, seconds) in &tracked {
                *per_day
                    .entry(task.updated_at.format("%Y-%m-%d").to_string())
                    .or_default() += seconds;
            }
            per_day
                .into_iter()
                .rev()
                .map(|(day, s)| item(day, None, s))
                .collect()
        }
    };

    TimeReport {
        by,
        total_seconds,
        total_hours: hours(total_seconds),
        items,
    }
}

#[derive(Clone, Copy)]
enum TimerAction {
    Start,
    Pause,
    Stop,
}

impl TimerAction {
    fn name(self) -> &'static str {
        match self {
            TimerAction::Start => "timer_started",
            TimerAction::Pause => "timer_paused",
            TimerAction::Stop => "timer_stopped",
        }
    }
}

impl Coordinator {
    pub fn timer_start(&mut self, task_id: &str) -> Result<Task, CoordError> {
        self.apply_timer(task_id, TimerAction::Start)
    }

    pub fn timer_pause(&mut self, task_id: &str) -> Result<Task, CoordError> {
        self.apply_timer(task_id, TimerAction::Pause)
    }

    pub fn timer_stop(&mut self, task_id: &str) -> Result<Task, CoordError> {
        self.apply_timer(task_id, TimerAction::Stop)
    }

    pub fn task_time(&self, task_id: &str) -> Result<TaskTime, CoordError> {
        Ok(task_time(self.backlog.task(task_id)?, Utc::now()))
    }

    pub fn time_report(&self, by: ReportGrouping, labels: &[String]) -> TimeReport {
        report(self.backlog.ordered_tasks(), by, labels)
    }

    /// Timer calls that change nothing return the task without a write.
    fn apply_timer(&mut self, task_id: &str, action: TimerAction) -> Result<Task, CoordError> {
        let now = Utc::now();
        let mut tracking = self.backlog.task(task_id)?.time_tracking.clone();
        let changed = match action {
            TimerAction::Start => start(&mut tracking, now),
            TimerAction::Pause => pause(&mut tracking, now),
            TimerAction::Stop => stop(&mut tracking, now),
        };
        if !changed {
            return Ok(self.backlog.task(task_id)?.clone());
        }

        let task = self.commit(|backlog| {
            let task = backlog.task_mut(task_id)?;
            task.time_tracking = tracking;
            task.updated_at = now;
            Ok(task.clone())
        })?;

        debug!(task_id = %task_id, action = action.name(), "timer updated");
        self.emit(EventKind::TaskUpdated {
            task_id: task.id.clone(),
            changes: vec![action.name().to_string()],
        });
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};

    use super::*;
    use crate::testing::{create, open};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tracked(id: &str, labels: &[&str], seconds: f64, day: DateTime<Utc>) -> Task {
        let mut task = Task::new(id.to_string(), format!("title {id}"), day);
        task.labels = labels.iter().map(|l| l.to_string()).collect();
        task.time_tracking = Some(TimeTracking {
            total_seconds: seconds,
            ..Default::default()
        });
        task
    }

    #[test]
    fn start_pause_resume_stop_accumulates() {
        let mut tt = None;
        assert!(start(&mut tt, at(0)));
        assert!(!start(&mut tt, at(5)), "already running");
        assert!(pause(&mut tt, at(60)));
        assert!(tt.as_ref().unwrap().paused_at.is_some());
        assert!(!pause(&mut tt, at(70)), "already paused");

        assert!(start(&mut tt, at(100)));
        assert!(tt.as_ref().unwrap().paused_at.is_none());
        assert!(stop(&mut tt, at(130)));

        let tt = tt.unwrap();
        assert_eq!(tt.total_seconds, 90.0);
        assert!(!tt.is_running());
        assert!(tt.paused_at.is_none());
    }

    #[test]
    fn stop_without_timer_is_noop() {
        let mut tt = None;
        assert!(!stop(&mut tt, at(0)));
        assert!(tt.is_none());
    }

    #[test]
    fn running_timer_reports_elapsed() {
        let mut task = Task::new("task-001".to_string(), "t".to_string(), at(0));
        start(&mut task.time_tracking, at(0));
        let time = task_time(&task, at(45));
        assert!(time.is_running);
        assert!(!time.is_paused);
        assert_eq!(time.current_elapsed, 45.0);
        assert_eq!(time.total_seconds, 0.0);
    }

    #[test]
    fn report_by_task_skips_untracked() {
        let tasks = vec![
            tracked("task-001", &["api"], 3600.0, at(0)),
            tracked("task-002", &["ui"], 0.0, at(0)),
        ];
        let report = report(&tasks, ReportGrouping::Task, &[]);
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].key, "task-001");
        assert_eq!(report.items[0].hours, 1.0);
        assert_eq!(report.total_hours, 1.0);
    }

    #[test]
    fn report_by_label_sorts_by_time_and_filters() {
        let tasks = vec![
            tracked("task-001", &["api", "db"], 600.0, at(0)),
            tracked("task-002", &["db"], 1200.0, at(0)),
            tracked("task-003", &[], 300.0, at(0)),
        ];

        let all = report(&tasks, ReportGrouping::Label, &[]);
        let keys: Vec<_> = all.items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["db", "api", "unlabeled"]);
        assert_eq!(all.total_seconds, 2100.0);

        let filtered = report(&tasks, ReportGrouping::Label, &["api".to_string()]);
        assert_eq!(filtered.total_seconds, 600.0);
    }

    #[test]
    fn report_by_day_is_newest_first() {
        let tasks = vec![
            tracked("task-001", &[], 60.0, at(0)),
            tracked("task-002", &[], 60.0, at(0) + TimeDelta::days(2)),
        ];
        let report = report(&tasks, ReportGrouping::Day, &[]);
        assert_eq!(report.items.len(), 2);
        assert!(report.items[0].key > report.items[1].key);
    }

    #[test]
    fn coordinator_timer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = open(dir.path());
        let task = create(&mut coord, "timed", 2, &[]);

        let running = coord.timer_start(&task.id).unwrap();
        assert!(running.time_tracking.as_ref().unwrap().is_running());
        assert!(coord.task_time(&task.id).unwrap().is_running);

        let stopped = coord.timer_stop(&task.id).unwrap();
        assert!(!stopped.time_tracking.unwrap().is_running());
        assert!(matches!(
            coord.timer_pause("task-404"),
            Err(CoordError::TaskNotFound(_))
        ));
    }
}
