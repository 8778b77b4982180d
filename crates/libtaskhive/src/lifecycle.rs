use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use taskhive_protocol::{
    EndOutcome, EventKind, RegisterSession, SYSTEM_AUTHOR, Session, SessionId, SessionRole,
};

use crate::error::CoordError;
use crate::store::{Coordinator, dedup};

/// Short random session id: the first 8 hex digits of a v4 UUID.
pub fn new_session_id() -> SessionId {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

impl Coordinator {
    /// Register a session, generating an id when none is given.
    /// Registering an existing id refreshes it and keeps its claimed work.
    /// The coordinator's own author name cannot be used as a session id.
    pub fn register_session(&mut self, req: RegisterSession) -> Result<Session, CoordError> {
        let session_id = req
            .session_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_session_id);
        if session_id == SYSTEM_AUTHOR {
            return Err(CoordError::ReservedSessionId(session_id));
        }
        let now = Utc::now();

        let previous = self.backlog.sessions.remove(&session_id);
        let session = Session {
            session_id: session_id.clone(),
            role: req.role,
            started_at: previous.as_ref().map_or(now, |s| s.started_at),
            last_heartbeat: now,
            working_on: previous.map(|s| s.working_on).unwrap_or_default(),
            context: req.context,
            labels: dedup(req.labels),
            branch: req.branch,
        };
        self.backlog.sessions.insert(session_id.clone(), session.clone());

        info!(session_id = %session_id, role = %session.role, "session registered");
        self.emit(EventKind::SessionRegistered {
            session_id,
            role: session.role,
        });
        Ok(session)
    }

    /// Refresh a session's lease. Returns false for unknown sessions.
    pub fn heartbeat(&mut self, session_id: &str) -> bool {
        match self.backlog.sessions.get_mut(session_id) {
            Some(session) => {
                session.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn end_session(
        &mut self,
        session_id: &str,
        release_tasks: bool,
    ) -> Result<EndOutcome, CoordError> {
        let note = release_tasks.then_some((session_id, "Released on session end"));
        self.finish_session(session_id, note, false)
    }

    pub fn reap_stale_sessions(&mut self) -> Vec<SessionId> {
        self.reap_stale_sessions_at(Utc::now())
    }

    /// End every session whose last heartbeat is older than the stale
    /// threshold at `now`, releasing its tasks.
    pub fn reap_stale_sessions_at(&mut self, now: DateTime<Utc>) -> Vec<SessionId> {
        let threshold = self.config.stale_threshold;
        let mut stale: Vec<SessionId> = self
            .backlog
            .sessions
            .values()
            .filter(|s| now - s.last_heartbeat > threshold)
            .map(|s| s.session_id.clone())
            .collect();
        stale.sort();

        let mut reaped = Vec::new();
        for session_id in stale {
            let note = format!("Released from stale session {session_id}");
            match self.finish_session(&session_id, Some((SYSTEM_AUTHOR, note.as_str())), true) {
                Ok(outcome) => {
                    warn!(
                        session_id = %session_id,
                        released = outcome.released.len(),
                        "reaped stale session"
                    );
                    reaped.push(session_id);
                }
                Err(err) => error!(session_id = %session_id, "failed to reap stale session: {err}"),
            }
        }
        reaped
    }

    pub fn worker_count(&self) -> usize {
        self.backlog
            .sessions
            .values()
            .filter(|s| s.role == SessionRole::Worker)
            .count()
    }

    /// Remove a session, optionally releasing its tasks with `release`
    /// (author, note). Signals `parallel_complete` when this was the last
    /// worker.
    fn finish_session(
        &mut self,
        session_id: &str,
        release: Option<(&str, &str)>,
        stale: bool,
    ) -> Result<EndOutcome, CoordError> {
        let role = self
            .backlog
            .sessions
            .get(session_id)
            .map(|s| s.role)
            .ok_or_else(|| CoordError::SessionNotFound(session_id.to_string()))?;

        let released = match release {
            Some((author, note)) => self.commit(|backlog| {
                let released = backlog.release_held_by(session_id, author, note, Utc::now());
                backlog.sessions.remove(session_id);
                Ok(released)
            })?,
            None => {
                self.backlog.sessions.remove(session_id);
                Vec::new()
            }
        };

        if !stale {
            info!(session_id = %session_id, released = released.len(), "session ended");
        }
        self.emit(EventKind::SessionEnded {
            session_id: session_id.to_string(),
            role,
            released: released.clone(),
            stale,
        });

        let parallel_complete =
            role == SessionRole::Worker && self.config.auto_shutdown && self.worker_count() == 0;
        if parallel_complete {
            info!("all workers finished");
            self.signal_parallel_complete();
        }

        Ok(EndOutcome {
            released,
            parallel_complete,
        })
    }
}
