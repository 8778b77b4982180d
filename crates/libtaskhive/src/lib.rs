pub mod assign;
pub mod broker;
pub mod error;
pub mod lifecycle;
pub mod persist;
pub mod store;
pub mod summary;
pub mod timer;

pub use broker::{EventBroker, Subscription};
pub use error::{CoordError, PersistError};
pub use persist::BacklogFile;
pub use store::{Coordinator, CoordinatorConfig, SharedCoordinator};

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use taskhive_protocol::{CreateTask, RegisterSession, RequestTask, SessionId, SessionRole, Task};

    use crate::{BacklogFile, Coordinator, CoordinatorConfig};

    pub fn open(dir: &Path) -> Coordinator {
        Coordinator::open(BacklogFile::in_state_dir(dir), CoordinatorConfig::default()).unwrap()
    }

    pub fn create(coord: &mut Coordinator, title: &str, priority: i64, labels: &[&str]) -> Task {
        coord
            .create_task(CreateTask {
                title: title.to_string(),
                priority: Some(priority),
                labels: labels.iter().map(|l| l.to_string()).collect(),
                ..Default::default()
            })
            .unwrap()
    }

    pub fn register(coord: &mut Coordinator, role: SessionRole, labels: &[&str]) -> SessionId {
        coord
            .register_session(RegisterSession {
                role,
                labels: labels.iter().map(|l| l.to_string()).collect(),
                ..Default::default()
            })
            .unwrap()
            .session_id
    }

    pub fn claim(coord: &mut Coordinator, session_id: &str) -> Option<Task> {
        coord
            .request_task(RequestTask {
                session_id: session_id.to_string(),
                preferred_labels: Vec::new(),
            })
            .unwrap()
    }
}
