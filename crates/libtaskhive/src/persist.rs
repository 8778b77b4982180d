use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

use taskhive_protocol::{BacklogDocument, SCHEMA_VERSION, paths};

use crate::error::PersistError;

/// What happened to a leftover temp file during load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Clean,
    Promoted,
    DiscardedCorrupt,
    DiscardedStale,
}

/// The backlog document on disk.
///
/// Writes go to a sibling `.tmp` file which is then renamed over the
/// canonical path, so a crash leaves either the old or the new document.
#[derive(Debug, Clone)]
pub struct BacklogFile {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl BacklogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tmp_path = path.with_extension("tmp");
        Self { path, tmp_path }
    }

    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(paths::tasks_path(state_dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Load the backlog, resolving any orphaned temp file first. A missing
    /// file yields an empty backlog. Older schemas are migrated and written
    /// back.
    pub fn load(&self) -> Result<BacklogDocument, PersistError> {
        self.recover()?;

        if !self.path.exists() {
            debug!(path = %self.path.display(), "no backlog on disk, starting empty");
            return Ok(BacklogDocument::default());
        }

        let data = fs::read(&self.path)?;
        let mut value: Value = serde_json::from_slice(&data)?;
        let migrated = migrate(&mut value);
        let doc: BacklogDocument = serde_json::from_value(value)?;

        if migrated {
            info!(path = %self.path.display(), version = SCHEMA_VERSION, "migrated backlog schema");
            self.save(&doc)?;
        }
        Ok(doc)
    }

    /// Write `doc` through the temp file. Inside a multi-threaded tokio
    /// runtime the write runs under `block_in_place`.
    pub fn save(&self, doc: &BacklogDocument) -> Result<(), PersistError> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.write_atomically(doc))
            }
            _ => self.write_atomically(doc),
        }
    }

    fn write_atomically(&self, doc: &BacklogDocument) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec_pretty(doc)?;
        {
            let mut file = File::create(&self.tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }

    /// Resolve a temp file left behind by an interrupted save.
    pub fn recover(&self) -> Result<Recovery, PersistError> {
        if !self.tmp_path.exists() {
            return Ok(Recovery::Clean);
        }

        let promote = if self.path.exists() {
            let tmp_modified = fs::metadata(&self.tmp_path)?.modified()?;
            let modified = fs::metadata(&self.path)?.modified()?;
            tmp_modified > modified
        } else {
            true
        };

        if !promote {
            warn!(path = %self.tmp_path.display(), "removing stale backlog temp file");
            fs::remove_file(&self.tmp_path)?;
            return Ok(Recovery::DiscardedStale);
        }

        if self.tmp_parses() {
            warn!(path = %self.tmp_path.display(), "recovering backlog from temp file");
            fs::rename(&self.tmp_path, &self.path)?;
            Ok(Recovery::Promoted)
        } else {
            debug!(path = %self.tmp_path.display(), "discarding corrupt backlog temp file");
            fs::remove_file(&self.tmp_path)?;
            Ok(Recovery::DiscardedCorrupt)
        }
    }

    fn tmp_parses(&self) -> bool {
        fs::read(&self.tmp_path)
            .ok()
            .and_then(|data| serde_json::from_slice::<Value>(&data).ok())
            .map(|mut value| {
                migrate(&mut value);
                serde_json::from_value::<BacklogDocument>(value).is_ok()
            })
            .unwrap_or(false)
    }
}

/// Bring a raw backlog document up to the current schema. Returns whether
/// anything changed.
pub fn migrate(doc: &mut Value) -> bool {
    let Some(obj) = doc.as_object_mut() else {
        return false;
    };

    let version = obj.get("version").and_then(Value::as_u64).unwrap_or(1);
    if version >= u64::from(SCHEMA_VERSION) {
        return false;
    }

    let tasks = obj
        .entry("tasks")
        .or_insert_with(|| Value::Array(Vec::new()));
    let mut highest = 0;
    if let Some(tasks) = tasks.as_array_mut() {
        for task in tasks.iter_mut().filter_map(Value::as_object_mut) {
            task.entry("parent_id").or_insert(Value::Null);
            task.entry("subtasks")
                .or_insert_with(|| Value::Array(Vec::new()));
            task.entry("is_subtask").or_insert(Value::Bool(false));
            task.entry("time_tracking").or_insert(Value::Null);
            if let Some(n) = task.get("id").and_then(Value::as_str).and_then(id_number) {
                highest = highest.max(n);
            }
        }
    }
    obj.entry("next_id").or_insert_with(|| Value::from(highest + 1));
    obj.insert("version".to_string(), Value::from(SCHEMA_VERSION));
    true
}

/// Numeric part of a `task-NNN` id.
pub fn id_number(id: &str) -> Option<u64> {
    id.strip_prefix("task-")?.parse().ok()
}
