use crate::StoreError;
use chrono::{DateTime, Local};
use scribe_diff::AuditDiff;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const LOG_FILE_SUFFIX: &str = ".log.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggedAction {
    Create,
    Modify,
    Delete,
}

impl LoggedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

/// Who performed a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub ip: String,
    pub user_agent: String,
}

impl Default for Actor {
    fn default() -> Self {
        Self {
            ip: "unknown".to_string(),
            user_agent: "unknown".to_string(),
        }
    }
}

impl Actor {
    pub fn local(user_agent: impl Into<String>) -> Self {
        Self {
            ip: "local".to_string(),
            user_agent: user_agent.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Local wall-clock time, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
    pub datetime_iso: String,
    pub path: String,
    pub action: LoggedAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_before: Option<u64>,
    pub size_after: u64,
    pub ip: String,
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<AuditDiff>,
    /// Set only in the global view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl LogEntry {
    pub fn new(path: &str, action: LoggedAction, size_after: u64, actor: &Actor) -> Self {
        Self::at(Local::now(), path, action, size_after, actor)
    }

    pub fn at(
        when: DateTime<Local>,
        path: &str,
        action: LoggedAction,
        size_after: u64,
        actor: &Actor,
    ) -> Self {
        Self {
            timestamp: when.format("%Y-%m-%d %H:%M:%S").to_string(),
            datetime_iso: when.to_rfc3339(),
            path: path.to_string(),
            action,
            template: None,
            size_before: None,
            size_after,
            ip: actor.ip.clone(),
            user_agent: actor.user_agent.clone(),
            diff: None,
            log_file: None,
        }
    }

    fn sort_key(&self) -> (Option<DateTime<chrono::FixedOffset>>, &str) {
        (
            DateTime::parse_from_rfc3339(&self.datetime_iso).ok(),
            self.timestamp.as_str(),
        )
    }
}

/// Per-file log name: separators become `_`.
pub fn log_file_name(path: &str) -> String {
    format!("{}{LOG_FILE_SUFFIX}", path.replace(['/', '\\'], "_"))
}

/// Append-first, capped change history with one JSON file per path.
#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
    per_file_cap: usize,
    global_cap: usize,
}

impl AuditLog {
    pub fn new(dir: &Path, per_file_cap: usize, global_cap: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            per_file_cap,
            global_cap,
        }
    }

    /// Put `entry` at index 0 of its path's log and drop anything past the cap.
    pub fn append(&self, entry: LogEntry) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let file = self.dir.join(log_file_name(&entry.path));
        let mut entries = read_entries(&file);
        entries.insert(0, entry);
        entries.truncate(self.per_file_cap);
        fs::write(&file, serde_json::to_vec_pretty(&entries)?)?;
        Ok(())
    }

    /// Newest first. A missing or unreadable log is an empty history.
    pub fn for_path(&self, path: &str) -> Vec<LogEntry> {
        read_entries(&self.dir.join(log_file_name(path)))
    }

    /// Every per-file log merged, newest first, capped at the global limit.
    pub fn global(&self) -> Result<Vec<LogEntry>, StoreError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut all = Vec::new();
        for item in fs::read_dir(&self.dir)? {
            let item = item?;
            let name = item.file_name().to_string_lossy().to_string();
            if !name.ends_with(LOG_FILE_SUFFIX) {
                continue;
            }
            for mut entry in read_entries(&item.path()) {
                entry.log_file = Some(name.clone());
                all.push(entry);
            }
        }
        all.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        all.truncate(self.global_cap);
        Ok(all)
    }
}

fn read_entries(file: &Path) -> Vec<LogEntry> {
    fs::read_to_string(file)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}
