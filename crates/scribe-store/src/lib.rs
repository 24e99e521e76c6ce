//! Sandboxed file access with an append-first audit trail.
//!
//! Every path handed to [`FileStore`] is untrusted. It is normalized and
//! checked against the sandbox root before any filesystem call, and each
//! successful mutation is recorded in the [`AuditLog`].

mod audit;
mod paths;
mod templates;

pub use audit::{Actor, AuditLog, LOG_FILE_SUFFIX, LogEntry, LoggedAction, log_file_name};
pub use paths::{ensure_inside, normalize_relative};
pub use templates::boilerplate;

use scribe_core::{StoreConfig, TemplateHint};
use scribe_diff::audit_diff;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::UNIX_EPOCH;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// HTTP-style status for callers that report one.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidPath(_) | Self::NotAFile(_) => 400,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Io(_) | Self::Json(_) => 500,
        }
    }
}

/// What the caller meant to do. The logged action is decided by whether the
/// file existed, not by this value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteIntent {
    Create,
    #[default]
    Modify,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub path: String,
    pub logged_action: LoggedAction,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub path: String,
    pub size: u64,
    pub template: TemplateHint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub size: u64,
    /// Unix seconds.
    pub modified: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

/// One lock per audit log file, so paths that share a log also share a lock.
/// Locks nobody holds are dropped on the next lookup.
#[derive(Debug, Default)]
struct PathLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PathLocks {
    fn for_path(&self, rel: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(log_file_name(rel)).or_default())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// The file collaborator: list, read, write and create under one sandbox root.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    audit: AuditLog,
    audit_change_cap: usize,
    actor: Actor,
    locks: PathLocks,
}

impl FileStore {
    pub fn new(workspace: &Path, cfg: &StoreConfig) -> Result<Self, StoreError> {
        let root = workspace.join(&cfg.root);
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            audit: AuditLog::new(
                &workspace.join(&cfg.logs_dir),
                cfg.per_file_log_cap,
                cfg.global_log_cap,
            ),
            audit_change_cap: cfg.audit_change_cap,
            actor: Actor::default(),
            locks: PathLocks::default(),
        })
    }

    #[must_use]
    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn exists(&self, raw_path: &str) -> Result<bool, StoreError> {
        let rel = normalize_relative(raw_path)?;
        Ok(self.root.join(&rel).exists())
    }

    /// Recursive tree in directory enumeration order.
    pub fn list_files(&self) -> Result<Vec<FileNode>, StoreError> {
        scan_directory(&self.root, &self.root)
    }

    pub fn read_file(&self, raw_path: &str) -> Result<FileContent, StoreError> {
        let rel = normalize_relative(raw_path)?;
        let full = self.root.join(&rel);
        if !full.exists() {
            return Err(StoreError::NotFound(rel));
        }
        ensure_inside(&self.root, &full)?;
        let meta = fs::metadata(&full)?;
        if !meta.is_file() {
            return Err(StoreError::NotAFile(rel));
        }
        let content = String::from_utf8_lossy(&fs::read(&full)?).into_owned();
        Ok(FileContent {
            path: rel,
            size: meta.len(),
            modified: modified_secs(&meta).unwrap_or(0),
            content,
        })
    }

    /// Write `content`, creating parent directories, and log the change.
    ///
    /// The read of the previous content, the write and the log append happen
    /// under one lock per path.
    pub fn write_file(
        &self,
        raw_path: &str,
        content: &str,
        _intent: WriteIntent,
    ) -> Result<WriteOutcome, StoreError> {
        let rel = normalize_relative(raw_path)?;
        let full = self.root.join(&rel);
        ensure_inside(&self.root, &full)?;

        let lock = self.locks.for_path(&rel);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if full.is_dir() {
            return Err(StoreError::NotAFile(rel));
        }
        // Raw bytes: legacy pages are not always UTF-8.
        let previous = match fs::read(&full) {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, content)?;

        let logged_action = if previous.is_some() {
            LoggedAction::Modify
        } else {
            LoggedAction::Create
        };
        let old = previous.unwrap_or_default();
        let size = content.len() as u64;
        let mut entry = LogEntry::new(&rel, logged_action, size, &self.actor);
        entry.size_before = Some(old.len() as u64);
        entry.diff = Some(audit_diff(
            &String::from_utf8_lossy(&old),
            content,
            self.audit_change_cap,
        ));
        self.audit.append(entry)?;

        Ok(WriteOutcome {
            path: rel,
            logged_action,
            size,
        })
    }

    /// Create a new file from a template. Fails with `Conflict` if anything
    /// already exists at the path.
    pub fn create_file(
        &self,
        raw_path: &str,
        template: TemplateHint,
    ) -> Result<CreateOutcome, StoreError> {
        let rel = normalize_relative(raw_path)?;
        let full = self.root.join(&rel);
        ensure_inside(&self.root, &full)?;

        let lock = self.locks.for_path(&rel);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if full.exists() {
            return Err(StoreError::Conflict(rel));
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = boilerplate(template);
        fs::write(&full, content)?;

        let size = content.len() as u64;
        let mut entry = LogEntry::new(&rel, LoggedAction::Create, size, &self.actor);
        entry.template = Some(template.as_str().to_string());
        self.audit.append(entry)?;

        Ok(CreateOutcome {
            path: rel,
            size,
            template,
        })
    }

    /// Single-file history (≤ per-file cap) or the global view (≤ global cap).
    pub fn fetch_logs(&self, raw_path: Option<&str>) -> Result<Vec<LogEntry>, StoreError> {
        match raw_path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(raw) => {
                let rel = normalize_relative(raw)?;
                Ok(self.audit.for_path(&rel))
            }
            None => self.audit.global(),
        }
    }
}

fn modified_secs(meta: &fs::Metadata) -> Option<u64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

fn scan_directory(root: &Path, dir: &Path) -> Result<Vec<FileNode>, StoreError> {
    let mut nodes = Vec::new();
    if !dir.is_dir() {
        return Ok(nodes);
    }
    for item in fs::read_dir(dir)? {
        let item = item?;
        let full = item.path();
        let name = item.file_name().to_string_lossy().to_string();
        let path = paths::relative_display(root, &full);
        let meta = item.metadata()?;
        if meta.is_dir() {
            nodes.push(FileNode {
                name,
                path,
                kind: NodeKind::Directory,
                extension: None,
                size: None,
                modified: None,
                children: scan_directory(root, &full)?,
            });
        } else {
            nodes.push(FileNode {
                extension: full
                    .extension()
                    .map(|ext| ext.to_string_lossy().to_string()),
                name,
                path,
                kind: NodeKind::File,
                size: Some(meta.len()),
                modified: modified_secs(&meta),
                children: Vec::new(),
            });
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_diff::AuditChange;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path(), &StoreConfig::default()).expect("store");
        (dir, store)
    }

    #[test]
    fn write_logs_create_then_modify_with_diff() {
        let (_dir, store) = store();
        let first = store
            .write_file("pages/index.php", "a\nb", WriteIntent::Modify)
            .expect("first write");
        assert_eq!(first.logged_action, LoggedAction::Create);
        let second = store
            .write_file("pages/index.php", "a\nB\nc", WriteIntent::Create)
            .expect("second write");
        assert_eq!(second.logged_action, LoggedAction::Modify);
        assert_eq!(second.size, 5);

        let logs = store.fetch_logs(Some("pages/index.php")).expect("logs");
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].action, LoggedAction::Modify);
        assert_eq!(logs[0].size_before, Some(3));
        let diff = logs[0].diff.as_ref().expect("diff");
        assert_eq!(diff.lines_before, 2);
        assert_eq!(diff.lines_after, 3);
        assert!(matches!(diff.changes[0], AuditChange::Modify { line: 2, .. }));
        assert_eq!(logs[1].diff.as_ref().map(|d| d.lines_before), Some(0));
    }

    #[test]
    fn non_utf8_files_can_be_read_and_overwritten() {
        let (dir, store) = store();
        let legacy = dir.path().join("page/legacy.php");
        fs::write(&legacy, b"\xe9t\xe9").expect("seed latin-1 file");

        let read = store.read_file("legacy.php").expect("read");
        assert_eq!(read.size, 3);
        assert_eq!(read.content, "\u{fffd}t\u{fffd}");

        let written = store
            .write_file("legacy.php", "<?php echo 1; ?>", WriteIntent::Modify)
            .expect("write over latin-1");
        assert_eq!(written.logged_action, LoggedAction::Modify);
        assert_eq!(fs::read_to_string(&legacy).expect("new content"), "<?php echo 1; ?>");

        let logs = store.fetch_logs(Some("legacy.php")).expect("logs");
        assert_eq!(logs[0].size_before, Some(3));
        assert_eq!(logs[0].diff.as_ref().map(|d| d.lines_before), Some(1));
    }

    #[test]
    fn paths_sharing_a_log_file_share_a_lock() {
        let locks = PathLocks::default();
        let nested = locks.for_path("a/b.txt");
        let flat = locks.for_path("a_b.txt");
        assert!(Arc::ptr_eq(&nested, &flat));
        assert!(!Arc::ptr_eq(&nested, &locks.for_path("c.txt")));

        drop(nested);
        drop(flat);
        let _held = locks.for_path("d.txt");
        assert_eq!(locks.len(), 1, "idle locks are dropped");
    }

    #[test]
    fn create_uses_template_and_rejects_existing() {
        let (_dir, store) = store();
        let created = store
            .create_file("contact.php", TemplateHint::Php)
            .expect("create");
        assert_eq!(created.size, boilerplate(TemplateHint::Php).len() as u64);
        let read = store.read_file("contact.php").expect("read");
        assert!(read.content.starts_with("<?php"));

        let err = store
            .create_file("contact.php", TemplateHint::Blank)
            .expect_err("conflict");
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(err.status_code(), 409);

        let logs = store.fetch_logs(Some("contact.php")).expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].template.as_deref(), Some("php"));
        assert!(logs[0].diff.is_none());
    }

    #[test]
    fn read_reports_missing_and_directories() {
        let (_dir, store) = store();
        assert!(matches!(
            store.read_file("nope.txt"),
            Err(StoreError::NotFound(_))
        ));
        store
            .write_file("dir/inner.txt", "x", WriteIntent::Create)
            .expect("write");
        assert!(matches!(store.read_file("dir"), Err(StoreError::NotAFile(_))));
        assert!(matches!(
            store.write_file("dir", "x", WriteIntent::Modify),
            Err(StoreError::NotAFile(_))
        ));
    }

    #[test]
    fn traversal_never_touches_the_filesystem() {
        let (dir, store) = store();
        let err = store
            .write_file("../escape.txt", "x", WriteIntent::Create)
            .expect_err("forbidden");
        assert_eq!(err.status_code(), 403);
        assert!(!dir.path().join("escape.txt").exists());
        assert!(store.fetch_logs(None).expect("logs").is_empty());
    }

    #[test]
    fn tree_lists_nested_entries() {
        let (_dir, store) = store();
        store
            .write_file("css/site.css", "body {}", WriteIntent::Create)
            .expect("write");
        store
            .write_file("index.html", "<p></p>", WriteIntent::Create)
            .expect("write");
        let tree = store.list_files().expect("tree");
        assert_eq!(tree.len(), 2);
        let css = tree
            .iter()
            .find(|n| n.kind == NodeKind::Directory)
            .expect("css dir");
        assert_eq!(css.children.len(), 1);
        assert_eq!(css.children[0].path, "css/site.css");
        assert_eq!(css.children[0].extension.as_deref(), Some("css"));
        assert_eq!(css.children[0].size, Some(7));
    }

    #[test]
    fn concurrent_writers_keep_every_log_entry() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .write_file("shared.txt", &format!("v{i}"), WriteIntent::Modify)
                        .expect("write");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        let logs = store.fetch_logs(Some("shared.txt")).expect("logs");
        assert_eq!(logs.len(), 8);
        assert_eq!(
            logs.iter()
                .filter(|e| e.action == LoggedAction::Create)
                .count(),
            1
        );
    }
}
