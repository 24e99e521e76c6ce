use crate::StoreError;
use std::path::{Component, Path, PathBuf};

/// Normalize an untrusted relative path.
///
/// Any `..` or `.` segment is refused outright instead of being resolved, as
/// are absolute paths. Repeated separators collapse and backslashes count as
/// separators. The result uses `/` throughout.
pub fn normalize_relative(raw: &str) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidPath("path is required".to_string()));
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') || Path::new(trimmed).is_absolute()
    {
        return Err(StoreError::Forbidden(format!("absolute path {trimmed}")));
    }

    let mut segments = Vec::new();
    for segment in trimmed.split(['/', '\\']) {
        match segment {
            "" => continue,
            "." | ".." => {
                return Err(StoreError::Forbidden(format!("traversal segment in {trimmed}")));
            }
            s if s.contains(':') => {
                return Err(StoreError::Forbidden(format!("drive prefix in {trimmed}")));
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(StoreError::InvalidPath(format!("no file name in {trimmed}")));
    }
    Ok(segments.join("/"))
}

/// Confirm that `target` (or its closest existing ancestor) resolves inside
/// `root`. Catches symlinks pointing out of the sandbox.
pub fn ensure_inside(root: &Path, target: &Path) -> Result<(), StoreError> {
    let canonical_root = root.canonicalize()?;
    let Some(existing) = target.ancestors().find(|p| p.exists()) else {
        return Err(StoreError::Forbidden(target.display().to_string()));
    };
    let resolved = existing.canonicalize()?;
    if resolved.starts_with(&canonical_root) {
        Ok(())
    } else {
        Err(StoreError::Forbidden(format!(
            "{} resolves outside the sandbox",
            target.display()
        )))
    }
}

/// Relative path of `full` under `root`, with `/` separators.
pub(crate) fn relative_display(root: &Path, full: &Path) -> String {
    let rel: PathBuf = full
        .strip_prefix(root)
        .unwrap_or(full)
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    rel.to_string_lossy().replace('\\', "/")
}
