use scribe_core::{Action, TemplateHint};
use scribe_store::{FileStore, StoreError, WriteIntent};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedAction {
    pub path: String,
    pub template: TemplateHint,
    pub size: u64,
}

/// Template for an action that did not name one: guessed from the extension
/// and, for markup, from the content.
pub fn infer_template(action: &Action) -> TemplateHint {
    if let Some(template) = action.template {
        return template;
    }
    if action.content.is_empty() {
        return TemplateHint::Blank;
    }
    let ext = Path::new(&action.path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" if action.content.contains("<!DOCTYPE") => TemplateHint::Html,
        "php" if action.content.contains("<?php") => TemplateHint::Php,
        "css" => TemplateHint::Css,
        "js" => TemplateHint::Js,
        _ => TemplateHint::Blank,
    }
}

/// Create the target from its template, then write the action's content over
/// it so the content change lands in the audit log as well.
///
/// The path is passed through untouched; the store rejects traversal.
pub fn apply_action(store: &FileStore, action: &Action) -> Result<AppliedAction, StoreError> {
    let template = infer_template(action);
    let created = store.create_file(&action.path, template)?;
    if action.content.is_empty() {
        return Ok(AppliedAction {
            path: created.path,
            template,
            size: created.size,
        });
    }
    let written = store.write_file(&created.path, &action.content, WriteIntent::Modify)?;
    Ok(AppliedAction {
        path: written.path,
        template,
        size: written.size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::{DetectionMethod, StoreConfig};
    use scribe_store::LoggedAction;

    fn action(path: &str, content: &str) -> Action {
        Action::create_file(path, content, DetectionMethod::CodeBlock)
    }

    #[test]
    fn inference_follows_extension_and_markers() {
        assert_eq!(
            infer_template(&action("a.html", "<!DOCTYPE html><p>")),
            TemplateHint::Html
        );
        assert_eq!(infer_template(&action("a.html", "<p>")), TemplateHint::Blank);
        assert_eq!(infer_template(&action("a.PHP", "<?php echo 1;")), TemplateHint::Php);
        assert_eq!(infer_template(&action("a.css", "p{}")), TemplateHint::Css);
        assert_eq!(infer_template(&action("a.js", "x()")), TemplateHint::Js);
        assert_eq!(infer_template(&action("a.js", "")), TemplateHint::Blank);
        assert_eq!(
            infer_template(&action("a.txt", "x").with_template(TemplateHint::Css)),
            TemplateHint::Css
        );
    }

    #[test]
    fn content_is_written_after_create() {
        let workspace = tempfile::tempdir().expect("workspace");
        let store = FileStore::new(workspace.path(), &StoreConfig::default()).expect("store");
        let applied =
            apply_action(&store, &action("contact.php", "<?php echo 1; ?>")).expect("apply");
        assert_eq!(applied.template, TemplateHint::Php);
        assert_eq!(store.read_file("contact.php").expect("read").content, "<?php echo 1; ?>");

        let history = store.fetch_logs(Some("contact.php")).expect("logs");
        let actions: Vec<LoggedAction> = history.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![LoggedAction::Modify, LoggedAction::Create]);
    }

    #[test]
    fn existing_target_is_a_conflict() {
        let workspace = tempfile::tempdir().expect("workspace");
        let store = FileStore::new(workspace.path(), &StoreConfig::default()).expect("store");
        apply_action(&store, &action("a.txt", "")).expect("first");
        let err = apply_action(&store, &action("a.txt", "x")).expect_err("second");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn traversal_in_action_path_is_refused_by_the_store() {
        let workspace = tempfile::tempdir().expect("workspace");
        let store = FileStore::new(workspace.path(), &StoreConfig::default()).expect("store");
        let err = apply_action(&store, &action("../outside.php", "<?php")).expect_err("forbidden");
        assert!(matches!(err, StoreError::Forbidden(_)));
    }
}
