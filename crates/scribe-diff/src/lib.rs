//! Positional line diff.
//!
//! Line `i` of the old text is compared with line `i` of the new text and
//! nothing else. There is no alignment step, so a single inserted or removed
//! line shows up as a modification of every line after it. That is a known
//! limitation of this differ; it is meant for previews and audit summaries,
//! not for producing minimal patches.

use serde::{Deserialize, Serialize};

pub const DEFAULT_AUDIT_CHANGE_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Context,
    Add,
    Delete,
}

impl DiffKind {
    fn prefix(self) -> char {
        match self {
            Self::Context => ' ',
            Self::Add => '+',
            Self::Delete => '-',
        }
    }
}

/// One rendered diff row. `line` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    #[serde(rename = "type")]
    pub kind: DiffKind,
    pub line: usize,
    pub content: String,
}

impl DiffEntry {
    fn new(kind: DiffKind, line: usize, content: &str) -> Self {
        Self {
            kind,
            line,
            content: content.to_string(),
        }
    }

    pub fn is_change(&self) -> bool {
        self.kind != DiffKind::Context
    }
}

fn split_lines(text: &str) -> Vec<&str> {
    text.split('\n').collect()
}

/// Rendering diff. A changed line becomes a delete immediately followed by an
/// add at the same line number.
pub fn compute_diff(old_text: &str, new_text: &str) -> Vec<DiffEntry> {
    let old_lines = split_lines(old_text);
    let new_lines = split_lines(new_text);
    let max_len = old_lines.len().max(new_lines.len());
    let mut diff = Vec::with_capacity(max_len);

    for i in 0..max_len {
        let line = i + 1;
        match (old_lines.get(i), new_lines.get(i)) {
            (None, Some(new)) => diff.push(DiffEntry::new(DiffKind::Add, line, new)),
            (Some(old), None) => diff.push(DiffEntry::new(DiffKind::Delete, line, old)),
            (Some(old), Some(new)) if old != new => {
                diff.push(DiffEntry::new(DiffKind::Delete, line, old));
                diff.push(DiffEntry::new(DiffKind::Add, line, new));
            }
            (Some(old), Some(_)) => diff.push(DiffEntry::new(DiffKind::Context, line, old)),
            (None, None) => {}
        }
    }
    diff
}

/// Which entries a viewer should display: every change, plus context rows
/// directly next to a change. Everything else is folded, not removed.
pub fn visible_mask(diff: &[DiffEntry]) -> Vec<bool> {
    (0..diff.len())
        .map(|i| {
            if diff[i].is_change() {
                return true;
            }
            let before = i.checked_sub(1).and_then(|j| diff.get(j));
            let after = diff.get(i + 1);
            before.is_some_and(DiffEntry::is_change) || after.is_some_and(DiffEntry::is_change)
        })
        .collect()
}

/// Terminal rendering with `+`/`-`/space prefixes. Each run of folded context
/// collapses into one `…` row.
pub fn render_unified(diff: &[DiffEntry]) -> String {
    let mask = visible_mask(diff);
    let mut out = String::new();
    let mut folding = false;
    for (entry, visible) in diff.iter().zip(mask) {
        if !visible {
            if !folding {
                out.push_str("  …\n");
                folding = true;
            }
            continue;
        }
        folding = false;
        out.push(entry.kind.prefix());
        out.push(' ');
        out.push_str(&entry.content);
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

pub fn diff_stats(diff: &[DiffEntry]) -> DiffStats {
    let mut stats = DiffStats::default();
    for entry in diff {
        match entry.kind {
            DiffKind::Add => stats.added += 1,
            DiffKind::Delete => stats.deleted += 1,
            DiffKind::Context => stats.unchanged += 1,
        }
    }
    stats
}

// ── Audit variant ───────────────────────────────────────────────────────

/// Compact change record stored in audit log entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuditChange {
    Add { line: usize, content: String },
    Delete { line: usize, content: String },
    Modify { line: usize, old: String, new: String },
}

impl AuditChange {
    pub fn line(&self) -> usize {
        match self {
            Self::Add { line, .. } | Self::Delete { line, .. } | Self::Modify { line, .. } => *line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDiff {
    pub lines_before: usize,
    pub lines_after: usize,
    pub changes: Vec<AuditChange>,
}

/// Audit diff between the previous and the new content of a file.
///
/// Empty previous content counts as zero lines, so writing into a fresh file
/// records every line as an add. Unchanged lines are omitted and only the
/// first `cap` changes (lowest line numbers) are kept.
pub fn audit_diff(old_text: &str, new_text: &str, cap: usize) -> AuditDiff {
    let old_lines = if old_text.is_empty() {
        Vec::new()
    } else {
        split_lines(old_text)
    };
    let new_lines = split_lines(new_text);
    let max_len = old_lines.len().max(new_lines.len());

    let mut changes = Vec::new();
    for i in 0..max_len {
        if changes.len() >= cap {
            break;
        }
        let line = i + 1;
        match (old_lines.get(i), new_lines.get(i)) {
            (None, Some(new)) => changes.push(AuditChange::Add {
                line,
                content: new.to_string(),
            }),
            (Some(old), None) => changes.push(AuditChange::Delete {
                line,
                content: old.to_string(),
            }),
            (Some(old), Some(new)) if old != new => changes.push(AuditChange::Modify {
                line,
                old: old.to_string(),
                new: new.to_string(),
            }),
            _ => {}
        }
    }

    AuditDiff {
        lines_before: old_lines.len(),
        lines_after: new_lines.len(),
        changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn line_count(text: &str) -> usize {
        text.split('\n').count()
    }

    fn only(diff: &[DiffEntry], kind: DiffKind) -> Vec<(usize, String)> {
        diff.iter()
            .filter(|e| e.kind == kind)
            .map(|e| (e.line, e.content.clone()))
            .collect()
    }

    proptest! {
        #[test]
        fn diff_length_is_bounded(a in "[ab\n]{0,40}", b in "[ab\n]{0,40}") {
            let diff = compute_diff(&a, &b);
            prop_assert!(diff.len() <= 2 * line_count(&a).max(line_count(&b)));
        }

        #[test]
        fn diff_against_self_is_all_context(a in "[a-z \n]{0,60}") {
            let diff = compute_diff(&a, &a);
            prop_assert_eq!(diff.len(), line_count(&a));
            prop_assert!(diff.iter().all(|e| e.kind == DiffKind::Context));
        }

        #[test]
        fn adds_and_deletes_mirror_when_swapped(a in "[xy\n]{0,40}", b in "[xy\n]{0,40}") {
            let forward = compute_diff(&a, &b);
            let backward = compute_diff(&b, &a);
            prop_assert_eq!(only(&forward, DiffKind::Add), only(&backward, DiffKind::Delete));
            prop_assert_eq!(only(&forward, DiffKind::Delete), only(&backward, DiffKind::Add));
        }

        #[test]
        fn line_numbers_never_decrease(a in "[pq\n]{0,40}", b in "[pq\n]{0,40}") {
            let diff = compute_diff(&a, &b);
            prop_assert!(diff.windows(2).all(|w| w[0].line <= w[1].line));
        }
    }

    #[test]
    fn modified_line_is_delete_then_add_at_same_line() {
        let diff = compute_diff("a\nb\nc", "a\nB\nc\nd");
        assert_eq!(
            diff,
            vec![
                DiffEntry::new(DiffKind::Context, 1, "a"),
                DiffEntry::new(DiffKind::Delete, 2, "b"),
                DiffEntry::new(DiffKind::Add, 2, "B"),
                DiffEntry::new(DiffKind::Context, 3, "c"),
                DiffEntry::new(DiffKind::Add, 4, "d"),
            ]
        );
    }

    #[test]
    fn insertion_shifts_every_following_line() {
        let diff = compute_diff("one\ntwo\nthree", "zero\none\ntwo\nthree");
        let stats = diff_stats(&diff);
        assert_eq!(stats.unchanged, 0);
        assert_eq!(stats.deleted, 3);
        assert_eq!(stats.added, 4);
    }

    #[test]
    fn empty_inputs_compare_as_one_blank_line() {
        let diff = compute_diff("", "");
        assert_eq!(diff, vec![DiffEntry::new(DiffKind::Context, 1, "")]);
    }

    #[test]
    fn context_far_from_changes_is_folded() {
        let old = "1\n2\n3\n4\n5\n6";
        let new = "1\n2\n3\n4\n5\nsix";
        let diff = compute_diff(old, new);
        let mask = visible_mask(&diff);
        assert_eq!(mask, vec![false, false, false, false, true, true, true]);
        let rendered = render_unified(&diff);
        assert_eq!(rendered, "  …\n  5\n- 6\n+ six\n");
    }

    #[test]
    fn audit_diff_records_modify_and_skips_context() {
        let audit = audit_diff("a\nb\nc", "a\nB", DEFAULT_AUDIT_CHANGE_CAP);
        assert_eq!(audit.lines_before, 3);
        assert_eq!(audit.lines_after, 2);
        assert_eq!(
            audit.changes,
            vec![
                AuditChange::Modify {
                    line: 2,
                    old: "b".to_string(),
                    new: "B".to_string()
                },
                AuditChange::Delete {
                    line: 3,
                    content: "c".to_string()
                },
            ]
        );
    }

    #[test]
    fn audit_diff_treats_empty_old_content_as_no_lines() {
        let audit = audit_diff("", "x\ny", DEFAULT_AUDIT_CHANGE_CAP);
        assert_eq!(audit.lines_before, 0);
        assert_eq!(audit.changes.len(), 2);
        assert!(matches!(audit.changes[0], AuditChange::Add { line: 1, .. }));
    }

    #[test]
    fn audit_diff_keeps_first_fifty_changes() {
        let new: Vec<String> = (0..120).map(|i| format!("line {i}")).collect();
        let audit = audit_diff("", &new.join("\n"), DEFAULT_AUDIT_CHANGE_CAP);
        assert_eq!(audit.changes.len(), 50);
        assert_eq!(audit.changes.first().map(AuditChange::line), Some(1));
        assert_eq!(audit.changes.last().map(AuditChange::line), Some(50));
        assert_eq!(audit.lines_after, 120);
    }

    #[test]
    fn audit_change_serializes_with_type_tag() {
        let value = serde_json::to_value(AuditChange::Modify {
            line: 3,
            old: "a".to_string(),
            new: "b".to_string(),
        })
        .expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"type": "modify", "line": 3, "old": "a", "new": "b"})
        );
    }
}
