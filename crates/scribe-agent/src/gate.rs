use anyhow::Result;
use scribe_core::{Action, DEFAULT_PREVIEW_CHARS, TemplateHint};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{BufRead, IsTerminal, Write};

/// What the user sees before deciding on an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionPreview {
    pub path: String,
    pub template: Option<TemplateHint>,
    /// Bounded content preview, `(empty)` when there is no content.
    pub preview: String,
    pub method: String,
}

impl ActionPreview {
    pub fn new(action: &Action, limit: usize) -> Self {
        Self {
            path: action.path.clone(),
            template: action.template,
            preview: action.preview(limit.min(DEFAULT_PREVIEW_CHARS)),
            method: action.method.as_str().to_string(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("🤖 The assistant wants to create a file\n  file: {}\n", self.path);
        if let Some(template) = self.template {
            out.push_str(&format!("  template: {template}\n"));
        }
        out.push_str("  content preview:\n");
        for line in self.preview.lines() {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Accept or reject one action. Each call resolves exactly once and never
/// touches the filesystem.
pub trait ConfirmationGate {
    fn confirm(&mut self, preview: &ActionPreview) -> Result<bool>;
}

impl<F> ConfirmationGate for F
where
    F: FnMut(&ActionPreview) -> Result<bool>,
{
    fn confirm(&mut self, preview: &ActionPreview) -> Result<bool> {
        self(preview)
    }
}

/// Same answer every time. Used for `--yes` and `auto_confirm`.
#[derive(Debug, Clone, Copy)]
pub struct AutoGate(pub bool);

impl ConfirmationGate for AutoGate {
    fn confirm(&mut self, _preview: &ActionPreview) -> Result<bool> {
        Ok(self.0)
    }
}

/// Replays a fixed list of answers and records what it was shown. Rejects
/// once the answers run out.
#[derive(Debug, Default)]
pub struct ScriptedGate {
    answers: VecDeque<bool>,
    seen: Vec<ActionPreview>,
}

impl ScriptedGate {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            seen: Vec::new(),
        }
    }

    pub fn seen(&self) -> &[ActionPreview] {
        &self.seen
    }
}

impl ConfirmationGate for ScriptedGate {
    fn confirm(&mut self, preview: &ActionPreview) -> Result<bool> {
        self.seen.push(preview.clone());
        Ok(self.answers.pop_front().unwrap_or(false))
    }
}

/// Blocking `[y/N]` prompt on the terminal.
///
/// Waits for as long as it takes. Without an interactive terminal every
/// action is rejected.
#[derive(Debug, Default)]
pub struct TerminalGate;

impl ConfirmationGate for TerminalGate {
    fn confirm(&mut self, preview: &ActionPreview) -> Result<bool> {
        let mut stdout = std::io::stdout();
        let stdin = std::io::stdin();
        if !stdin.is_terminal() || !stdout.is_terminal() {
            return Ok(false);
        }
        write!(stdout, "{}", preview.render())?;
        write!(stdout, "accept and create? [y/N]: ")?;
        stdout.flush()?;
        read_answer(&mut stdin.lock())
    }
}

fn read_answer(input: &mut impl BufRead) -> Result<bool> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    let normalized = line.trim().to_ascii_lowercase();
    Ok(matches!(normalized.as_str(), "y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::DetectionMethod;
    use std::io::Cursor;

    #[test]
    fn preview_never_exceeds_limit() {
        let action = Action::create_file("big.txt", "é".repeat(500), DetectionMethod::Json);
        let preview = ActionPreview::new(&action, 10_000);
        assert_eq!(preview.preview.chars().count(), DEFAULT_PREVIEW_CHARS + 3);
        let short = ActionPreview::new(&action, 5);
        assert_eq!(short.preview, "ééééé...");
    }

    #[test]
    fn render_shows_path_template_and_preview() {
        let action = Action::create_file("a.php", "<?php\necho 1;", DetectionMethod::Json)
            .with_template(TemplateHint::Php);
        let text = ActionPreview::new(&action, 200).render();
        assert!(text.contains("file: a.php"));
        assert!(text.contains("template: php"));
        assert!(text.contains("    echo 1;"));
    }

    #[test]
    fn answers_accept_only_yes() {
        assert!(read_answer(&mut Cursor::new("y\n")).expect("read"));
        assert!(read_answer(&mut Cursor::new(" YES \n")).expect("read"));
        assert!(!read_answer(&mut Cursor::new("\n")).expect("read"));
        assert!(!read_answer(&mut Cursor::new("nope\n")).expect("read"));
    }

    #[test]
    fn scripted_gate_records_and_defaults_to_reject() {
        let action = Action::create_file("x.txt", "", DetectionMethod::Command);
        let preview = ActionPreview::new(&action, 200);
        let mut gate = ScriptedGate::new([true]);
        assert!(gate.confirm(&preview).expect("first"));
        assert!(!gate.confirm(&preview).expect("second"));
        assert_eq!(gate.seen().len(), 2);
        assert_eq!(gate.seen()[0].preview, "(empty)");
    }

    #[test]
    fn closures_are_gates() {
        let mut calls = 0;
        let mut gate = |p: &ActionPreview| -> Result<bool> {
            calls += 1;
            Ok(p.path.ends_with(".css"))
        };
        let css = ActionPreview::new(
            &Action::create_file("a.css", "", DetectionMethod::Command),
            200,
        );
        assert!(gate.confirm(&css).expect("confirm"));
        drop(gate);
        assert_eq!(calls, 1);
    }
}
