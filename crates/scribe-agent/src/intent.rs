//! Intent detection over finished model responses.
//!
//! Each convention is its own [`Detector`]; they all run over the same text
//! and their results are concatenated in registration order. Deciding what to
//! do when several fire is left to the caller (see [`Extraction::proposal`]).

use anyhow::Result;
use regex::Regex;
use scribe_core::{Action, DetectionMethod, Plan, PlanStep, TemplateHint};
use serde_json::Value;

/// One textual convention that can yield file actions.
pub trait Detector: Send + Sync {
    fn method(&self) -> DetectionMethod;
    fn detect(&self, text: &str) -> Vec<Action>;
}

/// `CREATE_FILE: path` and its French synonyms, one per line.
pub struct CommandDetector {
    pattern: Regex,
}

impl CommandDetector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(
                r"(?i)(?:CRÉER_FICHIER|NOUVEAU_FICHIER|CREATE_FILE):[ \t]*([^\n]+)",
            )?,
        })
    }
}

impl Detector for CommandDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Command
    }

    fn detect(&self, text: &str) -> Vec<Action> {
        self.pattern
            .captures_iter(text)
            .filter_map(|caps| {
                let path = caps.get(1)?.as_str().trim();
                (!path.is_empty()).then(|| Action::create_file(path, "", self.method()))
            })
            .collect()
    }
}

/// Inline `{"action": "create_file", ...}` objects.
///
/// The pattern stops at the first `}`, so nested objects or a literal brace in
/// `content` cut the match short and the fragment is dropped as invalid JSON.
pub struct JsonDetector {
    pattern: Regex,
}

impl JsonDetector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(r#"\{[^}]*"action"\s*:\s*"create_file"[^}]*\}"#)?,
        })
    }
}

impl Detector for JsonDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Json
    }

    fn detect(&self, text: &str) -> Vec<Action> {
        self.pattern
            .find_iter(text)
            .filter_map(|m| {
                let value: Value = serde_json::from_str(m.as_str()).ok()?;
                let path = value.get("path")?.as_str()?.trim();
                if path.is_empty() {
                    return None;
                }
                let content = value
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let mut action = Action::create_file(path, content, self.method());
                if let Some(template) = value.get("template").and_then(Value::as_str) {
                    action = action.with_template(TemplateHint::from_name_or_blank(template));
                }
                Some(action)
            })
            .collect()
    }
}

/// A cue word plus a file name, then a fenced block holding the content.
///
/// `Here is the file contact.php:` followed by a fence yields an action for
/// `contact.php` with the trimmed fence body.
pub struct CodeBlockDetector {
    pattern: Regex,
}

impl CodeBlockDetector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(
                r"(?i)\b(?:fichier|file|créer|create)\s+([^\s:]+\.[a-z]{2,4})\s*:?\s*\n\s*```(\w+)?\n((?s:.*?))```",
            )?,
        })
    }
}

impl Detector for CodeBlockDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::CodeBlock
    }

    fn detect(&self, text: &str) -> Vec<Action> {
        self.pattern
            .captures_iter(text)
            .filter_map(|caps| {
                let path = caps.get(1)?.as_str().trim();
                let content = caps.get(3).map_or("", |m| m.as_str().trim());
                let language = caps.get(2).map_or("", |m| m.as_str());
                Some(Action::create_file(path, content, self.method()).with_language(language))
            })
            .collect()
    }
}

/// A `PLAN:` header followed by consecutive `N. description` lines.
pub struct PlanDetector {
    block: Regex,
    step: Regex,
}

impl PlanDetector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            block: Regex::new(r"(?im)^[ \t]*PLAN[ \t]*:?[ \t]*\r?\n((?:[ \t]*\d+\.[^\n]+\n?)+)")?,
            step: Regex::new(r"^[ \t]*(\d+)\.[ \t]*(.+)$")?,
        })
    }

    pub fn detect(&self, text: &str) -> Option<Plan> {
        let body = self.block.captures(text)?.get(1)?.as_str();
        let steps: Vec<PlanStep> = body
            .lines()
            .filter_map(|line| {
                let caps = self.step.captures(line)?;
                let number = caps.get(1)?.as_str().parse::<u32>().ok()?;
                let description = caps.get(2)?.as_str().trim();
                (!description.is_empty()).then(|| PlanStep::new(number, description))
            })
            .collect();
        if steps.is_empty() {
            return None;
        }
        Some(Plan::new(steps))
    }
}

/// A fenced code block anywhere in a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFence {
    /// `text` when the fence has no language tag.
    pub language: String,
    pub code: String,
}

/// What to show the user after a turn. A plan wins over individual actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    Plan(Plan),
    Actions(Vec<Action>),
    Nothing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub actions: Vec<Action>,
    pub plan: Option<Plan>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.plan.is_none()
    }

    pub fn proposal(self) -> Proposal {
        match self.plan {
            Some(plan) => Proposal::Plan(plan),
            None if !self.actions.is_empty() => Proposal::Actions(self.actions),
            None => Proposal::Nothing,
        }
    }
}

pub struct IntentExtractor {
    detectors: Vec<Box<dyn Detector>>,
    plan: PlanDetector,
    fence: Regex,
}

impl IntentExtractor {
    /// Command, JSON and code-block detectors, in that order.
    pub fn new() -> Result<Self> {
        Ok(Self {
            detectors: vec![
                Box::new(CommandDetector::new()?),
                Box::new(JsonDetector::new()?),
                Box::new(CodeBlockDetector::new()?),
            ],
            plan: PlanDetector::new()?,
            fence: Regex::new(r"(?s)```(\w+)?\n(.*?)```")?,
        })
    }

    pub fn with_detectors(detectors: Vec<Box<dyn Detector>>) -> Result<Self> {
        Ok(Self {
            detectors,
            ..Self::new()?
        })
    }

    pub fn extract_actions(&self, text: &str) -> Vec<Action> {
        self.detectors
            .iter()
            .flat_map(|detector| detector.detect(text))
            .collect()
    }

    pub fn extract_plan(&self, text: &str) -> Option<Plan> {
        self.plan.detect(text)
    }

    pub fn extract(&self, text: &str) -> Extraction {
        Extraction {
            actions: self.extract_actions(text),
            plan: self.extract_plan(text),
        }
    }

    pub fn code_fences(&self, text: &str) -> Vec<CodeFence> {
        self.fence
            .captures_iter(text)
            .map(|caps| CodeFence {
                language: caps
                    .get(1)
                    .map_or_else(|| "text".to_string(), |m| m.as_str().to_string()),
                code: caps.get(2).map_or("", |m| m.as_str()).trim().to_string(),
            })
            .collect()
    }
}
