use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub type Result<T> = anyhow::Result<T>;

pub const DEFAULT_CHAT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_CHAT_MODEL: &str = "openrouter/auto";
pub const DEFAULT_PREVIEW_CHARS: usize = 200;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".scribe")
}

// ── Actions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateFile,
}

/// Boilerplate selector understood by the file-creation collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateHint {
    Html,
    Php,
    Css,
    Js,
    #[default]
    Blank,
}

impl TemplateHint {
    pub const ALL: &'static [TemplateHint] = &[
        TemplateHint::Html,
        TemplateHint::Php,
        TemplateHint::Css,
        TemplateHint::Js,
        TemplateHint::Blank,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Php => "php",
            Self::Css => "css",
            Self::Js => "js",
            Self::Blank => "blank",
        }
    }

    /// Strict lookup. Callers that need the "unknown means blank" behavior use
    /// [`TemplateHint::from_name_or_blank`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.trim().to_ascii_lowercase().as_str() {
            "html" => Self::Html,
            "php" => Self::Php,
            "css" => Self::Css,
            "js" => Self::Js,
            "blank" => Self::Blank,
            _ => return None,
        })
    }

    #[must_use]
    pub fn from_name_or_blank(name: &str) -> Self {
        Self::from_name(name).unwrap_or_default()
    }
}

impl std::fmt::Display for TemplateHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMethod {
    Command,
    Json,
    CodeBlock,
}

impl DetectionMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Json => "json",
            Self::CodeBlock => "code-block",
        }
    }
}

/// A proposed filesystem mutation extracted from model output.
///
/// `path` is untrusted and flows unmodified into the store, which owns
/// traversal checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateHint>,
    /// Fence language tag for code-block detections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub method: DetectionMethod,
}

impl Action {
    pub fn create_file(
        path: impl Into<String>,
        content: impl Into<String>,
        method: DetectionMethod,
    ) -> Self {
        Self {
            kind: ActionKind::CreateFile,
            path: path.into(),
            content: content.into(),
            template: None,
            language: None,
            method,
        }
    }

    #[must_use]
    pub fn with_template(mut self, template: TemplateHint) -> Self {
        self.template = Some(template);
        self
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        let language = language.into();
        if !language.is_empty() {
            self.language = Some(language);
        }
        self
    }

    /// Content preview bounded to `limit` characters, with an ellipsis when cut.
    #[must_use]
    pub fn preview(&self, limit: usize) -> String {
        if self.content.is_empty() {
            return "(empty)".to_string();
        }
        let mut out: String = self.content.chars().take(limit).collect();
        if self.content.chars().count() > limit {
            out.push_str("...");
        }
        out
    }
}

// ── Plans ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub fn icon(&self) -> &'static str {
        match self {
            Self::Pending => "⏳",
            Self::InProgress => "🔄",
            Self::Completed => "✅",
            Self::Failed => "❌",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Steps only move forward: pending → in_progress → completed | failed.
pub fn is_valid_step_transition(from: StepStatus, to: StepStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        StepStatus::Pending => matches!(to, StepStatus::InProgress),
        StepStatus::InProgress => matches!(to, StepStatus::Completed | StepStatus::Failed),
        StepStatus::Completed | StepStatus::Failed => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal step transition {from} -> {to}")]
pub struct StepTransitionError {
    pub from: StepStatus,
    pub to: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Ordinal as written by the model; not renumbered.
    pub number: u32,
    pub description: String,
    pub status: StepStatus,
}

impl PlanStep {
    pub fn new(number: u32, description: impl Into<String>) -> Self {
        Self {
            number,
            description: description.into(),
            status: StepStatus::Pending,
        }
    }

    pub fn advance(&mut self, to: StepStatus) -> std::result::Result<(), StepTransitionError> {
        if !is_valid_step_transition(self.status, to) {
            return Err(StepTransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    pub current_step: usize,
    pub completed: bool,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            steps,
            current_step: 0,
            completed: false,
        }
    }

    pub fn count_with(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Plain-text rendering with one status icon per step.
    pub fn render(&self) -> String {
        let mut out = String::from("📋 Plan:\n");
        for step in &self.steps {
            out.push_str(&format!(
                "  {} {}. {}\n",
                step.status.icon(),
                step.number,
                step.description
            ));
        }
        out
    }
}

// ── Chat ────────────────────────────────────────────────────────────────

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant { content: String },
}

impl ChatMessage {
    pub fn content(&self) -> &str {
        match self {
            Self::System { content } | Self::User { content } | Self::Assistant { content } => {
                content
            }
        }
    }
}

/// Request for the streaming chat-completion transport.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
}

/// A single chunk emitted during streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    ContentDelta(String),
    /// The `[DONE]` sentinel was seen.
    Done,
}

/// Callback type for receiving streaming chunks.
pub type StreamCallback = std::sync::Arc<dyn Fn(StreamChunk) + Send + Sync>;

// ── Configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub store: StoreConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".scribe/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));
        Self::load_layers(&Self::legacy_toml_path(workspace), &paths)
    }

    fn load_layers(legacy: &Path, paths: &[PathBuf]) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::project_settings_path(workspace);
        if path.exists()
            || Self::project_local_settings_path(workspace).exists()
            || Self::legacy_toml_path(workspace).exists()
            || Self::user_settings_path().is_some_and(|p| p.exists())
        {
            return Self::load(workspace);
        }
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    /// Sent as `X-Title`.
    pub app_title: String,
    pub temperature: Option<f32>,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_CHAT_ENDPOINT.to_string(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            api_key: None,
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            app_title: "Scribe".to_string(),
            temperature: None,
            timeout_seconds: 120,
            max_retries: 2,
            retry_base_ms: 400,
        }
    }
}

impl LlmConfig {
    /// Env var first, then the configured key. Blank values count as unset.
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.api_key
                    .as_ref()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Steps are paced and marked completed without touching the filesystem.
    #[default]
    DisplayOnly,
    /// Each step description goes through extraction, confirmation and the store.
    Dispatch,
}

impl std::str::FromStr for StepMode {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "display_only" | "display" => Ok(Self::DisplayOnly),
            "dispatch" => Ok(Self::Dispatch),
            other => Err(anyhow::anyhow!(
                "invalid step mode '{}' (expected display_only|dispatch)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    FailFast,
    ContinueOnError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub step_delay_ms: u64,
    pub step_mode: StepMode,
    pub failure_policy: FailurePolicy,
    pub preview_chars: usize,
    /// Accept every confirmation without asking. Intended for scripted runs.
    pub auto_confirm: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: 1000,
            step_mode: StepMode::DisplayOnly,
            failure_policy: FailurePolicy::FailFast,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            auto_confirm: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Sandbox root, relative to the workspace.
    pub root: String,
    /// Audit log directory, relative to the workspace.
    pub logs_dir: String,
    pub per_file_log_cap: usize,
    pub global_log_cap: usize,
    pub audit_change_cap: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: "page".to_string(),
            logs_dir: ".scribe/logs".to_string(),
            per_file_log_cap: 100,
            global_log_cap: 200,
            audit_change_cap: 50,
        }
    }
}
