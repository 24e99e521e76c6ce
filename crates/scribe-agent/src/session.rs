use crate::apply::{AppliedAction, apply_action};
use crate::executor::{AgentActivity, PlanExecutor, PlanReport, StepDispatcher, StepWork};
use crate::gate::{ActionPreview, ConfirmationGate};
use crate::intent::{IntentExtractor, Proposal};
use anyhow::{Result, anyhow};
use scribe_core::{Action, AppConfig, ChatMessage, ChatRequest, Plan, PlanStep, StreamCallback};
use scribe_diff::{DiffEntry, DiffStats, compute_diff, diff_stats, render_unified};
use scribe_llm::{CancelToken, ChatClient, TurnError, TurnStatus};
use scribe_observe::{ObserveEvent, Observer, TurnEnd};
use scribe_store::{FileStore, StoreError, WriteIntent, WriteOutcome};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenFile {
    pub path: String,
    pub content: String,
}

/// A fenced block from the last response, proposed as the new content of the
/// open file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingDiff {
    pub path: String,
    pub language: String,
    pub original: String,
    pub proposed: String,
    pub entries: Vec<DiffEntry>,
    /// How many fenced blocks the response had; only the first is proposed.
    pub block_count: usize,
}

impl PendingDiff {
    pub fn stats(&self) -> DiffStats {
        diff_stats(&self.entries)
    }

    pub fn render(&self) -> String {
        render_unified(&self.entries)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReport {
    pub text: String,
    pub status: TurnStatus,
    pub proposal: Proposal,
    pub pending_diff: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub path: String,
    pub method: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<AppliedAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything one editing session owns: chat history, the open file, the
/// detected plan and the pending diff. Nothing here is process-global.
pub struct EditorSession {
    cfg: AppConfig,
    client: Box<dyn ChatClient + Send + Sync>,
    store: FileStore,
    extractor: IntentExtractor,
    observer: Observer,
    history: Vec<ChatMessage>,
    open_file: Option<OpenFile>,
    active_plan: Option<Plan>,
    pending_diff: Option<PendingDiff>,
    agent_mode: bool,
    activity: AgentActivity,
}

impl EditorSession {
    pub fn new(
        cfg: AppConfig,
        client: Box<dyn ChatClient + Send + Sync>,
        store: FileStore,
        observer: Observer,
    ) -> Result<Self> {
        Ok(Self {
            cfg,
            client,
            store,
            extractor: IntentExtractor::new()?,
            observer,
            history: Vec::new(),
            open_file: None,
            active_plan: None,
            pending_diff: None,
            agent_mode: false,
            activity: AgentActivity::default(),
        })
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn open_file(&self) -> Option<&OpenFile> {
        self.open_file.as_ref()
    }

    pub fn active_plan(&self) -> Option<&Plan> {
        self.active_plan.as_ref()
    }

    pub fn pending_diff(&self) -> Option<&PendingDiff> {
        self.pending_diff.as_ref()
    }

    pub fn agent_mode(&self) -> bool {
        self.agent_mode
    }

    pub fn set_agent_mode(&mut self, enabled: bool) {
        self.agent_mode = enabled;
        self.observer.verbose_log(if enabled {
            "agent mode enabled"
        } else {
            "agent mode disabled"
        });
    }

    /// True while a plan is being executed.
    pub fn agent_active(&self) -> bool {
        self.activity.is_active()
    }

    pub fn open(&mut self, path: &str) -> Result<&OpenFile, StoreError> {
        let file = self.store.read_file(path)?;
        self.pending_diff = None;
        Ok(self.open_file.insert(OpenFile {
            path: file.path,
            content: file.content,
        }))
    }

    pub fn close_file(&mut self) {
        self.open_file = None;
        self.pending_diff = None;
    }

    pub fn system_prompt(&self) -> String {
        let mut prompt = String::from("You are an expert programming assistant. ");
        match &self.open_file {
            Some(file) => {
                prompt.push_str(&format!(
                    "The user is currently editing the file \"{}\". ",
                    file.path
                ));
                prompt.push_str(
                    "When you propose code changes, ALWAYS use fenced code blocks with triple backticks (```). ",
                );
                prompt.push_str("Example: ```php\n<?php echo \"Hello\"; ?>\n```\n\n");
                prompt.push_str(
                    "The editor detects these blocks and shows the user a diff. \
                     If the user asks for changes, give the complete file in one block.",
                );
            }
            None => prompt.push_str(
                "No file is open. Help with general questions or invite the user to open a file.",
            ),
        }
        if self.agent_mode {
            prompt.push_str(
                "\n\nTo create a file, write `CREATE_FILE: path/name.ext` on its own line, or \
                 emit {\"action\": \"create_file\", \"path\": \"...\", \"content\": \"...\"}. \
                 For multi-step work, start with a line `PLAN:` followed by numbered steps.",
            );
        }
        prompt
    }

    /// System prompt plus history. The open file's content rides along on the
    /// first user message only.
    pub fn build_messages(&self) -> Vec<ChatMessage> {
        let context = self.open_file.as_ref().map(|file| {
            format!(
                "\n\n[Current file: {}]\n```\n{}\n```",
                file.path, file.content
            )
        });
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(ChatMessage::System {
            content: self.system_prompt(),
        });
        for (idx, msg) in self.history.iter().enumerate() {
            match (idx, msg, &context) {
                (0, ChatMessage::User { content }, Some(ctx)) => messages.push(ChatMessage::User {
                    content: format!("{content}{ctx}"),
                }),
                _ => messages.push(msg.clone()),
            }
        }
        messages
    }

    /// One chat turn: stream the reply, then look for a diff proposal and,
    /// in agent mode, for actions or a plan.
    ///
    /// A cancelled turn keeps its partial text but is not analysed.
    pub fn send(
        &mut self,
        text: &str,
        cancel: &CancelToken,
        on_delta: StreamCallback,
    ) -> std::result::Result<TurnReport, TurnError> {
        self.history.push(ChatMessage::User {
            content: text.to_string(),
        });
        let request = ChatRequest {
            model: self.cfg.llm.model.clone(),
            messages: self.build_messages(),
            temperature: self.cfg.llm.temperature,
        };
        self.observer.record_quiet(&ObserveEvent::TurnStarted {
            model: request.model.clone(),
            messages: request.messages.len(),
        });

        let outcome = match self.client.stream_chat(&request, cancel, on_delta) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.observer.record_quiet(&ObserveEvent::TurnFinished {
                    outcome: TurnEnd::Failed,
                    response_chars: err.partial().chars().count(),
                });
                self.observer.warn_log(&format!("chat turn failed: {err}"));
                return Err(err);
            }
        };

        self.observer.record_quiet(&ObserveEvent::TurnFinished {
            outcome: match outcome.status {
                TurnStatus::Completed => TurnEnd::Completed,
                TurnStatus::Cancelled => TurnEnd::Cancelled,
            },
            response_chars: outcome.text.chars().count(),
        });
        if !outcome.text.is_empty() {
            self.history.push(ChatMessage::Assistant {
                content: outcome.text.clone(),
            });
        }
        if outcome.status == TurnStatus::Cancelled {
            return Ok(TurnReport {
                text: outcome.text,
                status: outcome.status,
                proposal: Proposal::Nothing,
                pending_diff: false,
            });
        }

        let pending_diff = self.propose_diff(&outcome.text);
        let proposal = if self.agent_mode {
            self.detect_intents(&outcome.text)
        } else {
            Proposal::Nothing
        };
        Ok(TurnReport {
            text: outcome.text,
            status: outcome.status,
            proposal,
            pending_diff,
        })
    }

    fn propose_diff(&mut self, response: &str) -> bool {
        let Some(file) = &self.open_file else {
            return false;
        };
        let fences = self.extractor.code_fences(response);
        let Some(first) = fences.first() else {
            return false;
        };
        self.pending_diff = Some(PendingDiff {
            path: file.path.clone(),
            language: first.language.clone(),
            entries: compute_diff(&file.content, &first.code),
            original: file.content.clone(),
            proposed: first.code.clone(),
            block_count: fences.len(),
        });
        true
    }

    fn detect_intents(&mut self, response: &str) -> Proposal {
        let proposal = self.extractor.extract(response).proposal();
        match &proposal {
            Proposal::Plan(plan) => {
                self.observer.record_quiet(&ObserveEvent::PlanDetected {
                    steps: plan.steps.len(),
                });
                self.active_plan = Some(plan.clone());
            }
            Proposal::Actions(actions) => {
                self.observer.record_quiet(&ObserveEvent::ActionsDetected {
                    count: actions.len(),
                    methods: actions.iter().map(|a| a.method).collect(),
                });
            }
            Proposal::Nothing => {}
        }
        proposal
    }

    /// Ask about each action in turn and apply the accepted ones. A failure
    /// is reported on that action and the rest still get asked.
    pub fn review_actions(
        &mut self,
        actions: &[Action],
        gate: &mut dyn ConfirmationGate,
    ) -> Vec<ActionResult> {
        actions
            .iter()
            .map(|action| {
                review_one(
                    action,
                    &mut *gate,
                    &self.store,
                    &self.observer,
                    self.cfg.agent.preview_chars,
                )
            })
            .collect()
    }

    /// Execute the detected plan. `on_change` sees every step transition.
    pub fn run_plan(
        &mut self,
        gate: &mut dyn ConfirmationGate,
        cancel: &CancelToken,
        on_change: &mut dyn FnMut(&Plan),
    ) -> Result<PlanReport> {
        let mut plan = self
            .active_plan
            .take()
            .ok_or_else(|| anyhow!("no plan to run"))?;
        let executor = PlanExecutor::new(&self.cfg.agent, self.activity.clone());
        let mut dispatcher = ActionDispatcher {
            extractor: &self.extractor,
            store: &self.store,
            observer: &self.observer,
            gate,
            preview_chars: self.cfg.agent.preview_chars,
        };
        let observer = &self.observer;
        let mut last_seen: Vec<_> = plan.steps.iter().map(|s| s.status).collect();
        let result = executor.run(&mut plan, &mut dispatcher, cancel, &mut |p: &Plan| {
            for (step, seen) in p.steps.iter().zip(last_seen.iter_mut()) {
                if step.status != *seen {
                    *seen = step.status;
                    observer.record_quiet(&ObserveEvent::StepTransition {
                        number: step.number,
                        status: step.status,
                    });
                }
            }
            on_change(p);
        });
        self.active_plan = Some(plan);
        let report = result?;
        self.observer.record_quiet(&ObserveEvent::PlanFinished {
            completed: report.completed,
            failed_steps: report.failed_steps(),
        });
        Ok(report)
    }

    /// Take a plan that did not come from a chat turn, replacing any active one.
    pub fn adopt_plan(&mut self, plan: Plan) {
        self.observer.record_quiet(&ObserveEvent::PlanDetected {
            steps: plan.steps.len(),
        });
        self.active_plan = Some(plan);
    }

    /// Drop the plan and clear the agent flag.
    pub fn cancel_plan(&mut self) {
        self.active_plan = None;
        self.activity.clear();
    }

    /// Write the proposed content through the store and make it the open
    /// file's content.
    pub fn accept_diff(&mut self) -> std::result::Result<Option<WriteOutcome>, StoreError> {
        let Some(diff) = self.pending_diff.take() else {
            return Ok(None);
        };
        let written = self
            .store
            .write_file(&diff.path, &diff.proposed, WriteIntent::Modify)?;
        self.observer.record_quiet(&ObserveEvent::FileWritten {
            path: written.path.clone(),
            action: written.logged_action.as_str().to_string(),
            size: written.size,
        });
        if let Some(file) = self.open_file.as_mut().filter(|f| f.path == diff.path) {
            file.content = diff.proposed;
        }
        Ok(Some(written))
    }

    pub fn reject_diff(&mut self) -> bool {
        self.pending_diff.take().is_some()
    }

    pub fn clear_chat(&mut self) {
        self.history.clear();
    }

    /// Back to a fresh session: no history, file, plan, diff or agent mode.
    pub fn reset(&mut self) {
        self.history.clear();
        self.open_file = None;
        self.active_plan = None;
        self.pending_diff = None;
        self.agent_mode = false;
        self.activity.clear();
    }
}

fn review_one(
    action: &Action,
    gate: &mut dyn ConfirmationGate,
    store: &FileStore,
    observer: &Observer,
    preview_chars: usize,
) -> ActionResult {
    let mut result = ActionResult {
        path: action.path.clone(),
        method: action.method.as_str().to_string(),
        accepted: false,
        applied: None,
        error: None,
    };
    match gate.confirm(&ActionPreview::new(action, preview_chars)) {
        Ok(accepted) => result.accepted = accepted,
        Err(err) => {
            result.error = Some(format!("confirmation failed: {err:#}"));
            return result;
        }
    }
    observer.record_quiet(&ObserveEvent::ActionDecision {
        path: action.path.clone(),
        accepted: result.accepted,
    });
    if !result.accepted {
        return result;
    }
    match apply_action(store, action) {
        Ok(applied) => {
            observer.record_quiet(&ObserveEvent::ActionApplied {
                path: applied.path.clone(),
                size: applied.size,
            });
            result.applied = Some(applied);
        }
        Err(err) => {
            observer.record_quiet(&ObserveEvent::ActionFailed {
                path: action.path.clone(),
                reason: err.to_string(),
            });
            result.error = Some(err.to_string());
        }
    }
    result
}

/// Routes a step description through extraction, confirmation and the store.
struct ActionDispatcher<'a> {
    extractor: &'a IntentExtractor,
    store: &'a FileStore,
    observer: &'a Observer,
    gate: &'a mut dyn ConfirmationGate,
    preview_chars: usize,
}

impl StepDispatcher for ActionDispatcher<'_> {
    fn dispatch(&mut self, step: &PlanStep) -> Result<StepWork> {
        let mut work = StepWork::default();
        for action in self.extractor.extract_actions(&step.description) {
            let result = review_one(
                &action,
                &mut *self.gate,
                self.store,
                self.observer,
                self.preview_chars,
            );
            if let Some(error) = result.error {
                return Err(anyhow!("{}: {error}", action.path));
            }
            match result.applied {
                Some(applied) => work.applied.push(applied.path),
                None => work.rejected.push(action.path),
            }
        }
        Ok(work)
    }
}
