use anyhow::Result;
use scribe_core::{AgentConfig, FailurePolicy, Plan, PlanStep, StepMode, StepStatus};
use scribe_llm::CancelToken;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const PACE_SLICE: Duration = Duration::from_millis(25);

/// Turns one step description into filesystem work.
pub trait StepDispatcher {
    fn dispatch(&mut self, step: &PlanStep) -> Result<StepWork>;
}

/// Paths touched (or declined) while dispatching one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepWork {
    pub applied: Vec<String>,
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub number: u32,
    pub status: StepStatus,
    #[serde(flatten)]
    pub work: StepWork,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanReport {
    pub completed: bool,
    pub cancelled: bool,
    pub steps: Vec<StepReport>,
}

impl PlanReport {
    pub fn failed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count()
    }
}

/// Shared "a plan is running" flag.
#[derive(Debug, Clone, Default)]
pub struct AgentActivity(Arc<AtomicBool>);

impl AgentActivity {
    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn begin(&self) -> ActivityGuard<'_> {
        self.0.store(true, Ordering::SeqCst);
        ActivityGuard(self)
    }
}

struct ActivityGuard<'a>(&'a AgentActivity);

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.0.clear();
    }
}

/// Walks a plan one step at a time. Step `n + 1` starts only once step `n`
/// is completed or failed.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    step_delay: Duration,
    mode: StepMode,
    policy: FailurePolicy,
    activity: AgentActivity,
}

impl PlanExecutor {
    pub fn new(cfg: &AgentConfig, activity: AgentActivity) -> Self {
        Self {
            step_delay: Duration::from_millis(cfg.step_delay_ms),
            mode: cfg.step_mode,
            policy: cfg.failure_policy,
            activity,
        }
    }

    /// Run from `plan.current_step` to the end, a failure under fail-fast, or
    /// cancellation. `on_change` sees the plan after every transition.
    ///
    /// A step interrupted by cancellation ends `failed` and is not run again;
    /// finished steps keep their status. Running the plan again picks up the
    /// steps still pending. The plan is completed only when every step is.
    pub fn run(
        &self,
        plan: &mut Plan,
        dispatcher: &mut dyn StepDispatcher,
        cancel: &CancelToken,
        on_change: &mut dyn FnMut(&Plan),
    ) -> Result<PlanReport> {
        let _active = self.activity.begin();
        let mut reports = Vec::new();
        let mut cancelled = false;
        let mut halted = false;

        for index in plan.current_step..plan.steps.len() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            plan.steps[index].advance(StepStatus::InProgress)?;
            on_change(plan);

            let mut report = StepReport {
                number: plan.steps[index].number,
                status: StepStatus::Completed,
                work: StepWork::default(),
                error: None,
            };
            match self.mode {
                StepMode::DisplayOnly => {
                    if !pace(self.step_delay, cancel) {
                        report.status = StepStatus::Failed;
                        report.error = Some("cancelled".to_string());
                        cancelled = true;
                    }
                }
                StepMode::Dispatch => match dispatcher.dispatch(&plan.steps[index]) {
                    Ok(work) => report.work = work,
                    Err(err) => {
                        report.status = StepStatus::Failed;
                        report.error = Some(format!("{err:#}"));
                        halted = self.policy == FailurePolicy::FailFast;
                    }
                },
            }

            plan.steps[index].advance(report.status)?;
            plan.current_step = index + 1;
            on_change(plan);
            reports.push(report);
            if cancelled || halted {
                break;
            }
        }

        plan.completed = plan.count_with(StepStatus::Completed) == plan.steps.len();
        Ok(PlanReport {
            completed: plan.completed,
            cancelled,
            steps: reports,
        })
    }
}

/// Sleep for `delay` unless cancelled first. Returns false on cancellation.
fn pace(delay: Duration, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(PACE_SLICE));
    }
}
