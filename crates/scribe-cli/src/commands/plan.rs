use anyhow::{Result, anyhow};
use scribe_agent::IntentExtractor;
use scribe_core::{AppConfig, FailurePolicy, StepMode};
use serde_json::json;
use std::fs;
use std::path::Path;

use crate::commands::chat::execute_plan;
use crate::context::*;
use crate::output::*;
use crate::{Cli, PlanArgs};

/// Extract a `PLAN:` block from a file or inline text and run it.
pub(crate) fn run_plan(cwd: &Path, cli: &Cli, args: PlanArgs) -> Result<()> {
    let source_path = cwd.join(&args.source);
    let text = if source_path.is_file() {
        fs::read_to_string(&source_path)?
    } else {
        args.source.clone()
    };
    let plan = IntentExtractor::new()?
        .extract_plan(&text)
        .ok_or_else(|| anyhow!("no PLAN: block with numbered steps found"))?;

    let mut cfg = AppConfig::load(cwd)?;
    if args.dispatch {
        cfg.agent.step_mode = StepMode::Dispatch;
    }
    if args.continue_on_error {
        cfg.agent.failure_policy = FailurePolicy::ContinueOnError;
    }
    if let Some(delay) = args.delay_ms {
        cfg.agent.step_delay_ms = delay;
    }

    let mut gate = confirmation_gate(&cfg, args.yes);
    let interrupt = Interrupt::install()?;
    let mut session = open_session(cwd, cfg, cli)?;
    if !cli.json {
        print!("{}", plan.render());
    }
    session.adopt_plan(plan);
    let report = execute_plan(&mut session, gate.as_mut(), &interrupt, cli.json)?;
    if cli.json {
        print_json(&json!({
            "plan": session.active_plan(),
            "report": report,
        }))?;
    }
    Ok(())
}
