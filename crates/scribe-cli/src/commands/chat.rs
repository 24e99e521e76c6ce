use anyhow::{Result, anyhow};
use scribe_agent::{ActionResult, ConfirmationGate, EditorSession, PlanReport, Proposal, TurnReport};
use scribe_core::{AppConfig, Plan, StepStatus};
use scribe_diff::DiffStats;
use scribe_llm::TurnStatus;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use crate::commands::files::print_tree;
use crate::context::*;
use crate::output::*;
use crate::{AskArgs, ChatArgs, Cli};

const SLASH_HELP: &str = "\
/open <path>   open a file from the sandbox as chat context
/close         close the open file
/agent [on|off] toggle agent mode (file actions and plans)
/diff          show the pending diff
/accept        save the pending diff
/reject        discard the pending diff
/plan          show the active plan
/run           run (or resume) the active plan
/stop          drop the active plan
/files         list sandbox files
/clear         clear chat history
/reset         clear history, file, plan and agent mode
/quit          leave";

/// What to do with a diff proposed by the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffChoice {
    Accept,
    Reject,
    Keep,
}

#[derive(Debug, Serialize)]
struct DiffSummary {
    path: String,
    language: String,
    block_count: usize,
    stats: DiffStats,
    unified: String,
    accepted: bool,
}

#[derive(Debug, Serialize)]
struct TurnSummary {
    output: String,
    cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    diff: Option<DiffSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    actions: Vec<ActionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan_run: Option<PlanReport>,
}

enum SlashOutcome {
    Continue,
    Quit,
}

pub(crate) fn run_ask(cwd: &Path, cli: &Cli, args: AskArgs) -> Result<()> {
    let cfg = AppConfig::load(cwd)?;
    let mut gate = confirmation_gate(&cfg, args.yes);
    let mut session = open_session(cwd, cfg, cli)?;
    session.set_agent_mode(args.agent);
    if let Some(path) = &args.file {
        session.open(path)?;
    }
    let interrupt = Interrupt::install()?;

    let report = {
        let scope = interrupt.scope();
        session.send(&args.prompt, &scope.token, delta_printer(cli.json))?
    };
    if !cli.json {
        println!();
    }
    let choice = if args.accept_diff {
        DiffChoice::Accept
    } else {
        DiffChoice::Reject
    };
    let mut summary = follow_up(&mut session, report, gate.as_mut(), choice, cli.json)?;
    if summary.plan.is_some() {
        if args.run_plan {
            let run = execute_plan(&mut session, gate.as_mut(), &interrupt, cli.json)?;
            summary.plan = session.active_plan().cloned();
            summary.plan_run = Some(run);
        } else if !cli.json {
            println!("plan not run, pass --run-plan to execute it");
        }
    }
    if cli.json {
        print_json(&summary)?;
    }
    Ok(())
}

pub(crate) fn run_chat(cwd: &Path, cli: &Cli, args: ChatArgs) -> Result<()> {
    let cfg = AppConfig::load(cwd)?;
    let mut gate = confirmation_gate(&cfg, args.yes);
    let mut session = open_session(cwd, cfg, cli)?;
    session.set_agent_mode(args.agent);
    if let Some(path) = &args.file {
        session.open(path)?;
    }
    let interrupt = Interrupt::install()?;
    if !cli.json {
        println!("scribe chat. /help lists commands, Ctrl-C stops a reply or leaves when idle.");
    }

    let stdin = std::io::stdin();
    loop {
        if !cli.json {
            print_prompt(&session)?;
        }
        // No lock is held between lines; the terminal gate reads stdin too.
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(command) = input.strip_prefix('/') {
            match handle_slash(&mut session, command, gate.as_mut(), &interrupt, cli.json) {
                Ok(SlashOutcome::Quit) => break,
                Ok(SlashOutcome::Continue) => {}
                Err(err) => eprintln!("error: {err:#}"),
            }
            continue;
        }

        let sent = {
            let scope = interrupt.scope();
            session.send(input, &scope.token, delta_printer(cli.json))
        };
        match sent {
            Ok(report) => {
                if !cli.json {
                    println!();
                }
                let choice = DiffChoice::Keep;
                match follow_up(&mut session, report, gate.as_mut(), choice, cli.json) {
                    Ok(summary) if cli.json => print_json(&summary)?,
                    Ok(summary) if summary.plan.is_some() => {
                        println!("/run to execute the plan, /stop to drop it");
                    }
                    Ok(_) => {}
                    Err(err) => eprintln!("error: {err:#}"),
                }
            }
            Err(err) => {
                if !cli.json && !err.partial().is_empty() {
                    println!();
                }
                eprintln!("error: {err}");
            }
        }
    }
    Ok(())
}

fn print_prompt(session: &EditorSession) -> Result<()> {
    let mut prompt = String::from("scribe");
    if let Some(file) = session.open_file() {
        prompt.push_str(&format!(" [{}]", file.path));
    }
    if session.agent_mode() {
        prompt.push_str(" 🤖");
    }
    let mut stdout = std::io::stdout();
    write!(stdout, "{prompt}> ")?;
    stdout.flush()?;
    Ok(())
}

/// Diff proposal first, then actions. A plan is only shown; running it is a
/// separate choice.
fn follow_up(
    session: &mut EditorSession,
    report: TurnReport,
    gate: &mut dyn ConfirmationGate,
    choice: DiffChoice,
    json_mode: bool,
) -> Result<TurnSummary> {
    let mut summary = TurnSummary {
        output: report.text,
        cancelled: report.status == TurnStatus::Cancelled,
        diff: None,
        actions: Vec::new(),
        plan: None,
        plan_run: None,
    };
    if summary.cancelled {
        if !json_mode {
            println!("⏹  reply cancelled");
        }
        return Ok(summary);
    }

    if report.pending_diff
        && let Some(diff) = session.pending_diff()
    {
        let mut shown = DiffSummary {
            path: diff.path.clone(),
            language: diff.language.clone(),
            block_count: diff.block_count,
            stats: diff.stats(),
            unified: diff.render(),
            accepted: false,
        };
        if !json_mode {
            print_diff(&shown);
        }
        match choice {
            DiffChoice::Accept => {
                if let Some(written) = session.accept_diff()? {
                    shown.accepted = true;
                    if !json_mode {
                        println!("💾 saved {} ({})", written.path, format_size(written.size));
                    }
                }
            }
            DiffChoice::Reject => {
                session.reject_diff();
            }
            DiffChoice::Keep => {
                if !json_mode {
                    println!("/accept to save it, /reject to discard it");
                }
            }
        }
        summary.diff = Some(shown);
    }

    match report.proposal {
        Proposal::Actions(actions) => {
            summary.actions = session.review_actions(&actions, gate);
            if !json_mode {
                summary.actions.iter().for_each(print_action_result);
            }
        }
        Proposal::Plan(plan) => {
            if !json_mode {
                print!("{}", plan.render());
            }
            summary.plan = Some(plan);
        }
        Proposal::Nothing => {}
    }
    Ok(summary)
}

fn print_diff(diff: &DiffSummary) {
    let extra = if diff.block_count > 1 {
        format!(", first of {} blocks", diff.block_count)
    } else {
        String::new()
    };
    println!(
        "📝 proposed change to {} (+{} -{}{extra})",
        diff.path, diff.stats.added, diff.stats.deleted
    );
    print!("{}", diff.unified);
}

fn print_action_result(result: &ActionResult) {
    match (&result.applied, &result.error) {
        (Some(applied), _) => println!(
            "✅ created {} ({}, template {})",
            applied.path,
            format_size(applied.size),
            applied.template
        ),
        (None, Some(error)) => println!("❌ {}: {error}", result.path),
        (None, None) => println!("⏭  skipped {}", result.path),
    }
}

/// Run the session's active plan, echoing each step once per status.
pub(crate) fn execute_plan(
    session: &mut EditorSession,
    gate: &mut dyn ConfirmationGate,
    interrupt: &Interrupt,
    json_mode: bool,
) -> Result<PlanReport> {
    let mut announced: Vec<(u32, StepStatus)> = Vec::new();
    let scope = interrupt.scope();
    let report = session.run_plan(gate, &scope.token, &mut |plan: &Plan| {
        if json_mode {
            return;
        }
        for step in &plan.steps {
            let key = (step.number, step.status);
            if step.status != StepStatus::Pending && !announced.contains(&key) {
                announced.push(key);
                println!("  {} {}. {}", step.status.icon(), step.number, step.description);
            }
        }
    })?;
    drop(scope);
    if !json_mode {
        if report.completed {
            println!("🎉 plan finished");
        } else if report.cancelled {
            println!("⏹  plan cancelled, /run continues with the pending steps");
        } else {
            let failed = session
                .active_plan()
                .map_or(report.failed_steps(), |plan| plan.count_with(StepStatus::Failed));
            println!("plan ended with {failed} failed step(s)");
        }
    }
    Ok(report)
}

fn handle_slash(
    session: &mut EditorSession,
    command: &str,
    gate: &mut dyn ConfirmationGate,
    interrupt: &Interrupt,
    json_mode: bool,
) -> Result<SlashOutcome> {
    let (name, arg) = command
        .split_once(' ')
        .map_or((command, ""), |(name, arg)| (name, arg.trim()));
    match name {
        "quit" | "exit" => return Ok(SlashOutcome::Quit),
        "help" => println!("{SLASH_HELP}"),
        "open" => {
            if arg.is_empty() {
                return Err(anyhow!("usage: /open <path>"));
            }
            let file = session.open(arg)?;
            println!("📄 opened {} ({} lines)", file.path, file.content.lines().count());
        }
        "close" => {
            session.close_file();
            println!("file closed");
        }
        "agent" => {
            let enabled = match arg {
                "" => !session.agent_mode(),
                "on" => true,
                "off" => false,
                other => return Err(anyhow!("usage: /agent [on|off], got `{other}`")),
            };
            session.set_agent_mode(enabled);
            println!("🤖 agent mode {}", if enabled { "on" } else { "off" });
        }
        "diff" => match session.pending_diff() {
            Some(diff) => print!("{}", diff.render()),
            None => println!("no pending diff"),
        },
        "accept" => match session.accept_diff()? {
            Some(written) => {
                println!("💾 saved {} ({})", written.path, format_size(written.size));
            }
            None => println!("no pending diff"),
        },
        "reject" => {
            if session.reject_diff() {
                println!("diff discarded");
            } else {
                println!("no pending diff");
            }
        }
        "plan" => match session.active_plan() {
            Some(plan) => print!("{}", plan.render()),
            None => println!("no plan"),
        },
        "run" => {
            let report = execute_plan(session, gate, interrupt, json_mode)?;
            if json_mode {
                print_json(&report)?;
            }
        }
        "stop" => {
            session.cancel_plan();
            println!("plan dropped");
        }
        "files" => print_tree(&session.store().list_files()?, 0),
        "clear" => {
            session.clear_chat();
            println!("history cleared");
        }
        "reset" => {
            session.reset();
            println!("session reset");
        }
        other => return Err(anyhow!("unknown command /{other}, try /help")),
    }
    Ok(SlashOutcome::Continue)
}
