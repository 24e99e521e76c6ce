use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod context;
mod output;

use commands::admin::run_config;
use commands::chat::{run_ask, run_chat};
use commands::diff::run_diff;
use commands::files::{run_create, run_files, run_logs, run_read, run_write};
use commands::plan::run_plan;

#[derive(Parser)]
#[command(name = "scribe")]
#[command(about = "Chat-driven file editor with confirmed agent actions and an audit trail", long_about = None)]
struct Cli {
    /// Print one JSON document per command instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Workspace directory (defaults to the current directory).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat with slash commands.
    Chat(ChatArgs),
    /// One chat turn, then confirm and apply what it proposes.
    Ask(AskArgs),
    /// Positional line diff of two local files.
    Diff(DiffArgs),
    /// List the sandbox tree.
    Files,
    Read(PathArg),
    Write(WriteArgs),
    /// Create a file from a template. Fails if the path exists.
    Create(CreateArgs),
    /// Audit log for one file, or the merged view across files.
    Logs(LogsArgs),
    /// Extract a PLAN: block from a file or text and run it.
    Plan(PlanArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCmd,
    },
}

#[derive(Args, Default)]
struct ChatArgs {
    /// Open this sandbox file before the first turn.
    #[arg(long)]
    file: Option<String>,
    /// Start in agent mode.
    #[arg(long)]
    agent: bool,
    /// Accept every proposed action without asking.
    #[arg(long)]
    yes: bool,
}

#[derive(Args)]
struct AskArgs {
    prompt: String,
    #[arg(long)]
    file: Option<String>,
    #[arg(long)]
    agent: bool,
    #[arg(long)]
    yes: bool,
    /// Save the proposed diff to the open file instead of discarding it.
    #[arg(long)]
    accept_diff: bool,
    /// Execute a plan found in the reply instead of only showing it.
    #[arg(long)]
    run_plan: bool,
}

#[derive(Args)]
struct DiffArgs {
    old: PathBuf,
    new: PathBuf,
    /// Emit the audit-log form (modify records, capped change list).
    #[arg(long)]
    audit: bool,
}

#[derive(Args)]
struct PathArg {
    path: String,
}

#[derive(Args)]
struct WriteArgs {
    path: String,
    /// Content to write; read from stdin when omitted.
    #[arg(long)]
    content: Option<String>,
    /// Mark the write as a creation. The log still records what happened.
    #[arg(long)]
    new: bool,
}

#[derive(Args)]
struct CreateArgs {
    path: String,
    /// html, php, css, js or blank.
    #[arg(long)]
    template: Option<String>,
}

#[derive(Args)]
struct LogsArgs {
    path: Option<String>,
}

#[derive(Args)]
struct PlanArgs {
    /// Path to a file holding the plan, or the plan text itself.
    source: String,
    /// Route each step through action detection, confirmation and the store.
    #[arg(long)]
    dispatch: bool,
    #[arg(long)]
    continue_on_error: bool,
    /// Override the pacing delay between steps.
    #[arg(long)]
    delay_ms: Option<u64>,
    #[arg(long)]
    yes: bool,
}

#[derive(Subcommand)]
enum ConfigCmd {
    Show,
    Path,
}

fn main() -> Result<()> {
    let mut cli = Cli::parse();
    let cwd = match &cli.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    let command = cli
        .command
        .take()
        .unwrap_or(Commands::Chat(ChatArgs::default()));

    match command {
        Commands::Chat(args) => run_chat(&cwd, &cli, args),
        Commands::Ask(args) => run_ask(&cwd, &cli, args),
        Commands::Diff(args) => run_diff(&cwd, args, cli.json),
        Commands::Files => run_files(&cwd, cli.json),
        Commands::Read(args) => run_read(&cwd, args, cli.json),
        Commands::Write(args) => run_write(&cwd, args, cli.json),
        Commands::Create(args) => run_create(&cwd, args, cli.json),
        Commands::Logs(args) => run_logs(&cwd, args, cli.json),
        Commands::Plan(args) => run_plan(&cwd, &cli, args),
        Commands::Config { command } => run_config(&cwd, command, cli.json),
    }
}
