use anyhow::Result;
use scribe_agent::{AutoGate, ConfirmationGate, EditorSession, TerminalGate};
use scribe_core::{AppConfig, StreamCallback, StreamChunk};
use scribe_llm::{CancelToken, OpenRouterClient};
use scribe_observe::Observer;
use scribe_store::{Actor, FileStore};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::Cli;

pub(crate) fn user_agent() -> String {
    format!("scribe-cli/{}", env!("CARGO_PKG_VERSION"))
}

pub(crate) fn open_store(cwd: &Path, cfg: &AppConfig) -> Result<FileStore> {
    Ok(FileStore::new(cwd, &cfg.store)?.with_actor(Actor::local(user_agent())))
}

pub(crate) fn open_observer(cwd: &Path, cli: &Cli) -> Result<Observer> {
    let mut observer = Observer::new(cwd)?;
    observer.set_verbose(cli.verbose);
    Ok(observer)
}

/// Session wired to the configured chat endpoint. No request is made until
/// the first turn, so plan-only commands work without an API key.
pub(crate) fn open_session(cwd: &Path, cfg: AppConfig, cli: &Cli) -> Result<EditorSession> {
    let client = OpenRouterClient::new(cfg.llm.clone())?;
    let store = open_store(cwd, &cfg)?;
    let observer = open_observer(cwd, cli)?;
    observer.verbose_log(&format!(
        "workspace={} sandbox={} model={}",
        cwd.display(),
        store.root().display(),
        cfg.llm.model
    ));
    EditorSession::new(cfg, Box::new(client), store, observer)
}

/// `--yes` or `agent.auto_confirm` accept everything; otherwise ask on the
/// terminal.
pub(crate) fn confirmation_gate(cfg: &AppConfig, yes: bool) -> Box<dyn ConfirmationGate> {
    if yes || cfg.agent.auto_confirm {
        Box::new(AutoGate(true))
    } else {
        Box::new(TerminalGate)
    }
}

/// Deltas go straight to stdout in text mode; JSON mode prints once at the end.
pub(crate) fn delta_printer(json_mode: bool) -> StreamCallback {
    if json_mode {
        return Arc::new(|_| {});
    }
    Arc::new(|chunk| {
        if let StreamChunk::ContentDelta(delta) = chunk {
            let mut stdout = std::io::stdout();
            let _ = write!(stdout, "{delta}");
            let _ = stdout.flush();
        }
    })
}

/// Ctrl-C handling for interactive commands. Inside a scope (a streaming turn
/// or a plan run) SIGINT only sets the cancel flag; outside one it exits with
/// status 130.
pub(crate) struct Interrupt {
    flag: Arc<AtomicBool>,
    idle: Arc<AtomicBool>,
}

impl Interrupt {
    pub(crate) fn install() -> Result<Self> {
        let flag = Arc::new(AtomicBool::new(false));
        let idle = Arc::new(AtomicBool::new(true));
        #[cfg(unix)]
        {
            use signal_hook::consts::SIGINT;
            signal_hook::flag::register_conditional_shutdown(SIGINT, 130, Arc::clone(&idle))?;
            signal_hook::flag::register(SIGINT, Arc::clone(&flag))?;
        }
        Ok(Self { flag, idle })
    }

    /// Start a cancellable scope with a cleared flag.
    pub(crate) fn scope(&self) -> InterruptScope<'_> {
        self.flag.store(false, Ordering::SeqCst);
        self.idle.store(false, Ordering::SeqCst);
        InterruptScope {
            idle: &self.idle,
            token: CancelToken::from(Arc::clone(&self.flag)),
        }
    }
}

pub(crate) struct InterruptScope<'a> {
    idle: &'a AtomicBool,
    pub(crate) token: CancelToken,
}

impl Drop for InterruptScope<'_> {
    fn drop(&mut self) {
        self.idle.store(true, Ordering::SeqCst);
    }
}
