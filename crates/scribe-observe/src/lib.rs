use anyhow::Result;
use chrono::Utc;
use scribe_core::{DetectionMethod, StepStatus, runtime_dir};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEnd {
    Completed,
    Cancelled,
    Failed,
}

/// One line in the run log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObserveEvent {
    TurnStarted {
        model: String,
        messages: usize,
    },
    TurnFinished {
        outcome: TurnEnd,
        response_chars: usize,
    },
    ActionsDetected {
        count: usize,
        methods: Vec<DetectionMethod>,
    },
    ActionDecision {
        path: String,
        accepted: bool,
    },
    ActionApplied {
        path: String,
        size: u64,
    },
    ActionFailed {
        path: String,
        reason: String,
    },
    PlanDetected {
        steps: usize,
    },
    StepTransition {
        number: u32,
        status: StepStatus,
    },
    PlanFinished {
        completed: bool,
        failed_steps: usize,
    },
    FileWritten {
        path: String,
        action: String,
        size: u64,
    },
}

pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: false,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn record(&self, event: &ObserveEvent) -> Result<()> {
        self.append_log_line(&format!(
            "{} EVENT {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(event)?
        ))
    }

    /// Like [`Observer::record`], but a failing log write only produces a warning.
    pub fn record_quiet(&self, event: &ObserveEvent) {
        if let Err(err) = self.record(event) {
            eprintln!("[scribe WARN] failed to record event: {err}");
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// `[scribe] msg` on stderr, only in verbose mode.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[scribe] {msg}");
        }
    }

    /// Always written to stderr and to the log file.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[scribe WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
