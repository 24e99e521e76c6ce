//! Turns streamed model output into confirmed file changes.
//!
//! [`intent`] finds actions and plans in a finished response, [`gate`] asks
//! the user about each action, [`apply`] carries accepted actions into the
//! store, [`executor`] walks plans step by step and [`session`] ties a chat
//! turn to all of the above.

pub mod apply;
pub mod executor;
pub mod gate;
pub mod intent;
pub mod session;

pub use apply::{AppliedAction, apply_action, infer_template};
pub use executor::{AgentActivity, PlanExecutor, PlanReport, StepDispatcher, StepReport, StepWork};
pub use gate::{ActionPreview, AutoGate, ConfirmationGate, ScriptedGate, TerminalGate};
pub use intent::{
    CodeBlockDetector, CodeFence, CommandDetector, Detector, Extraction, IntentExtractor,
    JsonDetector, PlanDetector, Proposal,
};
pub use session::{ActionResult, EditorSession, OpenFile, PendingDiff, TurnReport};
