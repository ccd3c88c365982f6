#![allow(clippy::format_push_string)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::ref_option)]

//! # Maaflow
//!
//! Terminal host for MaaHelper workflows.
//!
//! Maaflow drives an external analysis engine through its command-line
//! interface: it lists workflow templates, creates workflows from them,
//! executes them with live output, and pauses, resumes, cancels and
//! checkpoints them. The engine owns all workflow state; Maaflow keeps a
//! cache of what the engine last reported.
//!
//! ## Features
//!
//! - **Templates**: Pick a template and answer only the inputs it leaves empty
//! - **Live Execution**: Engine output streamed line by line, Ctrl-C cancels
//! - **Control**: Pause, resume, cancel and checkpoint running workflows
//! - **Analysis**: One-shot code review, bug analysis, refactoring and more
//!
//! ## Quick Start
//!
//! ```bash
//! # Create and run a workflow interactively
//! maaflow start
//!
//! # Non-interactive
//! maaflow start bugfix -i bug_description="crash on save" --execute
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::use_self)]

pub mod app;
pub mod console;
pub mod core;
pub mod engine;
pub mod workflow;

// Re-export commonly used types
pub use app::{App, StartRequest, Started};
pub use core::{Config, ExecutionHandle, InvokeError, ProcessInvoker};
pub use engine::{CliEngine, Engine, EngineCommand};
pub use workflow::{
    ExecutionOutcome, Orchestrator, Workflow, WorkflowAction, WorkflowError, WorkflowStatus,
    WorkflowTemplate,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "maaflow";
