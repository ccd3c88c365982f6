//! Workflow orchestration core.
//!
//! Turns a template published by the engine into a long-running,
//! externally executed, checkpointable job.
//!
//! ## Components
//!
//! - `TemplateCatalog` - templates and their declared inputs
//! - `WorkflowRegistry` - last known state of each workflow
//! - `Orchestrator` - lifecycle state machine, executions and control requests
//! - `Presenter` / `ProgressSink` - what the core needs from a user interface

mod catalog;
mod error;
mod inputs;
mod orchestrator;
mod presenter;
mod registry;
mod types;

pub use catalog::TemplateCatalog;
pub use error::{Operation, WorkflowError, WorkflowResult};
pub use inputs::{collect_inputs, KnownInput, KNOWN_INPUTS};
pub use orchestrator::{ActionKind, ActionOutcome, ExecutionOutcome, Orchestrator, WorkflowAction};
pub use presenter::{Choice, NullSink, Presenter, ProgressEvent, ProgressSink};
pub use registry::WorkflowRegistry;
pub use types::{
    is_empty_default, Checkpoint, Progress, Workflow, WorkflowInputSet, WorkflowStatus,
    WorkflowTemplate,
};
