//! Workflow error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::types::WorkflowStatus;
use crate::core::{InvokeError, ProcessOutput};
use crate::engine::ProtocolError;

/// Result type for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Operation a workflow error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Execute,
    Pause,
    Resume,
    Cancel,
    Checkpoint,
    Status,
    ListCheckpoints,
    ListTemplates,
    ListWorkflows,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Execute => "execute",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Checkpoint => "checkpoint",
            Self::Status => "status",
            Self::ListCheckpoints => "list-checkpoints",
            Self::ListTemplates => "list-templates",
            Self::ListWorkflows => "list-workflows",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during workflow operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// An execution is already live for this workflow.
    #[error("Workflow '{id}' is already running")]
    AlreadyRunning { id: String },

    /// The checkpoint name is taken.
    #[error("Workflow '{id}' already has a checkpoint named '{name}'")]
    DuplicateCheckpoint { id: String, name: String },

    /// The checkpoint name is blank.
    #[error("Invalid checkpoint name '{name}' for workflow '{id}'")]
    InvalidCheckpointName { id: String, name: String },

    /// The workflow has finished; only read-only queries remain.
    #[error("Cannot {operation} workflow '{id}': it is {status}")]
    Terminal { id: String, status: WorkflowStatus, operation: Operation },

    /// The operation is not valid from the current state.
    #[error("Cannot {operation} workflow '{id}' while it is {from}")]
    InvalidTransition { id: String, from: WorkflowStatus, operation: Operation },

    /// The engine executable could not be started.
    #[error(
        "Workflow engine is unavailable: {source}. Install it or point [engine] cli_path (or MAAFLOW_ENGINE) at it"
    )]
    EngineUnavailable {
        #[source]
        source: InvokeError,
    },

    /// A short engine call exceeded its ceiling.
    #[error("{operation}{} timed out after {after:?}", target(.id))]
    Timeout { operation: Operation, id: Option<String>, after: Duration },

    /// The engine refused or failed the operation.
    #[error("{operation}{} failed: {}", target(.id), rejection(.code, .stderr))]
    EngineRejected { operation: Operation, id: Option<String>, code: Option<i32>, stderr: String },

    /// The engine answered with something unusable.
    #[error("{operation}{}: {source}", target(.id))]
    Parse {
        operation: Operation,
        id: Option<String>,
        #[source]
        source: ProtocolError,
    },

    /// No template with this name.
    #[error("Unknown workflow template '{0}'")]
    UnknownTemplate(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn target(id: &Option<String>) -> String {
    id.as_ref().map(|id| format!(" of workflow '{}'", id)).unwrap_or_default()
}

fn rejection(code: &Option<i32>, stderr: &str) -> String {
    let detail = stderr.trim();
    let code = code.map_or_else(|| "killed by a signal".to_string(), |c| format!("exit code {c}"));
    if detail.is_empty() {
        code
    } else {
        format!("{detail} ({code})")
    }
}

impl WorkflowError {
    /// Map a process failure onto the operation that caused it.
    pub fn from_invoke(operation: Operation, id: Option<&str>, err: InvokeError) -> Self {
        let id = id.map(str::to_string);
        match err {
            InvokeError::Spawn { .. } => Self::EngineUnavailable { source: err },
            InvokeError::Timeout { after, .. } => Self::Timeout { operation, id, after },
            InvokeError::NonZeroExit { code, stderr, .. } => {
                Self::EngineRejected { operation, id, code, stderr }
            }
            InvokeError::Io(e) => Self::Io(e),
        }
    }

    /// Rejection built from a finished call's output.
    pub fn rejected(operation: Operation, id: Option<&str>, output: ProcessOutput) -> Self {
        Self::EngineRejected {
            operation,
            id: id.map(str::to_string),
            code: output.exit_code,
            stderr: output.stderr,
        }
    }

    /// Decoding failure for an operation.
    pub fn parse(operation: Operation, id: Option<&str>, source: ProtocolError) -> Self {
        Self::Parse { operation, id: id.map(str::to_string), source }
    }

    /// Whether the session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EngineUnavailable { .. })
    }

    /// Whether the error was raised locally, before any engine call.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning { .. }
                | Self::DuplicateCheckpoint { .. }
                | Self::InvalidCheckpointName { .. }
                | Self::Terminal { .. }
                | Self::InvalidTransition { .. }
        )
    }
}
