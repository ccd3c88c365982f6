//! The external engine boundary.
//!
//! [`EngineCommand`] is the closed set of calls the core issues. [`Engine`]
//! is the seam between the core and the process that answers them;
//! [`CliEngine`] reaches the engine through the Process Invoker.

pub mod analysis;
pub mod protocol;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::core::{EngineConfig, ExecutionHandle, InvokeError, ProcessInvoker, ProcessOutput};

pub use analysis::{run_analysis, AnalysisKind, AnalysisReport, AnalysisRequest};
pub use protocol::ProtocolError;

/// A call to the external engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// List workflow templates
    ListTemplates,
    /// List known workflows with their status
    ListWorkflows,
    /// Create a workflow from a template
    CreateWorkflow { template: String, inputs: BTreeMap<String, String> },
    /// Execute a workflow, streaming its output
    ExecuteWorkflow { id: String },
    /// Pause a running workflow
    PauseWorkflow { id: String },
    /// Resume a paused workflow
    ResumeWorkflow { id: String },
    /// Cancel a workflow
    CancelWorkflow { id: String },
    /// Status of one workflow
    Status { id: String },
    /// Create a named checkpoint
    CreateCheckpoint { id: String, name: String },
    /// List a workflow's checkpoints
    ListCheckpoints { id: String },
    /// One-shot analysis
    Analyze(AnalysisRequest),
}

impl EngineCommand {
    /// Engine subcommand name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListTemplates => "workflow-templates",
            Self::ListWorkflows => "workflow-list",
            Self::CreateWorkflow { .. } => "workflow-create",
            Self::ExecuteWorkflow { .. } => "workflow-execute",
            Self::PauseWorkflow { .. } => "workflow-pause",
            Self::ResumeWorkflow { .. } => "workflow-resume",
            Self::CancelWorkflow { .. } => "workflow-cancel",
            Self::Status { .. } => "workflow-status",
            Self::CreateCheckpoint { .. } => "workflow-checkpoint",
            Self::ListCheckpoints { .. } => "workflow-checkpoints",
            Self::Analyze(request) => request.kind.command(),
        }
    }

    /// Workflow this command targets, if any.
    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            Self::ExecuteWorkflow { id }
            | Self::PauseWorkflow { id }
            | Self::ResumeWorkflow { id }
            | Self::CancelWorkflow { id }
            | Self::Status { id }
            | Self::CreateCheckpoint { id, .. }
            | Self::ListCheckpoints { id } => Some(id),
            Self::ListTemplates
            | Self::ListWorkflows
            | Self::CreateWorkflow { .. }
            | Self::Analyze(_) => None,
        }
    }

    /// Command-line arguments for this call.
    pub fn args(&self) -> Vec<String> {
        let name = self.name().to_string();
        let json = "--json".to_string();

        match self {
            Self::ListTemplates | Self::ListWorkflows => vec![name, json],
            Self::CreateWorkflow { template, inputs } => {
                vec![name, template.clone(), "--inputs".to_string(), inputs_json(inputs), json]
            }
            Self::ExecuteWorkflow { id }
            | Self::PauseWorkflow { id }
            | Self::ResumeWorkflow { id }
            | Self::CancelWorkflow { id } => vec![name, id.clone()],
            Self::Status { id } | Self::ListCheckpoints { id } => vec![name, id.clone(), json],
            Self::CreateCheckpoint { id, name: checkpoint } => {
                vec![name, id.clone(), checkpoint.clone()]
            }
            Self::Analyze(request) => request.args(),
        }
    }

    /// Data written to the engine's stdin, if any.
    pub fn stdin(&self) -> Option<String> {
        match self {
            Self::Analyze(request) => request.payload(),
            _ => None,
        }
    }
}

fn inputs_json(inputs: &BTreeMap<String, String>) -> String {
    let map: serde_json::Map<String, serde_json::Value> = inputs
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    serde_json::Value::Object(map).to_string()
}

/// Something that answers engine commands.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Run a short call to completion and capture its output.
    ///
    /// A non-zero exit is returned as output, not as an error.
    async fn call(&self, command: &EngineCommand) -> Result<ProcessOutput, InvokeError>;

    /// Start a long-running call and stream its output.
    fn start(&self, command: &EngineCommand) -> Result<ExecutionHandle, InvokeError>;
}

/// Engine reached through its command-line interface.
#[derive(Debug, Clone)]
pub struct CliEngine {
    program: String,
    base_args: Vec<String>,
    invoker: ProcessInvoker,
}

impl CliEngine {
    /// Create an engine that runs `program`.
    pub fn new(program: impl Into<String>, invoker: ProcessInvoker) -> Self {
        Self { program: program.into(), base_args: Vec::new(), invoker }
    }

    /// Create an engine from configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.program(), config.invoker()).base_args(config.args.clone())
    }

    /// Arguments placed before every command.
    #[must_use]
    pub fn base_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    /// Engine executable.
    pub fn program(&self) -> &str {
        &self.program
    }

    fn argv(&self, command: &EngineCommand) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend(command.args());
        args
    }
}

#[async_trait]
impl Engine for CliEngine {
    async fn call(&self, command: &EngineCommand) -> Result<ProcessOutput, InvokeError> {
        let input = command.stdin();
        self.invoker.run_with_input(&self.program, &self.argv(command), input.as_deref()).await
    }

    fn start(&self, command: &EngineCommand) -> Result<ExecutionHandle, InvokeError> {
        self.invoker.start(&self.program, &self.argv(command))
    }
}

/// Engine whose every call runs `script` under `sh -c`, engine arguments in `$@`.
#[cfg(test)]
pub(crate) fn shell_engine(script: &str) -> CliEngine {
    CliEngine::new("sh", ProcessInvoker::new()).base_args(vec![
        "-c".to_string(),
        script.to_string(),
        "engine".to_string(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_args() {
        let status = EngineCommand::Status { id: "wf-1".to_string() };
        assert_eq!(status.args(), vec!["workflow-status", "wf-1", "--json"]);
        assert_eq!(status.workflow_id(), Some("wf-1"));

        let checkpoint =
            EngineCommand::CreateCheckpoint { id: "wf-1".to_string(), name: "before".to_string() };
        assert_eq!(checkpoint.args(), vec!["workflow-checkpoint", "wf-1", "before"]);

        assert_eq!(EngineCommand::ListTemplates.args(), vec!["workflow-templates", "--json"]);
        assert_eq!(EngineCommand::ListTemplates.workflow_id(), None);
    }

    #[test]
    fn test_create_inputs_are_json() {
        let mut inputs = BTreeMap::new();
        inputs.insert("bug_description".to_string(), "null \"pointer\" on save".to_string());
        let create = EngineCommand::CreateWorkflow { template: "bugfix".to_string(), inputs };

        let args = create.args();
        assert_eq!(&args[..3], ["workflow-create", "bugfix", "--inputs"]);
        assert_eq!(args[4], "--json");

        let decoded: BTreeMap<String, String> = serde_json::from_str(&args[3]).unwrap();
        assert_eq!(decoded["bug_description"], "null \"pointer\" on save");
    }

    #[tokio::test]
    async fn test_cli_engine_prepends_base_args() {
        let engine = shell_engine("echo \"$@\"");

        let output = engine.call(&EngineCommand::ListWorkflows).await.unwrap();
        assert_eq!(output.stdout.trim(), "workflow-list --json");
    }

    #[tokio::test]
    async fn test_cli_engine_missing_program() {
        let engine = CliEngine::new("no-such-maahelper-binary", ProcessInvoker::new());
        let err = engine.call(&EngineCommand::ListTemplates).await.unwrap_err();
        assert!(matches!(err, InvokeError::Spawn { .. }));
    }
}
