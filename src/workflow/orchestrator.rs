//! Workflow Orchestrator.
//!
//! Drives workflows through their lifecycle against the external engine:
//!
//! ```text
//! Created ──execute──▶ Running ──exit 0──▶ Completed
//!                      │   ▲   ──exit≠0──▶ Failed
//!                pause │   │ resume
//!                      ▼   │
//!                      Paused ──cancel──▶ Cancelled ◀──cancel── Running
//! ```
//!
//! At most one execution is live per workflow id. Local invariant violations
//! are rejected before the engine is contacted.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::catalog::TemplateCatalog;
use super::error::{Operation, WorkflowError, WorkflowResult};
use super::inputs::collect_inputs;
use super::presenter::{Presenter, ProgressSink};
use super::registry::WorkflowRegistry;
use super::types::{Checkpoint, Workflow, WorkflowInputSet, WorkflowStatus, WorkflowTemplate};
use crate::core::{ExecutionHandle, ProcessEvent, ProcessExit, TERMINATION_GRACE};
use crate::engine::{protocol, Engine, EngineCommand};

/// How long `cancel` and `shutdown` wait for a live execution to wind down.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(TERMINATION_GRACE.as_secs() * 3);

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ExecutionOutcome {
    /// The process exited 0 and the engine did not report a failure
    Completed { workflow: Workflow },
    /// The process failed, or the engine reported the workflow failed
    Failed { exit_code: Option<i32>, stderr: String },
    /// The execution was cancelled before it finished
    Cancelled,
}

impl ExecutionOutcome {
    /// Resulting workflow status.
    pub fn status(&self) -> WorkflowStatus {
        match self {
            Self::Completed { .. } => WorkflowStatus::Completed,
            Self::Failed { .. } => WorkflowStatus::Failed,
            Self::Cancelled => WorkflowStatus::Cancelled,
        }
    }
}

/// Kind of control action, for menus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Status,
    Execute,
    Pause,
    Resume,
    Cancel,
    Checkpoint,
    ListCheckpoints,
}

impl ActionKind {
    /// Every action, in menu order.
    pub const ALL: [Self; 7] = [
        Self::Status,
        Self::Execute,
        Self::Pause,
        Self::Resume,
        Self::Cancel,
        Self::Checkpoint,
        Self::ListCheckpoints,
    ];

    /// Menu label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Status => "View Status",
            Self::Execute => "Execute",
            Self::Pause => "Pause",
            Self::Resume => "Resume",
            Self::Cancel => "Cancel",
            Self::Checkpoint => "Create Checkpoint",
            Self::ListCheckpoints => "View Checkpoints",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A control action against one workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowAction {
    Status,
    Execute,
    Pause,
    Resume,
    Cancel,
    Checkpoint { name: String },
    ListCheckpoints,
}

impl WorkflowAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Status => ActionKind::Status,
            Self::Execute => ActionKind::Execute,
            Self::Pause => ActionKind::Pause,
            Self::Resume => ActionKind::Resume,
            Self::Cancel => ActionKind::Cancel,
            Self::Checkpoint { .. } => ActionKind::Checkpoint,
            Self::ListCheckpoints => ActionKind::ListCheckpoints,
        }
    }
}

/// Result of [`Orchestrator::perform`].
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    /// Fresh status
    Status(Workflow),
    /// Execution finished
    Executed(ExecutionOutcome),
    /// The engine acknowledged a control request
    Acknowledged { action: ActionKind, message: String },
    /// Checkpoint listing
    Checkpoints(Vec<Checkpoint>),
}

/// Which operations each state permits.
fn permits(status: WorkflowStatus, operation: Operation) -> bool {
    use WorkflowStatus::{Created, Paused, Running};

    match operation {
        Operation::Execute => status == Created,
        Operation::Pause => status == Running,
        Operation::Resume => status == Paused,
        Operation::Cancel => matches!(status, Running | Paused),
        Operation::Checkpoint => matches!(status, Created | Running | Paused),
        Operation::Create
        | Operation::Status
        | Operation::ListCheckpoints
        | Operation::ListTemplates
        | Operation::ListWorkflows => true,
    }
}

/// Releases a live-execution slot when dropped.
struct LiveSlot<'a> {
    orchestrator: &'a Orchestrator,
    id: String,
}

impl Drop for LiveSlot<'_> {
    fn drop(&mut self) {
        self.orchestrator.live.lock().remove(&self.id);
        self.orchestrator.idle.notify_waiters();
    }
}

/// Marks a cancel request as in flight until dropped.
struct CancelMark<'a> {
    orchestrator: &'a Orchestrator,
    id: String,
}

impl Drop for CancelMark<'_> {
    fn drop(&mut self) {
        self.orchestrator.cancelling.lock().remove(&self.id);
    }
}

/// Session-scoped workflow orchestrator.
pub struct Orchestrator {
    engine: Arc<dyn Engine>,
    catalog: TemplateCatalog,
    registry: WorkflowRegistry,
    /// Cancellation token of each live execution, by workflow id
    live: Mutex<HashMap<String, CancellationToken>>,
    /// Workflows with a cancel request awaiting the engine's answer
    cancelling: Mutex<HashSet<String>>,
    /// Checkpoint names seen per workflow
    checkpoints: Mutex<HashMap<String, BTreeSet<String>>>,
    /// Parent of every execution token
    shutdown: CancellationToken,
    idle: Notify,
}

impl Orchestrator {
    /// Create an orchestrator talking to `engine`.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            catalog: TemplateCatalog::new(Arc::clone(&engine)),
            registry: WorkflowRegistry::new(Arc::clone(&engine)),
            engine,
            live: Mutex::new(HashMap::new()),
            cancelling: Mutex::new(HashSet::new()),
            checkpoints: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            idle: Notify::new(),
        }
    }

    /// The engine this orchestrator drives.
    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    /// The template catalog.
    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    /// The workflow registry.
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Available templates. Soft failure yields an empty list.
    pub async fn list_templates(&self) -> WorkflowResult<Vec<WorkflowTemplate>> {
        self.catalog.list_templates().await
    }

    /// Known workflows. Soft failure yields an empty list.
    pub async fn list_workflows(&self) -> WorkflowResult<Vec<Workflow>> {
        self.registry.list_workflows().await
    }

    /// Fresh status of a workflow.
    pub async fn get_status(&self, id: &str) -> WorkflowResult<Workflow> {
        self.registry.get_status(id).await
    }

    /// Whether an execution is live for `id`.
    pub fn is_running(&self, id: &str) -> bool {
        self.live.lock().contains_key(id)
    }

    /// Number of live executions.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Collect the inputs `template` needs, then create a workflow from it.
    pub async fn create_from_template(
        &self,
        template: &WorkflowTemplate,
        presenter: &dyn Presenter,
        preset: WorkflowInputSet,
    ) -> WorkflowResult<Workflow> {
        let inputs = collect_inputs(template, presenter, preset).await;
        self.create_workflow(&template.name, inputs).await
    }

    /// Create a workflow. It starts out `Created`.
    pub async fn create_workflow(
        &self,
        template: &str,
        inputs: WorkflowInputSet,
    ) -> WorkflowResult<Workflow> {
        let command =
            EngineCommand::CreateWorkflow { template: template.to_string(), inputs: inputs.into_inner() };
        let output = self
            .engine
            .call(&command)
            .await
            .map_err(|e| WorkflowError::from_invoke(Operation::Create, None, e))?;

        if !output.success() {
            return Err(WorkflowError::rejected(Operation::Create, None, output));
        }

        let id = protocol::decode_created(&output.stdout)
            .map_err(|e| WorkflowError::parse(Operation::Create, None, e))?;

        tracing::info!(workflow_id = %id, template, "workflow created");

        let workflow = Workflow::created(id.clone(), template);
        self.registry.record(workflow.clone());
        self.checkpoints.lock().insert(id, BTreeSet::new());
        Ok(workflow)
    }

    /// Last known status, asking the engine when the workflow is unknown here.
    async fn current_status(&self, id: &str) -> WorkflowResult<WorkflowStatus> {
        match self.registry.cached_status(id) {
            Some(status) => Ok(status),
            None => Ok(self.registry.get_status(id).await?.status),
        }
    }

    async fn check_transition(&self, id: &str, operation: Operation) -> WorkflowResult<()> {
        let status = self.current_status(id).await?;
        if permits(status, operation) {
            return Ok(());
        }

        tracing::debug!(workflow_id = %id, %operation, %status, "transition rejected");
        if status.is_terminal() {
            Err(WorkflowError::Terminal { id: id.to_string(), status, operation })
        } else {
            Err(WorkflowError::InvalidTransition { id: id.to_string(), from: status, operation })
        }
    }

    fn claim(&self, id: &str) -> WorkflowResult<(LiveSlot<'_>, CancellationToken)> {
        let mut live = self.live.lock();
        if live.contains_key(id) {
            return Err(WorkflowError::AlreadyRunning { id: id.to_string() });
        }

        let token = self.shutdown.child_token();
        live.insert(id.to_string(), token.clone());
        Ok((LiveSlot { orchestrator: self, id: id.to_string() }, token))
    }

    /// Execute a workflow, streaming its output into `sink`.
    ///
    /// Resolves when the engine process ends. Triggering `cancel` stops the
    /// process and resolves with [`ExecutionOutcome::Cancelled`]. The sink's
    /// `finished` is called with the same outcome that is returned.
    pub async fn execute(
        &self,
        id: &str,
        sink: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> WorkflowResult<ExecutionOutcome> {
        let (_slot, stop) = self.claim(id)?;

        // A signal that fired before the process exists must not reach the engine.
        if cancel.is_cancelled() || stop.is_cancelled() {
            tracing::info!(workflow_id = %id, "execution cancelled before start");
            let outcome = ExecutionOutcome::Cancelled;
            sink.finished(&outcome);
            return Ok(outcome);
        }

        self.check_transition(id, Operation::Execute).await?;

        let command = EngineCommand::ExecuteWorkflow { id: id.to_string() };
        let mut handle = self
            .engine
            .start(&command)
            .map_err(|e| WorkflowError::from_invoke(Operation::Execute, Some(id), e))?;

        self.registry.set_status(id, WorkflowStatus::Running);
        tracing::info!(workflow_id = %id, pid = ?handle.pid(), "workflow execution started");

        let mut stderr = Vec::new();
        let exit = loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break None,
                () = cancel.cancelled() => break None,
                event = handle.next_event() => match event {
                    Some(ProcessEvent::Stdout(line)) => sink.progress(&line),
                    Some(ProcessEvent::Stderr(line)) => {
                        tracing::debug!(workflow_id = %id, line = %line, "engine stderr");
                        sink.warning(&line);
                        stderr.push(line);
                    }
                    Some(ProcessEvent::Exited(exit)) => break Some(exit),
                    None => break Some(ProcessExit { code: None, cancelled: false }),
                },
            }
        };

        let outcome = match exit {
            None => self.finish_cancelled(id, handle).await,
            Some(exit) if exit.success() => self.confirm_completion(id, stderr).await,
            Some(exit) if self.cancel_requested(id) => {
                tracing::info!(workflow_id = %id, code = ?exit.code, "engine stopped execution on cancel");
                self.registry.set_status(id, WorkflowStatus::Cancelled);
                ExecutionOutcome::Cancelled
            }
            Some(exit) => {
                tracing::warn!(workflow_id = %id, code = ?exit.code, "workflow execution failed");
                self.registry.set_status(id, WorkflowStatus::Failed);
                ExecutionOutcome::Failed { exit_code: exit.code, stderr: stderr.join("\n") }
            }
        };

        sink.finished(&outcome);
        Ok(outcome)
    }

    async fn finish_cancelled(&self, id: &str, handle: ExecutionHandle) -> ExecutionOutcome {
        handle.cancel();
        let exit = handle.wait().await;
        tracing::info!(workflow_id = %id, code = ?exit.code, "workflow execution cancelled");

        // Cancellation that did not come through `cancel` still has to reach the engine.
        if self.registry.cached_status(id) != Some(WorkflowStatus::Cancelled) {
            let command = EngineCommand::CancelWorkflow { id: id.to_string() };
            match self.engine.call(&command).await {
                Ok(output) if output.success() => {}
                Ok(output) => tracing::warn!(
                    workflow_id = %id,
                    stderr = output.stderr.trim(),
                    "engine did not acknowledge cancellation"
                ),
                Err(e) => {
                    tracing::warn!(workflow_id = %id, error = %e, "could not notify engine of cancellation");
                }
            }
            self.registry.set_status(id, WorkflowStatus::Cancelled);
        }

        ExecutionOutcome::Cancelled
    }

    /// Decide the outcome of a clean exit from the engine's own account.
    async fn confirm_completion(&self, id: &str, stderr: Vec<String>) -> ExecutionOutcome {
        let reported = match self.registry.get_status(id).await {
            Ok(workflow) => Some(workflow),
            Err(e) => {
                tracing::warn!(workflow_id = %id, error = %e, "could not confirm completion");
                None
            }
        };

        match reported {
            Some(workflow) if workflow.status == WorkflowStatus::Failed => {
                ExecutionOutcome::Failed { exit_code: Some(0), stderr: stderr.join("\n") }
            }
            Some(workflow) if workflow.status == WorkflowStatus::Cancelled => {
                ExecutionOutcome::Cancelled
            }
            reported => {
                let mut workflow = reported
                    .or_else(|| self.registry.cached(id))
                    .unwrap_or_else(|| Workflow::created(id, ""));
                if workflow.status != WorkflowStatus::Completed {
                    tracing::debug!(workflow_id = %id, reported = %workflow.status, "treating clean exit as completion");
                    workflow.status = WorkflowStatus::Completed;
                }
                self.registry.record(workflow.clone());
                tracing::info!(workflow_id = %id, "workflow completed");
                ExecutionOutcome::Completed { workflow }
            }
        }
    }

    /// Issue a control request and record the state the engine moved to.
    async fn control(
        &self,
        id: &str,
        operation: Operation,
        command: EngineCommand,
        next: WorkflowStatus,
    ) -> WorkflowResult<String> {
        self.check_transition(id, operation).await?;

        let output = self
            .engine
            .call(&command)
            .await
            .map_err(|e| WorkflowError::from_invoke(operation, Some(id), e))?;
        if !output.success() {
            return Err(WorkflowError::rejected(operation, Some(id), output));
        }

        self.registry.set_status(id, next);
        tracing::info!(workflow_id = %id, %operation, status = %next, "engine acknowledged request");
        Ok(output.stdout.trim().to_string())
    }

    /// Pause a running workflow. The process keeps running.
    pub async fn pause(&self, id: &str) -> WorkflowResult<String> {
        let command = EngineCommand::PauseWorkflow { id: id.to_string() };
        self.control(id, Operation::Pause, command, WorkflowStatus::Paused).await
    }

    /// Resume a paused workflow.
    pub async fn resume(&self, id: &str) -> WorkflowResult<String> {
        let command = EngineCommand::ResumeWorkflow { id: id.to_string() };
        self.control(id, Operation::Resume, command, WorkflowStatus::Running).await
    }

    /// Cancel a running or paused workflow.
    ///
    /// Once the engine acknowledges, a live execution of the workflow is
    /// stopped and this waits for its process to be reaped.
    pub async fn cancel(&self, id: &str) -> WorkflowResult<String> {
        let command = EngineCommand::CancelWorkflow { id: id.to_string() };
        let ack = {
            self.cancelling.lock().insert(id.to_string());
            let _mark = CancelMark { orchestrator: self, id: id.to_string() };
            self.control(id, Operation::Cancel, command, WorkflowStatus::Cancelled).await?
        };

        let token = self.live.lock().get(id).cloned();
        if let Some(token) = token {
            token.cancel();
            if tokio::time::timeout(RELEASE_TIMEOUT, self.released(id)).await.is_err() {
                tracing::warn!(workflow_id = %id, "execution still winding down after cancel");
            }
        }

        Ok(ack)
    }

    /// Whether `id` is being cancelled or the engine already confirmed it.
    fn cancel_requested(&self, id: &str) -> bool {
        self.cancelling.lock().contains(id)
            || self.registry.cached_status(id) == Some(WorkflowStatus::Cancelled)
    }

    /// Wait until no execution is live for `id`.
    async fn released(&self, id: &str) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_running(id) {
                return;
            }
            notified.await;
        }
    }

    /// Create a named checkpoint.
    pub async fn checkpoint(&self, id: &str, name: &str) -> WorkflowResult<Checkpoint> {
        let name = name.trim();
        if name.is_empty() {
            return Err(WorkflowError::InvalidCheckpointName {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
        self.ensure_new_checkpoint(id, name)?;

        self.check_transition(id, Operation::Checkpoint).await?;

        let known = self.checkpoints.lock().contains_key(id);
        if !known {
            if let Err(e) = self.list_checkpoints(id).await {
                tracing::warn!(workflow_id = %id, error = %e, "could not load existing checkpoints");
                self.checkpoints.lock().entry(id.to_string()).or_default();
            }
        }

        // Reserve the name so concurrent requests cannot both create it.
        {
            let mut checkpoints = self.checkpoints.lock();
            let names = checkpoints.entry(id.to_string()).or_default();
            if !names.insert(name.to_string()) {
                return Err(WorkflowError::DuplicateCheckpoint {
                    id: id.to_string(),
                    name: name.to_string(),
                });
            }
        }

        let command = EngineCommand::CreateCheckpoint { id: id.to_string(), name: name.to_string() };
        let result = match self.engine.call(&command).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(WorkflowError::rejected(Operation::Checkpoint, Some(id), output)),
            Err(e) => Err(WorkflowError::from_invoke(Operation::Checkpoint, Some(id), e)),
        };

        if let Err(e) = result {
            if let Some(names) = self.checkpoints.lock().get_mut(id) {
                names.remove(name);
            }
            return Err(e);
        }

        tracing::info!(workflow_id = %id, checkpoint = name, "checkpoint created");
        Ok(Checkpoint { workflow_id: id.to_string(), name: name.to_string() })
    }

    fn ensure_new_checkpoint(&self, id: &str, name: &str) -> WorkflowResult<()> {
        let taken = self.checkpoints.lock().get(id).is_some_and(|names| names.contains(name));
        if taken {
            Err(WorkflowError::DuplicateCheckpoint { id: id.to_string(), name: name.to_string() })
        } else {
            Ok(())
        }
    }

    /// Checkpoints of a workflow, freshly fetched. Allowed in every state.
    pub async fn list_checkpoints(&self, id: &str) -> WorkflowResult<Vec<Checkpoint>> {
        let command = EngineCommand::ListCheckpoints { id: id.to_string() };
        let output = self
            .engine
            .call(&command)
            .await
            .map_err(|e| WorkflowError::from_invoke(Operation::ListCheckpoints, Some(id), e))?;
        if !output.success() {
            return Err(WorkflowError::rejected(Operation::ListCheckpoints, Some(id), output));
        }

        let names = protocol::decode_checkpoints(&output.stdout)
            .map_err(|e| WorkflowError::parse(Operation::ListCheckpoints, Some(id), e))?;

        self.checkpoints.lock().insert(id.to_string(), names.iter().cloned().collect());

        Ok(names
            .into_iter()
            .map(|name| Checkpoint { workflow_id: id.to_string(), name })
            .collect())
    }

    /// Dispatch a control action.
    pub async fn perform(
        &self,
        id: &str,
        action: WorkflowAction,
        sink: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> WorkflowResult<ActionOutcome> {
        let kind = action.kind();
        let acknowledged = |message: String| ActionOutcome::Acknowledged { action: kind, message };

        match action {
            WorkflowAction::Status => self.get_status(id).await.map(ActionOutcome::Status),
            WorkflowAction::Execute => {
                self.execute(id, sink, cancel).await.map(ActionOutcome::Executed)
            }
            WorkflowAction::Pause => self.pause(id).await.map(acknowledged),
            WorkflowAction::Resume => self.resume(id).await.map(acknowledged),
            WorkflowAction::Cancel => self.cancel(id).await.map(acknowledged),
            WorkflowAction::Checkpoint { name } => self
                .checkpoint(id, &name)
                .await
                .map(|cp| acknowledged(format!("Checkpoint '{}' created", cp.name))),
            WorkflowAction::ListCheckpoints => {
                self.list_checkpoints(id).await.map(ActionOutcome::Checkpoints)
            }
        }
    }

    /// Stop every live execution and wait for their processes to be reaped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let drained = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.live_count() == 0 {
                    return;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(RELEASE_TIMEOUT, drained).await.is_err() {
            tracing::warn!(live = self.live_count(), "executions still running at shutdown");
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
