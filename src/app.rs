//! Application session.
//!
//! The `App` struct owns one orchestrator for the lifetime of a session and
//! runs the interactive flows on top of it. It is constructed explicitly at
//! session start and disposed of with [`App::shutdown`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::{Config, InvokeError};
use crate::engine::{run_analysis, AnalysisReport, AnalysisRequest, CliEngine, Engine};
use crate::workflow::{
    collect_inputs, ActionKind, ActionOutcome, Choice, ExecutionOutcome, Orchestrator, Presenter,
    ProgressSink,
    Workflow, WorkflowAction, WorkflowError, WorkflowInputSet, WorkflowResult, WorkflowTemplate,
};

/// What to start.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Template name; asked for when absent
    pub template: Option<String>,

    /// Inputs supplied up front
    pub inputs: WorkflowInputSet,

    /// Execute right away instead of asking
    pub execute: bool,
}

/// Result of the start flow.
#[derive(Debug, Clone, PartialEq)]
pub struct Started {
    /// The created workflow
    pub workflow: Workflow,

    /// How the execution ended, if it was executed
    pub execution: Option<ExecutionOutcome>,
}

/// Main application session.
pub struct App {
    /// Application configuration
    pub config: Config,

    orchestrator: Arc<Orchestrator>,
}

impl App {
    /// Create a session driving the configured engine.
    pub fn new(config: Config) -> Self {
        let engine = Arc::new(CliEngine::from_config(&config.engine));
        tracing::debug!(engine = engine.program(), "session started");
        Self::with_engine(config, engine)
    }

    /// Create a session driving `engine`.
    pub fn with_engine(config: Config, engine: Arc<dyn Engine>) -> Self {
        Self { config, orchestrator: Arc::new(Orchestrator::new(engine)) }
    }

    /// The session's orchestrator.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Pick a template, collect its inputs, create a workflow and optionally
    /// execute it.
    ///
    /// Returns `None` when there is nothing to pick from or the human
    /// dismisses a prompt.
    pub async fn start_workflow(
        &self,
        presenter: &dyn Presenter,
        sink: &dyn ProgressSink,
        request: StartRequest,
        cancel: CancellationToken,
    ) -> WorkflowResult<Option<Started>> {
        let templates = self.orchestrator.list_templates().await?;
        if templates.is_empty() {
            presenter.warn("No workflow templates available");
            return Ok(None);
        }

        let template = match request.template {
            Some(name) => templates
                .into_iter()
                .find(|t| t.name == name)
                .ok_or(WorkflowError::UnknownTemplate(name))?,
            None => match pick_template(presenter, templates).await {
                Some(template) => template,
                None => return Ok(None),
            },
        };

        if interrupted(presenter, &cancel) {
            return Ok(None);
        }
        let inputs = collect_inputs(&template, presenter, request.inputs).await;
        if interrupted(presenter, &cancel) {
            return Ok(None);
        }

        let workflow = self.orchestrator.create_workflow(&template.name, inputs).await?;

        let execute = if request.execute {
            presenter.info(&format!("Workflow created: {}", workflow.id));
            true
        } else if self.config.workflow.confirm_execute {
            let prompt = format!("Workflow created: {}. Execute now?", workflow.id);
            let choices = [Choice::new("Execute"), Choice::new("View Status"), Choice::new("Not now")];
            match presenter.select(&prompt, &choices).await {
                Some(0) => true,
                Some(1) => {
                    let status = self.orchestrator.get_status(&workflow.id).await?;
                    presenter.show_status(&status);
                    false
                }
                _ => false,
            }
        } else {
            presenter.info(&format!("Workflow created: {}", workflow.id));
            false
        };

        let execution = if execute && !interrupted(presenter, &cancel) {
            Some(self.orchestrator.execute(&workflow.id, sink, cancel).await?)
        } else {
            None
        };

        Ok(Some(Started { workflow, execution }))
    }

    /// Pick a known workflow and run a control action against it.
    pub async fn manage_workflows(
        &self,
        presenter: &dyn Presenter,
        sink: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> WorkflowResult<Option<ActionOutcome>> {
        let workflows = self.orchestrator.list_workflows().await?;
        if workflows.is_empty() {
            presenter.info("No active workflows");
            return Ok(None);
        }

        let choices: Vec<Choice> = workflows
            .iter()
            .map(|w| {
                Choice::new(w.label())
                    .description(format!("Status: {}", w.status))
                    .detail(format!("Progress: {}", w.progress.summary()))
            })
            .collect();
        let Some(index) = presenter.select("Select workflow to manage", &choices).await else {
            return Ok(None);
        };
        let Some(workflow) = workflows.get(index) else {
            return Ok(None);
        };

        let actions: Vec<Choice> = ActionKind::ALL.iter().map(|a| Choice::new(a.label())).collect();
        let Some(kind) = presenter
            .select("Select action", &actions)
            .await
            .and_then(|i| ActionKind::ALL.get(i).copied())
        else {
            return Ok(None);
        };

        let action = match kind {
            ActionKind::Status => WorkflowAction::Status,
            ActionKind::Execute => WorkflowAction::Execute,
            ActionKind::Pause => WorkflowAction::Pause,
            ActionKind::Resume => WorkflowAction::Resume,
            ActionKind::Cancel => WorkflowAction::Cancel,
            ActionKind::ListCheckpoints => WorkflowAction::ListCheckpoints,
            ActionKind::Checkpoint => {
                match presenter.input("Checkpoint name", "e.g. before-refactor").await {
                    Some(name) if !name.trim().is_empty() => WorkflowAction::Checkpoint { name },
                    _ => {
                        presenter.warn("Checkpoint name is required");
                        return Ok(None);
                    }
                }
            }
        };

        if interrupted(presenter, &cancel) {
            return Ok(None);
        }

        match self.orchestrator.perform(&workflow.id, action, sink, cancel).await {
            Ok(outcome) => {
                present_outcome(presenter, &workflow.id, &outcome);
                Ok(Some(outcome))
            }
            Err(e) if e.is_local() => {
                presenter.warn(&e.to_string());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run a one-shot analysis.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReport, InvokeError> {
        run_analysis(self.orchestrator.engine(), request).await
    }

    /// End the session, stopping every live execution.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }
}

/// Whether Ctrl-C arrived while the flow was waiting on the human.
fn interrupted(presenter: &dyn Presenter, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        presenter.warn("Interrupted");
        true
    } else {
        false
    }
}

async fn pick_template(
    presenter: &dyn Presenter,
    templates: Vec<WorkflowTemplate>,
) -> Option<WorkflowTemplate> {
    let choices: Vec<Choice> = templates
        .iter()
        .map(|t| {
            let category = if t.category.is_empty() { "General" } else { t.category.as_str() };
            Choice::new(&t.name)
                .description(&t.description)
                .detail(format!("Category: {}", category))
        })
        .collect();

    let index = presenter.select("Select workflow template", &choices).await?;
    templates.into_iter().nth(index)
}

/// Show the result of a control action.
///
/// Executions report through their progress sink and are not repeated here.
pub fn present_outcome(presenter: &dyn Presenter, id: &str, outcome: &ActionOutcome) {
    match outcome {
        ActionOutcome::Status(workflow) => presenter.show_status(workflow),
        ActionOutcome::Executed(_) => {}
        ActionOutcome::Acknowledged { action, message } => {
            if message.is_empty() {
                presenter.info(&format!("{}: request accepted for {}", action, id));
            } else {
                presenter.info(message);
            }
        }
        ActionOutcome::Checkpoints(checkpoints) if checkpoints.is_empty() => {
            presenter.info(&format!("No checkpoints for workflow {}", id));
        }
        ActionOutcome::Checkpoints(checkpoints) => {
            let names: Vec<&str> = checkpoints.iter().map(|c| c.name.as_str()).collect();
            presenter.info(&format!("Checkpoints for workflow {}:\n  {}", id, names.join("\n  ")));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::engine::shell_engine;
    use crate::workflow::{NullSink, WorkflowStatus};

    const ENGINE: &str = r#"
case "$1" in
  workflow-templates)
    echo '[{"name":"bugfix","description":"Fix a bug","category":"maintenance","default_inputs":{"bug_description":""}},{"name":"docs","description":"Write docs","category":null,"default_inputs":{}}]' ;;
  workflow-create) echo "{\"id\":\"wf-1\",\"name\":\"$2\"}" ;;
  workflow-execute) echo "fixing" ;;
  workflow-status) echo '{"id":"wf-1","name":"bugfix","status":"completed","completed_steps":1,"total_steps":1}' ;;
  workflow-list) echo '[{"id":"wf-1","name":"bugfix","status":"paused","completed_steps":1,"total_steps":3}]' ;;
  workflow-resume) echo "Workflow wf-1 resumed" ;;
  workflow-checkpoints) echo '["a", {"name": "b"}]' ;;
  *) exit 64 ;;
esac
"#;

    /// Presenter answering from queues and recording everything shown.
    #[derive(Default)]
    struct Scripted {
        selections: Mutex<VecDeque<Option<usize>>>,
        answers: Mutex<VecDeque<Option<String>>>,
        prompts: Mutex<Vec<String>>,
        shown: Mutex<Vec<String>>,
        /// Tripped when a selection is made, as Ctrl-C at a prompt would
        interrupt: Option<CancellationToken>,
    }

    impl Scripted {
        fn new(selections: &[Option<usize>], answers: &[Option<&str>]) -> Self {
            Self {
                selections: Mutex::new(selections.iter().copied().collect()),
                answers: Mutex::new(answers.iter().map(|a| a.map(str::to_string)).collect()),
                ..Self::default()
            }
        }

        fn shown(&self) -> Vec<String> {
            self.shown.lock().clone()
        }
    }

    #[async_trait]
    impl Presenter for Scripted {
        async fn select(&self, placeholder: &str, _choices: &[Choice]) -> Option<usize> {
            self.prompts.lock().push(placeholder.to_string());
            if let Some(ref token) = self.interrupt {
                token.cancel();
            }
            self.selections.lock().pop_front().flatten()
        }

        async fn input(&self, prompt: &str, _placeholder: &str) -> Option<String> {
            self.prompts.lock().push(prompt.to_string());
            self.answers.lock().pop_front().flatten()
        }

        fn info(&self, message: &str) {
            self.shown.lock().push(format!("info: {}", message));
        }

        fn warn(&self, message: &str) {
            self.shown.lock().push(format!("warn: {}", message));
        }

        fn error(&self, message: &str) {
            self.shown.lock().push(format!("error: {}", message));
        }
    }

    fn app(script: &str) -> App {
        App::with_engine(Config::default(), Arc::new(shell_engine(script)))
    }

    #[tokio::test]
    async fn test_start_flow_executes() {
        let app = app(ENGINE);
        let presenter = Scripted::new(&[Some(0), Some(0)], &[Some("crash on save")]);

        let started = app
            .start_workflow(&presenter, &NullSink, StartRequest::default(), CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(started.workflow.id, "wf-1");
        assert_eq!(started.workflow.name, "bugfix");
        assert!(matches!(started.execution, Some(ExecutionOutcome::Completed { .. })));
        assert_eq!(
            *presenter.prompts.lock(),
            vec!["Select workflow template", "Bug description", "Workflow created: wf-1. Execute now?"]
        );
    }

    #[tokio::test]
    async fn test_start_flow_view_status() {
        let app = app(ENGINE);
        let presenter = Scripted::new(&[Some(1)], &[]);
        let request = StartRequest { template: Some("docs".to_string()), ..StartRequest::default() };

        let started = app
            .start_workflow(&presenter, &NullSink, request, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert!(started.execution.is_none());
        assert!(presenter.shown().iter().any(|m| m.contains("Status:   completed")));
    }

    #[tokio::test]
    async fn test_start_unknown_template() {
        let request = StartRequest { template: Some("release".to_string()), ..StartRequest::default() };
        let err = app(ENGINE)
            .start_workflow(&Scripted::default(), &NullSink, request, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::UnknownTemplate(name) if name == "release"));
    }

    #[tokio::test]
    async fn test_start_without_templates() {
        let presenter = Scripted::default();
        let started = app("echo '[]'")
            .start_workflow(&presenter, &NullSink, StartRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        assert!(started.is_none());
        assert_eq!(presenter.shown(), vec!["warn: No workflow templates available"]);
    }

    #[tokio::test]
    async fn test_dismissed_template_pick() {
        let presenter = Scripted::new(&[None], &[]);
        let started = app(ENGINE)
            .start_workflow(&presenter, &NullSink, StartRequest::default(), CancellationToken::new())
            .await
            .unwrap();

        assert!(started.is_none());
    }

    #[tokio::test]
    async fn test_manage_resume() {
        let app = app(ENGINE);
        // Workflow 0, action "Resume".
        let presenter = Scripted::new(&[Some(0), Some(3)], &[]);

        let outcome =
            app.manage_workflows(&presenter, &NullSink, CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome,
            Some(ActionOutcome::Acknowledged {
                action: ActionKind::Resume,
                message: "Workflow wf-1 resumed".to_string()
            })
        );
        assert_eq!(
            app.orchestrator().registry().cached_status("wf-1"),
            Some(WorkflowStatus::Running)
        );
    }

    #[tokio::test]
    async fn test_manage_checkpoints() {
        let app = app(ENGINE);
        let presenter = Scripted::new(&[Some(0), Some(6)], &[]);

        app.manage_workflows(&presenter, &NullSink, CancellationToken::new()).await.unwrap();

        assert_eq!(presenter.shown(), vec!["info: Checkpoints for workflow wf-1:\n  a\n  b"]);
    }

    #[tokio::test]
    async fn test_manage_blank_checkpoint_name() {
        let app = app(ENGINE);
        let presenter = Scripted::new(&[Some(0), Some(5)], &[Some("")]);

        let outcome =
            app.manage_workflows(&presenter, &NullSink, CancellationToken::new()).await.unwrap();

        assert!(outcome.is_none());
        assert_eq!(presenter.shown(), vec!["warn: Checkpoint name is required"]);
    }

    #[tokio::test]
    async fn test_start_interrupted_before_create() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let presenter = Scripted::default();
        let request = StartRequest {
            template: Some("bugfix".to_string()),
            inputs: [("bug_description", "crash")].into_iter().collect(),
            execute: true,
        };

        let started =
            app(ENGINE).start_workflow(&presenter, &NullSink, request, cancel).await.unwrap();

        assert!(started.is_none());
        assert_eq!(presenter.shown(), vec!["warn: Interrupted"]);
    }

    #[tokio::test]
    async fn test_start_interrupted_at_confirm_does_not_execute() {
        let app = app(ENGINE);
        let cancel = CancellationToken::new();
        let presenter = Scripted { interrupt: Some(cancel.clone()), ..Scripted::new(&[Some(0)], &[]) };
        let request = StartRequest { template: Some("docs".to_string()), ..StartRequest::default() };

        let started =
            app.start_workflow(&presenter, &NullSink, request, cancel).await.unwrap().unwrap();

        assert_eq!(started.workflow.id, "wf-1");
        assert!(started.execution.is_none());
        assert_eq!(app.orchestrator().registry().cached_status("wf-1"), Some(WorkflowStatus::Created));
        assert_eq!(presenter.shown(), vec!["warn: Interrupted"]);
    }

    #[tokio::test]
    async fn test_manage_local_rejection_is_a_warning() {
        let app = app(ENGINE);
        // Workflow 0 is paused; action "Pause".
        let presenter = Scripted::new(&[Some(0), Some(2)], &[]);

        let outcome =
            app.manage_workflows(&presenter, &NullSink, CancellationToken::new()).await.unwrap();

        assert!(outcome.is_none());
        assert_eq!(presenter.shown(), vec!["warn: Cannot pause workflow 'wf-1' while it is paused"]);
    }

    #[tokio::test]
    async fn test_manage_without_workflows() {
        let presenter = Scripted::default();
        let outcome = app("echo '[]'")
            .manage_workflows(&presenter, &NullSink, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert_eq!(presenter.shown(), vec!["info: No active workflows"]);
    }
}
