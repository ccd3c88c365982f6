//! Presentation Adapter interface.
//!
//! The core asks a [`Presenter`] to pick among choices and to supply input
//! values, and pushes execution output into a [`ProgressSink`]. It never
//! assumes anything about how these are rendered.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::orchestrator::ExecutionOutcome;
use super::types::Workflow;

/// One selectable item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Choice {
    /// Main text
    pub label: String,
    /// Secondary text shown next to the label
    pub description: Option<String>,
    /// Extra line shown under the label
    pub detail: Option<String>,
}

impl Choice {
    /// A choice with only a label.
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), description: None, detail: None }
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the detail line.
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Human-facing side of the interactive flows.
#[async_trait]
pub trait Presenter: Send + Sync {
    /// Ask the human to pick one of `choices`. `None` means dismissed.
    async fn select(&self, placeholder: &str, choices: &[Choice]) -> Option<usize>;

    /// Ask the human for a value. `None` means dismissed.
    async fn input(&self, prompt: &str, placeholder: &str) -> Option<String>;

    /// Informational message.
    fn info(&self, message: &str);

    /// Warning message.
    fn warn(&self, message: &str);

    /// Error message.
    fn error(&self, message: &str);

    /// Show a workflow's status.
    fn show_status(&self, workflow: &Workflow) {
        self.info(&workflow.render_status());
    }
}

/// Receives live output from one execution.
pub trait ProgressSink: Send + Sync {
    /// A line of standard output.
    fn progress(&self, line: &str);

    /// A line of standard error.
    fn warning(&self, line: &str);

    /// The execution ended. Called exactly once, last.
    fn finished(&self, outcome: &ExecutionOutcome);
}

/// Execution output as a value, for sinks backed by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Standard output line
    Progress(String),
    /// Standard error line
    Warning(String),
    /// Terminal outcome
    Finished(ExecutionOutcome),
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn progress(&self, line: &str) {
        let _ = self.send(ProgressEvent::Progress(line.to_string()));
    }

    fn warning(&self, line: &str) {
        let _ = self.send(ProgressEvent::Warning(line.to_string()));
    }

    fn finished(&self, outcome: &ExecutionOutcome) {
        let _ = self.send(ProgressEvent::Finished(outcome.clone()));
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn progress(&self, _line: &str) {}
    fn warning(&self, _line: &str) {}
    fn finished(&self, _outcome: &ExecutionOutcome) {}
}
