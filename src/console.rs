//! Terminal presentation.
//!
//! Prompts are numbered lists and line input on stdin. Execution output is
//! echoed with a timestamp; engine stderr goes to stderr.

use std::io::{self, BufRead, Write};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::core::send_notification;
use crate::workflow::{Choice, ExecutionOutcome, Presenter, ProgressSink};

/// Read one line from stdin without blocking the runtime.
///
/// Returns `None` at end of input.
async fn read_line() -> Option<String> {
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).map(|n| (n > 0).then_some(line))
    })
    .await;

    match line {
        Ok(Ok(line)) => line.map(|l| l.trim_end_matches(['\r', '\n']).to_string()),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "failed to read from stdin");
            None
        }
        Err(e) => {
            tracing::debug!(error = %e, "stdin reader task failed");
            None
        }
    }
}

/// Render a numbered choice list.
fn render_choices(placeholder: &str, choices: &[Choice]) -> String {
    let mut out = format!("{}\n", placeholder);
    for (i, choice) in choices.iter().enumerate() {
        out.push_str(&format!("  {}) {}", i + 1, choice.label));
        if let Some(ref description) = choice.description {
            if !description.is_empty() {
                out.push_str(&format!(" - {}", description));
            }
        }
        out.push('\n');
        if let Some(ref detail) = choice.detail {
            out.push_str(&format!("     {}\n", detail));
        }
    }
    out
}

/// Parse a 1-based menu answer into an index.
fn parse_choice(answer: &str, count: usize) -> Option<usize> {
    let n: usize = answer.trim().parse().ok()?;
    (1..=count).contains(&n).then(|| n - 1)
}

/// Presenter on the controlling terminal.
///
/// Prompts are abandoned once the interrupt token fires.
#[derive(Debug, Clone, Default)]
pub struct ConsolePresenter {
    interrupt: CancellationToken,
}

impl ConsolePresenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dismiss pending and later prompts when `token` is cancelled.
    #[must_use]
    pub fn interrupt_on(mut self, token: CancellationToken) -> Self {
        self.interrupt = token;
        self
    }

    async fn answer(&self) -> Option<String> {
        tokio::select! {
            biased;
            () = self.interrupt.cancelled() => None,
            line = read_line() => line,
        }
    }
}

#[async_trait]
impl Presenter for ConsolePresenter {
    async fn select(&self, placeholder: &str, choices: &[Choice]) -> Option<usize> {
        if choices.is_empty() {
            return None;
        }

        print!("{}Choice [1-{}, empty to dismiss]: ", render_choices(placeholder, choices), choices.len());
        let _ = io::stdout().flush();

        let answer = self.answer().await?;
        let index = parse_choice(&answer, choices.len());
        if index.is_none() && !answer.trim().is_empty() {
            eprintln!("Warning: '{}' is not one of the choices", answer.trim());
        }
        index
    }

    async fn input(&self, prompt: &str, placeholder: &str) -> Option<String> {
        print!("{} ({}): ", prompt, placeholder);
        let _ = io::stdout().flush();
        self.answer().await
    }

    fn info(&self, message: &str) {
        println!("{}", message);
    }

    fn warn(&self, message: &str) {
        eprintln!("Warning: {}", message);
    }

    fn error(&self, message: &str) {
        eprintln!("Error: {}", message);
    }
}

/// Progress sink echoing execution output to the terminal.
#[derive(Debug)]
pub struct ConsoleSink {
    workflow: String,
    started: Instant,
    notify: bool,
    timestamps: bool,
}

impl ConsoleSink {
    /// Create a sink for one execution of `workflow`.
    pub fn new(workflow: impl Into<String>) -> Self {
        Self { workflow: workflow.into(), started: Instant::now(), notify: false, timestamps: true }
    }

    /// Send a desktop notification when the execution ends.
    #[must_use]
    pub fn notify(mut self, enabled: bool) -> Self {
        self.notify = enabled;
        self
    }

    /// Prefix each line with the local time.
    #[must_use]
    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    fn stamp(&self, line: &str) -> String {
        if self.timestamps {
            format!("[{}] {}", Local::now().format("%H:%M:%S"), line)
        } else {
            line.to_string()
        }
    }
}

/// Final line for an execution outcome.
pub fn outcome_message(outcome: &ExecutionOutcome) -> String {
    match outcome {
        ExecutionOutcome::Completed { .. } => "Workflow completed successfully!".to_string(),
        ExecutionOutcome::Failed { exit_code: Some(code), .. } => {
            format!("Workflow failed with exit code {}", code)
        }
        ExecutionOutcome::Failed { exit_code: None, .. } => {
            "Workflow failed: engine process was killed".to_string()
        }
        ExecutionOutcome::Cancelled => "Workflow execution cancelled".to_string(),
    }
}

impl ProgressSink for ConsoleSink {
    fn progress(&self, line: &str) {
        println!("{}", self.stamp(line));
    }

    fn warning(&self, line: &str) {
        eprintln!("{}", self.stamp(&format!("Warning: {}", line)));
    }

    fn finished(&self, outcome: &ExecutionOutcome) {
        let message = outcome_message(outcome);
        match outcome {
            ExecutionOutcome::Completed { .. } => println!("{}", message),
            ExecutionOutcome::Failed { .. } | ExecutionOutcome::Cancelled => eprintln!("{}", message),
        }

        if self.notify {
            send_notification(&self.workflow, outcome, self.started.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Workflow;

    #[test]
    fn test_render_choices() {
        let choices = [
            Choice::new("bugfix").description("Fix a bug").detail("Category: maintenance"),
            Choice::new("docs"),
        ];
        let text = render_choices("Select workflow template", &choices);

        assert_eq!(
            text,
            "Select workflow template\n  1) bugfix - Fix a bug\n     Category: maintenance\n  2) docs\n"
        );
    }

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("1", 3), Some(0));
        assert_eq!(parse_choice(" 3 ", 3), Some(2));
        assert_eq!(parse_choice("0", 3), None);
        assert_eq!(parse_choice("4", 3), None);
        assert_eq!(parse_choice("", 3), None);
        assert_eq!(parse_choice("two", 3), None);
    }

    #[test]
    fn test_outcome_messages() {
        let completed = ExecutionOutcome::Completed { workflow: Workflow::created("wf-1", "bugfix") };
        assert_eq!(outcome_message(&completed), "Workflow completed successfully!");

        let failed = ExecutionOutcome::Failed { exit_code: Some(2), stderr: String::new() };
        assert_eq!(outcome_message(&failed), "Workflow failed with exit code 2");
        assert_eq!(outcome_message(&ExecutionOutcome::Cancelled), "Workflow execution cancelled");
    }

    #[tokio::test]
    async fn test_interrupted_prompts_are_dismissed() {
        let token = CancellationToken::new();
        token.cancel();
        let presenter = ConsolePresenter::new().interrupt_on(token);

        assert_eq!(presenter.select("Select action", &[Choice::new("Execute")]).await, None);
        assert_eq!(presenter.input("Checkpoint name", "e.g. before-refactor").await, None);
    }

    #[test]
    fn test_stamp() {
        let sink = ConsoleSink::new("wf-1").timestamps(false);
        assert_eq!(sink.stamp("step 1"), "step 1");

        let stamped = ConsoleSink::new("wf-1").stamp("step 1");
        assert!(stamped.starts_with('['));
        assert!(stamped.ends_with("] step 1"));
    }
}
