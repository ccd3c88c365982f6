//! Desktop notifications for finished executions.

use std::time::Duration;

use crate::workflow::ExecutionOutcome;

/// Notification text for an execution outcome: `(icon, body)`.
fn notification_body(outcome: &ExecutionOutcome, duration: Duration) -> (&'static str, String) {
    match outcome {
        ExecutionOutcome::Completed { .. } => {
            ("dialog-information", format!("Completed in {:.2?}", duration))
        }
        ExecutionOutcome::Failed { exit_code: Some(code), .. } => {
            ("dialog-error", format!("Failed with exit code {} after {:.2?}", code, duration))
        }
        ExecutionOutcome::Failed { exit_code: None, .. } => {
            ("dialog-error", format!("Failed after {:.2?}", duration))
        }
        ExecutionOutcome::Cancelled => ("dialog-warning", "Cancelled".to_string()),
    }
}

/// Send a desktop notification for a finished workflow execution.
#[cfg(feature = "notifications")]
pub fn send_notification(workflow: &str, outcome: &ExecutionOutcome, duration: Duration) {
    use notify_rust::Notification;

    let (icon, body) = notification_body(outcome, duration);

    if let Err(e) = Notification::new()
        .summary(&format!("Maaflow: {}", workflow))
        .body(&body)
        .icon(icon)
        .appname("maaflow")
        .timeout(5000)
        .show()
    {
        tracing::debug!(error = %e, "desktop notification unavailable");
    }
}

/// No-op notification when feature is disabled.
#[cfg(not(feature = "notifications"))]
pub fn send_notification(workflow: &str, outcome: &ExecutionOutcome, duration: Duration) {
    let (_, body) = notification_body(outcome, duration);
    tracing::debug!(workflow, body, "notifications disabled");
}
