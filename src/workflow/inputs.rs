//! Input collection for workflow creation.

use super::presenter::Presenter;
use super::types::{WorkflowInputSet, WorkflowTemplate};

/// A workflow input the host knows how to ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownInput {
    /// Input key as declared by templates
    pub key: &'static str,
    /// Prompt shown to the human
    pub prompt: &'static str,
    /// Example value
    pub placeholder: &'static str,
}

/// The inputs the host can collect, in prompt order.
pub const KNOWN_INPUTS: &[KnownInput] = &[
    KnownInput {
        key: "feature_name",
        prompt: "Feature name",
        placeholder: "e.g. user authentication",
    },
    KnownInput {
        key: "requirements",
        prompt: "Feature requirements",
        placeholder: "Describe what the feature must do",
    },
    KnownInput {
        key: "bug_description",
        prompt: "Bug description",
        placeholder: "Describe the bug and how to reproduce it",
    },
    KnownInput { key: "project_name", prompt: "Project name", placeholder: "e.g. my-service" },
    KnownInput {
        key: "project_type",
        prompt: "Project type",
        placeholder: "e.g. web, cli, library",
    },
    KnownInput { key: "license_type", prompt: "License type", placeholder: "e.g. MIT" },
];

/// Collect the inputs `template` needs.
///
/// Only keys the template declares with an empty default are asked for, and
/// only when `preset` does not already carry them. Preset values are kept
/// as given. Dismissed or blank answers are left out so the engine applies
/// its own default.
pub async fn collect_inputs(
    template: &WorkflowTemplate,
    presenter: &dyn Presenter,
    preset: WorkflowInputSet,
) -> WorkflowInputSet {
    let mut inputs = preset;

    for input in KNOWN_INPUTS {
        if inputs.contains(input.key) || !template.needs_input(input.key) {
            continue;
        }

        match presenter.input(input.prompt, input.placeholder).await {
            Some(value) if !value.trim().is_empty() => {
                inputs.insert(input.key, value.trim());
            }
            _ => tracing::debug!(key = input.key, "input left to template default"),
        }
    }

    inputs
}
