//! Template Catalog Client.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::error::{Operation, WorkflowError, WorkflowResult};
use super::types::WorkflowTemplate;
use crate::core::InvokeError;
use crate::engine::{protocol, Engine, EngineCommand};

/// Run a read-only listing call.
///
/// A non-zero exit or an unparseable answer degrades to an empty list with a
/// warning. An unreachable engine or a timeout is still an error.
pub(super) async fn fetch_listing<T: DeserializeOwned>(
    engine: &dyn Engine,
    command: EngineCommand,
    operation: Operation,
    expected: &'static str,
) -> WorkflowResult<Vec<T>> {
    let output = match engine.call(&command).await {
        Ok(output) => output,
        Err(e @ (InvokeError::Spawn { .. } | InvokeError::Timeout { .. })) => {
            return Err(WorkflowError::from_invoke(operation, None, e));
        }
        Err(e) => {
            tracing::warn!(%operation, error = %e, "engine listing failed");
            return Ok(Vec::new());
        }
    };

    if !output.success() {
        tracing::warn!(
            %operation,
            code = ?output.exit_code,
            stderr = output.stderr.trim(),
            "engine listing exited with an error"
        );
        return Ok(Vec::new());
    }

    match protocol::decode::<Vec<T>>(&output.stdout, expected) {
        Ok(items) => Ok(items),
        Err(e) => {
            tracing::warn!(%operation, error = %e, "ignoring unparseable engine listing");
            Ok(Vec::new())
        }
    }
}

/// Lists the workflow templates the engine publishes.
#[derive(Clone)]
pub struct TemplateCatalog {
    engine: Arc<dyn Engine>,
}

impl TemplateCatalog {
    /// Create a catalog client.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// All templates, freshly fetched.
    pub async fn list_templates(&self) -> WorkflowResult<Vec<WorkflowTemplate>> {
        let templates: Vec<WorkflowTemplate> = fetch_listing(
            self.engine.as_ref(),
            EngineCommand::ListTemplates,
            Operation::ListTemplates,
            "a template list",
        )
        .await?;

        tracing::debug!(count = templates.len(), "fetched workflow templates");
        Ok(templates)
    }

    /// The template called `name`.
    pub async fn find(&self, name: &str) -> WorkflowResult<WorkflowTemplate> {
        self.list_templates()
            .await?
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| WorkflowError::UnknownTemplate(name.to_string()))
    }
}
