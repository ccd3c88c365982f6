//! Workflow Registry.
//!
//! The engine is the authority on workflow state. The registry keeps the last
//! status seen for each workflow so the orchestrator can validate transitions,
//! and overwrites it whenever the engine reports something newer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::catalog::fetch_listing;
use super::error::{Operation, WorkflowError, WorkflowResult};
use super::types::{Workflow, WorkflowStatus};
use crate::engine::{protocol, Engine, EngineCommand};

/// In-memory view of known workflows.
pub struct WorkflowRegistry {
    engine: Arc<dyn Engine>,
    known: Mutex<HashMap<String, Workflow>>,
}

impl WorkflowRegistry {
    /// Create an empty registry.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine, known: Mutex::new(HashMap::new()) }
    }

    /// Every workflow the engine knows, freshly fetched.
    ///
    /// Soft failure: an engine error or malformed answer yields an empty list.
    pub async fn list_workflows(&self) -> WorkflowResult<Vec<Workflow>> {
        let workflows: Vec<Workflow> = fetch_listing(
            self.engine.as_ref(),
            EngineCommand::ListWorkflows,
            Operation::ListWorkflows,
            "a workflow list",
        )
        .await?;

        let mut known = self.known.lock();
        for workflow in workflows.iter().filter(|w| !w.id.is_empty()) {
            known.insert(workflow.id.clone(), workflow.clone());
        }

        Ok(workflows)
    }

    /// Current status of one workflow, freshly fetched.
    pub async fn get_status(&self, id: &str) -> WorkflowResult<Workflow> {
        let command = EngineCommand::Status { id: id.to_string() };
        let output = self
            .engine
            .call(&command)
            .await
            .map_err(|e| WorkflowError::from_invoke(Operation::Status, Some(id), e))?;

        if !output.success() {
            return Err(WorkflowError::rejected(Operation::Status, Some(id), output));
        }

        let mut workflow: Workflow = protocol::decode(&output.stdout, "a workflow status")
            .map_err(|e| WorkflowError::parse(Operation::Status, Some(id), e))?;
        if workflow.id.is_empty() {
            workflow.id = id.to_string();
        }

        tracing::debug!(workflow_id = %id, status = %workflow.status, "fetched workflow status");
        self.record(workflow.clone());
        Ok(workflow)
    }

    /// Remember a workflow as reported.
    pub fn record(&self, workflow: Workflow) {
        self.known.lock().insert(workflow.id.clone(), workflow);
    }

    /// Last reported state of a workflow.
    pub fn cached(&self, id: &str) -> Option<Workflow> {
        self.known.lock().get(id).cloned()
    }

    /// Last reported status of a workflow.
    pub fn cached_status(&self, id: &str) -> Option<WorkflowStatus> {
        self.known.lock().get(id).map(|w| w.status)
    }

    /// Record a status the engine has acknowledged.
    pub fn set_status(&self, id: &str, status: WorkflowStatus) {
        let mut known = self.known.lock();
        known
            .entry(id.to_string())
            .and_modify(|w| w.status = status)
            .or_insert_with(|| Workflow { status, ..Workflow::created(id, "") });
    }

    /// Number of workflows in the view.
    pub fn len(&self) -> usize {
        self.known.lock().len()
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.known.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::shell_engine;

    fn registry(script: &str) -> WorkflowRegistry {
        WorkflowRegistry::new(Arc::new(shell_engine(script)))
    }

    #[tokio::test]
    async fn test_get_status_records_workflow() {
        let registry = registry(
            r#"echo "{\"name\":\"bugfix\",\"status\":\"paused\",\"completed_steps\":1,\"total_steps\":2}""#,
        );

        let workflow = registry.get_status("wf-1").await.unwrap();
        assert_eq!(workflow.id, "wf-1");
        assert_eq!(workflow.status, WorkflowStatus::Paused);
        assert_eq!(registry.cached_status("wf-1"), Some(WorkflowStatus::Paused));
    }

    #[tokio::test]
    async fn test_get_status_rejected() {
        let registry = registry(r#"echo "Unknown workflow: $2" >&2; exit 1"#);

        let err = registry.get_status("wf-404").await.unwrap_err();
        match err {
            WorkflowError::EngineRejected { operation, id, code, stderr } => {
                assert_eq!(operation, Operation::Status);
                assert_eq!(id.as_deref(), Some("wf-404"));
                assert_eq!(code, Some(1));
                assert!(stderr.contains("Unknown workflow: wf-404"));
            }
            other => panic!("expected EngineRejected, got {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_get_status_parse_error_is_hard() {
        let err = registry("echo 'status: running'").get_status("wf-1").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Parse { operation: Operation::Status, .. }));
    }

    #[tokio::test]
    async fn test_list_workflows_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("listed");
        let script = format!(
            r#"if [ -f '{m}' ]; then echo '[]'; else touch '{m}'; echo '[{{"id":"wf-1","name":"bugfix","status":"running"}}]'; fi"#,
            m = marker.display()
        );
        let registry = registry(&script);

        assert_eq!(registry.list_workflows().await.unwrap().len(), 1);
        assert!(registry.list_workflows().await.unwrap().is_empty());
        assert_eq!(registry.cached_status("wf-1"), Some(WorkflowStatus::Running));
    }

    #[tokio::test]
    async fn test_list_workflows_soft_failure() {
        let workflows = registry("echo '{not json'").list_workflows().await.unwrap();
        assert!(workflows.is_empty());
    }

    #[test]
    fn test_set_status() {
        let registry = registry("true");
        registry.record(Workflow::created("wf-1", "bugfix"));
        registry.set_status("wf-1", WorkflowStatus::Running);
        registry.set_status("wf-2", WorkflowStatus::Paused);

        assert_eq!(registry.cached("wf-1").unwrap().name, "bugfix");
        assert_eq!(registry.cached_status("wf-1"), Some(WorkflowStatus::Running));
        assert_eq!(registry.cached_status("wf-2"), Some(WorkflowStatus::Paused));
        assert_eq!(registry.len(), 2);
    }
}
