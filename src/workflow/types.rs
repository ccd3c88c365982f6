//! Workflow data model.
//!
//! Every type here is a view of data the engine owns. Nothing is generated
//! locally: ids, statuses and progress all come from engine responses.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::engine::ProtocolError;

/// Width of the text progress bar.
const BAR_WIDTH: usize = 20;

/// A reusable workflow definition published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Unique template name
    pub name: String,

    /// Human-readable description
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,

    /// Grouping shown next to the template
    #[serde(default, deserialize_with = "null_as_default")]
    pub category: String,

    /// Declared inputs and their defaults
    #[serde(default, deserialize_with = "null_as_default")]
    pub default_inputs: BTreeMap<String, serde_json::Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl WorkflowTemplate {
    /// Whether the template declares `key` without a usable default.
    pub fn needs_input(&self, key: &str) -> bool {
        self.default_inputs.get(key).is_some_and(is_empty_default)
    }
}

/// Whether a declared default counts as "not filled in".
pub fn is_empty_default(value: &serde_json::Value) -> bool {
    use serde_json::Value;

    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Input values for one workflow creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowInputSet(BTreeMap<String, String>);

impl WorkflowInputSet {
    /// Create an empty input set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether `key` has a value.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over key/value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Consume into the underlying map.
    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for WorkflowInputSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum WorkflowStatus {
    /// Created, not yet executed
    Created,
    /// Executing
    Running,
    /// Paused by request
    Paused,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by request
    Cancelled,
}

impl WorkflowStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "created" | "pending" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(ProtocolError::UnknownStatus(s.to_string())),
        }
    }
}

impl TryFrom<String> for WorkflowStatus {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Step counts reported by the engine. Absent values are unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Steps finished successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_steps: Option<u32>,

    /// Steps that failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_steps: Option<u32>,

    /// Steps in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_steps: Option<u32>,

    /// Total steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,

    /// Percentage complete, 0 to 100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percentage: Option<f64>,
}

impl Progress {
    /// Percentage complete, derived from step counts when not reported.
    pub fn percentage(&self) -> f64 {
        let pct = match (self.progress_percentage, self.completed_steps, self.total_steps) {
            (Some(pct), _, _) => pct,
            (None, Some(done), Some(total)) if total > 0 => f64::from(done) * 100.0 / f64::from(total),
            _ => 0.0,
        };
        pct.clamp(0.0, 100.0)
    }

    /// `"3/5 steps (60%)"`; unknown counts read as 0.
    pub fn summary(&self) -> String {
        format!(
            "{}/{} steps ({:.0}%)",
            self.completed_steps.unwrap_or(0),
            self.total_steps.unwrap_or(0),
            self.percentage()
        )
    }

    /// Text progress bar, `[########------------]`.
    pub fn bar(&self) -> String {
        let filled = ((self.percentage() / 100.0) * BAR_WIDTH as f64).round() as usize;
        let filled = filled.min(BAR_WIDTH);
        format!("[{}{}]", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
    }
}

/// One workflow instance as last reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Engine-issued id
    #[serde(default, alias = "workflow_id")]
    pub id: String,

    /// Name of the template it was created from
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,

    /// Lifecycle state
    pub status: WorkflowStatus,

    /// Step counts
    #[serde(flatten)]
    pub progress: Progress,
}

impl Workflow {
    /// A freshly created workflow.
    pub fn created(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: WorkflowStatus::Created,
            progress: Progress::default(),
        }
    }

    /// Name, or the id when the engine did not report one.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Multi-line status report.
    pub fn render_status(&self) -> String {
        let name = if self.name.is_empty() { "Unknown" } else { &self.name };
        let p = &self.progress;

        format!(
            "Workflow: {}\nID:       {}\nStatus:   {}\nProgress: {} {}\nSteps:    {} completed, {} failed, {} running",
            name,
            self.id,
            self.status,
            p.bar(),
            p.summary(),
            p.completed_steps.unwrap_or(0),
            p.failed_steps.unwrap_or(0),
            p.running_steps.unwrap_or(0),
        )
    }
}

/// A named save-point within a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Owning workflow
    pub workflow_id: String,
    /// Checkpoint name, unique within the workflow
    pub name: String,
}
