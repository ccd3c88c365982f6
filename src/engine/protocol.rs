//! Structured response decoding.
//!
//! Every engine answer the core depends on is JSON. Identifiers are taken from
//! named fields only; free-text output is never scraped.

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Errors raised while decoding an engine response.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The response was not the JSON shape expected.
    #[error("Malformed engine response, expected {expected}: {source}")]
    Malformed {
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A required field was absent or empty.
    #[error("Engine response is missing '{field}'")]
    MissingField { field: &'static str },

    /// A workflow status outside the known set.
    #[error("Unknown workflow status '{0}'")]
    UnknownStatus(String),
}

/// Decode a JSON response into `T`.
pub fn decode<T: DeserializeOwned>(stdout: &str, expected: &'static str) -> Result<T, ProtocolError> {
    serde_json::from_str(stdout.trim()).map_err(|source| ProtocolError::Malformed { expected, source })
}

#[derive(Debug, Deserialize)]
struct Created {
    #[serde(default, alias = "workflow_id")]
    id: Option<String>,
}

/// Workflow id from a `workflow-create` response.
pub fn decode_created(stdout: &str) -> Result<String, ProtocolError> {
    let created: Created = decode(stdout, "a created-workflow object")?;
    match created.id {
        Some(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        _ => Err(ProtocolError::MissingField { field: "id" }),
    }
}

/// One item of a checkpoint listing: a bare name or a record carrying one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CheckpointEntry {
    Name(String),
    Record { name: String },
}

/// Checkpoint names from a `workflow-checkpoints` response.
pub fn decode_checkpoints(stdout: &str) -> Result<Vec<String>, ProtocolError> {
    let entries: Vec<CheckpointEntry> = decode(stdout, "a checkpoint list")?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            CheckpointEntry::Name(name) | CheckpointEntry::Record { name } => name,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_created() {
        assert_eq!(decode_created(r#"{"id": "wf-7", "name": "bugfix"}"#).unwrap(), "wf-7");
        assert_eq!(decode_created("{\"workflow_id\":\"abc\"}\n").unwrap(), "abc");
    }

    #[test]
    fn test_created_without_id_is_an_error() {
        assert!(matches!(
            decode_created(r#"{"name": "bugfix"}"#),
            Err(ProtocolError::MissingField { field: "id" })
        ));
        assert!(matches!(
            decode_created(r#"{"id": "  "}"#),
            Err(ProtocolError::MissingField { .. })
        ));
    }

    #[test]
    fn test_created_free_text_is_not_scraped() {
        let err = decode_created("Workflow created with ID: wf-9").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
        assert!(err.to_string().contains("created-workflow"));
    }

    #[test]
    fn test_decode_checkpoints_mixed_entries() {
        let names = decode_checkpoints(r#"["before-merge", {"name": "after-tests", "step": 3}]"#)
            .unwrap();
        assert_eq!(names, vec!["before-merge", "after-tests"]);
    }

    #[test]
    fn test_decode_checkpoints_empty() {
        assert!(decode_checkpoints("[]").unwrap().is_empty());
        assert!(decode_checkpoints("").is_err());
    }
}
