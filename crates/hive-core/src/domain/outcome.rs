//! Outcome model: what an executor reports back for one run.
//!
//! The scheduler never looks inside `notes` or `artifacts`; it only branches
//! on the kind.

use serde::{Deserialize, Serialize};

/// Classification of a single execution.
///
/// Serialized as SUCCESS / FAILURE / BLOCKED, which is also the vocabulary of
/// the command executor's result marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
    Blocked,
}

/// Something produced or observed during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Artifact {
    /// Tail of captured standard output.
    Stdout(String),

    /// Tail of captured standard error.
    Stderr(String),

    /// Path to a file produced/used.
    FilePath(String),

    Url(String),

    /// Arbitrary structured output.
    Json(serde_json::Value),
}

/// Result of one executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    #[serde(rename = "status")]
    pub kind: OutcomeKind,

    #[serde(default)]
    pub notes: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Outcome {
    pub fn success(notes: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Success,
            notes: notes.into(),
            artifacts: Vec::new(),
        }
    }

    pub fn failure(notes: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            notes: notes.into(),
            artifacts: Vec::new(),
        }
    }

    pub fn blocked(notes: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Blocked,
            notes: notes.into(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_artifacts(mut self, artifacts: impl IntoIterator<Item = Artifact>) -> Self {
        self.artifacts.extend(artifacts);
        self
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_kind_serializes_as_required_names() {
        let s = serde_json::to_string(&OutcomeKind::Success).unwrap();
        assert_eq!(s, "\"SUCCESS\"");

        let s = serde_json::to_string(&OutcomeKind::Blocked).unwrap();
        assert_eq!(s, "\"BLOCKED\"");
    }

    #[test]
    fn outcome_parses_marker_payload_shape() {
        let json = r#"{"status":"FAILURE","notes":"lint errors","artifacts":[{"kind":"FilePath","value":"report.txt"}]}"#;
        let outcome: Outcome = serde_json::from_str(json).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Failure);
        assert_eq!(outcome.notes, "lint errors");
        assert_eq!(
            outcome.artifacts,
            vec![Artifact::FilePath("report.txt".to_string())]
        );
    }

    #[test]
    fn notes_default_to_empty() {
        let outcome: Outcome = serde_json::from_str(r#"{"status":"SUCCESS"}"#).unwrap();
        assert!(outcome.is_success());
        assert!(outcome.notes.is_empty());
        assert!(outcome.artifacts.is_empty());
    }
}
