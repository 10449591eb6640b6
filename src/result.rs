//! Result JSON (v2): the shape every `build` invocation emits on stdout,
//! win or lose. The v1 output format is out of scope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry in a pipeline's execution log: a stage that ran (cached or not).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLogEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

pub type PipelineLog = BTreeMap<String, Vec<StageLogEntry>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageErrorDetails {
    pub stage: StageLogEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildError {
    #[serde(rename = "type")]
    pub kind: String,
    pub details: StageErrorDetails,
}

/// Outcome of a full scheduler run, ready to be serialized as v2 Result JSON.
#[derive(Debug, Clone)]
pub enum BuildResult {
    Success {
        metadata: BTreeMap<String, BTreeMap<String, Value>>,
        log: PipelineLog,
    },
    Failure {
        error: BuildError,
        log: PipelineLog,
    },
}

impl BuildResult {
    pub fn success(&self) -> bool {
        matches!(self, BuildResult::Success { .. })
    }

    pub fn to_json(&self) -> Value {
        match self {
            BuildResult::Success { metadata, log } => serde_json::json!({
                "type": "result",
                "success": true,
                "metadata": metadata,
                "log": log,
            }),
            BuildResult::Failure { error, log } => serde_json::json!({
                "type": "error",
                "success": false,
                "error": error,
                "log": log,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_result_serializes_flat_shape() {
        let mut metadata = BTreeMap::new();
        metadata.insert("tree".to_string(), BTreeMap::new());
        let result = BuildResult::Success { metadata, log: PipelineLog::new() };
        let json = result.to_json();
        assert_eq!(json["type"], "result");
        assert_eq!(json["success"], true);
    }

    #[test]
    fn failure_result_carries_stage_details() {
        let log = PipelineLog::new();
        let error = BuildError {
            kind: "org.osbuild.error.stage".to_string(),
            details: StageErrorDetails {
                stage: StageLogEntry {
                    id: "abc".into(),
                    stage_type: "org.osbuild.testing.fail".into(),
                    output: "boom".into(),
                    success: Some(false),
                    error: None,
                },
            },
        };
        let result = BuildResult::Failure { error, log };
        let json = result.to_json();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["details"]["stage"]["id"], "abc");
    }
}
