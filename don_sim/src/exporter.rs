//! JSON report exporter.
//!
//! Serializes scenario runs, down to every node's execution result, for CI
//! parsing and offline inspection.

use crate::runner::{ScenarioMetrics, ScenarioResult};
use crate::world::SimulationOutcome;
use alloy_primitives::U256;
use don_core::RequestId;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// One node's execution of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub slot: u16,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub gas_used: u64,
}

/// One simulated request, from dispatch to billing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestReport {
    pub request_id: RequestId,
    pub quorum_reached: bool,
    pub result_hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub contributing_nodes: Vec<u16>,
    pub collection_end: String,
    /// Decoded value, or the decode error
    pub decoded: String,
    pub callback_succeeded: bool,
    pub total_cost_juels: U256,
    pub nodes: Vec<NodeReport>,
}

impl RequestReport {
    pub fn from_outcome(outcome: &SimulationOutcome) -> Self {
        let nodes = outcome
            .results
            .iter()
            .map(|r| NodeReport {
                slot: r.node_slot.0,
                success: r.is_success(),
                value_hex: r.value().map(hex::encode),
                error_kind: r.error_kind().map(|k| k.to_string()),
                message: r.message().map(str::to_string),
                gas_used: r.gas_used,
            })
            .collect();

        Self {
            request_id: outcome.request_id,
            quorum_reached: outcome.response.quorum_reached,
            result_hex: hex::encode(&outcome.response.result),
            error: outcome.response.error_message(),
            contributing_nodes: outcome.response.contributing_nodes.iter().map(|s| s.0).collect(),
            collection_end: format!("{:?}", outcome.end),
            decoded: match &outcome.decoded {
                Ok(value) => value.to_string(),
                Err(e) => format!("error: {}", e),
            },
            callback_succeeded: outcome.receipt.callback_succeeded,
            total_cost_juels: outcome.receipt.billing.total_cost,
            nodes,
        }
    }
}

/// One scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub seed: u64,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub metrics: ScenarioMetrics,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub requests: Vec<RequestReport>,
}

impl From<&ScenarioResult> for ScenarioReport {
    fn from(result: &ScenarioResult) -> Self {
        Self {
            scenario: result.scenario.name().to_string(),
            seed: result.seed,
            passed: result.passed,
            failure_reason: result.failure_reason.clone(),
            metrics: result.metrics.clone(),
            requests: result.requests.clone(),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimExport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<ScenarioReport>,
}

impl SimExport {
    /// Creates an empty export container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a scenario run.
    pub fn add(&mut self, result: &ScenarioResult) {
        self.total += 1;
        if result.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(ScenarioReport::from(result));
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = self.to_json()?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::ScenarioId;

    fn result(passed: bool) -> ScenarioResult {
        ScenarioResult {
            scenario: ScenarioId::HappyPath,
            seed: 42,
            passed,
            failure_reason: (!passed).then(|| "boom".to_string()),
            metrics: ScenarioMetrics::default(),
            requests: Vec::new(),
        }
    }

    #[test]
    fn test_counts() {
        let mut export = SimExport::new();
        export.add(&result(true));
        export.add(&result(false));

        assert_eq!(export.total, 2);
        assert_eq!(export.passed, 1);
        assert_eq!(export.failed, 1);
    }

    #[test]
    fn test_json_shape() {
        let mut export = SimExport::new();
        export.add(&result(false));

        let json: serde_json::Value = serde_json::from_str(&export.to_json().unwrap()).unwrap();
        assert_eq!(json["results"][0]["scenario"], "happy_path");
        assert_eq!(json["results"][0]["failure_reason"], "boom");
        assert!(json["results"][0].get("requests").is_none());
    }
}
