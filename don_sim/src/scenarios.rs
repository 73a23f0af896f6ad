//! Protocol scenarios for the simulation harness.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// DON-001: Every node answers, one value is delivered and billed
    HappyPath,

    /// DON-002: Nodes time out; quorum depends on the threshold
    SlowNodes,

    /// DON-003: A request from a consumer the subscription never added
    UnauthorizedConsumer,

    /// DON-004: The same request fulfilled twice, also concurrently
    DuplicateFulfillment,

    /// DON-005: Callback gas limit above the registry maximum
    GasLimitExceeded,

    /// DON-006: Nodes disagree; majority vs median aggregation
    DivergentNodes,

    /// DON-007: Per-node secrets reach only their own node
    SecretIsolation,

    /// DON-008: An unfulfilled request expires and releases its reservation
    RequestTimeout,

    /// DON-009: The consumer reverts, the fulfillment is still billed
    CallbackFailure,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::HappyPath,
            ScenarioId::SlowNodes,
            ScenarioId::UnauthorizedConsumer,
            ScenarioId::DuplicateFulfillment,
            ScenarioId::GasLimitExceeded,
            ScenarioId::DivergentNodes,
            ScenarioId::SecretIsolation,
            ScenarioId::RequestTimeout,
            ScenarioId::CallbackFailure,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::HappyPath => "happy_path",
            ScenarioId::SlowNodes => "slow_nodes",
            ScenarioId::UnauthorizedConsumer => "unauthorized_consumer",
            ScenarioId::DuplicateFulfillment => "duplicate_fulfillment",
            ScenarioId::GasLimitExceeded => "gas_limit_exceeded",
            ScenarioId::DivergentNodes => "divergent_nodes",
            ScenarioId::SecretIsolation => "secret_isolation",
            ScenarioId::RequestTimeout => "request_timeout",
            ScenarioId::CallbackFailure => "callback_failure",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::HappyPath => "Distance request on every node, quorum, consumer callback, billing",
            ScenarioId::SlowNodes => "Only slot 0 answers 42; threshold 2 misses quorum, threshold 1 delivers",
            ScenarioId::UnauthorizedConsumer => "Request from an unknown consumer is rejected without state change",
            ScenarioId::DuplicateFulfillment => "Second fulfillment fails; two racing fulfillments yield one success",
            ScenarioId::GasLimitExceeded => "Gas limit above max fails before encryption and is never billed",
            ScenarioId::DivergentNodes => "Outlier node excluded by majority; skewed feeds settled by median",
            ScenarioId::SecretIsolation => "Each node sees its own secrets share, ciphertext only in the payload",
            ScenarioId::RequestTimeout => "Pending request expires after request_timeout_seconds",
            ScenarioId::CallbackFailure => "Reverting consumer emits UserCallbackError, fulfillment still billed",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "happy_path" | "happypath" | "don-001" => Ok(ScenarioId::HappyPath),
            "slow_nodes" | "slownodes" | "don-002" => Ok(ScenarioId::SlowNodes),
            "unauthorized_consumer" | "unauthorized" | "don-003" => Ok(ScenarioId::UnauthorizedConsumer),
            "duplicate_fulfillment" | "duplicate" | "don-004" => Ok(ScenarioId::DuplicateFulfillment),
            "gas_limit_exceeded" | "gas_limit" | "don-005" => Ok(ScenarioId::GasLimitExceeded),
            "divergent_nodes" | "divergent" | "don-006" => Ok(ScenarioId::DivergentNodes),
            "secret_isolation" | "secrets" | "don-007" => Ok(ScenarioId::SecretIsolation),
            "request_timeout" | "timeout" | "don-008" => Ok(ScenarioId::RequestTimeout),
            "callback_failure" | "callback" | "don-009" => Ok(ScenarioId::CallbackFailure),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
