//! Sandbox executor.
//!
//! Runs user code once per node slot. Each run gets a fresh [`ScriptScope`]
//! holding that slot's args, its own secrets view and its own HTTP
//! transport; nothing is shared between runs.
//!
//! Source text is executed by a [`ScriptEngine`]; the default is the
//! QuickJS-backed [`QuickJsEngine`]. The executor bounds each run by
//! [`SandboxLimits::timeout`] in context time, while the engine bounds
//! compute and memory inside the interpreter.
//!
//! Failures never escape as `Err`: timeouts, thrown errors and bad return
//! values all come back as an [`ExecutionResult`] carrying a failure kind,
//! so the aggregator can treat them as data.

use crate::config::CodeLanguage;
use crate::engine::QuickJsEngine;
use crate::error::{DonError, ErrorKind, Result};
use crate::secrets::NodeSecrets;
use crate::value::{ReturnType, ReturnValue};
use async_trait::async_trait;
use don_env::{HttpRequest, HttpResponse, HttpTransport, NodeSlot};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Fixed gas charged for every execution.
pub const EXECUTION_BASE_GAS: u64 = 5_000;

/// Calldata gas per zero byte of the response.
pub const ZERO_BYTE_GAS: u64 = 4;

/// Calldata gas per non-zero byte of the response.
pub const NONZERO_BYTE_GAS: u64 = 16;

// ============================================================================
// LIMITS
// ============================================================================

/// Resource budget for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Budget for the whole run
    pub timeout: Duration,

    /// Budget for one outbound HTTP call
    pub http_timeout: Duration,

    /// Maximum outbound HTTP calls per run
    pub max_http_requests: usize,

    /// Maximum encoded size of the returned value
    pub max_response_bytes: usize,

    /// Interpreter heap limit
    pub max_memory_bytes: usize,

    /// Interrupt polls a script may use before it is stopped
    pub max_fuel: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(9),
            max_http_requests: 5,
            max_response_bytes: 256,
            max_memory_bytes: 128 * 1024 * 1024,
            max_fuel: 20_000,
        }
    }
}

impl SandboxLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_max_http_requests(mut self, max: usize) -> Self {
        self.max_http_requests = max;
        self
    }

    pub fn with_max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }

    pub fn with_max_memory_bytes(mut self, max: usize) -> Self {
        self.max_memory_bytes = max;
        self
    }

    pub fn with_max_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = fuel;
        self
    }
}

// ============================================================================
// USER CODE INTERFACE
// ============================================================================

/// Errors raised while running user code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    /// User code threw, or settled without a usable value
    #[error("{0}")]
    Thrown(String),

    #[error("HTTP request limit of {0} exceeded")]
    HttpRequestLimit(usize),

    /// Stopped by the engine's compute budget
    #[error("{0}")]
    Interrupted(String),

    #[error("script engine error: {0}")]
    Engine(String),
}

impl ScriptError {
    /// Creates an error as if user code had thrown `msg`.
    pub fn thrown(msg: impl Into<String>) -> Self {
        Self::Thrown(msg.into())
    }
}

/// Executes request source text.
///
/// An engine returns the raw bytes user code produced; the executor checks
/// them against the expected return type.
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    async fn run(
        &self,
        language: CodeLanguage,
        source: &str,
        scope: &mut ScriptScope,
        limits: &SandboxLimits,
    ) -> std::result::Result<Vec<u8>, ScriptError>;
}

/// Outcome of one `make_http_request` call, as seen by user code.
///
/// Transport failures, timeouts and error statuses set `error` instead of
/// faulting.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResult {
    pub error: bool,

    /// Response body (`Null` when there was no response)
    pub data: serde_json::Value,

    pub response: Option<HttpResponse>,

    /// Failure description when `error` is set
    pub message: Option<String>,
}

impl HttpResult {
    fn from_response(response: HttpResponse) -> Self {
        let error = !response.is_success();
        Self {
            error,
            data: response.data.clone(),
            message: error.then(|| format!("HTTP status {}", response.status)),
            response: Some(response),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            error: true,
            data: serde_json::Value::Null,
            response: None,
            message: Some(message.into()),
        }
    }
}

/// Everything user code can see during one run.
pub struct ScriptScope {
    slot: NodeSlot,
    args: Vec<String>,
    secrets: NodeSecrets,
    http: Arc<dyn HttpTransport>,
    http_timeout: Duration,
    max_http_requests: usize,
    http_requests: usize,
}

impl ScriptScope {
    /// Creates a scope for one run.
    pub fn new(
        slot: NodeSlot,
        args: Vec<String>,
        secrets: NodeSecrets,
        http: Arc<dyn HttpTransport>,
        limits: &SandboxLimits,
    ) -> Self {
        Self {
            slot,
            args,
            secrets,
            http,
            http_timeout: limits.http_timeout,
            max_http_requests: limits.max_http_requests,
            http_requests: 0,
        }
    }

    /// The slot of the node running this scope.
    pub fn slot(&self) -> NodeSlot {
        self.slot
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// This node's secrets. Other slots' shares are never reachable.
    pub fn secrets(&self) -> &NodeSecrets {
        &self.secrets
    }

    /// Number of HTTP calls made so far.
    pub fn http_requests(&self) -> usize {
        self.http_requests
    }

    /// Performs one outbound HTTP call through this node's transport.
    ///
    /// Takes `&mut self`, so a run has at most one call in flight.
    /// Exceeding the per-run request budget is the only `Err`.
    pub async fn make_http_request(
        &mut self,
        request: HttpRequest,
    ) -> std::result::Result<HttpResult, ScriptError> {
        if self.http_requests >= self.max_http_requests {
            return Err(ScriptError::HttpRequestLimit(self.max_http_requests));
        }
        self.http_requests += 1;

        let url = request.url.clone();
        let result = match tokio::time::timeout(self.http_timeout, self.http.send(request)).await {
            Ok(Ok(response)) => HttpResult::from_response(response),
            Ok(Err(e)) => HttpResult::failed(e.to_string()),
            Err(_) => HttpResult::failed(format!(
                "request timed out after {}ms",
                self.http_timeout.as_millis()
            )),
        };

        if result.error {
            debug!("{} HTTP call to {} failed: {:?}", self.slot, url, result.message);
        }
        Ok(result)
    }
}

// ============================================================================
// EXECUTION RESULTS
// ============================================================================

/// Why an execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionErrorKind {
    Timeout,
    Failed,
}

impl ExecutionErrorKind {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ExecutionErrorKind::Timeout => ErrorKind::ExecutionTimeout,
            ExecutionErrorKind::Failed => ErrorKind::ExecutionFailed,
        }
    }
}

impl std::fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionErrorKind::Timeout => f.write_str("ExecutionTimeout"),
            ExecutionErrorKind::Failed => f.write_str("ExecutionFailed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Encoded return value
    Success(Vec<u8>),
    Failure {
        kind: ExecutionErrorKind,
        message: String,
    },
}

/// The result of one node's execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub node_slot: NodeSlot,
    pub outcome: ExecutionOutcome,
    pub gas_used: u64,
}

impl ExecutionResult {
    pub fn success(node_slot: NodeSlot, value: Vec<u8>, gas_used: u64) -> Self {
        Self {
            node_slot,
            outcome: ExecutionOutcome::Success(value),
            gas_used,
        }
    }

    pub fn failure(node_slot: NodeSlot, kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            node_slot,
            outcome: ExecutionOutcome::Failure {
                kind,
                message: message.into(),
            },
            gas_used: EXECUTION_BASE_GAS,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Success(_))
    }

    /// Returns the encoded value of a successful run.
    pub fn value(&self) -> Option<&[u8]> {
        match &self.outcome {
            ExecutionOutcome::Success(v) => Some(v),
            ExecutionOutcome::Failure { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ExecutionErrorKind> {
        match &self.outcome {
            ExecutionOutcome::Success(_) => None,
            ExecutionOutcome::Failure { kind, .. } => Some(*kind),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match &self.outcome {
            ExecutionOutcome::Success(_) => None,
            ExecutionOutcome::Failure { message, .. } => Some(message),
        }
    }

    /// Converts to a `Result`, mapping failures to their protocol error.
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self.outcome {
            ExecutionOutcome::Success(v) => Ok(v),
            ExecutionOutcome::Failure { kind, message } => Err(match kind {
                ExecutionErrorKind::Timeout => DonError::ExecutionTimeout(message),
                ExecutionErrorKind::Failed => DonError::ExecutionFailed(message),
            }),
        }
    }
}

/// Calldata gas for delivering `bytes`.
pub fn calldata_gas(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .map(|b| if *b == 0 { ZERO_BYTE_GAS } else { NONZERO_BYTE_GAS })
        .sum()
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// What one node is asked to run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub slot: NodeSlot,
    pub source: String,
    pub language: CodeLanguage,
    pub args: Vec<String>,
    pub gas_limit: u32,
    pub expected: ReturnType,
}

/// Runs user code under [`SandboxLimits`].
#[derive(Clone)]
pub struct SandboxExecutor {
    engine: Arc<dyn ScriptEngine>,
    limits: SandboxLimits,
}

impl SandboxExecutor {
    /// Creates an executor running JavaScript on [`QuickJsEngine`].
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            engine: Arc::new(QuickJsEngine),
            limits,
        }
    }

    /// Replaces the engine.
    pub fn with_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Runs one invocation to completion, timeout or failure.
    pub async fn execute(
        &self,
        invocation: Invocation,
        secrets: NodeSecrets,
        http: Arc<dyn HttpTransport>,
    ) -> ExecutionResult {
        let slot = invocation.slot;
        let mut scope = ScriptScope::new(slot, invocation.args, secrets, http, &self.limits);
        let run = self.engine.run(
            invocation.language,
            &invocation.source,
            &mut scope,
            &self.limits,
        );

        let bytes = match tokio::time::timeout(self.limits.timeout, run).await {
            Err(_) => {
                return ExecutionResult::failure(
                    slot,
                    ExecutionErrorKind::Timeout,
                    format!("exceeded {}ms", self.limits.timeout.as_millis()),
                );
            }
            Ok(Err(ScriptError::Interrupted(reason))) => {
                warn!("{} stopped by budget: {}", slot, reason);
                return ExecutionResult::failure(slot, ExecutionErrorKind::Timeout, reason);
            }
            Ok(Err(e)) => {
                return ExecutionResult::failure(slot, ExecutionErrorKind::Failed, e.to_string());
            }
            Ok(Ok(bytes)) => bytes,
        };

        let value = match ReturnValue::decode(&bytes, invocation.expected) {
            Ok(value) => value,
            Err(e) => {
                return ExecutionResult::failure(
                    slot,
                    ExecutionErrorKind::Failed,
                    format!("returned value is not a valid {}: {}", invocation.expected, e),
                );
            }
        };

        if bytes.len() > self.limits.max_response_bytes {
            return ExecutionResult::failure(
                slot,
                ExecutionErrorKind::Failed,
                format!(
                    "response of {} bytes exceeds {} bytes",
                    bytes.len(),
                    self.limits.max_response_bytes
                ),
            );
        }

        let gas_used = (EXECUTION_BASE_GAS + calldata_gas(&bytes)).min(invocation.gas_limit as u64);
        debug!("{} returned {} ({} gas)", slot, value, gas_used);
        ExecutionResult::success(slot, bytes, gas_used)
    }
}
