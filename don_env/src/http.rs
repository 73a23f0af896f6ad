//! Outbound HTTP capability abstraction for node executions.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{HttpRequest, HttpResponse, NodeSlot};

/// Abstraction for the outbound HTTP calls a node performs on behalf of
/// user code.
///
/// Every node owns its own transport instance: nodes call external
/// services independently, so responses may legitimately differ between
/// slots.
///
/// # Implementations
///
/// - **Simulation**: routes to in-memory mock services with per-node
///   latency, outage and response-override injection
///
/// # Call Flow
///
/// ```text
/// user code (JS)        ScriptScope              HttpTransport
///   |                       |                          |
///   |-- makeHttpRequest --->|                          |
///   |                       |-- send(request) -------->|
///   |                       |                          |-- [latency/outage]
///   |                       |<-- Ok(response) / Err ---|
///   |<-- HttpResult --------|                          |
/// ```
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    /// Performs one request.
    ///
    /// # Returns
    /// * `Ok(response)` - Any response from the remote side, including
    ///   non-2xx statuses
    /// * `Err(EnvError)` - The request never produced a response
    ///
    /// # Blocking
    /// May block for as long as the remote side takes; callers bound it
    /// with their own timeout.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, EnvError>;

    /// Returns the slot of the node this transport belongs to.
    fn local_slot(&self) -> NodeSlot;
}

/// Fault injection for simulated HTTP transports.
pub trait HttpController: Send + Sync {
    /// Makes every outbound call of a node fail as unreachable.
    fn isolate(&self, slot: NodeSlot);

    /// Makes every outbound call of a node hang forever.
    fn hang(&self, slot: NodeSlot);

    /// Clears all injected faults.
    fn heal_all(&self);

    /// Sets the latency added to each call of a node.
    fn set_latency(&self, slot: NodeSlot, latency_ms: u64);
}
