//! Simulated outbound HTTP with per-node fault injection.
//!
//! Every node gets its own [`SimHttp`]; all of them route into one shared
//! [`MockHttpServer`], and one [`SimHttpController`] decides per slot whether
//! a call is delayed, fails, hangs or gets a substituted answer.

use crate::context::SimContext;
use async_trait::async_trait;
use don_env::{DonContext, EnvError, HttpController, HttpRequest, HttpResponse, HttpTransport, NodeSlot};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Handler for one mocked route.
pub type RouteHandler = Arc<dyn Fn(&HttpRequest, NodeSlot) -> HttpResponse + Send + Sync>;

/// In-memory stand-in for the external services user code calls.
///
/// Routes are URL prefixes; the first registered match wins. Unmatched
/// URLs get a 404.
#[derive(Clone, Default)]
pub struct MockHttpServer {
    routes: Arc<RwLock<Vec<(String, RouteHandler)>>>,
}

impl MockHttpServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for every URL starting with `prefix`.
    pub fn route<F>(&self, prefix: impl Into<String>, handler: F)
    where
        F: Fn(&HttpRequest, NodeSlot) -> HttpResponse + Send + Sync + 'static,
    {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((prefix.into(), Arc::new(handler)));
    }

    /// Registers a route that always answers 200 with `data`.
    pub fn respond_json(&self, prefix: impl Into<String>, data: serde_json::Value) {
        self.route(prefix, move |_, _| HttpResponse::ok(data.clone()));
    }

    /// Answers `request` as seen from `slot`.
    pub fn handle(&self, request: &HttpRequest, slot: NodeSlot) -> HttpResponse {
        let handler = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(prefix, _)| request.url.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone());

        match handler {
            Some(handler) => handler(request, slot),
            None => HttpResponse::with_status(
                404,
                serde_json::json!({ "error": format!("no route for {}", request.url) }),
            ),
        }
    }
}

/// A fault injected into one node's outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFault {
    /// Calls fail immediately as unreachable
    Unreachable,
    /// Calls never complete
    Hang,
}

/// Fault injection for every node's transport.
#[derive(Clone, Default)]
pub struct SimHttpController {
    /// Active faults
    faults: Arc<RwLock<HashMap<NodeSlot, NodeFault>>>,

    /// Per-node latency in milliseconds
    latency_ms: Arc<RwLock<HashMap<NodeSlot, u64>>>,

    /// Responses that replace whatever the server would answer
    overrides: Arc<RwLock<HashMap<NodeSlot, HttpResponse>>>,

    /// Calls seen per node
    calls: Arc<RwLock<HashMap<NodeSlot, usize>>>,
}

impl SimHttpController {
    /// Creates a controller with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call of `slot` answer `response`.
    pub fn override_response(&self, slot: NodeSlot, response: HttpResponse) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot, response);
    }

    pub fn fault(&self, slot: NodeSlot) -> Option<NodeFault> {
        self.faults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slot)
            .copied()
    }

    /// Gets the latency of a node (default 0).
    pub fn latency(&self, slot: NodeSlot) -> u64 {
        self.latency_ms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slot)
            .copied()
            .unwrap_or(0)
    }

    pub fn response_override(&self, slot: NodeSlot) -> Option<HttpResponse> {
        self.overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slot)
            .cloned()
    }

    /// Number of calls `slot` has made.
    pub fn calls(&self, slot: NodeSlot) -> usize {
        self.calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slot)
            .copied()
            .unwrap_or(0)
    }

    /// Total calls across all nodes.
    pub fn total_calls(&self) -> usize {
        self.calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    fn record_call(&self, slot: NodeSlot) {
        *self
            .calls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(slot)
            .or_default() += 1;
    }

    fn set_fault(&self, slot: NodeSlot, fault: NodeFault) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot, fault);
    }
}

impl HttpController for SimHttpController {
    fn isolate(&self, slot: NodeSlot) {
        self.set_fault(slot, NodeFault::Unreachable);
    }

    fn hang(&self, slot: NodeSlot) {
        self.set_fault(slot, NodeFault::Hang);
    }

    /// Clears faults, latency and overrides. Call counts are kept.
    fn heal_all(&self) {
        self.faults.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.latency_ms.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.overrides.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn set_latency(&self, slot: NodeSlot, latency_ms: u64) {
        self.latency_ms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot, latency_ms);
    }
}

/// Simulated HTTP transport of one node.
pub struct SimHttp {
    slot: NodeSlot,
    ctx: Arc<SimContext>,
    server: MockHttpServer,
    controller: SimHttpController,
}

impl SimHttp {
    pub fn new(
        slot: NodeSlot,
        ctx: Arc<SimContext>,
        server: MockHttpServer,
        controller: SimHttpController,
    ) -> Self {
        Self {
            slot,
            ctx,
            server,
            controller,
        }
    }
}

#[async_trait]
impl HttpTransport for SimHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, EnvError> {
        self.controller.record_call(self.slot);

        let latency = self.controller.latency(self.slot);
        if latency > 0 {
            self.ctx.sleep(Duration::from_millis(latency)).await;
        }

        match self.controller.fault(self.slot) {
            Some(NodeFault::Unreachable) => {
                debug!("{} -> {} dropped (unreachable)", self.slot, request.host());
                return Err(EnvError::unreachable(request.host()));
            }
            Some(NodeFault::Hang) => {
                debug!("{} -> {} hanging", self.slot, request.host());
                return std::future::pending().await;
            }
            None => {}
        }

        if let Some(response) = self.controller.response_override(self.slot) {
            return Ok(response);
        }
        Ok(self.server.handle(&request, self.slot))
    }

    fn local_slot(&self) -> NodeSlot {
        self.slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport(slot: u16, server: &MockHttpServer, controller: &SimHttpController) -> SimHttp {
        SimHttp::new(NodeSlot(slot), SimContext::shared(1), server.clone(), controller.clone())
    }

    #[test]
    fn test_server_routes_by_prefix() {
        let server = MockHttpServer::new();
        server.respond_json("https://a.example/price", json!({ "price": 10 }));
        server.route("https://b.example/", |_, slot| HttpResponse::ok(json!({ "slot": slot.0 })));

        let price = server.handle(&HttpRequest::get("https://a.example/price?x=1"), NodeSlot(0));
        assert_eq!(price.data["price"], 10);

        let echo = server.handle(&HttpRequest::get("https://b.example/who"), NodeSlot(3));
        assert_eq!(echo.data["slot"], 3);

        let missing = server.handle(&HttpRequest::get("https://c.example/"), NodeSlot(0));
        assert_eq!(missing.status, 404);
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_node_is_unreachable() {
        let server = MockHttpServer::new();
        server.respond_json("https://a.example/", json!(1));
        let controller = SimHttpController::new();
        controller.isolate(NodeSlot(1));

        let healthy = transport(0, &server, &controller);
        let isolated = transport(1, &server, &controller);

        assert!(healthy.send(HttpRequest::get("https://a.example/")).await.is_ok());
        let err = isolated.send(HttpRequest::get("https://a.example/")).await.unwrap_err();
        assert!(err.to_string().contains("a.example"));

        controller.heal_all();
        assert!(isolated.send(HttpRequest::get("https://a.example/")).await.is_ok());
        assert_eq!(controller.calls(NodeSlot(1)), 2);
        assert_eq!(controller.total_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_node_never_answers() {
        let server = MockHttpServer::new();
        let controller = SimHttpController::new();
        controller.hang(NodeSlot(0));

        let http = transport(0, &server, &controller);
        let result = tokio::time::timeout(
            Duration::from_secs(60),
            http.send(HttpRequest::get("https://a.example/")),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_call() {
        let server = MockHttpServer::new();
        server.respond_json("https://a.example/", json!(1));
        let controller = SimHttpController::new();
        controller.set_latency(NodeSlot(0), 250);

        let http = transport(0, &server, &controller);
        let start = tokio::time::Instant::now();
        http.send(HttpRequest::get("https://a.example/")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_override_replaces_server_answer() {
        let server = MockHttpServer::new();
        server.respond_json("https://a.example/", json!({ "v": 1 }));
        let controller = SimHttpController::new();
        controller.override_response(NodeSlot(2), HttpResponse::ok(json!({ "v": 2 })));

        let normal = transport(0, &server, &controller);
        let skewed = transport(2, &server, &controller);

        let a = normal.send(HttpRequest::get("https://a.example/")).await.unwrap();
        let b = skewed.send(HttpRequest::get("https://a.example/")).await.unwrap();
        assert_eq!(a.data["v"], 1);
        assert_eq!(b.data["v"], 2);
        assert_eq!(skewed.local_slot(), NodeSlot(2));
    }
}
