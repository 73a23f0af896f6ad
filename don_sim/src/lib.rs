//! DON Deterministic Simulation Harness
//!
//! Runs the whole request/fulfillment round - request building, per-node
//! execution, aggregation, registry fulfillment and billing - inside one
//! process, with every source of non-determinism pinned down:
//! - **Time**: a paused tokio clock that jumps straight to the next timer
//! - **HTTP**: in-memory mock services with per-node faults and overrides
//! - **Randomness**: keys, nonces and request ids all derive from one seed
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                          SimDon                           │
//! │  ┌─────────────────┐       ┌───────────────────────────┐  │
//! │  │ RequestBuilder  │──────►│ MockRegistry (+LINK token)│  │
//! │  └─────────────────┘       └─────────────▲─────────────┘  │
//! │          │ payload                       │ fulfill        │
//! │  ┌───────▼─────────────────────────────────────────────┐  │
//! │  │ Don: slot-0 .. slot-N executions ──► aggregation    │  │
//! │  └───────┬─────────────────────────────────────────────┘  │
//! │          │ SimHttp (faults, latency, overrides)           │
//! │  ┌───────▼───────────┐                                    │
//! │  │  MockHttpServer   │                                    │
//! │  └───────────────────┘                                    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use don_sim::{ScenarioRunner, ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4).run(ScenarioId::SlowNodes);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod http;
mod keys;
mod runner;
pub mod scenarios;
pub mod scripts;
mod world;

pub use context::SimContext;
pub use exporter::{NodeReport, RequestReport, ScenarioReport, SimExport};
pub use http::{MockHttpServer, NodeFault, SimHttp, SimHttpController};
pub use keys::DeterministicKeyProvider;
pub use runner::{ScenarioFailure, ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
pub use world::{SimConfig, SimDon, SimulationOutcome, StrategyKind, CONSUMER_EVENT, WALLET_COUNT};
