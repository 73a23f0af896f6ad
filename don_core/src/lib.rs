//! DON Core - Request/Fulfillment Protocol Engines
//!
//! Engines for a decentralized off-chain compute oracle network (DON):
//! a client contract submits a signed request, N nodes run the user code
//! against external services, and the aggregated result is delivered back
//! through a registry that keeps subscription and billing books.
//!
//! ```text
//! RequestBuilder --(secrets sealed per node)--> MockRegistry::request
//!        |                                             |
//!        v                                             v
//!     Request -----------> Don::dispatch --> [SandboxExecutor x N] --> aggregate
//!                                                                          |
//!   decoder::decode <-- EventLog <-- billing::estimate <-- MockRegistry::fulfill
//! ```
//!
//! Nothing here performs file or environment I/O; time, task spawning and
//! outbound HTTP all come in through `don_env`.

pub mod aggregator;
pub mod billing;
pub mod config;
pub mod decoder;
pub mod don;
pub mod engine;
pub mod error;
pub mod events;
pub mod registry;
pub mod request;
pub mod sandbox;
pub mod secrets;
pub mod value;

// Re-export key types for convenience
pub use aggregator::{
    aggregate, AggregatedResponse, AggregationStrategy, CollectionEnd, MajorityStrategy,
    MedianStrategy, ResultCollector,
};
pub use billing::{estimate, estimate_max_cost, BillingConfig, BillingRecord};
pub use config::{CodeLanguage, CodeLocation, RequestConfig};
pub use don::{DispatchOutcome, Don, DonConfig, DonNode};
pub use engine::QuickJsEngine;
pub use error::{DonError, ErrorKind};
pub use events::{EventLog, FulfillmentEvent, REQUEST_FULFILLED};
pub use registry::{
    ConsumerContract, FulfillmentReceipt, MockLinkToken, MockRegistry, RecordingConsumer,
    Subscription, SubscriptionState,
};
pub use request::{address_of, ParsedRequest, Request, RequestBuilder, RequestId};
pub use sandbox::{
    ExecutionErrorKind, ExecutionOutcome, ExecutionResult, HttpResult, Invocation,
    SandboxExecutor, SandboxLimits, ScriptEngine, ScriptError, ScriptScope,
};
pub use secrets::{EncryptedSecrets, EncryptedSecretsBundle, NodeSecrets, SecretsMap};
pub use value::{ReturnType, ReturnValue};
