//! DON Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the DON protocol
//! engines to run in both **Production** (tokio) and **Simulation**
//! (seeded, paused-clock) environments.
//!
//! # Core Concept
//!
//! Everything a node execution touches outside its own memory goes through
//! a trait:
//! - Time and task spawning (`DonContext`)
//! - Outbound HTTP calls made by user code (`HttpTransport`)
//!
//! Running on a paused clock with every HTTP call routed to in-memory
//! services, a simulated request/fulfillment round is reproducible from
//! its seed.
//!
//! # Example
//!
//! ```ignore
//! use don_env::{DonContext, HttpRequest, HttpTransport};
//!
//! async fn poll<Ctx: DonContext, Http: HttpTransport>(ctx: &Ctx, http: &Http) {
//!     let response = http.send(HttpRequest::get("https://api.example/price")).await;
//!     ctx.sleep(Duration::from_secs(1)).await;
//! }
//! ```

mod context;
mod http;
mod types;
mod error;
mod tokio_impl;

pub use context::DonContext;
pub use http::{HttpController, HttpTransport};
pub use types::{HttpMethod, HttpRequest, HttpResponse, NodeSlot};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
