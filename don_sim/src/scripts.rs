//! Built-in user scripts and the mock services they call.
//!
//! The scripts are plain JavaScript (`don_sim/scripts/*.js`) and run on the
//! sandbox's QuickJS engine like any caller-supplied source.

use crate::http::MockHttpServer;
use don_env::{HttpResponse, NodeSlot};
use serde_json::json;

pub const DISTANCE_SOURCE: &str = include_str!("../scripts/distance.js");
pub const ANSWER_SOURCE: &str = include_str!("../scripts/answer.js");
pub const PRICE_SOURCE: &str = include_str!("../scripts/price.js");
pub const SECRET_ECHO_SOURCE: &str = include_str!("../scripts/secret_echo.js");

pub const MAPS_URL: &str = "https://maps.example.com/distance";
pub const ANSWER_URL: &str = "https://oracle.example.com/answer";
pub const PRICE_URL: &str = "https://prices.example.com/eth-usd";

/// Answer served by the mock answer service.
pub const ANSWER: i64 = 42;

/// Price served to slot 0; each further slot's source lags 5 cents behind.
pub const BASE_PRICE_CENTS: u64 = 250_000;

/// Looks up a built-in source by short name (`distance`, `answer`, ...).
pub fn builtin_source(name: &str) -> Option<&'static str> {
    match name {
        "distance" => Some(DISTANCE_SOURCE),
        "answer" => Some(ANSWER_SOURCE),
        "price" => Some(PRICE_SOURCE),
        "secret_echo" => Some(SECRET_ECHO_SOURCE),
        _ => None,
    }
}

// ============================================================================
// MOCK SERVICES
// ============================================================================

fn query_param<'a>(url: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Distance the mock maps service reports between two places.
///
/// FNV-1a over `origin|destination`, folded into 1..41 km.
pub fn mock_distance_meters(origin: &str, destination: &str) -> u64 {
    let hash = origin
        .bytes()
        .chain(std::iter::once(b'|'))
        .chain(destination.bytes())
        .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
    1_000 + hash % 40_000
}

/// Price the mock price service reports to `slot`.
pub fn mock_price_cents(slot: NodeSlot) -> u64 {
    BASE_PRICE_CENTS - 5 * slot.0 as u64
}

/// Registers the maps, answer and price services on `server`.
pub fn install_services(server: &MockHttpServer) {
    server.route(MAPS_URL, |request, _| {
        if request.headers.get("X-Api-Key").map_or(true, |k| k.is_empty()) {
            return HttpResponse::with_status(401, json!({ "error": "missing api key" }));
        }
        match (
            query_param(&request.url, "origin"),
            query_param(&request.url, "destination"),
        ) {
            (Some(origin), Some(destination)) => HttpResponse::ok(json!({
                "distance_m": mock_distance_meters(origin, destination),
            })),
            _ => HttpResponse::with_status(400, json!({ "error": "origin and destination required" })),
        }
    });
    server.respond_json(ANSWER_URL, json!({ "answer": ANSWER }));
    server.route(PRICE_URL, |_, slot| {
        HttpResponse::ok(json!({ "price_cents": mock_price_cents(slot) }))
    });
}
