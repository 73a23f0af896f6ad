//! Common types for the DON environment abstraction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Position of a node within the DON.
///
/// The slot selects the node's per-node secrets share and orders results
/// for deterministic aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeSlot(pub u16);

impl NodeSlot {
    /// Largest number of nodes a DON can address.
    pub const MAX_COUNT: usize = u16::MAX as usize + 1;

    /// Returns the slot as a vector index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Iterates over the first `count` slots in order, stopping at
    /// [`NodeSlot::MAX_COUNT`].
    pub fn range(count: usize) -> impl Iterator<Item = NodeSlot> {
        (0..=u16::MAX).take(count).map(NodeSlot)
    }
}

impl std::fmt::Display for NodeSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// HTTP verb supported by the sandbox capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

/// An outbound request issued by user code.
///
/// Mirrors the `{url, method?, headers?, data?}` shape user scripts pass to
/// `makeHttpRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub url: String,

    #[serde(default)]
    pub method: HttpMethod,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl HttpRequest {
    /// Creates a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            data: None,
        }
    }

    /// Creates a POST request with a JSON body.
    pub fn post(url: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Post,
            headers: BTreeMap::new(),
            data: Some(data),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns the host part of the URL (scheme, path and query stripped).
    pub fn host(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        let end = rest.find(['/', '?']).unwrap_or(rest.len());
        &rest[..end]
    }
}

/// Response returned by an HTTP transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,

    /// Parsed JSON body (`Null` when empty)
    pub data: serde_json::Value,
}

impl HttpResponse {
    /// Creates a 200 response.
    pub fn ok(data: serde_json::Value) -> Self {
        Self { status: 200, data }
    }

    /// Creates a response with an explicit status.
    pub fn with_status(status: u16, data: serde_json::Value) -> Self {
        Self { status, data }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_host() {
        let req = HttpRequest::get("https://maps.example.com/api/distance?origins=a");
        assert_eq!(req.host(), "maps.example.com");

        let bare = HttpRequest::get("localhost:8080");
        assert_eq!(bare.host(), "localhost:8080");
    }

    #[test]
    fn test_slot_ordering() {
        let slots: Vec<_> = NodeSlot::range(3).collect();
        assert_eq!(slots, vec![NodeSlot(0), NodeSlot(1), NodeSlot(2)]);
        assert_eq!(NodeSlot::range(0).count(), 0);
        assert!(NodeSlot(0) < NodeSlot(2));
        assert_eq!(NodeSlot(2).to_string(), "slot-2");
    }

    #[test]
    fn test_range_does_not_wrap_past_last_slot() {
        let slots: Vec<_> = NodeSlot::range(NodeSlot::MAX_COUNT + 5).collect();
        assert_eq!(slots.len(), NodeSlot::MAX_COUNT);
        assert_eq!(slots.last(), Some(&NodeSlot(u16::MAX)));
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: HttpRequest = serde_json::from_str(r#"{"url": "https://x.io"}"#).unwrap();
        assert_eq!(req.method, HttpMethod::Get);
        assert!(req.headers.is_empty());
        assert!(req.data.is_none());
    }
}
