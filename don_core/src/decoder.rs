//! Result decoder.
//!
//! Pulls the final typed value out of a registry's event log, the way a
//! test asserts on a fulfillment.

use crate::error::{DonError, Result};
use crate::events::{EventLog, FulfillmentEvent};
use crate::value::{ReturnType, ReturnValue};

/// Finds the last fulfillment event named `name`.
pub fn find_event<'a>(logs: &'a [EventLog], name: &str) -> Result<&'a FulfillmentEvent> {
    logs.iter()
        .rev()
        .filter_map(EventLog::as_fulfillment)
        .find(|event| event.name == name)
        .ok_or_else(|| DonError::EventNotFound(name.to_string()))
}

/// Returns the error report carried by a fulfillment, if any.
pub fn decode_error(event: &FulfillmentEvent) -> Option<String> {
    (!event.error.is_empty()).then(|| String::from_utf8_lossy(&event.error).into_owned())
}

/// Decodes the value of the last fulfillment named `name`.
///
/// A fulfillment that carries only an error is surfaced as that error:
/// `QuorumNotReached` for failed consensus, `ExecutionFailed` otherwise.
pub fn decode(logs: &[EventLog], name: &str, expected: ReturnType) -> Result<ReturnValue> {
    let event = find_event(logs, name)?;

    if event.result.is_empty() {
        if let Some(error) = decode_error(event) {
            return Err(if error.starts_with("QuorumNotReached") {
                DonError::QuorumNotReached(error)
            } else {
                DonError::ExecutionFailed(error)
            });
        }
    }

    ReturnValue::decode(&event.result, expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::request::RequestId;
    use alloy_primitives::{Address, B256};

    fn fulfillment(name: &str, result: &[u8], error: &[u8]) -> EventLog {
        EventLog::Fulfillment(FulfillmentEvent::new(name, RequestId(B256::ZERO), result, error))
    }

    #[test]
    fn test_decode_uint() {
        let logs = vec![
            EventLog::SubscriptionCreated {
                subscription_id: 1,
                owner: Address::ZERO,
            },
            fulfillment("RequestFulfilled", &ReturnValue::uint(40_000).encode(), b""),
        ];
        let value = decode(&logs, "RequestFulfilled", ReturnType::Uint256).unwrap();
        assert_eq!(value, ReturnValue::uint(40_000));
    }

    #[test]
    fn test_event_not_found() {
        let logs = vec![fulfillment("OCRResponse", b"x", b"")];
        let err = decode(&logs, "RequestFulfilled", ReturnType::String).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EventNotFound);
    }

    #[test]
    fn test_latest_event_wins() {
        let logs = vec![
            fulfillment("RequestFulfilled", b"old", b""),
            fulfillment("RequestFulfilled", b"new", b""),
        ];
        let value = decode(&logs, "RequestFulfilled", ReturnType::String).unwrap();
        assert_eq!(value, ReturnValue::String("new".into()));
    }

    #[test]
    fn test_width_mismatch() {
        let logs = vec![fulfillment("RequestFulfilled", &[1, 2, 3], b"")];
        let err = decode(&logs, "RequestFulfilled", ReturnType::Int256).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_error_payload_surfaced() {
        let logs = vec![fulfillment(
            "RequestFulfilled",
            b"",
            b"QuorumNotReached (1/2); slot-1: ExecutionTimeout: exceeded 10000ms",
        )];
        let err = decode(&logs, "RequestFulfilled", ReturnType::Int256).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuorumNotReached);

        let event = find_event(&logs, "RequestFulfilled").unwrap();
        assert!(decode_error(event).unwrap().contains("slot-1"));
    }

    #[test]
    fn test_empty_bytes_decode() {
        let logs = vec![fulfillment("RequestFulfilled", b"", b"")];
        assert_eq!(
            decode(&logs, "RequestFulfilled", ReturnType::Bytes).unwrap(),
            ReturnValue::Bytes(Vec::new())
        );
    }
}
