//! Events emitted by the mock registry and consumer contracts.

use crate::billing::{BillingConfig, BillingRecord};
use crate::request::RequestId;
use alloy_primitives::{Address, U256};

/// Name of the registry's own fulfillment event.
pub const REQUEST_FULFILLED: &str = "RequestFulfilled";

/// A fulfillment-shaped event: `{request_id, result, error}`.
///
/// The registry emits one named [`REQUEST_FULFILLED`]; consumer contracts
/// may emit their own under other names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentEvent {
    pub name: String,
    pub request_id: RequestId,
    pub result: Vec<u8>,
    pub error: Vec<u8>,
}

impl FulfillmentEvent {
    pub fn new(name: impl Into<String>, request_id: RequestId, result: &[u8], error: &[u8]) -> Self {
        Self {
            name: name.into(),
            request_id,
            result: result.to_vec(),
            error: error.to_vec(),
        }
    }
}

/// One entry of the registry's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventLog {
    SubscriptionCreated {
        subscription_id: u64,
        owner: Address,
    },
    SubscriptionFunded {
        subscription_id: u64,
        old_balance: U256,
        new_balance: U256,
    },
    SubscriptionConsumerAdded {
        subscription_id: u64,
        consumer: Address,
    },
    AuthorizedSendersChanged {
        senders: Vec<Address>,
    },
    ConfigSet(BillingConfig),
    RequestStarted {
        request_id: RequestId,
        subscription_id: u64,
        consumer: Address,
        requester: Address,
        gas_limit: u32,
    },
    RequestTimedOut {
        request_id: RequestId,
    },
    UserCallbackError {
        request_id: RequestId,
        reason: String,
    },
    BillingEnd {
        subscription_id: u64,
        record: BillingRecord,
    },
    Fulfillment(FulfillmentEvent),
}

impl EventLog {
    /// Returns the event name.
    pub fn name(&self) -> &str {
        match self {
            EventLog::SubscriptionCreated { .. } => "SubscriptionCreated",
            EventLog::SubscriptionFunded { .. } => "SubscriptionFunded",
            EventLog::SubscriptionConsumerAdded { .. } => "SubscriptionConsumerAdded",
            EventLog::AuthorizedSendersChanged { .. } => "AuthorizedSendersChanged",
            EventLog::ConfigSet(_) => "ConfigSet",
            EventLog::RequestStarted { .. } => "RequestStarted",
            EventLog::RequestTimedOut { .. } => "RequestTimedOut",
            EventLog::UserCallbackError { .. } => "UserCallbackError",
            EventLog::BillingEnd { .. } => "BillingEnd",
            EventLog::Fulfillment(event) => &event.name,
        }
    }

    /// Returns the fulfillment payload, if this is a fulfillment event.
    pub fn as_fulfillment(&self) -> Option<&FulfillmentEvent> {
        match self {
            EventLog::Fulfillment(event) => Some(event),
            _ => None,
        }
    }
}
