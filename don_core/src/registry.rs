//! Mock registry/oracle.
//!
//! An in-memory stand-in for the on-chain subscription, billing and oracle
//! contracts. Subscriptions move through
//!
//! ```text
//! Created --fund--> Funded --add_consumer--> ConsumerAuthorized --request--> RequestPending
//!                                                  ^                             |
//!                                                  |                          fulfill
//!                                             (timeout)                          v
//!                                                  +------------------------ Fulfilled --request--> ...
//! ```
//!
//! Every operation validates completely before touching state, so a
//! rejected call leaves the registry exactly as it was. Share it as
//! `Arc<tokio::sync::Mutex<MockRegistry<_>>>`; the request status guard then
//! makes concurrent fulfillments of one request yield a single success.

use crate::aggregator::AggregatedResponse;
use crate::billing::{self, BillingConfig, BillingRecord, PriceFeed};
use crate::error::{DonError, Result};
use crate::events::{EventLog, FulfillmentEvent, REQUEST_FULFILLED};
use crate::request::{Request, RequestId};
use crate::sandbox::calldata_gas;
use crate::secrets;
use crate::value::ReturnType;
use alloy_primitives::{keccak256, Address, U256};
use don_env::DonContext;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey;

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Created,
    Funded,
    ConsumerAuthorized,
    RequestPending,
    Fulfilled,
}

impl SubscriptionState {
    fn is_funded(&self) -> bool {
        !matches!(self, SubscriptionState::Created)
    }
}

/// A funded, authorization-scoped billing account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    pub owner: Address,
    /// Juels
    pub balance: U256,
    /// Juels reserved for pending requests
    pub blocked_balance: U256,
    pub consumers: BTreeSet<Address>,
    pub state: SubscriptionState,
    pending: usize,
}

impl Subscription {
    /// Balance not reserved by pending requests.
    pub fn available_balance(&self) -> U256 {
        self.balance.saturating_sub(self.blocked_balance)
    }

    /// Number of requests awaiting fulfillment.
    pub fn pending_requests(&self) -> usize {
        self.pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Fulfilled,
    TimedOut,
}

/// A request accepted by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub subscription_id: u64,
    pub consumer: Address,
    pub requester: Address,
    pub gas_limit: u32,
    pub return_type: ReturnType,
    /// Context time of acceptance
    pub created_at: Duration,
    /// Juels reserved at acceptance
    pub estimated_cost: U256,
    /// Billing terms in force at acceptance; fulfillment is charged under these
    pub billing: BillingConfig,
    pub status: RequestStatus,
}

// ============================================================================
// CONSUMERS
// ============================================================================

/// What a consumer callback did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub gas_used: u64,
    pub events: Vec<FulfillmentEvent>,
}

/// A requesting contract, as seen by the registry.
pub trait ConsumerContract: Send {
    /// Receives the fulfillment. `Err` reverts the callback.
    fn handle_oracle_fulfillment(
        &mut self,
        request_id: RequestId,
        response: &[u8],
        err: &[u8],
    ) -> std::result::Result<CallbackOutcome, String>;
}

/// Gas a [`RecordingConsumer`] spends besides calldata.
pub const CONSUMER_BASE_GAS: u64 = 21_000;

/// A consumer that stores the latest fulfillment and re-emits it under its
/// own event name.
#[derive(Debug, Clone)]
pub struct RecordingConsumer {
    event_name: String,
    extra_gas: u64,
    fail_with: Option<String>,
    pub latest_request_id: Option<RequestId>,
    pub latest_response: Vec<u8>,
    pub latest_error: Vec<u8>,
}

impl RecordingConsumer {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            extra_gas: 0,
            fail_with: None,
            latest_request_id: None,
            latest_response: Vec::new(),
            latest_error: Vec::new(),
        }
    }

    /// Burns `gas` on top of the base cost in every callback.
    pub fn with_extra_gas(mut self, gas: u64) -> Self {
        self.extra_gas = gas;
        self
    }

    /// Makes every callback revert with `reason`.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.fail_with = Some(reason.into());
        self
    }
}

impl ConsumerContract for RecordingConsumer {
    fn handle_oracle_fulfillment(
        &mut self,
        request_id: RequestId,
        response: &[u8],
        err: &[u8],
    ) -> std::result::Result<CallbackOutcome, String> {
        if let Some(reason) = &self.fail_with {
            return Err(reason.clone());
        }

        self.latest_request_id = Some(request_id);
        self.latest_response = response.to_vec();
        self.latest_error = err.to_vec();

        Ok(CallbackOutcome {
            gas_used: CONSUMER_BASE_GAS + self.extra_gas + calldata_gas(response) + calldata_gas(err),
            events: vec![FulfillmentEvent::new(&self.event_name, request_id, response, err)],
        })
    }
}

/// Result of a successful `fulfill`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentReceipt {
    pub request_id: RequestId,
    pub callback_succeeded: bool,
    pub callback_gas_used: u64,
    pub billing: BillingRecord,
}

// ============================================================================
// REGISTRY
// ============================================================================

/// In-memory subscription/billing/oracle registry.
pub struct MockRegistry<Ctx: DonContext> {
    ctx: Arc<Ctx>,
    config: BillingConfig,
    price_feed: Option<PriceFeed>,
    subscriptions: BTreeMap<u64, Subscription>,
    next_subscription_id: u64,
    requests: HashMap<RequestId, PendingRequest>,
    request_nonce: u64,
    authorized_senders: BTreeSet<Address>,
    don_public_key: Option<PublicKey>,
    node_public_keys: Vec<PublicKey>,
    consumers: HashMap<Address, Box<dyn ConsumerContract>>,
    billing: Vec<BillingRecord>,
    logs: Vec<EventLog>,
}

impl<Ctx: DonContext> MockRegistry<Ctx> {
    pub fn new(ctx: Arc<Ctx>, config: BillingConfig) -> Self {
        Self {
            ctx,
            config,
            price_feed: None,
            subscriptions: BTreeMap::new(),
            next_subscription_id: 1,
            requests: HashMap::new(),
            request_nonce: 0,
            authorized_senders: BTreeSet::new(),
            don_public_key: None,
            node_public_keys: Vec::new(),
            consumers: HashMap::new(),
            billing: Vec::new(),
            logs: Vec::new(),
        }
    }

    // ---- admin ------------------------------------------------------------

    /// Replaces the billing configuration.
    pub fn set_config(&mut self, config: BillingConfig) -> Result<()> {
        if config.wei_per_unit_link.is_zero() {
            return Err(DonError::InvalidConfig("wei_per_unit_link must be non-zero".into()));
        }
        info!("Registry config set: max gas {}", config.max_gas_limit);
        self.logs.push(EventLog::ConfigSet(config.clone()));
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Replaces the set of addresses allowed to fulfill.
    pub fn set_authorized_senders(&mut self, senders: Vec<Address>) {
        self.authorized_senders = senders.iter().copied().collect();
        self.logs.push(EventLog::AuthorizedSendersChanged { senders });
    }

    pub fn is_authorized_sender(&self, sender: &Address) -> bool {
        self.authorized_senders.contains(sender)
    }

    /// Returns the DON public key as `0x`-prefixed hex.
    pub fn get_don_public_key(&self) -> Result<String> {
        self.don_public_key
            .map(|key| format!("0x{}", hex::encode(key.as_bytes())))
            .ok_or_else(|| DonError::InvalidPublicKey("DON public key not set".into()))
    }

    /// Sets the DON public key from hex, with or without `0x`.
    pub fn set_don_public_key(&mut self, hex_key: &str) -> Result<()> {
        self.don_public_key = Some(secrets::parse_public_key(hex_key)?);
        Ok(())
    }

    pub fn set_node_public_keys(&mut self, keys: Vec<PublicKey>) {
        self.node_public_keys = keys;
    }

    /// Node public keys, in slot order.
    pub fn get_all_node_public_keys(&self) -> &[PublicKey] {
        &self.node_public_keys
    }

    /// Records a LINK/ETH price feed answer at the current context time.
    pub fn set_price_feed(&mut self, wei_per_unit_link: U256) {
        self.price_feed = Some(PriceFeed {
            wei_per_unit_link,
            updated_at: self.ctx.now(),
        });
    }

    /// Deploys a consumer contract at `address`.
    pub fn deploy_consumer(&mut self, address: Address, consumer: Box<dyn ConsumerContract>) {
        self.consumers.insert(address, consumer);
    }

    // ---- subscriptions ----------------------------------------------------

    /// Creates a subscription owned by `owner` and returns its id.
    pub fn create_subscription(&mut self, owner: Address) -> u64 {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;

        self.subscriptions.insert(
            id,
            Subscription {
                id,
                owner,
                balance: U256::ZERO,
                blocked_balance: U256::ZERO,
                consumers: BTreeSet::new(),
                state: SubscriptionState::Created,
                pending: 0,
            },
        );
        self.logs.push(EventLog::SubscriptionCreated {
            subscription_id: id,
            owner,
        });
        debug!("Subscription {} created for {}", id, owner);
        id
    }

    fn subscription_mut(&mut self, id: u64) -> Result<&mut Subscription> {
        self.subscriptions
            .get_mut(&id)
            .ok_or(DonError::SubscriptionNotFound(id))
    }

    /// Adds `amount` juels to a subscription.
    pub fn fund(&mut self, id: u64, amount: U256) -> Result<()> {
        if amount.is_zero() {
            return Err(DonError::InvalidAmount("funding amount must be positive".into()));
        }
        let sub = self.subscription_mut(id)?;
        let old_balance = sub.balance;
        let new_balance = old_balance
            .checked_add(amount)
            .ok_or_else(|| DonError::InvalidAmount("balance overflow".into()))?;

        sub.balance = new_balance;
        if sub.state == SubscriptionState::Created {
            sub.state = SubscriptionState::Funded;
        }
        self.logs.push(EventLog::SubscriptionFunded {
            subscription_id: id,
            old_balance,
            new_balance,
        });
        debug!("Subscription {} funded: {} -> {}", id, old_balance, new_balance);
        Ok(())
    }

    /// Authorizes `consumer` to send requests on a funded subscription.
    pub fn add_consumer(&mut self, id: u64, consumer: Address) -> Result<()> {
        let sub = self.subscription_mut(id)?;
        if !sub.state.is_funded() {
            return Err(DonError::SubscriptionNotFunded(id));
        }

        sub.consumers.insert(consumer);
        if sub.state == SubscriptionState::Funded {
            sub.state = SubscriptionState::ConsumerAuthorized;
        }
        self.logs.push(EventLog::SubscriptionConsumerAdded {
            subscription_id: id,
            consumer,
        });
        Ok(())
    }

    // ---- requests ---------------------------------------------------------

    /// Accepts a request from consumer `sender` on subscription `id`.
    ///
    /// Reserves the request's maximum cost from the subscription balance.
    ///
    /// # Errors
    /// Checked in order: `SubscriptionNotFound`, `SubscriptionNotFunded`,
    /// `UnauthorizedSender`, payload errors (`MalformedPayload`,
    /// `InvalidSignature`), `GasLimitExceeded`, `InsufficientBalance`.
    pub fn request(&mut self, id: u64, sender: Address, request: &Request) -> Result<RequestId> {
        let sub = self
            .subscriptions
            .get(&id)
            .ok_or(DonError::SubscriptionNotFound(id))?;
        if !sub.state.is_funded() {
            return Err(DonError::SubscriptionNotFunded(id));
        }
        if !sub.consumers.contains(&sender) {
            warn!("Rejected request from {} on subscription {}", sender, id);
            return Err(DonError::UnauthorizedSender(sender.to_string()));
        }

        let parsed = request.verify()?;
        if parsed.gas_limit > self.config.max_gas_limit {
            return Err(DonError::GasLimitExceeded {
                requested: parsed.gas_limit,
                max: self.config.max_gas_limit,
            });
        }

        let config = self.billing_config_now();
        let estimated_cost = billing::estimate_max_cost(parsed.gas_limit, &config)?;
        if sub.available_balance() < estimated_cost {
            return Err(DonError::InsufficientBalance {
                required: estimated_cost.to_string(),
                available: sub.available_balance().to_string(),
            });
        }

        let mut preimage = Vec::with_capacity(48);
        preimage.extend_from_slice(&id.to_be_bytes());
        preimage.extend_from_slice(&self.request_nonce.to_be_bytes());
        preimage.extend_from_slice(keccak256(&request.payload).as_slice());
        let request_id = RequestId(keccak256(&preimage));
        self.request_nonce += 1;

        let requester = parsed.requester_address();
        let pending = PendingRequest {
            id: request_id,
            subscription_id: id,
            consumer: sender,
            requester,
            gas_limit: parsed.gas_limit,
            return_type: parsed.return_type,
            created_at: self.ctx.now(),
            estimated_cost,
            billing: config,
            status: RequestStatus::Pending,
        };

        let sub = self.subscription_mut(id)?;
        sub.blocked_balance += estimated_cost;
        sub.pending += 1;
        sub.state = SubscriptionState::RequestPending;

        self.requests.insert(request_id, pending);
        self.logs.push(EventLog::RequestStarted {
            request_id,
            subscription_id: id,
            consumer: sender,
            requester,
            gas_limit: parsed.gas_limit,
        });
        info!("Request {} started on subscription {}", request_id, id);
        Ok(request_id)
    }

    fn billing_config_now(&self) -> BillingConfig {
        let rate = billing::effective_wei_per_unit_link(
            self.price_feed.as_ref(),
            self.ctx.now(),
            &self.config,
        );
        BillingConfig {
            wei_per_unit_link: rate,
            ..self.config.clone()
        }
    }

    /// Delivers an aggregated response to the requesting consumer.
    ///
    /// A reverting or out-of-gas callback is recorded as `UserCallbackError`
    /// and still billed; it does not fail the fulfillment.
    ///
    /// # Errors
    /// `UnauthorizedSender`, `UnknownRequest`, `DuplicateFulfillment`,
    /// `RequestTimedOut`, all without state change.
    pub fn fulfill(
        &mut self,
        transmitter: Address,
        request_id: RequestId,
        response: &AggregatedResponse,
    ) -> Result<FulfillmentReceipt> {
        if !self.authorized_senders.contains(&transmitter) {
            return Err(DonError::UnauthorizedSender(transmitter.to_string()));
        }
        let pending = self
            .requests
            .get(&request_id)
            .ok_or_else(|| DonError::UnknownRequest(request_id.to_string()))?;
        match pending.status {
            RequestStatus::Pending => {}
            RequestStatus::Fulfilled => {
                return Err(DonError::DuplicateFulfillment(request_id.to_string()))
            }
            RequestStatus::TimedOut => return Err(DonError::RequestTimedOut(request_id.to_string())),
        }
        let subscription_id = pending.subscription_id;
        let consumer_address = pending.consumer;
        let gas_limit = pending.gas_limit;
        let reserved = pending.estimated_cost;
        let config = pending.billing.clone();

        // Fail on billing before the consumer sees anything.
        billing::estimate(gas_limit, gas_limit as u64, &config)?;

        let callback = match self.consumers.get_mut(&consumer_address) {
            Some(consumer) => {
                consumer.handle_oracle_fulfillment(request_id, &response.result, &response.error)
            }
            None => Err(format!("no contract deployed at {}", consumer_address)),
        };
        let (callback_succeeded, callback_gas_used) = match callback {
            Ok(outcome) if outcome.gas_used <= gas_limit as u64 => {
                self.logs
                    .extend(outcome.events.into_iter().map(EventLog::Fulfillment));
                (true, outcome.gas_used)
            }
            Ok(_) => {
                self.callback_error(request_id, "out of gas".to_string());
                (false, gas_limit as u64)
            }
            Err(reason) => {
                self.callback_error(request_id, reason);
                (false, 0)
            }
        };

        self.logs.push(EventLog::Fulfillment(FulfillmentEvent::new(
            REQUEST_FULFILLED,
            request_id,
            &response.result,
            &response.error,
        )));

        let mut record = billing::estimate(gas_limit, callback_gas_used, &config)?;
        record.request_id = Some(request_id);

        let sub = self.subscription_mut(subscription_id)?;
        let charged = record.total_cost.min(sub.balance);
        sub.balance -= charged;
        sub.blocked_balance = sub.blocked_balance.saturating_sub(reserved);
        sub.pending = sub.pending.saturating_sub(1);
        if sub.pending == 0 {
            sub.state = SubscriptionState::Fulfilled;
        }

        if let Some(pending) = self.requests.get_mut(&request_id) {
            pending.status = RequestStatus::Fulfilled;
        }
        self.billing.push(record.clone());
        self.logs.push(EventLog::BillingEnd {
            subscription_id,
            record: record.clone(),
        });

        info!(
            "Request {} fulfilled (quorum={}, callback ok={}, cost {} juels)",
            request_id, response.quorum_reached, callback_succeeded, record.total_cost
        );
        Ok(FulfillmentReceipt {
            request_id,
            callback_succeeded,
            callback_gas_used,
            billing: record,
        })
    }

    fn callback_error(&mut self, request_id: RequestId, reason: String) {
        warn!("Consumer callback for {} failed: {}", request_id, reason);
        self.logs
            .push(EventLog::UserCallbackError { request_id, reason });
    }

    /// Expires pending requests older than `request_timeout_seconds`.
    ///
    /// Requests that are not yet old enough, or no longer pending, are
    /// skipped. Returns the ids that were timed out.
    ///
    /// # Errors
    /// `UnknownRequest` if any id is unknown (nothing is timed out then).
    pub fn timeout_requests(&mut self, ids: &[RequestId]) -> Result<Vec<RequestId>> {
        if let Some(unknown) = ids.iter().find(|id| !self.requests.contains_key(id)) {
            return Err(DonError::UnknownRequest(unknown.to_string()));
        }

        let now = self.ctx.now();
        let timeout = Duration::from_secs(self.config.request_timeout_seconds);
        let mut expired = Vec::new();

        for id in ids {
            let Some(pending) = self.requests.get_mut(id) else {
                continue;
            };
            if pending.status != RequestStatus::Pending || now.saturating_sub(pending.created_at) < timeout
            {
                continue;
            }
            pending.status = RequestStatus::TimedOut;
            let (subscription_id, reserved) = (pending.subscription_id, pending.estimated_cost);

            if let Some(sub) = self.subscriptions.get_mut(&subscription_id) {
                sub.blocked_balance = sub.blocked_balance.saturating_sub(reserved);
                sub.pending = sub.pending.saturating_sub(1);
                if sub.pending == 0 {
                    sub.state = SubscriptionState::ConsumerAuthorized;
                }
            }
            self.logs.push(EventLog::RequestTimedOut { request_id: *id });
            info!("Request {} timed out", id);
            expired.push(*id);
        }

        Ok(expired)
    }

    // ---- views ------------------------------------------------------------

    pub fn subscription(&self, id: u64) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    pub fn pending_request(&self, id: &RequestId) -> Option<&PendingRequest> {
        self.requests.get(id)
    }

    pub fn billing_records(&self) -> &[BillingRecord] {
        &self.billing
    }

    pub fn logs(&self) -> &[EventLog] {
        &self.logs
    }
}

// ============================================================================
// LINK TOKEN
// ============================================================================

/// ABI word carrying a subscription id in `transfer_and_call` data.
pub fn encode_subscription_id(id: u64) -> [u8; 32] {
    U256::from(id).to_be_bytes::<32>()
}

/// A minimal LINK token that can fund subscriptions.
#[derive(Debug, Default)]
pub struct MockLinkToken {
    balances: HashMap<Address, U256>,
}

impl MockLinkToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&mut self, to: Address, amount: U256) {
        *self.balances.entry(to).or_default() += amount;
    }

    pub fn balance_of(&self, owner: &Address) -> U256 {
        self.balances.get(owner).copied().unwrap_or_default()
    }

    /// Transfers `amount` to the registry and funds the subscription named
    /// by `data`.
    pub fn transfer_and_call<Ctx: DonContext>(
        &mut self,
        from: Address,
        registry: &mut MockRegistry<Ctx>,
        amount: U256,
        data: &[u8],
    ) -> Result<()> {
        let word: [u8; 32] = data
            .try_into()
            .map_err(|_| DonError::malformed("transfer data must be one 32-byte word"))?;
        let id: u64 = U256::from_be_bytes(word)
            .try_into()
            .map_err(|_| DonError::malformed("subscription id out of range"))?;

        let balance = self.balance_of(&from);
        if balance < amount {
            return Err(DonError::InsufficientBalance {
                required: amount.to_string(),
                available: balance.to_string(),
            });
        }

        registry.fund(id, amount)?;
        self.balances.insert(from, balance - amount);
        Ok(())
    }
}
