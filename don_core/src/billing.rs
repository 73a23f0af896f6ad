//! Gas/billing calculator.
//!
//! Costs are in juels (1 LINK = 10^18 juels) and computed in `U256` with
//! floor division, so the result is never negative and never depends on
//! float rounding:
//!
//! ```text
//! fulfillment_gas = observed + gas_after_payment_calculation + gas_overhead
//! total_cost      = fulfillment_gas * gas_price_wei * 10^18 / wei_per_unit_link
//!                 + don_fee + registry_fee
//! ```

use crate::error::{DonError, Result};
use crate::request::RequestId;
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Juels per LINK.
pub const JUELS_PER_LINK: u64 = 1_000_000_000_000_000_000;

/// Registry billing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Maximum callback gas limit a request may ask for
    pub max_gas_limit: u32,

    /// Price feed answers older than this fall back to `wei_per_unit_link`
    /// (0 disables the check)
    pub staleness_seconds: u64,

    /// Gas spent after the payment is computed
    pub gas_after_payment_calculation: u64,

    /// Fallback LINK price in wei
    pub wei_per_unit_link: U256,

    /// Flat fulfillment overhead
    pub gas_overhead: u64,

    /// Age after which a pending request may be timed out
    pub request_timeout_seconds: u64,

    pub gas_price_wei: U256,

    /// Flat fee paid to the DON, in juels
    pub don_fee: U256,

    /// Flat fee paid to the registry, in juels
    pub registry_fee: U256,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            max_gas_limit: 300_000,
            staleness_seconds: 86_400,
            gas_after_payment_calculation: 39_173,
            wei_per_unit_link: U256::from(5_000_000_000_000_000u64),
            gas_overhead: 519_719,
            request_timeout_seconds: 300,
            gas_price_wei: U256::from(1_000_000_000u64),
            don_fee: U256::ZERO,
            registry_fee: U256::ZERO,
        }
    }
}

impl BillingConfig {
    pub fn with_max_gas_limit(mut self, max: u32) -> Self {
        self.max_gas_limit = max;
        self
    }

    pub fn with_wei_per_unit_link(mut self, wei: U256) -> Self {
        self.wei_per_unit_link = wei;
        self
    }

    pub fn with_gas_price_wei(mut self, wei: U256) -> Self {
        self.gas_price_wei = wei;
        self
    }

    pub fn with_fees(mut self, don_fee: U256, registry_fee: U256) -> Self {
        self.don_fee = don_fee;
        self.registry_fee = registry_fee;
        self
    }

    pub fn with_request_timeout_seconds(mut self, seconds: u64) -> Self {
        self.request_timeout_seconds = seconds;
        self
    }
}

/// Cost of one request/fulfillment pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub request_id: Option<RequestId>,
    /// Callback gas limit the request asked for
    pub request_gas: u32,
    pub fulfillment_gas: u64,
    pub wei_per_unit_link: U256,
    /// Juels charged
    pub total_cost: U256,
}

/// A LINK/ETH price feed answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceFeed {
    pub wei_per_unit_link: U256,
    /// Context time the answer was written
    pub updated_at: Duration,
}

/// Returns the price to bill with at `now`.
///
/// Missing, zero or stale feed answers fall back to the configured price.
pub fn effective_wei_per_unit_link(
    feed: Option<&PriceFeed>,
    now: Duration,
    config: &BillingConfig,
) -> U256 {
    match feed {
        Some(feed) if !feed.wei_per_unit_link.is_zero() => {
            let age = now.saturating_sub(feed.updated_at).as_secs();
            if config.staleness_seconds > 0 && age > config.staleness_seconds {
                config.wei_per_unit_link
            } else {
                feed.wei_per_unit_link
            }
        }
        _ => config.wei_per_unit_link,
    }
}

fn overflow() -> DonError {
    DonError::InvalidConfig("billing arithmetic overflow".into())
}

/// Computes the cost of a fulfillment.
///
/// # Errors
/// * `GasLimitExceeded` - `request_gas_limit > config.max_gas_limit`
/// * `InvalidConfig` - zero LINK price, or arithmetic overflow
pub fn estimate(
    request_gas_limit: u32,
    observed_gas_used: u64,
    config: &BillingConfig,
) -> Result<BillingRecord> {
    if request_gas_limit > config.max_gas_limit {
        return Err(DonError::GasLimitExceeded {
            requested: request_gas_limit,
            max: config.max_gas_limit,
        });
    }
    if config.wei_per_unit_link.is_zero() {
        return Err(DonError::InvalidConfig("wei_per_unit_link must be non-zero".into()));
    }

    let fulfillment_gas = observed_gas_used
        .checked_add(config.gas_after_payment_calculation)
        .and_then(|g| g.checked_add(config.gas_overhead))
        .ok_or_else(overflow)?;

    let total_cost = U256::from(fulfillment_gas)
        .checked_mul(config.gas_price_wei)
        .and_then(|wei| wei.checked_mul(U256::from(JUELS_PER_LINK)))
        .map(|scaled| scaled / config.wei_per_unit_link)
        .and_then(|juels| juels.checked_add(config.don_fee))
        .and_then(|juels| juels.checked_add(config.registry_fee))
        .ok_or_else(overflow)?;

    Ok(BillingRecord {
        request_id: None,
        request_gas: request_gas_limit,
        fulfillment_gas,
        wei_per_unit_link: config.wei_per_unit_link,
        total_cost,
    })
}

/// The most a request can cost: the whole callback gas limit used.
pub fn estimate_max_cost(request_gas_limit: u32, config: &BillingConfig) -> Result<U256> {
    estimate(request_gas_limit, request_gas_limit as u64, config).map(|r| r.total_cost)
}
