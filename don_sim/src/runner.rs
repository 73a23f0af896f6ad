//! Scenario runner - executes protocol scenarios against a simulated DON.
//!
//! Every run gets a fresh current-thread runtime with a paused clock, so
//! request timeouts and hung nodes resolve instantly and in a fixed order.

use crate::exporter::RequestReport;
use crate::scenarios::ScenarioId;
use crate::scripts::{
    mock_distance_meters, mock_price_cents, ANSWER, ANSWER_SOURCE, DISTANCE_SOURCE,
    PRICE_SOURCE, SECRET_ECHO_SOURCE,
};
use crate::world::{SimConfig, SimDon, SimulationOutcome, StrategyKind, CONSUMER_EVENT};

use alloy_primitives::{Address, U256};
use don_core::billing;
use don_core::decoder;
use don_core::sandbox::ExecutionErrorKind;
use don_core::{
    AggregatedResponse, DonError, ErrorKind, EventLog, RecordingConsumer, RequestConfig,
    ReturnType, ReturnValue, SandboxLimits, SecretsMap, SubscriptionState, REQUEST_FULFILLED,
};
use don_env::{DonContext, HttpController, HttpResponse, NodeSlot};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Every request that went through a full simulation
    pub requests: Vec<RequestReport>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    /// Requests fully simulated
    pub requests: u64,

    /// Node executions across those requests
    pub node_executions: u64,

    /// Node executions that failed or timed out
    pub node_failures: u64,

    /// Fulfillments delivered without quorum
    pub quorum_failures: u64,

    /// Outbound HTTP calls made by user code
    pub http_calls: u64,

    /// Juels charged across all fulfillments
    pub total_cost_juels: U256,

    /// Longest simulated time any deployment ran for (ms)
    pub sim_time_ms: u64,
}

/// Why a scenario failed.
#[derive(Debug, Error)]
pub enum ScenarioFailure {
    #[error(transparent)]
    Don(#[from] DonError),

    #[error("{0}")]
    Check(String),
}

type Outcome = Result<(), ScenarioFailure>;

fn check(condition: bool, message: impl Into<String>) -> Outcome {
    if condition {
        Ok(())
    } else {
        Err(ScenarioFailure::Check(message.into()))
    }
}

/// Checks that `result` failed with `expected`.
fn expect_err<T>(result: Result<T, DonError>, expected: ErrorKind, what: &str) -> Outcome {
    match result {
        Err(e) if e.kind() == expected => Ok(()),
        Err(e) => Err(ScenarioFailure::Check(format!(
            "{}: expected {:?}, got {}",
            what, expected, e
        ))),
        Ok(_) => Err(ScenarioFailure::Check(format!(
            "{}: expected {:?}, got success",
            what, expected
        ))),
    }
}

/// Accumulates metrics and request reports over one run.
#[derive(Default)]
struct Recorder {
    metrics: ScenarioMetrics,
    requests: Vec<RequestReport>,
}

impl Recorder {
    fn record(&mut self, outcome: &SimulationOutcome) {
        let m = &mut self.metrics;
        m.requests += 1;
        m.node_executions += outcome.results.len() as u64;
        m.node_failures += outcome.results.iter().filter(|r| !r.is_success()).count() as u64;
        if !outcome.response.quorum_reached {
            m.quorum_failures += 1;
        }
        m.total_cost_juels += outcome.receipt.billing.total_cost;
        self.requests.push(RequestReport::from_outcome(outcome));
    }

    /// Folds a finished deployment's counters in.
    fn finish(&mut self, sim: &SimDon) {
        self.metrics.http_calls += sim.controller().total_calls() as u64;
        let elapsed = sim.context().now().as_millis() as u64;
        self.metrics.sim_time_ms = self.metrics.sim_time_ms.max(elapsed);
    }
}

/// Runs protocol scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of DON nodes
    num_nodes: usize,

    /// Quorum threshold (default: simple majority)
    threshold: Option<usize>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_nodes: usize) -> Self {
        Self {
            seed,
            num_nodes,
            threshold: None,
        }
    }

    /// Sets the quorum threshold.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn threshold(&self) -> usize {
        self.threshold.unwrap_or(self.num_nodes / 2 + 1)
    }

    /// Deployment config shared by every scenario of this runner.
    pub fn sim_config(&self) -> SimConfig {
        SimConfig::default()
            .with_seed(self.seed)
            .with_nodes(self.num_nodes)
            .with_threshold(self.threshold())
    }

    /// Runs a scenario on a fresh paused-clock runtime.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(self.run_async(scenario)),
            Err(e) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                failure_reason: Some(format!("could not start runtime: {}", e)),
                metrics: ScenarioMetrics::default(),
                requests: Vec::new(),
            },
        }
    }

    /// Runs a scenario on the current runtime.
    ///
    /// The runtime should have a paused clock; on a live clock the timeout
    /// scenarios wait in real time.
    pub async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let mut recorder = Recorder::default();
        let outcome = match scenario {
            ScenarioId::HappyPath => self.run_happy_path(&mut recorder).await,
            ScenarioId::SlowNodes => self.run_slow_nodes(&mut recorder).await,
            ScenarioId::UnauthorizedConsumer => self.run_unauthorized_consumer(&mut recorder).await,
            ScenarioId::DuplicateFulfillment => self.run_duplicate_fulfillment(&mut recorder).await,
            ScenarioId::GasLimitExceeded => self.run_gas_limit_exceeded(&mut recorder).await,
            ScenarioId::DivergentNodes => self.run_divergent_nodes(&mut recorder).await,
            ScenarioId::SecretIsolation => self.run_secret_isolation(&mut recorder).await,
            ScenarioId::RequestTimeout => self.run_request_timeout(&mut recorder).await,
            ScenarioId::CallbackFailure => self.run_callback_failure(&mut recorder).await,
        };

        if let Err(e) = &outcome {
            warn!("{} failed: {}", scenario.name(), e);
        }
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: outcome.is_ok(),
            failure_reason: outcome.err().map(|e| e.to_string()),
            metrics: recorder.metrics,
            requests: recorder.requests,
        }
    }

    /// Runs a caller-supplied request once on this runner's deployment.
    pub async fn run_request(&self, params: &RequestConfig) -> Result<SimulationOutcome, DonError> {
        let mut sim = SimDon::new(self.sim_config())?;
        sim.simulate_request(params).await
    }

    fn distance_request(&self, sim: &SimDon) -> RequestConfig {
        sim.request_config(DISTANCE_SOURCE, ReturnType::Uint256)
            .with_args(["berlin", "hamburg"])
            .with_secret("mapsApiKey", "maps-demo-key")
    }

    /// DON-001: HappyPath - the full request/fulfillment round.
    ///
    /// **Assertion**: every node executes once, the consumer and the
    /// registry both see the distance, and exactly the billed cost leaves
    /// the subscription.
    async fn run_happy_path(&self, recorder: &mut Recorder) -> Outcome {
        info!("DON-001: HappyPath");
        let mut sim = SimDon::new(self.sim_config())?;
        let params = self.distance_request(&sim);

        let outcome = sim.simulate_request(&params).await?;
        recorder.record(&outcome);
        recorder.finish(&sim);

        let expected = ReturnValue::uint(mock_distance_meters("berlin", "hamburg"));
        check(outcome.response.quorum_reached, "no quorum on a healthy DON")?;
        check(
            outcome.response.contributing_nodes.len() == self.num_nodes,
            format!("{} contributors, want {}", outcome.response.contributing_nodes.len(), self.num_nodes),
        )?;
        check(
            sim.controller().total_calls() == self.num_nodes,
            format!("{} executions, want {}", sim.controller().total_calls(), self.num_nodes),
        )?;
        check(
            outcome.decoded.as_ref().ok() == Some(&expected),
            format!("decoded {:?}, want {}", outcome.decoded, expected),
        )?;
        check(outcome.receipt.callback_succeeded, "consumer callback failed")?;

        let registry = sim.registry();
        let registry = registry.lock().await;
        let consumer_value = decoder::decode(registry.logs(), CONSUMER_EVENT, ReturnType::Uint256)?;
        check(consumer_value == expected, "consumer event disagrees with registry")?;

        let sub = registry
            .subscription(sim.subscription_id())
            .ok_or_else(|| ScenarioFailure::Check("subscription vanished".into()))?;
        check(sub.state == SubscriptionState::Fulfilled, format!("state {:?}", sub.state))?;
        check(sub.blocked_balance.is_zero(), "reservation not released")?;
        check(
            sub.balance + outcome.receipt.billing.total_cost == sim.config().funding,
            "charged amount differs from billing record",
        )?;
        check(registry.billing_records().len() == 1, "expected one billing record")?;
        Ok(())
    }

    /// DON-002: SlowNodes - slot 0 answers 42, every other node hangs past
    /// the execution timeout.
    ///
    /// **Assertion**: threshold 2 delivers `QuorumNotReached`, threshold 1
    /// delivers 42.
    async fn run_slow_nodes(&self, recorder: &mut Recorder) -> Outcome {
        info!("DON-002: SlowNodes");

        for threshold in [2, 1] {
            // HTTP timeout above the execution timeout, so the sandbox
            // budget is what trips.
            let config = self
                .sim_config()
                .with_threshold(threshold)
                .with_limits(SandboxLimits::default().with_http_timeout(Duration::from_secs(60)));
            let mut sim = SimDon::new(config)?;
            for slot in NodeSlot::range(self.num_nodes).skip(1) {
                sim.controller().hang(slot);
            }

            let params = sim.request_config(ANSWER_SOURCE, ReturnType::Int256);
            let outcome = sim.simulate_request(&params).await?;
            recorder.record(&outcome);
            recorder.finish(&sim);

            let timeouts = outcome
                .results
                .iter()
                .filter(|r| r.error_kind() == Some(ExecutionErrorKind::Timeout))
                .count();
            check(
                timeouts == self.num_nodes - 1,
                format!("{} timeouts, want {}", timeouts, self.num_nodes - 1),
            )?;
            check(
                sim.context().now() >= SandboxLimits::default().timeout,
                "collection ended before the execution timeout",
            )?;

            if threshold == 2 {
                check(!outcome.response.quorum_reached, "quorum with one answer at threshold 2")?;
                expect_err(outcome.decoded, ErrorKind::QuorumNotReached, "threshold 2 decode")?;
                let error = outcome.response.error_message().unwrap_or_default();
                check(error.starts_with("QuorumNotReached (1/2)"), format!("error report {:?}", error))?;
            } else {
                check(outcome.response.quorum_reached, "no quorum at threshold 1")?;
                check(
                    outcome.decoded.as_ref().ok() == Some(&ReturnValue::int(ANSWER)),
                    format!("decoded {:?}, want {}", outcome.decoded, ANSWER),
                )?;
                check(
                    outcome.response.contributing_nodes.iter().eq([NodeSlot(0)].iter()),
                    "slot 0 should be the only contributor",
                )?;
            }
        }
        Ok(())
    }

    /// DON-003: UnauthorizedConsumer - create, fund, add consumer, then a
    /// request from an address that was never added.
    ///
    /// **Assertion**: `UnauthorizedSender`, and the subscription stays
    /// `ConsumerAuthorized` with nothing reserved.
    async fn run_unauthorized_consumer(&self, recorder: &mut Recorder) -> Outcome {
        info!("DON-003: UnauthorizedConsumer");
        let mut sim = SimDon::new(self.sim_config())?;
        let params = sim.request_config(ANSWER_SOURCE, ReturnType::Int256);
        let request = sim.build_request(&params).await?;

        let stranger = Address::repeat_byte(0xee);
        let registry = sim.registry();
        let mut registry = registry.lock().await;
        let logs_before = registry.logs().len();
        let sub_before = registry.subscription(sim.subscription_id()).cloned();

        expect_err(
            registry.request(sim.subscription_id(), stranger, &request),
            ErrorKind::UnauthorizedSender,
            "request from stranger",
        )?;

        let sub_after = registry.subscription(sim.subscription_id()).cloned();
        check(sub_before == sub_after, "rejected request changed the subscription")?;
        check(
            sub_after.map(|s| s.state) == Some(SubscriptionState::ConsumerAuthorized),
            "subscription left ConsumerAuthorized",
        )?;
        check(registry.logs().len() == logs_before, "rejected request emitted events")?;
        drop(registry);

        recorder.finish(&sim);
        Ok(())
    }

    /// DON-004: DuplicateFulfillment - replays a fulfillment, then races
    /// two fulfillments of a fresh request.
    ///
    /// **Assertion**: the replay fails with no state change; exactly one
    /// racer succeeds.
    async fn run_duplicate_fulfillment(&self, recorder: &mut Recorder) -> Outcome {
        info!("DON-004: DuplicateFulfillment");
        let mut sim = SimDon::new(self.sim_config())?;
        let params = sim.request_config(ANSWER_SOURCE, ReturnType::Int256);

        let outcome = sim.simulate_request(&params).await?;
        recorder.record(&outcome);

        let (balance_before, records_before, logs_before) = {
            let registry = sim.registry();
            let registry = registry.lock().await;
            (
                registry.subscription(sim.subscription_id()).map(|s| s.balance),
                registry.billing_records().len(),
                registry.logs().len(),
            )
        };
        expect_err(
            sim.fulfill(outcome.request_id, &outcome.response).await,
            ErrorKind::DuplicateFulfillment,
            "replayed fulfillment",
        )?;
        {
            let registry = sim.registry();
            let registry = registry.lock().await;
            check(
                registry.subscription(sim.subscription_id()).map(|s| s.balance) == balance_before,
                "replay changed the balance",
            )?;
            check(registry.billing_records().len() == records_before, "replay was billed")?;
            check(registry.logs().len() == logs_before, "replay emitted events")?;
        }

        let (request_id, request) = sim.submit(&params).await?;
        let dispatch = sim.don().dispatch(&request.verify()?).await?;
        let (a, b) = tokio::join!(
            sim.fulfill(request_id, &dispatch.response),
            sim.fulfill(request_id, &dispatch.response)
        );
        debug!("racing fulfillments: {:?} / {:?}", a.is_ok(), b.is_ok());
        check(a.is_ok() != b.is_ok(), "racing fulfillments must yield exactly one success")?;
        let loser = if a.is_ok() { b } else { a };
        expect_err(loser, ErrorKind::DuplicateFulfillment, "losing racer")?;

        recorder.finish(&sim);
        Ok(())
    }

    /// DON-005: GasLimitExceeded - a callback gas limit one above the
    /// registry maximum.
    ///
    /// **Assertion**: the builder and the calculator both refuse it, nothing
    /// is billed, and a request at exactly the maximum still goes through.
    async fn run_gas_limit_exceeded(&self, recorder: &mut Recorder) -> Outcome {
        info!("DON-005: GasLimitExceeded");
        let mut sim = SimDon::new(self.sim_config())?;
        let max = sim.config().billing.max_gas_limit;

        let over = sim
            .request_config(ANSWER_SOURCE, ReturnType::Int256)
            .with_gas_limit(max + 1);
        expect_err(sim.build_request(&over).await, ErrorKind::GasLimitExceeded, "build over max")?;
        expect_err(
            billing::estimate(max + 1, 0, &sim.config().billing),
            ErrorKind::GasLimitExceeded,
            "estimate over max",
        )?;
        {
            let registry = sim.registry();
            let registry = registry.lock().await;
            check(registry.billing_records().is_empty(), "over-limit request was billed")?;
        }

        let at_max = sim
            .request_config(ANSWER_SOURCE, ReturnType::Int256)
            .with_gas_limit(max);
        let outcome = sim.simulate_request(&at_max).await?;
        recorder.record(&outcome);
        recorder.finish(&sim);

        check(outcome.response.quorum_reached, "request at max gas limit missed quorum")?;
        check(outcome.receipt.billing.request_gas == max, "billing record has wrong gas limit")?;
        Ok(())
    }

    /// DON-006: DivergentNodes - one outlier, then per-node price feeds that
    /// all differ.
    ///
    /// **Assertion**: majority excludes the outlier; majority cannot settle
    /// skewed feeds, median can.
    async fn run_divergent_nodes(&self, recorder: &mut Recorder) -> Outcome {
        info!("DON-006: DivergentNodes");
        let outlier = NodeSlot::range(self.num_nodes)
            .last()
            .ok_or_else(|| ScenarioFailure::Check("no nodes to make an outlier of".into()))?;

        // One liar among honest nodes.
        let mut sim = SimDon::new(self.sim_config().with_threshold(self.num_nodes - 1))?;
        sim.controller()
            .override_response(outlier, HttpResponse::ok(json!({ "answer": -1 })));
        let params = sim.request_config(ANSWER_SOURCE, ReturnType::Int256);
        let outcome = sim.simulate_request(&params).await?;
        recorder.record(&outcome);
        recorder.finish(&sim);

        check(outcome.response.quorum_reached, "honest majority missed quorum")?;
        check(
            !outcome.response.contributing_nodes.contains(&outlier),
            "outlier counted as a contributor",
        )?;
        check(
            outcome.decoded.as_ref().ok() == Some(&ReturnValue::int(ANSWER)),
            format!("decoded {:?}", outcome.decoded),
        )?;

        // Every node sees a different price.
        let threshold = self.threshold().max(2);
        let mut prices: Vec<u64> = NodeSlot::range(self.num_nodes).map(mock_price_cents).collect();
        prices.sort_unstable();
        let lower_median = prices[(prices.len() - 1) / 2];

        for strategy in [StrategyKind::Majority, StrategyKind::Median] {
            let config = self
                .sim_config()
                .with_threshold(threshold)
                .with_strategy(strategy);
            let mut sim = SimDon::new(config)?;
            let params = sim.request_config(PRICE_SOURCE, ReturnType::Uint256);
            let outcome = sim.simulate_request(&params).await?;
            recorder.record(&outcome);
            recorder.finish(&sim);

            match strategy {
                StrategyKind::Majority => {
                    check(!outcome.response.quorum_reached, "majority settled divergent prices")?;
                    let error = outcome.response.error_message().unwrap_or_default();
                    check(error.contains("divergent results"), format!("error report {:?}", error))?;
                }
                StrategyKind::Median => {
                    check(outcome.response.quorum_reached, "median missed quorum")?;
                    check(
                        outcome.decoded.as_ref().ok() == Some(&ReturnValue::uint(lower_median)),
                        format!("decoded {:?}, want {}", outcome.decoded, lower_median),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// DON-007: SecretIsolation - per-node `apiKey` shares under a DON-wide
    /// default.
    ///
    /// **Assertion**: each node reads its own share, no plaintext share is
    /// in the payload, and with only the DON-wide secret all nodes agree.
    async fn run_secret_isolation(&self, recorder: &mut Recorder) -> Outcome {
        info!("DON-007: SecretIsolation");
        let mut sim = SimDon::new(self.sim_config())?;
        let shares: Vec<String> = NodeSlot::range(self.num_nodes)
            .map(|slot| format!("node-{}-key", slot.0))
            .collect();
        let per_node: Vec<SecretsMap> = shares
            .iter()
            .map(|share| [("apiKey", share.as_str())].into_iter().collect())
            .collect();

        let params = RequestConfig::new(SECRET_ECHO_SOURCE, ReturnType::String)
            .with_secret("apiKey", "don-wide-key")
            .with_per_node_secrets(per_node);

        let request = sim.build_request(&params).await?;
        for share in &shares {
            let leaked = request
                .payload
                .windows(share.len())
                .any(|w| w == share.as_bytes());
            check(!leaked, format!("{} appears in plaintext", share))?;
        }

        let outcome = sim.simulate_request(&params).await?;
        recorder.record(&outcome);
        for (result, share) in outcome.results.iter().zip(&shares) {
            check(
                result.value() == Some(share.as_bytes()),
                format!("{} saw {:?}", result.node_slot, result.value().map(String::from_utf8_lossy)),
            )?;
        }

        let shared = sim
            .request_config(SECRET_ECHO_SOURCE, ReturnType::String)
            .with_secret("apiKey", "don-wide-key");
        let outcome = sim.simulate_request(&shared).await?;
        recorder.record(&outcome);
        recorder.finish(&sim);

        check(
            outcome.decoded.as_ref().ok() == Some(&ReturnValue::String("don-wide-key".into())),
            format!("decoded {:?}", outcome.decoded),
        )?;
        Ok(())
    }

    /// DON-008: RequestTimeout - a request nobody fulfills.
    ///
    /// **Assertion**: it cannot be timed out early, it expires after
    /// `request_timeout_seconds`, releases its reservation and refuses a
    /// late fulfillment.
    async fn run_request_timeout(&self, recorder: &mut Recorder) -> Outcome {
        info!("DON-008: RequestTimeout");
        let mut sim = SimDon::new(self.sim_config())?;
        let params = sim.request_config(ANSWER_SOURCE, ReturnType::Int256);
        let (request_id, _) = sim.submit(&params).await?;
        let registry = sim.registry();

        {
            let mut registry = registry.lock().await;
            let sub = registry.subscription(sim.subscription_id());
            check(
                sub.map(|s| s.state) == Some(SubscriptionState::RequestPending),
                "submitted request not pending",
            )?;
            check(
                registry.timeout_requests(&[request_id])?.is_empty(),
                "request expired early",
            )?;
        }

        let timeout = Duration::from_secs(sim.config().billing.request_timeout_seconds);
        sim.context().sleep(timeout + Duration::from_secs(1)).await;

        {
            let mut registry = registry.lock().await;
            check(
                registry.timeout_requests(&[request_id])? == vec![request_id],
                "request did not expire",
            )?;
            let sub = registry
                .subscription(sim.subscription_id())
                .ok_or_else(|| ScenarioFailure::Check("subscription vanished".into()))?;
            check(sub.blocked_balance.is_zero(), "reservation not released")?;
            check(sub.balance == sim.config().funding, "expired request was charged")?;
            check(
                sub.state == SubscriptionState::ConsumerAuthorized,
                format!("state {:?}", sub.state),
            )?;
        }

        expect_err(
            sim.fulfill(request_id, &AggregatedResponse::default()).await,
            ErrorKind::RequestTimedOut,
            "late fulfillment",
        )?;
        recorder.finish(&sim);
        Ok(())
    }

    /// DON-009: CallbackFailure - a second consumer that always reverts.
    ///
    /// **Assertion**: `UserCallbackError` is logged, `RequestFulfilled`
    /// still carries the value, and the request is billed.
    async fn run_callback_failure(&self, recorder: &mut Recorder) -> Outcome {
        info!("DON-009: CallbackFailure");
        let mut sim = SimDon::new(self.sim_config())?;
        let reverting = Address::repeat_byte(0xcb);
        {
            let registry = sim.registry();
            let mut registry = registry.lock().await;
            registry.deploy_consumer(
                reverting,
                Box::new(RecordingConsumer::new("Reverted").failing("consumer reverted")),
            );
            registry.add_consumer(sim.subscription_id(), reverting)?;
        }

        let params = sim.request_config(ANSWER_SOURCE, ReturnType::Int256);
        let request = sim.build_request(&params).await?;
        let request_id = {
            let registry = sim.registry();
            let mut registry = registry.lock().await;
            registry.request(sim.subscription_id(), reverting, &request)?
        };
        let dispatch = sim.don().dispatch(&request.verify()?).await?;
        let receipt = sim.fulfill(request_id, &dispatch.response).await?;
        recorder.finish(&sim);

        check(!receipt.callback_succeeded, "reverting consumer reported success")?;
        check(receipt.billing.total_cost > U256::ZERO, "failed callback was not billed")?;

        let registry = sim.registry();
        let registry = registry.lock().await;
        let callback_error = registry.logs().iter().any(|log| {
            matches!(log, EventLog::UserCallbackError { request_id: id, .. } if *id == request_id)
        });
        check(callback_error, "no UserCallbackError logged")?;
        check(
            decoder::decode(registry.logs(), REQUEST_FULFILLED, ReturnType::Int256)?
                == ReturnValue::int(ANSWER),
            "RequestFulfilled lost the value",
        )?;
        expect_err(
            decoder::find_event(registry.logs(), "Reverted"),
            ErrorKind::EventNotFound,
            "reverted consumer event",
        )?;
        Ok(())
    }
}
