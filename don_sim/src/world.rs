//! SimDon - the simulated deployment.
//!
//! Wires one DON, one mock registry, one LINK token and one consumer into a
//! funded, authorized subscription, so that a test only has to describe
//! the request.

use crate::context::SimContext;
use crate::http::{MockHttpServer, SimHttp, SimHttpController};
use crate::keys::DeterministicKeyProvider;
use crate::scripts;

use alloy_primitives::{Address, U256};
use don_core::billing::JUELS_PER_LINK;
use don_core::decoder;
use don_core::registry::encode_subscription_id;
use don_core::sandbox::SandboxExecutor;
use don_core::{
    address_of, AggregatedResponse, AggregationStrategy, BillingConfig, CollectionEnd, DonConfig,
    DonError, DonNode, Don, ExecutionResult, FulfillmentReceipt, MajorityStrategy, MedianStrategy,
    MockLinkToken, MockRegistry, RecordingConsumer, Request, RequestBuilder, RequestConfig,
    RequestId, ReturnValue, SandboxLimits, REQUEST_FULFILLED,
};
use don_env::{DonContext, NodeSlot};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Number of requester wallets the harness signs with.
pub const WALLET_COUNT: u32 = 3;

/// Event the harness consumer re-emits fulfillments under.
pub const CONSUMER_EVENT: &str = "OCRResponse";

/// Aggregation rule for a simulated DON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Majority,
    Median,
}

impl StrategyKind {
    fn build(&self) -> Arc<dyn AggregationStrategy> {
        match self {
            StrategyKind::Majority => Arc::new(MajorityStrategy),
            StrategyKind::Median => Arc::new(MedianStrategy),
        }
    }
}

/// Configuration for a simulated deployment.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of DON nodes
    pub num_nodes: usize,

    /// Minimum agreeing results for a quorum
    pub threshold: usize,

    /// Stop collecting once the slot-order prefix holds a quorum
    pub early_exit: bool,

    pub strategy: StrategyKind,

    /// Per-execution sandbox limits
    pub limits: SandboxLimits,

    /// Registry billing parameters
    pub billing: BillingConfig,

    /// Juels the subscription owner funds the subscription with
    pub funding: U256,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_nodes: 4,
            threshold: 3,
            early_exit: false,
            strategy: StrategyKind::Majority,
            limits: SandboxLimits::default(),
            billing: BillingConfig::default(),
            funding: U256::from(10u64) * U256::from(JUELS_PER_LINK),
        }
    }
}

impl SimConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_nodes(mut self, num_nodes: usize) -> Self {
        self.num_nodes = num_nodes;
        self
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_early_exit(mut self, early_exit: bool) -> Self {
        self.early_exit = early_exit;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_billing(mut self, billing: BillingConfig) -> Self {
        self.billing = billing;
        self
    }

    pub fn with_funding(mut self, funding: U256) -> Self {
        self.funding = funding;
        self
    }
}

/// Everything one simulated request produced.
#[derive(Debug)]
pub struct SimulationOutcome {
    pub request_id: RequestId,
    pub response: AggregatedResponse,
    /// Per-node results, in slot order
    pub results: Vec<ExecutionResult>,
    pub end: CollectionEnd,
    pub receipt: FulfillmentReceipt,
    /// The fulfillment decoded from the registry's event log
    pub decoded: Result<ReturnValue, DonError>,
}

/// A funded deployment: DON + registry + token + one authorized consumer.
pub struct SimDon {
    config: SimConfig,
    ctx: Arc<SimContext>,
    don: Don<SimContext>,
    registry: Arc<Mutex<MockRegistry<SimContext>>>,
    link: MockLinkToken,
    builder: RequestBuilder,
    server: MockHttpServer,
    controller: SimHttpController,
    rng: ChaCha8Rng,
    owner: Address,
    consumer: Address,
    transmitter: Address,
    subscription_id: u64,
}

impl SimDon {
    /// Deploys and funds everything.
    ///
    /// After this the subscription is `ConsumerAuthorized` for
    /// [`SimDon::consumer`], and node 0's transmitter may fulfill.
    pub fn new(config: SimConfig) -> Result<Self, DonError> {
        if config.num_nodes > NodeSlot::MAX_COUNT {
            return Err(DonError::InvalidConfig(format!(
                "at most {} nodes, got {}",
                NodeSlot::MAX_COUNT,
                config.num_nodes
            )));
        }
        let ctx = SimContext::shared(config.seed);
        let mut keys = DeterministicKeyProvider::new(config.seed);

        let server = MockHttpServer::new();
        scripts::install_services(&server);
        let controller = SimHttpController::new();

        let nodes: Vec<DonNode> = NodeSlot::range(config.num_nodes)
            .map(|slot| {
                let http = SimHttp::new(slot, ctx.clone(), server.clone(), controller.clone());
                DonNode::new(slot, keys.node_secret(slot), Arc::new(http))
            })
            .collect();

        let executor = SandboxExecutor::new(config.limits.clone());
        let don_config = DonConfig::default()
            .with_threshold(config.threshold)
            .with_request_timeout(Duration::from_secs(config.billing.request_timeout_seconds))
            .with_early_exit(config.early_exit);
        let don = Don::new(ctx.clone(), nodes, keys.don_secret(), executor, don_config)?
            .with_strategy(config.strategy.build());

        let wallets = keys.wallets(WALLET_COUNT);
        let owner = address_of(&keys.wallet_key(0).verifying_key());
        let builder = RequestBuilder::new(wallets, don.node_public_keys())
            .with_max_gas_limit(config.billing.max_gas_limit);

        let mut registry = MockRegistry::new(ctx.clone(), config.billing.clone());
        registry.set_don_public_key(&hex::encode(don.don_public_key().as_bytes()))?;
        registry.set_node_public_keys(don.node_public_keys());

        let transmitter = keys.transmitter_address(NodeSlot(0));
        registry.set_authorized_senders(vec![transmitter]);

        let consumer = keys.consumer_address(0);
        registry.deploy_consumer(consumer, Box::new(RecordingConsumer::new(CONSUMER_EVENT)));

        let subscription_id = registry.create_subscription(owner);
        let mut link = MockLinkToken::new();
        link.mint(owner, config.funding);
        link.transfer_and_call(
            owner,
            &mut registry,
            config.funding,
            &encode_subscription_id(subscription_id),
        )?;
        registry.add_consumer(subscription_id, consumer)?;

        let rng = ctx.fork_rng();
        info!(
            "SimDon ready: {} nodes, threshold {}, {} aggregation, subscription {} (seed={})",
            config.num_nodes,
            config.threshold,
            don.strategy_name(),
            subscription_id,
            ctx.seed()
        );

        Ok(Self {
            config,
            ctx,
            don,
            registry: Arc::new(Mutex::new(registry)),
            link,
            builder,
            server,
            controller,
            rng,
            owner,
            consumer,
            transmitter,
            subscription_id,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    pub fn don(&self) -> &Don<SimContext> {
        &self.don
    }

    /// The shared registry.
    pub fn registry(&self) -> Arc<Mutex<MockRegistry<SimContext>>> {
        self.registry.clone()
    }

    pub fn link(&self) -> &MockLinkToken {
        &self.link
    }

    pub fn server(&self) -> &MockHttpServer {
        &self.server
    }

    /// Fault injection for the nodes' HTTP calls.
    pub fn controller(&self) -> &SimHttpController {
        &self.controller
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    /// The authorized consumer contract.
    pub fn consumer(&self) -> Address {
        self.consumer
    }

    pub fn transmitter(&self) -> Address {
        self.transmitter
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    /// A request for `source` with one empty per-node secrets map per node.
    pub fn request_config(&self, source: &str, expected: don_core::ReturnType) -> RequestConfig {
        RequestConfig::new(source, expected).with_empty_node_secrets(self.config.num_nodes)
    }

    /// Builds a request with the DON key the registry publishes.
    pub async fn build_request(&mut self, params: &RequestConfig) -> Result<Request, DonError> {
        let don_key = self.registry.lock().await.get_don_public_key()?;
        let don_key = don_key.strip_prefix("0x").unwrap_or(&don_key);
        self.builder.build(&mut self.rng, don_key, params, 0)
    }

    /// Builds and submits a request from the authorized consumer.
    pub async fn submit(&mut self, params: &RequestConfig) -> Result<(RequestId, Request), DonError> {
        let request = self.build_request(params).await?;
        let request_id = self
            .registry
            .lock()
            .await
            .request(self.subscription_id, self.consumer, &request)?;
        Ok((request_id, request))
    }

    /// Delivers `response` for `request_id` as node 0's transmitter.
    pub async fn fulfill(
        &self,
        request_id: RequestId,
        response: &AggregatedResponse,
    ) -> Result<FulfillmentReceipt, DonError> {
        self.registry
            .lock()
            .await
            .fulfill(self.transmitter, request_id, response)
    }

    /// Runs one request end to end: build, submit, execute on every node,
    /// aggregate, fulfill, decode.
    ///
    /// Node failures and a missed quorum are part of the outcome; only
    /// structural and registry errors are `Err`.
    pub async fn simulate_request(
        &mut self,
        params: &RequestConfig,
    ) -> Result<SimulationOutcome, DonError> {
        let (request_id, request) = self.submit(params).await?;
        let parsed = request.verify()?;
        debug!("Dispatching {} to {} nodes", request_id, self.don.node_count());

        let dispatch = self.don.dispatch(&parsed).await?;
        let receipt = self.fulfill(request_id, &dispatch.response).await?;

        let decoded = {
            let registry = self.registry.lock().await;
            decoder::decode(registry.logs(), REQUEST_FULFILLED, params.expected_return_type)
        };
        match &decoded {
            Ok(value) => info!("Request {} resolved to {}", request_id, value),
            Err(e) => info!("Request {} resolved to an error: {}", request_id, e),
        }

        Ok(SimulationOutcome {
            request_id,
            response: dispatch.response,
            results: dispatch.results,
            end: dispatch.end,
            receipt,
            decoded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripts::{mock_distance_meters, ANSWER, ANSWER_SOURCE, DISTANCE_SOURCE};
    use don_core::{ErrorKind, ReturnType, SubscriptionState};
    use don_env::HttpController;

    fn distance_request(sim: &SimDon) -> RequestConfig {
        sim.request_config(DISTANCE_SOURCE, ReturnType::Uint256)
            .with_args(["paris", "lyon"])
            .with_secret("mapsApiKey", "maps-key")
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_leaves_consumer_authorized() {
        let sim = SimDon::new(SimConfig::default()).unwrap();
        let registry = sim.registry();
        let registry = registry.lock().await;
        let sub = registry.subscription(sim.subscription_id()).unwrap();

        assert_eq!(sub.state, SubscriptionState::ConsumerAuthorized);
        assert_eq!(sub.balance, sim.config().funding);
        assert!(sub.consumers.contains(&sim.consumer()));
        assert_eq!(sim.link().balance_of(&sim.owner()), U256::ZERO);
        assert_eq!(registry.get_all_node_public_keys().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulate_distance_request() {
        let mut sim = SimDon::new(SimConfig::default()).unwrap();
        let params = distance_request(&sim);

        let outcome = sim.simulate_request(&params).await.unwrap();

        assert!(outcome.response.quorum_reached);
        assert_eq!(outcome.results.len(), 4);
        assert_eq!(outcome.response.contributing_nodes.len(), 4);
        assert_eq!(
            outcome.decoded.unwrap(),
            ReturnValue::uint(mock_distance_meters("paris", "lyon"))
        );
        assert!(outcome.receipt.callback_succeeded);

        let registry = sim.registry();
        let registry = registry.lock().await;
        let sub = registry.subscription(sim.subscription_id()).unwrap();
        assert_eq!(sub.state, SubscriptionState::Fulfilled);
        assert_eq!(sub.balance, sim.config().funding - outcome.receipt.billing.total_cost);
        assert_eq!(registry.billing_records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_seed_same_request_id() {
        let mut a = SimDon::new(SimConfig::default().with_seed(7)).unwrap();
        let mut b = SimDon::new(SimConfig::default().with_seed(7)).unwrap();
        let params = a.request_config(ANSWER_SOURCE, ReturnType::Int256);

        let ra = a.simulate_request(&params).await.unwrap();
        let rb = b.simulate_request(&params).await.unwrap();
        assert_eq!(ra.request_id, rb.request_id);
        assert_eq!(ra.response, rb.response);
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_minority_still_reaches_quorum() {
        let mut sim = SimDon::new(SimConfig::default()).unwrap();
        sim.controller().isolate(NodeSlot(3));
        let params = sim.request_config(ANSWER_SOURCE, ReturnType::Int256);

        let outcome = sim.simulate_request(&params).await.unwrap();
        assert!(outcome.response.quorum_reached);
        assert!(!outcome.results[3].is_success());
        assert_eq!(outcome.decoded.unwrap(), ReturnValue::int(ANSWER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_structural_error_never_reaches_registry() {
        let mut sim = SimDon::new(SimConfig::default()).unwrap();
        let params = RequestConfig::new(ANSWER_SOURCE, ReturnType::Int256);

        let err = sim.simulate_request(&params).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeCountMismatch);

        let registry = sim.registry();
        let registry = registry.lock().await;
        assert_eq!(
            registry.subscription(sim.subscription_id()).unwrap().state,
            SubscriptionState::ConsumerAuthorized
        );
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let result = SimDon::new(SimConfig::default().with_threshold(5));
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::InvalidConfig));
    }

    #[test]
    fn test_node_count_beyond_slot_space_rejected() {
        let result = SimDon::new(SimConfig::default().with_nodes(NodeSlot::MAX_COUNT + 1));
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::InvalidConfig));
    }
}
