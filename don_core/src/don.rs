//! DON nodes and the request dispatcher.
//!
//! A [`Don`] fans a verified request out to one task per node slot,
//! collects the [`ExecutionResult`]s and aggregates them:
//!
//! ```text
//!                 +--> node slot-0 --(secrets, http, sandbox)--+
//! ParsedRequest --+--> node slot-1 --------------------------- +--> ResultCollector --> aggregate
//!                 +--> node slot-N --------------------------- +
//! ```

use crate::aggregator::{
    aggregate, AggregatedResponse, AggregationStrategy, CollectionEnd, MajorityStrategy,
    ResultCollector,
};
use crate::error::{DonError, Result};
use crate::request::ParsedRequest;
use crate::sandbox::{ExecutionErrorKind, ExecutionResult, Invocation, SandboxExecutor};
use crate::secrets::NodeSecrets;
use don_env::{DonContext, HttpTransport, NodeSlot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

/// One DON node: a slot, its decryption key and its own HTTP transport.
pub struct DonNode {
    slot: NodeSlot,
    secret: StaticSecret,
    http: Arc<dyn HttpTransport>,
}

impl DonNode {
    pub fn new(slot: NodeSlot, secret: StaticSecret, http: Arc<dyn HttpTransport>) -> Self {
        Self { slot, secret, http }
    }

    pub fn slot(&self) -> NodeSlot {
        self.slot
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    /// Opens this node's secrets and runs the request in the sandbox.
    ///
    /// A secrets share that fails to open is an execution failure, not a
    /// dispatcher error.
    pub async fn execute(
        &self,
        executor: &SandboxExecutor,
        request: &ParsedRequest,
        don_secret: &StaticSecret,
    ) -> ExecutionResult {
        let secrets = match NodeSecrets::open(self.slot, &request.secrets, don_secret, &self.secret)
        {
            Ok(secrets) => secrets,
            Err(e) => {
                warn!("{} could not open secrets: {}", self.slot, e);
                return ExecutionResult::failure(self.slot, ExecutionErrorKind::Failed, e.to_string());
            }
        };

        let invocation = Invocation {
            slot: self.slot,
            source: request.source.clone(),
            language: request.code_language,
            args: request.args.clone(),
            gas_limit: request.gas_limit,
            expected: request.return_type,
        };
        executor.execute(invocation, secrets, self.http.clone()).await
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DonConfig {
    /// Minimum agreeing results for a quorum
    pub threshold: usize,

    /// Global wait for node results
    pub request_timeout: Duration,

    /// Stop waiting once the slot-order prefix holds a quorum
    pub early_exit: bool,
}

impl Default for DonConfig {
    fn default() -> Self {
        Self {
            threshold: 1,
            request_timeout: Duration::from_secs(300),
            early_exit: false,
        }
    }
}

impl DonConfig {
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_early_exit(mut self, early_exit: bool) -> Self {
        self.early_exit = early_exit;
        self
    }
}

/// Everything one dispatch produced.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub response: AggregatedResponse,
    /// Per-node results, in slot order
    pub results: Vec<ExecutionResult>,
    pub end: CollectionEnd,
}

/// The set of DON nodes plus the dispatch policy.
pub struct Don<Ctx: DonContext> {
    ctx: Arc<Ctx>,
    nodes: Vec<Arc<DonNode>>,
    don_secret: Arc<StaticSecret>,
    executor: SandboxExecutor,
    strategy: Arc<dyn AggregationStrategy>,
    config: DonConfig,
}

impl<Ctx: DonContext> Don<Ctx> {
    /// Creates a DON over `nodes`, which must be in slot order.
    ///
    /// # Errors
    /// `InvalidConfig` when there are no nodes or more than
    /// [`NodeSlot::MAX_COUNT`], the nodes are not in slot order, or the
    /// threshold is outside `1..=nodes.len()`.
    pub fn new(
        ctx: Arc<Ctx>,
        nodes: Vec<DonNode>,
        don_secret: StaticSecret,
        executor: SandboxExecutor,
        config: DonConfig,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(DonError::InvalidConfig("a DON needs at least one node".into()));
        }
        if nodes.len() > NodeSlot::MAX_COUNT {
            return Err(DonError::InvalidConfig(format!(
                "a DON has at most {} nodes, got {}",
                NodeSlot::MAX_COUNT,
                nodes.len()
            )));
        }
        if nodes.iter().enumerate().any(|(i, n)| n.slot.index() != i) {
            return Err(DonError::InvalidConfig("nodes must be given in slot order".into()));
        }
        if config.threshold == 0 || config.threshold > nodes.len() {
            return Err(DonError::InvalidConfig(format!(
                "threshold {} outside 1..={}",
                config.threshold,
                nodes.len()
            )));
        }

        Ok(Self {
            ctx,
            nodes: nodes.into_iter().map(Arc::new).collect(),
            don_secret: Arc::new(don_secret),
            executor,
            strategy: Arc::new(MajorityStrategy),
            config,
        })
    }

    /// Replaces the aggregation strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn config(&self) -> &DonConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// The DON-wide secrets key.
    pub fn don_public_key(&self) -> PublicKey {
        PublicKey::from(self.don_secret.as_ref())
    }

    /// Node keys, in slot order.
    pub fn node_public_keys(&self) -> Vec<PublicKey> {
        self.nodes.iter().map(|n| n.public_key()).collect()
    }

    /// Runs `request` on every node and aggregates the results.
    ///
    /// # Errors
    /// `NodeCountMismatch` when the request was built for a different
    /// number of nodes. Node failures are never errors here.
    pub async fn dispatch(&self, request: &ParsedRequest) -> Result<DispatchOutcome> {
        if request.node_count != self.nodes.len() {
            return Err(DonError::NodeCountMismatch {
                expected: self.nodes.len(),
                actual: request.node_count,
            });
        }

        let (tx, rx) = mpsc::channel(self.nodes.len());
        let shared = Arc::new(request.clone());

        for node in &self.nodes {
            let node = node.clone();
            let tx = tx.clone();
            let request = shared.clone();
            let executor = self.executor.clone();
            let don_secret = self.don_secret.clone();

            self.ctx.spawn(&format!("node-{}", node.slot().0), async move {
                let result = node.execute(&executor, &request, &don_secret).await;
                if tx.send(result).await.is_err() {
                    debug!("{} finished after collection closed", node.slot());
                }
            });
        }
        drop(tx);

        let collector = ResultCollector::new(
            self.nodes.len(),
            self.config.threshold,
            self.config.request_timeout,
        )
        .with_early_exit(self.config.early_exit);
        let collected = collector
            .collect(rx, self.strategy.as_ref(), request.return_type)
            .await;

        let response = aggregate(
            &collected.results,
            self.config.threshold,
            self.strategy.as_ref(),
            request.return_type,
        )?;

        info!(
            "Dispatch done ({:?}): quorum={} contributors={}/{}",
            collected.end,
            response.quorum_reached,
            response.contributing_nodes.len(),
            self.nodes.len()
        );

        Ok(DispatchOutcome {
            response,
            results: collected.results,
            end: collected.end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CodeLanguage, RequestConfig};
    use crate::error::ErrorKind;
    use crate::request::RequestBuilder;
    use crate::sandbox::{SandboxLimits, ScriptEngine, ScriptError, ScriptScope};
    use crate::value::{ReturnType, ReturnValue};
    use async_trait::async_trait;
    use don_env::{EnvError, HttpRequest, HttpResponse, TokioContext};
    use ed25519_dalek::SigningKey;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoHttp(NodeSlot);

    #[async_trait]
    impl HttpTransport for NoHttp {
        async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, EnvError> {
            Err(EnvError::unreachable(request.host()))
        }

        fn local_slot(&self) -> NodeSlot {
            self.0
        }
    }

    /// Slot 0 answers 42, every other slot sleeps past the budget.
    struct OnlyFirstAnswers(Arc<AtomicUsize>);

    #[async_trait]
    impl ScriptEngine for OnlyFirstAnswers {
        async fn run(
            &self,
            _language: CodeLanguage,
            _source: &str,
            scope: &mut ScriptScope,
            _limits: &SandboxLimits,
        ) -> std::result::Result<Vec<u8>, ScriptError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if scope.slot() != NodeSlot(0) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(ReturnValue::int(42).encode())
        }
    }

    struct Harness {
        don: Don<TokioContext>,
        builder: RequestBuilder,
        rng: ChaCha8Rng,
        runs: Arc<AtomicUsize>,
    }

    fn harness(nodes: u16, threshold: usize) -> Harness {
        let runs = Arc::new(AtomicUsize::new(0));
        let executor = SandboxExecutor::new(SandboxLimits::default())
            .with_engine(Arc::new(OnlyFirstAnswers(runs.clone())));

        let don_nodes = NodeSlot::range(nodes as usize)
            .map(|slot| {
                DonNode::new(
                    slot,
                    StaticSecret::from([slot.0 as u8 + 1; 32]),
                    Arc::new(NoHttp(slot)),
                )
            })
            .collect();
        let don = Don::new(
            TokioContext::shared(),
            don_nodes,
            StaticSecret::from([0xDD; 32]),
            executor,
            DonConfig::default().with_threshold(threshold),
        )
        .unwrap();

        let builder = RequestBuilder::new(vec![SigningKey::from_bytes(&[1; 32])], don.node_public_keys());
        Harness {
            don,
            builder,
            rng: ChaCha8Rng::seed_from_u64(7),
            runs,
        }
    }

    fn request(h: &mut Harness, nodes: usize) -> ParsedRequest {
        let config = RequestConfig::new("src", ReturnType::Int256)
            .with_args(["req-1", "destA", "destB"])
            .with_empty_node_secrets(nodes);
        let don_hex = hex::encode(h.don.don_public_key().as_bytes());
        h.builder
            .build(&mut h.rng, &don_hex, &config, 0)
            .unwrap()
            .verify()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_threshold_two_fails() {
        let mut h = harness(4, 2);
        let parsed = request(&mut h, 4);
        let outcome = h.don.dispatch(&parsed).await.unwrap();

        assert_eq!(h.runs.load(Ordering::SeqCst), 4);
        assert!(!outcome.response.quorum_reached);
        assert_eq!(outcome.end, CollectionEnd::AllReported);
        assert_eq!(outcome.results.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_threshold_one_succeeds() {
        let mut h = harness(4, 1);
        let parsed = request(&mut h, 4);
        let outcome = h.don.dispatch(&parsed).await.unwrap();

        assert!(outcome.response.quorum_reached);
        assert_eq!(
            ReturnValue::decode(&outcome.response.result, ReturnType::Int256).unwrap(),
            ReturnValue::int(42)
        );
    }

    #[tokio::test]
    async fn test_threshold_validated() {
        let executor = SandboxExecutor::new(SandboxLimits::default());
        let nodes = vec![DonNode::new(NodeSlot(0), StaticSecret::from([1; 32]), Arc::new(NoHttp(NodeSlot(0))))];
        let err = Don::new(
            TokioContext::shared(),
            nodes,
            StaticSecret::from([2; 32]),
            executor,
            DonConfig::default().with_threshold(2),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_node_count_mismatch_is_fatal() {
        let mut small = harness(2, 1);
        let parsed = request(&mut small, 2);

        let big = harness(3, 1);
        let err = big.don.dispatch(&parsed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeCountMismatch);
        assert_eq!(big.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_node_count_capped_at_slot_space() {
        let http: Arc<dyn HttpTransport> = Arc::new(NoHttp(NodeSlot(0)));
        let nodes: Vec<_> = NodeSlot::range(NodeSlot::MAX_COUNT)
            .chain(std::iter::once(NodeSlot(0)))
            .map(|slot| DonNode::new(slot, StaticSecret::from([1; 32]), http.clone()))
            .collect();
        assert_eq!(nodes.len(), NodeSlot::MAX_COUNT + 1);

        let err = Don::new(
            TokioContext::shared(),
            nodes,
            StaticSecret::from([2; 32]),
            SandboxExecutor::new(SandboxLimits::default()),
            DonConfig::default(),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(err.to_string().contains("at most 65536 nodes"));
    }
}
