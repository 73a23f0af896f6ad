//! Response aggregator.
//!
//! Turns the per-node [`ExecutionResult`]s of one request into a single
//! [`AggregatedResponse`]. The value is chosen by a pluggable
//! [`AggregationStrategy`]; a response is only ever attributed to at least
//! `threshold` agreeing nodes.
//!
//! [`ResultCollector`] is the synchronization point between the node
//! executions and aggregation: it stops waiting on quorum, on all slots
//! reporting, or on the request timeout, whichever comes first.

use crate::error::{DonError, Result};
use crate::sandbox::{ExecutionErrorKind, ExecutionResult};
use crate::value::{ReturnType, ReturnValue};
use don_env::NodeSlot;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ============================================================================
// STRATEGIES
// ============================================================================

/// A value picked by a strategy, and the slots that back it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub value: Vec<u8>,
    pub contributors: BTreeSet<NodeSlot>,
}

/// Rule for choosing one value out of the successful results.
pub trait AggregationStrategy: Send + Sync {
    /// Short name for logs and reports.
    fn name(&self) -> &'static str;

    /// Picks a value from `successes`, given in slot order.
    ///
    /// Returns `None` when there is nothing to pick from.
    fn select(&self, successes: &[(NodeSlot, &[u8])], return_type: ReturnType) -> Option<Selection>;
}

/// Mode under byte equality. Ties go to the value seen first in slot order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MajorityStrategy;

impl AggregationStrategy for MajorityStrategy {
    fn name(&self) -> &'static str {
        "majority"
    }

    fn select(&self, successes: &[(NodeSlot, &[u8])], _return_type: ReturnType) -> Option<Selection> {
        // Groups kept in first-seen order.
        let mut groups: Vec<(&[u8], BTreeSet<NodeSlot>)> = Vec::new();
        for (slot, value) in successes {
            match groups.iter_mut().find(|(v, _)| v == value) {
                Some((_, slots)) => {
                    slots.insert(*slot);
                }
                None => groups.push((value, BTreeSet::from([*slot]))),
            }
        }

        let mut best: Option<(&[u8], BTreeSet<NodeSlot>)> = None;
        for (value, slots) in groups {
            if best.as_ref().map_or(true, |(_, b)| slots.len() > b.len()) {
                best = Some((value, slots));
            }
        }

        best.map(|(value, contributors)| Selection {
            value: value.to_vec(),
            contributors,
        })
    }
}

/// Median for numeric types, majority otherwise.
///
/// Even counts take the lower median. Every result that decodes as the
/// expected numeric type counts as a contributor.
#[derive(Debug, Clone, Copy, Default)]
pub struct MedianStrategy;

fn numeric_cmp(a: &ReturnValue, b: &ReturnValue) -> Ordering {
    match (a, b) {
        (ReturnValue::Uint256(x), ReturnValue::Uint256(y)) => x.cmp(y),
        (ReturnValue::Int256(x), ReturnValue::Int256(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

impl AggregationStrategy for MedianStrategy {
    fn name(&self) -> &'static str {
        "median"
    }

    fn select(&self, successes: &[(NodeSlot, &[u8])], return_type: ReturnType) -> Option<Selection> {
        if !return_type.is_numeric() {
            return MajorityStrategy.select(successes, return_type);
        }

        let mut decoded: Vec<(ReturnValue, NodeSlot, &[u8])> = successes
            .iter()
            .filter_map(|(slot, bytes)| {
                ReturnValue::decode(bytes, return_type)
                    .ok()
                    .map(|v| (v, *slot, *bytes))
            })
            .collect();
        if decoded.is_empty() {
            return None;
        }

        // Stable sort keeps slot order among equal values.
        decoded.sort_by(|a, b| numeric_cmp(&a.0, &b.0));
        let median = &decoded[(decoded.len() - 1) / 2];

        Some(Selection {
            value: median.2.to_vec(),
            contributors: decoded.iter().map(|(_, slot, _)| *slot).collect(),
        })
    }
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// The outcome of aggregating one request's results.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AggregatedResponse {
    /// Encoded value (empty without quorum)
    pub result: Vec<u8>,

    /// UTF-8 error report (empty with quorum)
    pub error: Vec<u8>,

    pub quorum_reached: bool,

    pub contributing_nodes: BTreeSet<NodeSlot>,

    /// Highest execution gas among the contributing nodes (all nodes
    /// without quorum)
    pub gas_used: u64,
}

impl AggregatedResponse {
    /// Returns the error report as text.
    pub fn error_message(&self) -> Option<String> {
        (!self.error.is_empty()).then(|| String::from_utf8_lossy(&self.error).into_owned())
    }
}

/// Aggregates `results` under `strategy`.
///
/// Quorum needs at least `threshold` successes *and* at least `threshold`
/// contributors behind the selected value.
pub fn aggregate(
    results: &[ExecutionResult],
    threshold: usize,
    strategy: &dyn AggregationStrategy,
    return_type: ReturnType,
) -> Result<AggregatedResponse> {
    if threshold == 0 {
        return Err(DonError::InvalidConfig("threshold must be at least 1".into()));
    }

    let mut ordered: Vec<&ExecutionResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.node_slot);

    let successes: Vec<(NodeSlot, &[u8])> = ordered
        .iter()
        .filter_map(|r| r.value().map(|v| (r.node_slot, v)))
        .collect();

    let selection = if successes.len() >= threshold {
        strategy.select(&successes, return_type)
    } else {
        None
    };

    if let Some(selection) = selection.filter(|s| s.contributors.len() >= threshold) {
        let gas_used = ordered
            .iter()
            .filter(|r| selection.contributors.contains(&r.node_slot))
            .map(|r| r.gas_used)
            .max()
            .unwrap_or_default();

        debug!(
            "Quorum reached by {}: {}/{} agreeing",
            strategy.name(),
            selection.contributors.len(),
            ordered.len()
        );
        return Ok(AggregatedResponse {
            result: selection.value,
            error: Vec::new(),
            quorum_reached: true,
            contributing_nodes: selection.contributors,
            gas_used,
        });
    }

    let mut report = vec![format!("QuorumNotReached ({}/{})", successes.len(), threshold)];
    if successes.len() >= threshold {
        report.push("divergent results".to_string());
    }
    for r in &ordered {
        if let (Some(kind), Some(message)) = (r.error_kind(), r.message()) {
            report.push(format!("{}: {}: {}", r.node_slot, kind, message));
        }
    }

    warn!("{}", report[0]);
    Ok(AggregatedResponse {
        result: Vec::new(),
        error: report.join("; ").into_bytes(),
        quorum_reached: false,
        contributing_nodes: BTreeSet::new(),
        gas_used: ordered.iter().map(|r| r.gas_used).max().unwrap_or_default(),
    })
}

// ============================================================================
// COLLECTION
// ============================================================================

/// Why collection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionEnd {
    /// Every slot reported
    AllReported,
    /// The slot-order prefix already held a quorum
    EarlyQuorum,
    /// The request timeout fired
    TimedOut,
    /// Every sender went away before all slots reported
    Closed,
}

/// Results gathered for one request.
#[derive(Debug, Clone)]
pub struct Collected {
    /// Results in slot order
    pub results: Vec<ExecutionResult>,
    pub end: CollectionEnd,
}

/// Waits for node results of one request.
#[derive(Debug, Clone)]
pub struct ResultCollector {
    node_count: usize,
    threshold: usize,
    timeout: Duration,
    early_exit: bool,
}

impl ResultCollector {
    pub fn new(node_count: usize, threshold: usize, timeout: Duration) -> Self {
        Self {
            node_count,
            threshold,
            timeout,
            early_exit: false,
        }
    }

    /// Stops as soon as the slot-order prefix of results holds a quorum.
    ///
    /// Only a contiguous prefix starting at slot 0 is considered, so the
    /// outcome does not depend on arrival order.
    pub fn with_early_exit(mut self, early_exit: bool) -> Self {
        self.early_exit = early_exit;
        self
    }

    fn prefix_quorum(
        &self,
        received: &BTreeMap<NodeSlot, ExecutionResult>,
        strategy: &dyn AggregationStrategy,
        return_type: ReturnType,
    ) -> Option<Vec<ExecutionResult>> {
        let prefix: Vec<ExecutionResult> = NodeSlot::range(self.node_count)
            .map_while(|slot| received.get(&slot).cloned())
            .collect();

        let quorum = aggregate(&prefix, self.threshold, strategy, return_type)
            .map(|r| r.quorum_reached)
            .unwrap_or(false);
        quorum.then_some(prefix)
    }

    /// Receives results until one of the stop conditions holds.
    ///
    /// The receiver is dropped on return, so results arriving later are
    /// discarded. On timeout, silent slots are reported as timed out.
    pub async fn collect(
        &self,
        mut rx: mpsc::Receiver<ExecutionResult>,
        strategy: &dyn AggregationStrategy,
        return_type: ReturnType,
    ) -> Collected {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut received: BTreeMap<NodeSlot, ExecutionResult> = BTreeMap::new();

        let end = loop {
            if received.len() == self.node_count {
                break CollectionEnd::AllReported;
            }

            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(result)) => {
                    let slot = result.node_slot;
                    if slot.index() >= self.node_count || received.contains_key(&slot) {
                        warn!("Ignoring unexpected result from {}", slot);
                        continue;
                    }
                    received.insert(slot, result);

                    if self.early_exit && received.len() < self.node_count {
                        if let Some(prefix) = self.prefix_quorum(&received, strategy, return_type) {
                            debug!("Early quorum after {} results", prefix.len());
                            return Collected {
                                results: prefix,
                                end: CollectionEnd::EarlyQuorum,
                            };
                        }
                    }
                }
                Ok(None) => break CollectionEnd::Closed,
                Err(_) => break CollectionEnd::TimedOut,
            }
        };

        if end == CollectionEnd::TimedOut {
            info!(
                "Request timeout after {}ms with {}/{} results",
                self.timeout.as_millis(),
                received.len(),
                self.node_count
            );
            for slot in NodeSlot::range(self.node_count) {
                received.entry(slot).or_insert_with(|| {
                    ExecutionResult::failure(
                        slot,
                        ExecutionErrorKind::Timeout,
                        "no result before request timeout",
                    )
                });
            }
        }

        Collected {
            results: received.into_values().collect(),
            end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    fn ok(slot: u16, value: ReturnValue) -> ExecutionResult {
        ExecutionResult::success(NodeSlot(slot), value.encode(), 1_000 + slot as u64)
    }

    fn timeout(slot: u16) -> ExecutionResult {
        ExecutionResult::failure(NodeSlot(slot), ExecutionErrorKind::Timeout, "exceeded 10000ms")
    }

    fn failed(slot: u16, msg: &str) -> ExecutionResult {
        ExecutionResult::failure(NodeSlot(slot), ExecutionErrorKind::Failed, msg)
    }

    #[test]
    fn test_one_success_three_timeouts() {
        let results = vec![ok(0, ReturnValue::int(42)), timeout(1), timeout(2), timeout(3)];

        let response = aggregate(&results, 2, &MajorityStrategy, ReturnType::Int256).unwrap();
        assert!(!response.quorum_reached);
        assert!(response.result.is_empty());
        let error = response.error_message().unwrap();
        assert!(error.starts_with("QuorumNotReached (1/2)"));
        assert!(error.contains("slot-3: ExecutionTimeout: exceeded 10000ms"));

        let response = aggregate(&results, 1, &MajorityStrategy, ReturnType::Int256).unwrap();
        assert!(response.quorum_reached);
        assert_eq!(
            ReturnValue::decode(&response.result, ReturnType::Int256).unwrap(),
            ReturnValue::int(42)
        );
        assert_eq!(response.contributing_nodes, BTreeSet::from([NodeSlot(0)]));
        assert_eq!(response.gas_used, 1_000);
    }

    #[test]
    fn test_majority_tie_goes_to_first_slot() {
        let results = vec![
            ok(3, ReturnValue::uint(2)),
            ok(0, ReturnValue::uint(1)),
            ok(1, ReturnValue::uint(2)),
            ok(2, ReturnValue::uint(1)),
        ];
        let response = aggregate(&results, 2, &MajorityStrategy, ReturnType::Uint256).unwrap();

        assert!(response.quorum_reached);
        assert_eq!(response.result, ReturnValue::uint(1).encode());
        assert_eq!(response.contributing_nodes, BTreeSet::from([NodeSlot(0), NodeSlot(2)]));
    }

    #[test]
    fn test_divergent_results_no_quorum() {
        let results = vec![
            ok(0, ReturnValue::String("a".into())),
            ok(1, ReturnValue::String("b".into())),
            ok(2, ReturnValue::String("c".into())),
        ];
        let response = aggregate(&results, 2, &MajorityStrategy, ReturnType::String).unwrap();

        assert!(!response.quorum_reached);
        assert!(response.error_message().unwrap().contains("divergent results"));
    }

    #[test]
    fn test_median_strategy() {
        let results = vec![
            ok(0, ReturnValue::int(-5)),
            ok(1, ReturnValue::int(100)),
            ok(2, ReturnValue::int(7)),
            ok(3, ReturnValue::int(9)),
            failed(4, "boom"),
        ];
        let response = aggregate(&results, 3, &MedianStrategy, ReturnType::Int256).unwrap();

        assert!(response.quorum_reached);
        // Sorted: -5, 7, 9, 100 -> lower median 7
        assert_eq!(response.result, ReturnValue::int(7).encode());
        assert_eq!(response.contributing_nodes.len(), 4);
    }

    #[test]
    fn test_median_falls_back_to_majority_for_strings() {
        let results = vec![
            ok(0, ReturnValue::String("x".into())),
            ok(1, ReturnValue::String("y".into())),
            ok(2, ReturnValue::String("y".into())),
        ];
        let response = aggregate(&results, 2, &MedianStrategy, ReturnType::String).unwrap();
        assert_eq!(response.result, b"y".to_vec());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = aggregate(&[], 0, &MajorityStrategy, ReturnType::Uint256).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    proptest! {
        #[test]
        fn prop_quorum_iff_enough_agreeing_successes(
            successes in 0usize..8,
            failures in 0usize..8,
            threshold in 1usize..10,
            seed in any::<u64>(),
        ) {
            let mut results: Vec<ExecutionResult> = (0..successes)
                .map(|i| ok(i as u16, ReturnValue::uint(42)))
                .chain((successes..successes + failures).map(|i| timeout(i as u16)))
                .collect();

            // Deterministic shuffle from the seed.
            let len = results.len();
            for i in 0..len {
                let j = ((seed >> (i % 64)) as usize).wrapping_add(i * 7) % len.max(1);
                results.swap(i, j);
            }

            for strategy in [&MajorityStrategy as &dyn AggregationStrategy, &MedianStrategy] {
                let response = aggregate(&results, threshold, strategy, ReturnType::Uint256).unwrap();
                prop_assert_eq!(response.quorum_reached, successes >= threshold);
                if response.quorum_reached {
                    prop_assert!(response.contributing_nodes.len() >= threshold);
                }
            }
        }

        #[test]
        fn prop_never_attributed_to_fewer_than_threshold(
            values in proptest::collection::vec(0u64..3, 1..8),
            threshold in 1usize..8,
        ) {
            let results: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(i, v)| ok(i as u16, ReturnValue::uint(*v)))
                .collect();
            let response = aggregate(&results, threshold, &MajorityStrategy, ReturnType::Uint256).unwrap();
            if response.quorum_reached {
                let agreeing = results
                    .iter()
                    .filter(|r| r.value() == Some(response.result.as_slice()))
                    .count();
                prop_assert!(agreeing >= threshold);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_times_out_on_hung_nodes() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(ok(0, ReturnValue::int(42))).await.unwrap();

        let collector = ResultCollector::new(4, 2, Duration::from_secs(300));
        let collected = collector.collect(rx, &MajorityStrategy, ReturnType::Int256).await;

        assert_eq!(collected.end, CollectionEnd::TimedOut);
        assert_eq!(collected.results.len(), 4);
        assert_eq!(collected.results[3].error_kind(), Some(ExecutionErrorKind::Timeout));

        // The receiver is gone; late results are dropped.
        assert!(tx.send(ok(1, ReturnValue::int(42))).await.is_err());
    }

    #[tokio::test]
    async fn test_collector_all_reported() {
        let (tx, rx) = mpsc::channel(4);
        for r in [timeout(2), ok(0, ReturnValue::uint(1)), ok(1, ReturnValue::uint(1))] {
            tx.send(r).await.unwrap();
        }

        let collector = ResultCollector::new(3, 2, Duration::from_secs(300));
        let collected = collector.collect(rx, &MajorityStrategy, ReturnType::Uint256).await;

        assert_eq!(collected.end, CollectionEnd::AllReported);
        let slots: Vec<_> = collected.results.iter().map(|r| r.node_slot).collect();
        assert_eq!(slots, vec![NodeSlot(0), NodeSlot(1), NodeSlot(2)]);
    }

    #[tokio::test]
    async fn test_early_exit_uses_slot_prefix() {
        let (tx, rx) = mpsc::channel(8);
        // Slots 2 and 3 agree first, but the prefix is not contiguous yet.
        for r in [
            ok(2, ReturnValue::uint(9)),
            ok(3, ReturnValue::uint(9)),
            ok(0, ReturnValue::uint(1)),
            ok(1, ReturnValue::uint(1)),
        ] {
            tx.send(r).await.unwrap();
        }

        let collector = ResultCollector::new(5, 2, Duration::from_secs(300)).with_early_exit(true);
        let collected = collector.collect(rx, &MajorityStrategy, ReturnType::Uint256).await;

        assert_eq!(collected.end, CollectionEnd::EarlyQuorum);
        let response = aggregate(&collected.results, 2, &MajorityStrategy, ReturnType::Uint256).unwrap();
        assert_eq!(response.result, ReturnValue::uint(1).encode());
    }

    #[tokio::test]
    async fn test_collector_ignores_duplicates() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(ok(0, ReturnValue::uint(1))).await.unwrap();
        tx.send(ok(0, ReturnValue::uint(2))).await.unwrap();
        drop(tx);

        let collector = ResultCollector::new(2, 1, Duration::from_secs(300));
        let collected = collector.collect(rx, &MajorityStrategy, ReturnType::Uint256).await;

        assert_eq!(collected.end, CollectionEnd::Closed);
        assert_eq!(collected.results.len(), 1);
        assert_eq!(collected.results[0].value(), Some(ReturnValue::uint(1).encode().as_slice()));
    }
}
