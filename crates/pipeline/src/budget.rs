//! Shared pipeline budget with reservation-style check-and-commit.
//!
//! A run has one [`BudgetTracker`]. Every cost-incurring call first reserves an
//! upper bound, then settles the reservation against the actual cost reported
//! by the delegate. The committed total (settled cost plus outstanding
//! reservations) lives in a single [`AtomicU64`] of micro-dollars and is only
//! ever advanced by compare-and-swap, so two reservations that together exceed
//! the remainder can never both be granted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CostBudget, NodeId, TokenCost};

/// A reservation could not be granted.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("budget denied: requested {requested}, remaining {remaining}")]
pub struct BudgetDenied {
    pub requested: TokenCost,
    pub remaining: TokenCost,
}

/// Cost consumed by one node, split by call purpose (`generate`, `alignment`,
/// `edge_condition`, `spawn`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCost {
    pub total: TokenCost,
    #[serde(default)]
    pub items: BTreeMap<String, TokenCost>,
}

/// Snapshot of the budget, as reported and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetBreakdown {
    pub limit: CostBudget,
    pub consumed: TokenCost,
    /// Reservations granted but not yet settled.
    #[serde(default)]
    pub reserved: TokenCost,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, NodeCost>,
}

impl BudgetBreakdown {
    /// An empty breakdown for a fresh run.
    pub fn empty(limit: CostBudget) -> Self {
        Self {
            limit,
            consumed: TokenCost::zero(),
            reserved: TokenCost::zero(),
            nodes: BTreeMap::new(),
        }
    }

    /// Cost attributed to `node` so far.
    pub fn node_total(&self, node: &NodeId) -> TokenCost {
        self.nodes
            .get(node)
            .map(|cost| cost.total)
            .unwrap_or_else(TokenCost::zero)
    }
}

/// A granted reservation. Must be handed back through
/// [`BudgetTracker::settle`] or [`BudgetTracker::release`].
#[must_use = "a reservation holds budget until it is settled or released"]
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    node: NodeId,
    item: String,
    micros: u64,
}

impl Reservation {
    pub fn amount(&self) -> TokenCost {
        TokenCost::from_micros(self.micros)
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

/// The single shared mutable resource of a run.
#[derive(Debug)]
pub struct BudgetTracker {
    limit: CostBudget,
    limit_micros: u64,
    /// Settled cost plus outstanding reservations.
    committed: AtomicU64,
    /// Settled cost only, attributed by node and item.
    settled: Mutex<BTreeMap<NodeId, NodeCost>>,
}

impl BudgetTracker {
    /// Creates a tracker with nothing consumed.
    pub fn new(limit: CostBudget) -> Self {
        Self {
            limit,
            limit_micros: limit.as_micros(),
            committed: AtomicU64::new(0),
            settled: Mutex::new(BTreeMap::new()),
        }
    }

    /// Rebuilds a tracker from a persisted breakdown. Outstanding reservations
    /// in the breakdown are dropped: they belonged to calls of a previous
    /// invocation that never settled.
    pub fn restore(limit: CostBudget, breakdown: &BudgetBreakdown) -> Self {
        let consumed = breakdown.consumed.as_micros().min(limit.as_micros());
        Self {
            limit,
            limit_micros: limit.as_micros(),
            committed: AtomicU64::new(consumed),
            settled: Mutex::new(breakdown.nodes.clone()),
        }
    }

    pub fn limit(&self) -> CostBudget {
        self.limit
    }

    /// Settled cost plus outstanding reservations.
    pub fn committed(&self) -> TokenCost {
        TokenCost::from_micros(self.committed.load(Ordering::Acquire))
    }

    /// Budget still available for new reservations.
    pub fn remaining(&self) -> TokenCost {
        TokenCost::from_micros(
            self.limit_micros
                .saturating_sub(self.committed.load(Ordering::Acquire)),
        )
    }

    /// Settled cost across all nodes.
    pub fn consumed(&self) -> TokenCost {
        self.with_settled(|nodes| nodes.values().map(|cost| cost.total).sum())
    }

    /// Atomically reserves `amount` for `node`, or denies without side effects.
    pub fn reserve(
        &self,
        node: &NodeId,
        item: &str,
        amount: TokenCost,
    ) -> Result<Reservation, BudgetDenied> {
        let micros = amount.as_micros();
        self.try_commit(micros).map_err(|remaining| BudgetDenied {
            requested: amount,
            remaining: TokenCost::from_micros(remaining),
        })?;
        tracing::trace!(node = %node, item, reserved = %amount, "Budget reserved");
        Ok(Reservation {
            node: node.clone(),
            item: item.to_string(),
            micros,
        })
    }

    /// Settles a reservation against the actual cost.
    ///
    /// Any unused portion is returned. If the actual cost exceeds the
    /// reservation, the overage is reserved as well; when that is denied the
    /// remaining budget is consumed up to the limit and the denial is returned
    /// so the caller can fail the node.
    pub fn settle(&self, reservation: Reservation, actual: TokenCost) -> Result<(), BudgetDenied> {
        let actual_micros = actual.as_micros();
        let mut outcome = Ok(());
        let recorded = if actual_micros <= reservation.micros {
            self.committed
                .fetch_sub(reservation.micros - actual_micros, Ordering::AcqRel);
            actual_micros
        } else {
            let overage = actual_micros - reservation.micros;
            match self.try_commit(overage) {
                Ok(()) => actual_micros,
                Err(remaining) => {
                    let taken = self.take_remaining();
                    outcome = Err(BudgetDenied {
                        requested: TokenCost::from_micros(overage),
                        remaining: TokenCost::from_micros(remaining),
                    });
                    reservation.micros + taken
                }
            }
        };

        self.with_settled(|nodes| {
            let cost = TokenCost::from_micros(recorded);
            let entry = nodes.entry(reservation.node.clone()).or_default();
            entry.total += cost;
            *entry.items.entry(reservation.item.clone()).or_default() += cost;
        });
        tracing::trace!(
            node = %reservation.node,
            item = %reservation.item,
            actual = %actual,
            "Budget settled"
        );
        outcome
    }

    /// Returns an unused reservation in full.
    pub fn release(&self, reservation: Reservation) {
        self.committed.fetch_sub(reservation.micros, Ordering::AcqRel);
    }

    /// Returns the current breakdown by node and item.
    pub fn breakdown(&self) -> BudgetBreakdown {
        let nodes = self.with_settled(|nodes| nodes.clone());
        let consumed: TokenCost = nodes.values().map(|cost| cost.total).sum();
        BudgetBreakdown {
            limit: self.limit,
            consumed,
            reserved: self.committed().saturating_sub(consumed),
            nodes,
        }
    }

    /// Creates a per-node view that caps each call at `per_call` and the
    /// node's total at `share`.
    pub fn node_budget(
        self: &Arc<Self>,
        node: NodeId,
        share: Option<TokenCost>,
        per_call: TokenCost,
    ) -> NodeBudget {
        let spent = self.with_settled(|nodes| {
            nodes
                .get(&node)
                .map(|cost| cost.total.as_micros())
                .unwrap_or(0)
        });
        NodeBudget {
            tracker: Arc::clone(self),
            node,
            share_micros: share.map(TokenCost::as_micros),
            per_call_micros: per_call.as_micros(),
            spent: AtomicU64::new(spent),
        }
    }

    fn try_commit(&self, micros: u64) -> Result<(), u64> {
        let limit = self.limit_micros;
        self.committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(micros).filter(|next| *next <= limit)
            })
            .map(|_| ())
            .map_err(|current| limit.saturating_sub(current))
    }

    fn take_remaining(&self) -> u64 {
        let limit = self.limit_micros;
        self.committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.max(limit))
            })
            .map(|previous| limit.saturating_sub(previous))
            .unwrap_or(0)
    }

    fn with_settled<R>(&self, f: impl FnOnce(&mut BTreeMap<NodeId, NodeCost>) -> R) -> R {
        // A poisoned lock only means another task panicked mid-update; the map
        // itself is still a consistent value.
        let mut guard = match self.settled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

/// One node's view of the shared budget.
///
/// Each reservation asks for `min(per_call, share remaining)`, so a node can
/// never reserve past its configured share of the pipeline budget.
#[derive(Debug)]
pub struct NodeBudget {
    tracker: Arc<BudgetTracker>,
    node: NodeId,
    share_micros: Option<u64>,
    per_call_micros: u64,
    spent: AtomicU64,
}

impl NodeBudget {
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn tracker(&self) -> &BudgetTracker {
        &self.tracker
    }

    /// Cost settled by this node, including previous invocations.
    pub fn spent(&self) -> TokenCost {
        TokenCost::from_micros(self.spent.load(Ordering::Acquire))
    }

    /// Reserves the per-call amount, capped by the node's remaining share.
    pub fn reserve(&self, item: &str) -> Result<Reservation, BudgetDenied> {
        let amount = match self.share_micros {
            Some(share) => {
                let left = share.saturating_sub(self.spent.load(Ordering::Acquire));
                if left == 0 {
                    return Err(BudgetDenied {
                        requested: TokenCost::from_micros(self.per_call_micros),
                        remaining: TokenCost::zero(),
                    });
                }
                self.per_call_micros.min(left)
            }
            None => self.per_call_micros,
        };
        self.tracker
            .reserve(&self.node, item, TokenCost::from_micros(amount))
    }

    pub fn settle(&self, reservation: Reservation, actual: TokenCost) -> Result<(), BudgetDenied> {
        self.spent.fetch_add(actual.as_micros(), Ordering::AcqRel);
        self.tracker.settle(reservation, actual)
    }

    pub fn release(&self, reservation: Reservation) {
        self.tracker.release(reservation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(value: f64) -> TokenCost {
        TokenCost::new(value).expect("valid cost")
    }

    fn node(name: &str) -> NodeId {
        NodeId::new(name).expect("non-empty")
    }

    #[test]
    fn reserve_two_exceeding_remainder_expected_second_denied() {
        let tracker = BudgetTracker::new(CostBudget::new(100.0).expect("valid"));
        let first = tracker.reserve(&node("a"), "generate", usd(80.0));
        let second = tracker.reserve(&node("b"), "generate", usd(80.0));
        assert!(first.is_ok());
        let denied = second.expect_err("second reservation must be denied");
        assert_eq!(denied.remaining, usd(20.0));
    }

    #[test]
    fn settle_below_reservation_expected_refund() {
        let tracker = BudgetTracker::new(CostBudget::new(10.0).expect("valid"));
        let reservation = tracker.reserve(&node("a"), "generate", usd(4.0)).expect("granted");
        tracker.settle(reservation, usd(1.5)).expect("settled");
        assert_eq!(tracker.consumed(), usd(1.5));
        assert_eq!(tracker.remaining(), usd(8.5));
        let breakdown = tracker.breakdown();
        assert_eq!(breakdown.node_total(&node("a")), usd(1.5));
        assert_eq!(breakdown.nodes[&node("a")].items["generate"], usd(1.5));
    }

    #[test]
    fn settle_overage_past_limit_expected_denied_and_capped() {
        let tracker = BudgetTracker::new(CostBudget::new(5.0).expect("valid"));
        let reservation = tracker.reserve(&node("a"), "generate", usd(4.0)).expect("granted");
        let error = tracker.settle(reservation, usd(7.0)).expect_err("overage denied");
        assert_eq!(error.requested, usd(3.0));
        assert_eq!(tracker.consumed(), usd(5.0));
        assert_eq!(tracker.remaining(), TokenCost::zero());
    }

    #[test]
    fn release_expected_full_refund() {
        let tracker = BudgetTracker::new(CostBudget::new(1.0).expect("valid"));
        let reservation = tracker.reserve(&node("a"), "alignment", usd(1.0)).expect("granted");
        tracker.release(reservation);
        assert_eq!(tracker.committed(), TokenCost::zero());
    }

    #[test]
    fn node_budget_share_expected_caps_reservation() {
        let tracker = Arc::new(BudgetTracker::new(CostBudget::new(10.0).expect("valid")));
        let budget = tracker.node_budget(node("a"), Some(usd(1.0)), usd(2.0));
        let reservation = budget.reserve("generate").expect("granted");
        assert_eq!(reservation.amount(), usd(1.0));
        budget.settle(reservation, usd(1.0)).expect("settled");
        assert!(budget.reserve("generate").is_err());
    }

    #[test]
    fn restore_expected_consumed_carried_over() {
        let limit = CostBudget::new(10.0).expect("valid");
        let tracker = BudgetTracker::new(limit);
        let reservation = tracker.reserve(&node("a"), "generate", usd(3.0)).expect("granted");
        tracker.settle(reservation, usd(2.0)).expect("settled");

        let restored = BudgetTracker::restore(limit, &tracker.breakdown());
        assert_eq!(restored.committed(), usd(2.0));
        assert_eq!(restored.consumed(), usd(2.0));
    }
}
