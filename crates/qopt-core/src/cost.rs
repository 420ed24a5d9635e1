//! # Cost Model
//!
//! This module defines the cost abstraction and a default cost model for the optimizer.
//!
//! ## Weighted Cost
//!
//! The `DefaultCostModel` charges CPU work per row touched and memory work per row
//! held in a hash table or sort buffer:
//!
//! ```text
//! local_cost = cpu_weight * rows_processed + memory_weight * rows_retained
//! ```
//!
//! ## Cost Accumulation
//!
//! Costs are **additive**: the total cost of a plan is its local cost plus the costs
//! of all child plans. Every local cost is monotone non-decreasing in each input
//! cardinality, so a cheaper subplan never makes its parent more expensive. Both the
//! memo search and the join-order resolvers rely on that when they keep only the
//! cheapest plan per group or table set.
//!
//! ## Pluggable Design
//!
//! The `CostModel` trait allows replacing the default model. Weights are
//! deserializable so they can be tuned from configuration.

use crate::plan::{BuildSide, LogicalOp, PhysicalOp};
use serde::{Deserialize, Serialize};

/// Cost is a single comparable value representing the estimated expense of a plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Cost {
    /// The total weighted cost. Lower is better. `f64::MAX` represents infinity
    /// (an infeasible or not-yet-costed plan).
    pub total: f64,
}

impl Cost {
    pub fn zero() -> Self {
        Self { total: 0.0 }
    }

    pub fn new(total: f64) -> Self {
        Self { total }
    }

    pub fn infinite() -> Self {
        Self { total: f64::MAX }
    }

    pub fn is_infinite(&self) -> bool {
        self.total == f64::MAX
    }
}

/// Epsilon-based equality to handle floating-point imprecision in cost comparisons.
impl PartialEq for Cost {
    fn eq(&self, other: &Self) -> bool {
        (self.total - other.total).abs() < f64::EPSILON
    }
}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.total.partial_cmp(&other.total)
    }
}

/// Trait for pluggable cost models.
pub trait CostModel: Send + Sync {
    /// Cost of running `op` (implementing `logic`) once, excluding its inputs.
    fn local_cost(&self, op: &PhysicalOp, logic: &LogicalOp, input_cards: &[f64], output_card: f64) -> f64;

    /// Cumulative cost: local cost plus the children's costs.
    fn compute_cost(
        &self,
        op: &PhysicalOp,
        logic: &LogicalOp,
        input_cards: &[f64],
        children_costs: &[Cost],
        output_card: f64,
    ) -> Cost {
        let children_total: f64 = children_costs.iter().map(|c| c.total).sum();
        Cost::new(children_total + self.local_cost(op, logic, input_cards, output_card))
    }
}

/// Default cost model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultCostModel {
    /// Weight for CPU-bound work (row processing, comparisons, hashing).
    pub cpu_weight: f64,
    /// Weight for rows retained in memory (hash tables, sort buffers).
    pub memory_weight: f64,
}

impl Default for DefaultCostModel {
    fn default() -> Self {
        Self {
            cpu_weight: 1.0,
            memory_weight: 1.0,
        }
    }
}

impl CostModel for DefaultCostModel {
    fn local_cost(&self, op: &PhysicalOp, _logic: &LogicalOp, input_cards: &[f64], output_card: f64) -> f64 {
        let input = |i: usize| input_cards.get(i).copied().unwrap_or(1.0);
        match op {
            // Scans read and emit each row once.
            PhysicalOp::TableScan | PhysicalOp::FileScan => self.cpu_weight * output_card,
            PhysicalOp::Filter | PhysicalOp::Project | PhysicalOp::Limit => self.cpu_weight * input(0),
            // O(n * m): for every left row, evaluate the predicate on all right rows.
            PhysicalOp::NestedLoopJoin => self.cpu_weight * input(0) * input(1),
            // Hash the build side into memory, then probe once per row of the other side.
            PhysicalOp::HashJoin { build_side } => {
                let (build, probe) = match build_side {
                    BuildSide::Left => (input(0), input(1)),
                    BuildSide::Right => (input(1), input(0)),
                };
                self.cpu_weight * (build + probe) + self.memory_weight * build
            }
            PhysicalOp::HashAggregate => self.cpu_weight * input(0) + self.memory_weight * output_card,
            PhysicalOp::Sort => {
                let rows = input(0).max(1.0);
                let n_log_n = rows * (1.0 + rows.log2());
                self.cpu_weight * n_log_n + self.memory_weight * rows
            }
            PhysicalOp::Materialize => (self.cpu_weight + self.memory_weight) * input(0),
        }
    }
}
