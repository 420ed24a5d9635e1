//! # Aggregate Implementation Rule
//!
//! ## Hash Aggregate (`ImplHashAggregateRule`)
//!
//! Uses a hash table keyed by the group-by expressions. Each input row is routed to
//! its group's accumulators. Works with any input ordering; a global aggregate (no
//! group-by keys) is a hash aggregate with a single group.
//!
//! **Cost trade-off**: O(n) CPU + O(groups) memory.

use qopt_core::memo::{Memo, MemoExpr};
use qopt_core::pattern::Pattern;
use qopt_core::plan::{LogicalNode, LogicalOpKind, PhysicalOp};
use qopt_core::rule::{OptContext, Rule, RuleResult, RuleType};

/// Implement a logical aggregate as a hash aggregate. Always applicable.
pub struct ImplHashAggregateRule;

impl Rule for ImplHashAggregateRule {
    fn name(&self) -> &str {
        "ImplHashAggregate"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::unary(LogicalOpKind::Aggregate)
    }

    fn apply(&self, expr: &MemoExpr, node: &LogicalNode, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        if node.kind() != LogicalOpKind::Aggregate {
            return vec![];
        }
        vec![RuleResult::Physical {
            op: PhysicalOp::HashAggregate,
            children: expr.children(),
        }]
    }
}
