//! # Join Implementation Rules
//!
//! Two implementation rules map a logical join to physical join operators.
//!
//! ## Hash Join (`ImplHashJoinRule`)
//!
//! Builds a hash table on one input and probes it with rows from the other. It needs
//! at least one hashable key: a `col = col` conjunct whose columns come from opposite
//! inputs. Inner joins get both build sides so the cost model can build on the
//! smaller input. Left, semi, anti, single, and mark joins always build on the right
//! input, since the left input drives the preserved or filtered side.
//!
//! **Cost**: O(build_rows) memory + O(build_rows + probe_rows) CPU.
//!
//! ## Nested Loop Join (`ImplNestedLoopJoinRule`)
//!
//! For each left row, scans all right rows. Always applicable, including cross
//! products and non-equality predicates, so every join group has at least one
//! physical member.
//!
//! **Cost**: O(left_rows * right_rows) CPU.

use qopt_core::expr::{Expr, JoinType, TableRefId};
use qopt_core::memo::{Memo, MemoExpr};
use qopt_core::pattern::Pattern;
use qopt_core::plan::{BuildSide, LogicalNode, LogicalOp, PhysicalOp};
use qopt_core::rule::{OptContext, Rule, RuleResult, RuleType};
use std::collections::BTreeSet;

/// Implement a logical join as a hash join.
pub struct ImplHashJoinRule;

impl Rule for ImplHashJoinRule {
    fn name(&self) -> &str {
        "ImplHashJoin"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::join()
    }

    fn apply(&self, expr: &MemoExpr, node: &LogicalNode, memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let LogicalOp::Join { join_type, predicate } = &node.op else {
            return vec![];
        };
        let children = expr.children();
        let [left, right] = children[..] else {
            return vec![];
        };
        let Some(predicate) = predicate else {
            return vec![];
        };
        // group tables only list what a join input exposes, so a semi join below
        // contributes its left side alone
        if !has_hash_key(predicate, &memo.group(left).tables, &memo.group(right).tables) {
            return vec![];
        }

        let sides: &[BuildSide] = match join_type {
            JoinType::Inner => &[BuildSide::Right, BuildSide::Left],
            _ => &[BuildSide::Right],
        };
        sides
            .iter()
            .map(|&build_side| RuleResult::Physical {
                op: PhysicalOp::HashJoin { build_side },
                children: children.clone(),
            })
            .collect()
    }
}

/// Implement a logical join as a nested loop join (universal fallback).
pub struct ImplNestedLoopJoinRule;

impl Rule for ImplNestedLoopJoinRule {
    fn name(&self) -> &str {
        "ImplNestedLoopJoin"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::join()
    }

    fn apply(&self, expr: &MemoExpr, node: &LogicalNode, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        if node.op.join_type().is_none() {
            return vec![];
        }
        vec![RuleResult::Physical {
            op: PhysicalOp::NestedLoopJoin,
            children: expr.children(),
        }]
    }
}

/// Whether `predicate` has a `col = col` conjunct with one column from each side.
pub fn has_hash_key(predicate: &Expr, left: &BTreeSet<TableRefId>, right: &BTreeSet<TableRefId>) -> bool {
    predicate.conjuncts().into_iter().any(|c| {
        let Some((a, b)) = c.as_column_equality() else {
            return false;
        };
        if a.is_outer() || b.is_outer() {
            return false;
        }
        match (a.table_ref(), b.table_ref()) {
            (Some(x), Some(y)) => {
                (left.contains(&x) && right.contains(&y)) || (left.contains(&y) && right.contains(&x))
            }
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qopt_core::expr::{BinaryOp, ColumnRef};

    fn col(t: &str, r: TableRefId) -> Expr {
        Expr::Column(ColumnRef::bound(t, "k", r, 0))
    }

    #[test]
    fn test_hash_key_needs_both_sides() {
        let left = BTreeSet::from([0]);
        let right = BTreeSet::from([1]);
        assert!(has_hash_key(&Expr::eq(col("a", 0), col("b", 1)), &left, &right));
        assert!(has_hash_key(&Expr::eq(col("b", 1), col("a", 0)), &left, &right));
        // same-side equality is a filter, not a key
        assert!(!has_hash_key(&Expr::eq(col("a", 0), col("a", 0)), &left, &right));
        let range = Expr::binary(BinaryOp::Lt, col("a", 0), col("b", 1));
        assert!(!has_hash_key(&range, &left, &right));
        let mixed = Expr::And(vec![range, Expr::eq(col("a", 0), col("b", 1))]);
        assert!(has_hash_key(&mixed, &left, &right));
    }
}
