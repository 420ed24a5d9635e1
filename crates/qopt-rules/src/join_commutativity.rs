//! # Join Commutativity Rule
//!
//! Implements the identity `A ⋈ B = B ⋈ A` for inner joins.
//!
//! ## Why Commutativity Matters
//!
//! The order of join inputs decides which side a hash join builds on and which side a
//! nested loop drives. Swapping the inputs at every level of a join region, combined
//! with associativity, lets the search reach every join order over the region's
//! leaves.
//!
//! ## Applicability
//!
//! Only inner joins commute. Left, semi, anti, single, and mark joins have a fixed
//! preserved side.
//!
//! ## Predicate and Output
//!
//! The predicate is kept as written; conjunct hashing ignores `=` operand order, so
//! the swapped node keeps the group's signature. The output column order is the
//! group's, since every member of a group exposes the same columns.

use qopt_core::memo::{Memo, MemoExpr};
use qopt_core::pattern::Pattern;
use qopt_core::plan::{LogicalNode, PlanChild};
use qopt_core::rule::{OptContext, Rule, RuleResult, RuleType};

/// Join commutativity: A ⋈ B → B ⋈ A.
pub struct JoinCommutativityRule;

impl Rule for JoinCommutativityRule {
    fn name(&self) -> &str {
        "JoinCommutativity"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Exploration
    }

    fn pattern(&self) -> Pattern {
        Pattern::join()
    }

    fn apply(&self, expr: &MemoExpr, node: &LogicalNode, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        if !node.op.is_inner_join() {
            return vec![];
        }
        let children = expr.children();
        let [left, right] = children[..] else {
            return vec![];
        };
        vec![RuleResult::Logical(
            node.with_children(vec![PlanChild::Group(right), PlanChild::Group(left)]),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qopt_core::catalog::InMemoryCatalog;
    use qopt_core::expr::{ColumnRef, Expr, JoinType};
    use qopt_core::plan::ScanSource;
    use qopt_core::tableref::TableRefRegistry;
    use std::sync::Arc;

    fn scan(t: &str, r: u32) -> Arc<LogicalNode> {
        let col = Expr::Column(ColumnRef::bound(t, "k", r, 0));
        Arc::new(LogicalNode::scan(r, ScanSource::Table(t.into()), vec![col]))
    }

    fn apply(join_type: JoinType) -> (Memo, Vec<RuleResult>) {
        let mut memo = Memo::new();
        let pred = Expr::eq(
            Expr::Column(ColumnRef::bound("a", "k", 0, 0)),
            Expr::Column(ColumnRef::bound("b", "k", 1, 0)),
        );
        let root = memo
            .insert_plan(&LogicalNode::join(join_type, Some(pred), scan("a", 0), scan("b", 1)))
            .unwrap();
        let eid = memo.group(root).logical_exprs[0];
        let expr = memo.expr(eid).clone();
        let node = memo.logical(eid).unwrap().clone();
        let catalog = InMemoryCatalog::new();
        let tables = TableRefRegistry::new();
        let out = JoinCommutativityRule.apply(&expr, &node, &memo, &OptContext::new(&catalog, &tables));
        (memo, out)
    }

    #[test]
    fn test_swaps_children_and_keeps_signature() {
        let (mut memo, out) = apply(JoinType::Inner);
        assert_eq!(out.len(), 1);
        let RuleResult::Logical(ref swapped) = out[0] else {
            panic!("expected a logical result");
        };
        assert_eq!(swapped.children[0], PlanChild::Group(1));
        assert_eq!(swapped.children[1], PlanChild::Group(0));
        assert!(swapped.op.is_inner_join());
        let inserted = memo.insert_logical(swapped, Some(2)).unwrap();
        assert!(inserted.is_new);
        assert_eq!(inserted.group, 2);
    }

    #[test]
    fn test_outer_and_semi_joins_do_not_commute() {
        for join_type in [JoinType::Left, JoinType::Semi, JoinType::Anti, JoinType::Single, JoinType::Mark(0)] {
            assert!(apply(join_type).1.is_empty(), "{join_type:?}");
        }
    }
}
