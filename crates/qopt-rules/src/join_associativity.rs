//! # Join Associativity Rule
//!
//! Implements the identity for inner joins:
//! `A ⋈ (B ⋈ C) = (A ⋈ B) ⋈ C`
//!
//! ## Why Associativity Matters
//!
//! Associativity changes the *shape* of the join tree. Commutativity alone only
//! mirrors a tree; together they reach every bushy tree over a join region's leaves.
//!
//! ## Predicate Redistribution
//!
//! All conjuncts of the two original joins are pooled. A conjunct whose tables all
//! belong to `A` or `B` moves onto the new `A ⋈ B`; everything else stays on the new
//! top join, where every column is still in scope. The pooled conjunct set is
//! unchanged, so the result has the same region signature as the original group.
//!
//! ## Cross Products
//!
//! The rule refuses when `B ⋈ C` had no predicate at all but some conjunct would
//! land on `A ⋈ B`: the rewrite would turn the original cross product into a
//! filtered join one level down while leaving `C` unconstrained above it.
//!
//! ## Matching
//!
//! The pattern matches `Join(Any, Join(Any, Any))`. The rule walks every inner-join
//! member of the right group, so one application covers all known shapes of
//! `B ⋈ C`.

use qopt_core::expr::{and_all, Expr, JoinType, TableRefId};
use qopt_core::memo::{GroupId, Memo, MemoExpr};
use qopt_core::pattern::Pattern;
use qopt_core::plan::{LogicalNode, LogicalOp, PlanChild};
use qopt_core::rule::{OptContext, Rule, RuleResult, RuleType};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

/// Join associativity: `A ⋈ (B ⋈ C) → (A ⋈ B) ⋈ C`.
pub struct JoinAssociativityRule;

impl Rule for JoinAssociativityRule {
    fn name(&self) -> &str {
        "JoinAssociativity"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Exploration
    }

    fn pattern(&self) -> Pattern {
        Pattern::join_join_right()
    }

    fn apply(&self, expr: &MemoExpr, node: &LogicalNode, memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let LogicalOp::Join {
            join_type: JoinType::Inner,
            predicate: top_pred,
        } = &node.op
        else {
            return vec![];
        };
        let children = expr.children();
        let [a, bc] = children[..] else {
            return vec![];
        };

        let mut results = Vec::new();
        for &eid in &memo.group(bc).logical_exprs {
            let Some(inner) = memo.logical(eid) else {
                continue;
            };
            let LogicalOp::Join {
                join_type: JoinType::Inner,
                predicate: bc_pred,
            } = &inner.op
            else {
                continue;
            };
            let inner_children = memo.expr(eid).children();
            let [b, c] = inner_children[..] else {
                continue;
            };
            match reassociate(memo, a, b, c, top_pred.as_ref(), bc_pred.as_ref(), &node.output) {
                Some(rewritten) => results.push(RuleResult::Logical(rewritten)),
                None => trace!(group = expr.group, inner = eid, "associativity would add a cross product"),
            }
        }
        results
    }
}

/// Build `(a ⋈ b) ⋈ c` from the predicates of `a ⋈ (b ⋈ c)`. Returns `None` when
/// the rewrite would move a predicate off a former cross product.
pub fn reassociate(
    memo: &Memo,
    a: GroupId,
    b: GroupId,
    c: GroupId,
    top_pred: Option<&Expr>,
    bc_pred: Option<&Expr>,
    output: &[Expr],
) -> Option<LogicalNode> {
    let ab_tables: BTreeSet<TableRefId> = memo.group(a).tables.union(&memo.group(b).tables).copied().collect();

    let (mut ab_conjuncts, mut top_conjuncts): (Vec<Expr>, Vec<Expr>) = top_pred
        .into_iter()
        .chain(bc_pred)
        .flat_map(|p| p.conjuncts())
        .cloned()
        .partition(|conj| {
            let tables = conj.tables();
            !tables.is_empty() && tables.is_subset(&ab_tables)
        });

    // canonical conjunct order, so rediscovered trees dedup as identical members
    for conjuncts in [&mut ab_conjuncts, &mut top_conjuncts] {
        conjuncts.sort_by_key(Expr::canonical_hash);
        conjuncts.dedup_by_key(|c| c.canonical_hash());
    }
    let ab_pred = and_all(ab_conjuncts);
    if ab_pred.is_some() && bc_pred.is_none() {
        return None;
    }

    let ab_output: Vec<Expr> = memo
        .group(a)
        .output
        .iter()
        .chain(&memo.group(b).output)
        .cloned()
        .collect();
    let ab = LogicalNode::new(
        LogicalOp::Join {
            join_type: JoinType::Inner,
            predicate: ab_pred,
        },
        vec![PlanChild::Group(a), PlanChild::Group(b)],
        ab_output,
    );
    Some(LogicalNode::new(
        LogicalOp::Join {
            join_type: JoinType::Inner,
            predicate: and_all(top_conjuncts),
        },
        vec![PlanChild::Node(Arc::new(ab)), PlanChild::Group(c)],
        output.to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qopt_core::catalog::InMemoryCatalog;
    use qopt_core::expr::ColumnRef;
    use qopt_core::plan::ScanSource;
    use qopt_core::tableref::TableRefRegistry;

    fn col(t: &str, r: TableRefId) -> Expr {
        Expr::Column(ColumnRef::bound(t, "k", r, 0))
    }

    fn scan(t: &str, r: TableRefId) -> Arc<LogicalNode> {
        Arc::new(LogicalNode::scan(r, ScanSource::Table(t.into()), vec![col(t, r)]))
    }

    /// `a ⋈ (b ⋈ c)` inserted into a fresh memo; returns the root group.
    fn right_deep(top: Option<Expr>, bc: Option<Expr>) -> (Memo, GroupId) {
        let inner = Arc::new(LogicalNode::join(JoinType::Inner, bc, scan("b", 1), scan("c", 2)));
        let plan = LogicalNode::join(JoinType::Inner, top, scan("a", 0), inner);
        let mut memo = Memo::new();
        let root = memo.insert_plan(&plan).unwrap();
        (memo, root)
    }

    fn run(memo: &Memo, root: GroupId) -> Vec<RuleResult> {
        let eid = memo.group(root).logical_exprs[0];
        let expr = memo.expr(eid).clone();
        let node = memo.logical(eid).unwrap().clone();
        let catalog = InMemoryCatalog::new();
        let tables = TableRefRegistry::new();
        JoinAssociativityRule.apply(&expr, &node, memo, &OptContext::new(&catalog, &tables))
    }

    fn logical(result: &RuleResult) -> &LogicalNode {
        match result {
            RuleResult::Logical(n) => n,
            other => panic!("expected a logical result, got {other:?}"),
        }
    }

    fn predicate(node: &LogicalNode) -> Option<&Expr> {
        match node.op {
            LogicalOp::Join { ref predicate, .. } => predicate.as_ref(),
            _ => None,
        }
    }

    #[test]
    fn test_predicates_follow_their_tables() {
        let ab = Expr::eq(col("a", 0), col("b", 1));
        let bc = Expr::eq(col("b", 1), col("c", 2));
        let (mut memo, root) = right_deep(Some(ab.clone()), Some(bc.clone()));
        let out = run(&memo, root);
        assert_eq!(out.len(), 1);

        let top = logical(&out[0]);
        assert_eq!(predicate(top), Some(&bc));
        let new_ab = top.child(0).unwrap();
        assert_eq!(predicate(new_ab), Some(&ab));
        assert_eq!(new_ab.output.len(), 2);
        // scan c was the third group created
        assert_eq!(top.children[1], PlanChild::Group(2));

        // same leaves, same conjuncts: lands in the root group
        let inserted = memo.insert_logical(top, Some(root)).unwrap();
        assert_eq!(inserted.group, root);
        assert!(inserted.is_new);
        assert_eq!(memo.group(root).logical_exprs.len(), 2);
    }

    #[test]
    fn test_refuses_to_filter_a_former_cross_product() {
        let ab = Expr::eq(col("a", 0), col("b", 1));
        let (memo, root) = right_deep(Some(ab), None);
        assert!(run(&memo, root).is_empty());
    }

    #[test]
    fn test_conjuncts_spanning_all_sides_stay_on_top() {
        let ac = Expr::eq(col("a", 0), col("c", 2));
        let bc = Expr::eq(col("b", 1), col("c", 2));
        let (memo, root) = right_deep(Some(ac.clone()), Some(bc.clone()));
        let out = run(&memo, root);
        let top = logical(&out[0]);
        assert_eq!(predicate(top.child(0).unwrap()), None);
        let Some(Expr::And(conjuncts)) = predicate(top) else {
            panic!("expected a conjunction on top");
        };
        assert_eq!(conjuncts.len(), 2);
        assert!(conjuncts.contains(&ac) && conjuncts.contains(&bc));
    }

    #[test]
    fn test_non_inner_joins_are_left_alone() {
        let inner = Arc::new(LogicalNode::join(JoinType::Inner, None, scan("b", 1), scan("c", 2)));
        let plan = LogicalNode::join(JoinType::Left, None, scan("a", 0), inner);
        let mut memo = Memo::new();
        let root = memo.insert_plan(&plan).unwrap();
        assert!(run(&memo, root).is_empty());
    }
}
