//! # Filter Pushdown
//!
//! Moves the conjuncts of movable filters as close to the data as their columns
//! allow: into scan predicates, into join predicates, below projections, sorts and
//! group keys. Conjuncts that cannot move stay in a filter at the lowest point they
//! reached.
//!
//! ## Rules
//!
//! - A pinned filter is a barrier: nothing passes through it and its own predicate
//!   never moves. Pushdown restarts below it.
//! - Only plain conjuncts move. A conjunct holding a subquery, a mark-join marker,
//!   an outer reference or an aggregate stays put.
//! - Inner joins take conjuncts spanning both inputs into their predicate, and hand
//!   one-sided conjuncts (pending or already in the predicate) to that side.
//! - Every other join type only forwards conjuncts on its left input from above.
//!   Conjuncts of its own predicate that read only the right input move into the
//!   right input.
//! - Limits and derived tables are barriers.

use qopt_core::expr::{and_all, Expr, JoinType, TableRefId};
use qopt_core::plan::{LogicalNode, LogicalOp, PlanChild, ScanSource};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

/// Push every movable filter in `node` down as far as it goes.
pub fn push_down_filters(node: &Arc<LogicalNode>) -> Arc<LogicalNode> {
    push(node, Vec::new())
}

/// Whether a conjunct may leave the filter it was written in.
pub fn is_pushable(conjunct: &Expr) -> bool {
    !conjunct.has_subquery() && !conjunct.has_marker() && !conjunct.has_outer_refs() && !conjunct.has_aggregate()
}

fn push(node: &Arc<LogicalNode>, pending: Vec<Expr>) -> Arc<LogicalNode> {
    let Some(child) = node.child(0) else {
        return match &node.op {
            LogicalOp::Scan {
                table_ref,
                source,
                predicate,
            } => push_into_scan(node, *table_ref, source, predicate.as_ref(), pending),
            _ => wrap(pending, Arc::clone(node)),
        };
    };
    match &node.op {
        LogicalOp::Filter { predicate, movable: true } => {
            let mut pending = pending;
            pending.extend(predicate.clone().into_conjuncts());
            push(child, pending)
        }
        LogicalOp::Filter { movable: false, .. } => {
            let below = push(child, Vec::new());
            wrap(pending, Arc::new(node.with_children(vec![PlanChild::Node(below)])))
        }
        LogicalOp::Join { join_type, predicate } => push_into_join(node, *join_type, predicate.as_ref(), pending),
        LogicalOp::Project { .. } | LogicalOp::Order { .. } => {
            let (down, stay): (Vec<Expr>, Vec<Expr>) = pending.into_iter().partition(is_pushable);
            let below = push(child, down);
            wrap(stay, Arc::new(node.with_children(vec![PlanChild::Node(below)])))
        }
        LogicalOp::Aggregate { group_by, .. } => {
            // a conjunct over group keys only filters whole groups
            let on_keys = |c: &Expr| {
                !group_by.is_empty()
                    && is_pushable(c)
                    && c.columns().iter().all(|col| group_by.contains(&Expr::Column((*col).clone())))
            };
            let (down, stay): (Vec<Expr>, Vec<Expr>) = pending.into_iter().partition(|c| on_keys(c));
            let below = push(child, down);
            wrap(stay, Arc::new(node.with_children(vec![PlanChild::Node(below)])))
        }
        LogicalOp::Limit { .. } | LogicalOp::FromQuery { .. } | LogicalOp::Scan { .. } => {
            let below = push(child, Vec::new());
            wrap(pending, Arc::new(node.with_children(vec![PlanChild::Node(below)])))
        }
    }
}

fn push_into_scan(
    node: &LogicalNode,
    table_ref: TableRefId,
    source: &ScanSource,
    existing: Option<&Expr>,
    pending: Vec<Expr>,
) -> Arc<LogicalNode> {
    let (mine, stay): (Vec<Expr>, Vec<Expr>) = pending
        .into_iter()
        .partition(|c| is_pushable(c) && c.tables().iter().all(|t| *t == table_ref));
    if mine.is_empty() {
        return wrap(stay, Arc::new(node.clone()));
    }
    trace!(table_ref, conjuncts = mine.len(), "pushed into scan");
    let predicate = and_all(existing.cloned().into_iter().chain(mine));
    let scan = LogicalNode::new(
        LogicalOp::Scan {
            table_ref,
            source: source.clone(),
            predicate,
        },
        vec![],
        node.output.clone(),
    );
    wrap(stay, Arc::new(scan))
}

fn push_into_join(node: &LogicalNode, join_type: JoinType, existing: Option<&Expr>, pending: Vec<Expr>) -> Arc<LogicalNode> {
    let (Some(left), Some(right)) = (node.child(0), node.child(1)) else {
        return wrap(pending, Arc::new(node.clone()));
    };
    let left_tables = left.tables();
    let right_tables = right.tables();
    let within = |c: &Expr, side: &BTreeSet<TableRefId>| c.tables().is_subset(side);

    let mut to_left = Vec::new();
    let mut to_right = Vec::new();
    let mut on = Vec::new();
    let mut stay = Vec::new();

    for c in pending {
        if !is_pushable(&c) {
            stay.push(c);
        } else if within(&c, &left_tables) {
            to_left.push(c);
        } else if join_type == JoinType::Inner && within(&c, &right_tables) {
            to_right.push(c);
        } else if join_type == JoinType::Inner {
            on.push(c);
        } else {
            stay.push(c);
        }
    }
    for c in existing.map(|p| p.clone().into_conjuncts()).unwrap_or_default() {
        let one_sided = is_pushable(&c) && !c.tables().is_empty();
        if one_sided && join_type == JoinType::Inner && within(&c, &left_tables) {
            to_left.push(c);
        } else if one_sided && within(&c, &right_tables) {
            to_right.push(c);
        } else {
            on.push(c);
        }
    }

    let left = push(left, to_left);
    let right = push(right, to_right);
    let join = LogicalNode::new(
        LogicalOp::Join {
            join_type,
            predicate: and_all(on),
        },
        vec![PlanChild::Node(left), PlanChild::Node(right)],
        node.output.clone(),
    );
    wrap(stay, Arc::new(join))
}

fn wrap(conjuncts: Vec<Expr>, node: Arc<LogicalNode>) -> Arc<LogicalNode> {
    match and_all(conjuncts) {
        Some(predicate) => Arc::new(LogicalNode::filter(predicate, node)),
        None => node,
    }
}
