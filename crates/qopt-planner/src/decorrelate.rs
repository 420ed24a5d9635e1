//! # Subquery Decorrelation
//!
//! Rewrites correlated subqueries in filters into joins against the subquery's own
//! plan, so the memo and the join-order resolvers can see them.
//!
//! ## Rewrites
//!
//! | Filter conjunct                    | Becomes                                             |
//! |------------------------------------|-----------------------------------------------------|
//! | `EXISTS (q)`                       | semi join on the correlation predicate              |
//! | `NOT EXISTS (q)`                   | anti join on the correlation predicate              |
//! | `x IN (q)`                         | semi join on `x = q.out AND correlation`            |
//! | `... (scalar q) ...`               | single join, pinned filter on `q.out` above it       |
//! | `EXISTS` / `IN` under `OR` / `NOT` | mark join, pinned filter on the marker above it      |
//!
//! The correlation predicate is pulled out of the subquery's filters. Columns it
//! reads from the enclosing query turn into ordinary column references, since after
//! the rewrite those columns come from the join's left input.
//!
//! A correlated scalar subquery over a global aggregate is grouped by the inner side
//! of its equality correlation before the single join. `COUNT` is not rewritten
//! that way: an empty group yields no row instead of `0`.
//!
//! ## What Stays Correlated
//!
//! Anything the pass cannot prove safe is left in place for nested evaluation and
//! reported in [`DecorrelationReport::unsupported`]: `NOT IN`, `LIMIT` inside the
//! subquery (other than under `EXISTS`), correlation below a join or a grouped
//! aggregate, correlation reaching past the enclosing query, and scalar subqueries
//! whose plan already contains a mark join.
//!
//! Non-correlated subqueries are never touched. Running the pass on its own output
//! finds nothing more to rewrite.

use crate::builder::LogicalPlan;
use qopt_core::expr::{and_all, AggFunc, ColumnRef, Expr, JoinType, SubqueryExpr, SubqueryId, SubqueryKind, UnaryOp};
use qopt_core::plan::{LogicalNode, LogicalOp, PlanChild};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// What one decorrelation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecorrelationReport {
    pub semi_joins: usize,
    pub anti_joins: usize,
    pub single_joins: usize,
    pub mark_joins: usize,
    /// Correlated subqueries left for nested evaluation, with the reason.
    pub unsupported: Vec<(SubqueryId, &'static str)>,
}

impl DecorrelationReport {
    pub fn rewrites(&self) -> usize {
        self.semi_joins + self.anti_joins + self.single_joins + self.mark_joins
    }

    fn record(&mut self, id: SubqueryId, join_type: JoinType) {
        match join_type {
            JoinType::Semi => self.semi_joins += 1,
            JoinType::Anti => self.anti_joins += 1,
            JoinType::Single => self.single_joins += 1,
            JoinType::Mark(_) => self.mark_joins += 1,
            JoinType::Inner | JoinType::Left => {}
        }
        debug!(subquery = id, join = join_type.name(), "decorrelated subquery");
    }
}

/// Decorrelate every plan of `plan`. Subqueries turned into joins are dropped from
/// the returned plan's subquery map.
pub fn decorrelate(plan: &LogicalPlan) -> (LogicalPlan, DecorrelationReport) {
    let mut pass = Decorrelator {
        subqueries: plan.subqueries.clone(),
        inlined: BTreeSet::new(),
        report: DecorrelationReport::default(),
    };
    // nested subqueries have larger ids than the ones enclosing them
    let ids: Vec<SubqueryId> = plan.subqueries.keys().rev().copied().collect();
    for id in ids {
        if let Some(sub) = pass.subqueries.get(&id).cloned() {
            let rewritten = pass.rewrite(&sub);
            pass.subqueries.insert(id, rewritten);
        }
    }
    let root = pass.rewrite(&plan.root);
    for id in &pass.inlined {
        pass.subqueries.remove(id);
    }
    (
        LogicalPlan {
            root,
            subqueries: pass.subqueries,
        },
        pass.report,
    )
}

/// Ids of correlated subquery expressions still present anywhere in `plan`.
pub fn remaining_correlated(plan: &LogicalPlan) -> Vec<SubqueryId> {
    let mut out = BTreeSet::new();
    for node in std::iter::once(&plan.root).chain(plan.subqueries.values()) {
        node.visit(&mut |n| {
            for e in n.op.exprs() {
                out.extend(e.subqueries().iter().filter(|sq| sq.correlated).filter_map(|sq| sq.id));
            }
        });
    }
    out.into_iter().collect()
}

/// How the subquery's result is consumed; decides what the pull-up may strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Exists,
    In,
    Scalar,
}

/// A subquery plan with its correlation conjuncts lifted out.
struct Pulled {
    plan: Arc<LogicalNode>,
    correlation: Vec<Expr>,
}

/// A join that replaces one subquery.
struct Rewrite {
    id: SubqueryId,
    join_type: JoinType,
    plan: Arc<LogicalNode>,
}

type Unsupported = &'static str;

struct Decorrelator {
    subqueries: BTreeMap<SubqueryId, Arc<LogicalNode>>,
    inlined: BTreeSet<SubqueryId>,
    report: DecorrelationReport,
}

impl Decorrelator {
    fn rewrite(&mut self, node: &Arc<LogicalNode>) -> Arc<LogicalNode> {
        let mut changed = false;
        let children: Vec<PlanChild<LogicalNode>> = node
            .children
            .iter()
            .map(|c| match c {
                PlanChild::Node(n) => {
                    let r = self.rewrite(n);
                    changed |= !Arc::ptr_eq(&r, n);
                    PlanChild::Node(r)
                }
                PlanChild::Group(g) => PlanChild::Group(*g),
            })
            .collect();
        let node = if changed {
            Arc::new(node.with_children(children))
        } else {
            Arc::clone(node)
        };

        let (predicate, movable) = match &node.op {
            LogicalOp::Filter { predicate, movable } if predicate.has_correlated_subquery() => {
                (predicate.clone(), *movable)
            }
            _ => return node,
        };
        let Some(child) = node.child(0).cloned() else {
            return node;
        };
        self.rewrite_filter(predicate, movable, child).unwrap_or(node)
    }

    /// Returns `None` when no conjunct could be rewritten.
    fn rewrite_filter(&mut self, predicate: Expr, movable: bool, child: Arc<LogicalNode>) -> Option<Arc<LogicalNode>> {
        let mut current = child;
        let mut residual = Vec::new();
        let mut changed = false;
        for conjunct in predicate.into_conjuncts() {
            if !conjunct.has_correlated_subquery() {
                residual.push(conjunct);
                continue;
            }
            match self.rewrite_conjunct(&conjunct, &current) {
                Ok((plan, rewrites)) => {
                    for r in rewrites {
                        self.report.record(r.id, r.join_type);
                        self.inlined.insert(r.id);
                    }
                    current = plan;
                    changed = true;
                }
                Err((id, reason)) => {
                    debug!(subquery = id, reason, "subquery left correlated");
                    self.report.unsupported.push((id, reason));
                    residual.push(conjunct);
                }
            }
        }
        if !changed {
            return None;
        }
        Some(match and_all(residual) {
            Some(rest) if movable => Arc::new(LogicalNode::filter(rest, current)),
            Some(rest) => Arc::new(LogicalNode::pinned_filter(rest, current)),
            None => current,
        })
    }

    /// Rewrite one conjunct holding correlated subqueries on top of `left`.
    fn rewrite_conjunct(
        &self,
        conjunct: &Expr,
        left: &Arc<LogicalNode>,
    ) -> Result<(Arc<LogicalNode>, Vec<Rewrite>), (SubqueryId, Unsupported)> {
        let direct = match conjunct {
            Expr::Subquery(sq) => Some((sq, false)),
            Expr::UnaryOp {
                op: UnaryOp::Not,
                operand,
            } => match operand.as_ref() {
                Expr::Subquery(sq @ SubqueryExpr {
                    kind: SubqueryKind::Exists { .. },
                    ..
                }) => Some((sq, true)),
                _ => None,
            },
            _ => None,
        };
        match direct {
            Some((sq, flipped)) if sq.correlated => match sq.kind {
                SubqueryKind::Exists { negated } => {
                    let r = self.exists_join(sq, negated != flipped, left)?;
                    Ok((Arc::clone(&r.plan), vec![r]))
                }
                SubqueryKind::In { ref lhs, negated: false } => {
                    let r = self.in_join(sq, lhs, left)?;
                    Ok((Arc::clone(&r.plan), vec![r]))
                }
                SubqueryKind::In { negated: true, .. } => Err((sq.id.unwrap_or_default(), "NOT IN is not decorrelated")),
                SubqueryKind::Scalar => self.nested(conjunct, left),
            },
            _ => self.nested(conjunct, left),
        }
    }

    /// Single and mark joins for every correlated subquery of `conjunct`, then a
    /// pinned filter evaluating the rewritten conjunct above them.
    fn nested(
        &self,
        conjunct: &Expr,
        left: &Arc<LogicalNode>,
    ) -> Result<(Arc<LogicalNode>, Vec<Rewrite>), (SubqueryId, Unsupported)> {
        if let Some(id) = negated_membership(conjunct) {
            return Err((id, "NOT IN is not decorrelated"));
        }
        let mut plan = Arc::clone(left);
        let mut rewritten = conjunct.clone();
        let mut rewrites = Vec::new();
        let subqueries: Vec<SubqueryExpr> = conjunct
            .subqueries()
            .into_iter()
            .filter(|sq| sq.correlated)
            .cloned()
            .collect();
        for sq in subqueries {
            let id = sq.id.unwrap_or_default();
            let (r, replacement) = match sq.kind {
                SubqueryKind::Scalar => self.single_join(&sq, &plan)?,
                SubqueryKind::Exists { negated } => {
                    let r = self.mark_join(&sq, None, &plan)?;
                    let marker = if negated {
                        Expr::not(Expr::Marker(id))
                    } else {
                        Expr::Marker(id)
                    };
                    (r, marker)
                }
                SubqueryKind::In { ref lhs, negated: false } => {
                    (self.mark_join(&sq, Some(lhs.as_ref()), &plan)?, Expr::Marker(id))
                }
                SubqueryKind::In { negated: true, .. } => return Err((id, "NOT IN is not decorrelated")),
            };
            rewritten = rewritten.transform(&mut |e| match e {
                Expr::Subquery(ref s) if s.id == Some(id) => replacement.clone(),
                other => other,
            });
            plan = Arc::clone(&r.plan);
            rewrites.push(r);
        }
        Ok((Arc::new(LogicalNode::pinned_filter(rewritten, plan)), rewrites))
    }

    fn exists_join(
        &self,
        sq: &SubqueryExpr,
        negated: bool,
        left: &Arc<LogicalNode>,
    ) -> Result<Rewrite, (SubqueryId, Unsupported)> {
        let id = sq.id.unwrap_or_default();
        let pulled = self.pull(sq, Mode::Exists).map_err(|r| (id, r))?;
        let predicate = correlation_predicate(pulled.correlation, left).map_err(|r| (id, r))?;
        let join_type = if negated { JoinType::Anti } else { JoinType::Semi };
        Ok(Rewrite {
            id,
            join_type,
            plan: Arc::new(LogicalNode::join(join_type, predicate, Arc::clone(left), pulled.plan)),
        })
    }

    fn in_join(&self, sq: &SubqueryExpr, lhs: &Expr, left: &Arc<LogicalNode>) -> Result<Rewrite, (SubqueryId, Unsupported)> {
        let id = sq.id.unwrap_or_default();
        let pulled = self.pull(sq, Mode::In).map_err(|r| (id, r))?;
        let predicate = membership_predicate(lhs, &pulled, left).map_err(|r| (id, r))?;
        Ok(Rewrite {
            id,
            join_type: JoinType::Semi,
            plan: Arc::new(LogicalNode::join(JoinType::Semi, predicate, Arc::clone(left), pulled.plan)),
        })
    }

    fn mark_join(
        &self,
        sq: &SubqueryExpr,
        lhs: Option<&Expr>,
        left: &Arc<LogicalNode>,
    ) -> Result<Rewrite, (SubqueryId, Unsupported)> {
        let id = sq.id.unwrap_or_default();
        let mode = if lhs.is_some() { Mode::In } else { Mode::Exists };
        let pulled = self.pull(sq, mode).map_err(|r| (id, r))?;
        let predicate = match lhs {
            Some(lhs) => membership_predicate(lhs, &pulled, left),
            None => correlation_predicate(pulled.correlation, left),
        }
        .map_err(|r| (id, r))?;
        let join_type = JoinType::Mark(id);
        Ok(Rewrite {
            id,
            join_type,
            plan: Arc::new(LogicalNode::join(join_type, predicate, Arc::clone(left), pulled.plan)),
        })
    }

    /// Single join plus the expression that now carries the subquery's value.
    fn single_join(&self, sq: &SubqueryExpr, left: &Arc<LogicalNode>) -> Result<(Rewrite, Expr), (SubqueryId, Unsupported)> {
        let id = sq.id.unwrap_or_default();
        let inner = self.subqueries.get(&id).ok_or((id, "no plan for subquery"))?;
        if contains_mark_join(inner) {
            return Err((id, "scalar subquery over a mark join"));
        }
        let pulled = self.pull(sq, Mode::Scalar).map_err(|r| (id, r))?;
        let value = pulled
            .plan
            .output
            .first()
            .cloned()
            .ok_or((id, "scalar subquery without output"))?;
        let predicate = correlation_predicate(pulled.correlation, left).map_err(|r| (id, r))?;
        let plan = Arc::new(LogicalNode::join(JoinType::Single, predicate, Arc::clone(left), pulled.plan));
        Ok((
            Rewrite {
                id,
                join_type: JoinType::Single,
                plan,
            },
            value,
        ))
    }

    fn pull(&self, sq: &SubqueryExpr, mode: Mode) -> Result<Pulled, Unsupported> {
        let id = sq.id.ok_or("unbound subquery")?;
        let mut inner = Arc::clone(self.subqueries.get(&id).ok_or("no plan for subquery")?);
        if mode == Mode::Exists {
            // row existence does not depend on projection or order
            loop {
                let next = match inner.op {
                    LogicalOp::Project { .. } | LogicalOp::Order { .. } => inner.child(0).cloned(),
                    LogicalOp::Limit { count: 0 } => return Err("LIMIT 0 inside EXISTS"),
                    LogicalOp::Limit { .. } => inner.child(0).cloned(),
                    _ => None,
                };
                match next {
                    Some(child) => inner = child,
                    None => break,
                }
            }
        }
        let mut correlation = Vec::new();
        let plan = pull_correlation(&inner, mode, &mut correlation)?;
        if is_correlated(&plan) {
            return Err("correlation below a join or derived table");
        }
        Ok(Pulled { plan, correlation })
    }
}

/// Lift conjuncts with outer references out of `node`'s filter spine.
fn pull_correlation(node: &Arc<LogicalNode>, mode: Mode, out: &mut Vec<Expr>) -> Result<Arc<LogicalNode>, Unsupported> {
    let child = || node.child(0).ok_or("detached plan node");
    match &node.op {
        LogicalOp::Filter { predicate, movable } => {
            let below = pull_correlation(child()?, mode, out)?;
            let (correlated, local): (Vec<Expr>, Vec<Expr>) =
                predicate.clone().into_conjuncts().into_iter().partition(Expr::has_outer_refs);
            out.extend(correlated);
            Ok(match and_all(local) {
                Some(p) => Arc::new(LogicalNode::new(
                    LogicalOp::Filter {
                        predicate: p,
                        movable: *movable,
                    },
                    vec![PlanChild::Node(Arc::clone(&below))],
                    below.output.clone(),
                )),
                None => below,
            })
        }
        LogicalOp::Project { exprs, aliases } => {
            let below = pull_correlation(child()?, mode, out)?;
            let mut exprs = exprs.clone();
            let mut aliases = aliases.clone();
            for col in local_columns(out) {
                let e = Expr::Column(col);
                if !exprs.contains(&e) {
                    exprs.push(e);
                    aliases.push(None);
                }
            }
            Ok(Arc::new(LogicalNode::project(exprs, aliases, below)))
        }
        LogicalOp::Order { keys } => Ok(Arc::new(LogicalNode::order(keys.clone(), pull_correlation(child()?, mode, out)?))),
        LogicalOp::Limit { .. } => Err("LIMIT inside a correlated subquery"),
        LogicalOp::Aggregate { group_by, aggregates } => {
            let before = out.len();
            let below = pull_correlation(child()?, mode, out)?;
            if out.len() == before {
                return Ok(Arc::clone(node));
            }
            if mode != Mode::Scalar {
                return Err("correlation below an aggregate");
            }
            if !group_by.is_empty() {
                return Err("correlation below a grouped aggregate");
            }
            if aggregates.iter().any(|a| a.func == AggFunc::Count) {
                return Err("COUNT over a correlated subquery");
            }
            let mut keys: Vec<Expr> = Vec::new();
            for conjunct in &out[before..] {
                let (l, r) = conjunct
                    .as_column_equality()
                    .ok_or("non-equality correlation below an aggregate")?;
                let key = match (l.is_outer(), r.is_outer()) {
                    (true, false) => r,
                    (false, true) => l,
                    _ => return Err("non-equality correlation below an aggregate"),
                };
                let key = Expr::Column(key.clone());
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            Ok(Arc::new(LogicalNode::aggregate(keys, aggregates.clone(), below)))
        }
        _ => Ok(Arc::clone(node)),
    }
}

/// Non-outer columns read by the pulled conjuncts.
fn local_columns(conjuncts: &[Expr]) -> Vec<ColumnRef> {
    let mut cols: Vec<ColumnRef> = Vec::new();
    for c in conjuncts.iter().flat_map(Expr::columns) {
        if !c.is_outer() && !cols.contains(c) {
            cols.push(c.clone());
        }
    }
    cols
}

/// Whether any operator in `node` still reads an enclosing query.
fn is_correlated(node: &LogicalNode) -> bool {
    let mut found = false;
    node.visit(&mut |n| {
        found |= n
            .op
            .exprs()
            .iter()
            .any(|e| e.has_outer_refs() || e.has_correlated_subquery());
    });
    found
}

fn contains_mark_join(node: &LogicalNode) -> bool {
    let mut found = false;
    node.visit(&mut |n| found |= matches!(n.op.join_type(), Some(JoinType::Mark(_))));
    found
}

/// Join predicate from pulled conjuncts. Every outer reference must come from
/// `left`; those references become local.
fn correlation_predicate(correlation: Vec<Expr>, left: &LogicalNode) -> Result<Option<Expr>, Unsupported> {
    let left_tables = left.tables();
    let reaches_past = correlation
        .iter()
        .flat_map(Expr::outer_refs)
        .any(|c| c.table_ref().is_some_and(|t| !left_tables.contains(&t)));
    if reaches_past {
        return Err("correlation reaches past the enclosing query");
    }
    Ok(and_all(correlation.into_iter().map(|c| c.localize_outer_refs(&left_tables))))
}

/// `lhs = inner.out AND correlation`.
fn membership_predicate(lhs: &Expr, pulled: &Pulled, left: &LogicalNode) -> Result<Option<Expr>, Unsupported> {
    let out = pulled.plan.output.first().cloned().ok_or("IN subquery without output")?;
    let correlation = correlation_predicate(pulled.correlation.clone(), left)?;
    Ok(and_all(std::iter::once(Expr::eq(lhs.clone(), out)).chain(correlation)))
}

/// A correlated `IN` under a `NOT`. A mark join's marker cannot carry the
/// unknown result `NOT IN` needs when the subquery yields a NULL.
fn negated_membership(conjunct: &Expr) -> Option<SubqueryId> {
    let mut found = None;
    conjunct.visit(&mut |e| {
        if let (None, Expr::UnaryOp { op: UnaryOp::Not, operand }) = (found, e) {
            found = operand
                .subqueries()
                .into_iter()
                .find(|sq| sq.correlated && matches!(sq.kind, SubqueryKind::In { .. }))
                .map(|sq| sq.id.unwrap_or_default());
        }
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::BindContext;
    use crate::builder::PlanBuilder;
    use qopt_core::ast::SelectStmt;
    use qopt_core::catalog::{ColumnDef, InMemoryCatalog};
    use qopt_core::expr::{AggExpr, BinaryOp};
    use qopt_core::plan::LogicalOpKind;
    use qopt_core::value::DataType;

    fn catalog() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        for t in ["a", "b"] {
            let cols = (1..=4).map(|i| ColumnDef::new(format!("{t}{i}"), DataType::Int)).collect();
            catalog.create_table(t, cols).unwrap();
        }
        catalog
    }

    fn plan(stmt: &SelectStmt) -> LogicalPlan {
        let catalog = catalog();
        let mut ctx = BindContext::new(&catalog);
        let bound = ctx.bind_statement(stmt).unwrap();
        PlanBuilder::new(&ctx).build(&bound).unwrap()
    }

    fn b_correlated(select: Vec<Expr>) -> SelectStmt {
        SelectStmt::select(select)
            .from_tables(&["b"])
            .filter(Expr::eq(Expr::col("b", "b1"), Expr::col("a", "a1")))
    }

    fn joins(node: &LogicalNode) -> Vec<JoinType> {
        let mut out = Vec::new();
        node.visit(&mut |n| out.extend(n.op.join_type()));
        out
    }

    fn filters(node: &LogicalNode) -> Vec<(Expr, bool)> {
        let mut out = Vec::new();
        node.visit(&mut |n| {
            if let LogicalOp::Filter { predicate, movable } = &n.op {
                out.push((predicate.clone(), *movable));
            }
        });
        out
    }

    #[test]
    fn test_exists_becomes_semi_join() {
        let stmt = SelectStmt::star().from_tables(&["a"]).filter(Expr::exists(b_correlated(vec![Expr::lit(1)])));
        let (out, report) = decorrelate(&plan(&stmt));

        assert_eq!(report.semi_joins, 1);
        assert_eq!(joins(&out.root), vec![JoinType::Semi]);
        assert!(out.subqueries.is_empty());
        assert!(remaining_correlated(&out).is_empty());

        let join = out.root.child(0).unwrap();
        let LogicalOp::Join { predicate: Some(ref pred), .. } = join.op else {
            panic!("expected a join predicate");
        };
        assert!(!pred.has_outer_refs());
        assert_eq!(pred.tables(), BTreeSet::from([0, 1]));
        // the inner projection is gone: semi join straight over scan(b)
        assert_eq!(join.child(1).unwrap().kind(), LogicalOpKind::Scan);
    }

    #[test]
    fn test_not_exists_becomes_anti_join() {
        let inner = b_correlated(vec![Expr::lit(1)]);
        for conjunct in [Expr::not_exists(inner.clone()), Expr::not(Expr::exists(inner))] {
            let stmt = SelectStmt::star().from_tables(&["a"]).filter(conjunct);
            let (out, report) = decorrelate(&plan(&stmt));
            assert_eq!(report.anti_joins, 1);
            assert_eq!(joins(&out.root), vec![JoinType::Anti]);
        }
    }

    #[test]
    fn test_correlated_in_joins_on_membership_and_correlation() {
        let stmt = SelectStmt::star()
            .from_tables(&["a"])
            .filter(Expr::in_subquery(Expr::unqualified("a2"), b_correlated(vec![Expr::unqualified("b2")])));
        let (out, report) = decorrelate(&plan(&stmt));
        assert_eq!(report.semi_joins, 1);
        let join = out.root.child(0).unwrap();
        let LogicalOp::Join { predicate: Some(Expr::And(ref conjuncts)), .. } = join.op else {
            panic!("expected two join conjuncts");
        };
        assert_eq!(conjuncts.len(), 2);
        // b1 is carried through the inner projection for the join
        assert_eq!(join.child(1).unwrap().output.len(), 2);
    }

    #[test]
    fn test_residual_outer_predicate_stays_above() {
        let local = Expr::binary(BinaryOp::Gt, Expr::unqualified("a3"), Expr::lit(5));
        let stmt = SelectStmt::star()
            .from_tables(&["a"])
            .filter(Expr::And(vec![Expr::exists(b_correlated(vec![Expr::lit(1)])), local]));
        let (out, _) = decorrelate(&plan(&stmt));
        let top = out.root.child(0).unwrap();
        let LogicalOp::Filter { ref predicate, movable: true } = top.op else {
            panic!("expected a movable filter, got {}", top.op);
        };
        assert_eq!(predicate.to_string(), "a.a3 > 5");
        assert_eq!(top.child(0).unwrap().op.join_type(), Some(JoinType::Semi));
    }

    #[test]
    fn test_scalar_aggregate_becomes_grouped_single_join() {
        let max = Expr::Aggregate(AggExpr::new(AggFunc::Max, Expr::unqualified("b2")));
        let stmt = SelectStmt::star().from_tables(&["a"]).filter(Expr::eq(
            Expr::unqualified("a2"),
            Expr::scalar_subquery(b_correlated(vec![max])),
        ));
        let (out, report) = decorrelate(&plan(&stmt));
        assert_eq!(report.single_joins, 1);
        assert_eq!(joins(&out.root), vec![JoinType::Single]);

        let pinned = filters(&out.root);
        assert_eq!(pinned.len(), 1);
        assert!(!pinned[0].1, "the comparison must stay above the single join");
        assert!(!pinned[0].0.has_subquery());
        assert!(pinned[0].0.has_aggregate());

        let mut group_keys = Vec::new();
        out.root.visit(&mut |n| {
            if let LogicalOp::Aggregate { group_by, .. } = &n.op {
                group_keys = group_by.clone();
            }
        });
        assert_eq!(group_keys.len(), 1);
        assert_eq!(group_keys[0].to_string(), "b.b1");
    }

    #[test]
    fn test_scalar_count_stays_correlated() {
        let count = Expr::Aggregate(AggExpr::count_star());
        let stmt = SelectStmt::star().from_tables(&["a"]).filter(Expr::eq(
            Expr::unqualified("a2"),
            Expr::scalar_subquery(b_correlated(vec![count])),
        ));
        let (out, report) = decorrelate(&plan(&stmt));
        assert_eq!(report.rewrites(), 0);
        assert_eq!(report.unsupported, vec![(0, "COUNT over a correlated subquery")]);
        assert_eq!(remaining_correlated(&out), vec![0]);
        assert!(out.subqueries.contains_key(&0));
    }

    #[test]
    fn test_negated_in_stays_correlated_in_both_forms() {
        let lhs = || Expr::unqualified("a2");
        let inner = || b_correlated(vec![Expr::unqualified("b2")]);
        let local = Expr::eq(Expr::unqualified("a4"), Expr::lit(0));
        for conjunct in [
            Expr::not_in_subquery(lhs(), inner()),
            Expr::not(Expr::in_subquery(lhs(), inner())),
            Expr::Or(vec![Expr::not(Expr::in_subquery(lhs(), inner())), local]),
        ] {
            let stmt = SelectStmt::star().from_tables(&["a"]).filter(conjunct);
            let (out, report) = decorrelate(&plan(&stmt));
            assert_eq!(report.rewrites(), 0);
            assert_eq!(report.unsupported, vec![(0, "NOT IN is not decorrelated")]);
            assert!(joins(&out.root).is_empty());
            assert_eq!(remaining_correlated(&out), vec![0]);
        }
    }

    #[test]
    fn test_exists_under_or_becomes_mark_join() {
        let stmt = SelectStmt::star().from_tables(&["a"]).filter(Expr::Or(vec![
            Expr::exists(b_correlated(vec![Expr::lit(1)])),
            Expr::eq(Expr::unqualified("a4"), Expr::lit(0)),
        ]));
        let (out, report) = decorrelate(&plan(&stmt));
        assert_eq!(report.mark_joins, 1);
        assert_eq!(joins(&out.root), vec![JoinType::Mark(0)]);
        let pinned = filters(&out.root);
        assert_eq!(pinned.len(), 1);
        assert!(pinned[0].0.has_marker());
        assert!(!pinned[0].1);
    }

    #[test]
    fn test_second_pass_finds_nothing() {
        let stmt = SelectStmt::star().from_tables(&["a"]).filter(Expr::And(vec![
            Expr::exists(b_correlated(vec![Expr::lit(1)])),
            Expr::not_exists(b_correlated(vec![Expr::lit(1)])),
        ]));
        let (once, first) = decorrelate(&plan(&stmt));
        assert_eq!(first.rewrites(), 2);
        let (twice, second) = decorrelate(&once);
        assert_eq!(second.rewrites(), 0);
        assert_eq!(twice.root.explain(), once.root.explain());
        assert!(remaining_correlated(&twice).is_empty());
    }

    #[test]
    fn test_uncorrelated_subquery_is_untouched() {
        let inner = SelectStmt::select(vec![Expr::unqualified("b1")]).from_tables(&["b"]);
        let stmt = SelectStmt::star()
            .from_tables(&["a"])
            .filter(Expr::in_subquery(Expr::unqualified("a1"), inner));
        let original = plan(&stmt);
        let (out, report) = decorrelate(&original);
        assert_eq!(report, DecorrelationReport::default());
        assert!(Arc::ptr_eq(&out.root, &original.root));
        assert_eq!(out.subqueries.len(), 1);
    }
}
