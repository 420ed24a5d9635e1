//! # Logical Plan Builder
//!
//! Turns a [`BoundSelect`] into a tree of [`LogicalNode`]s. The shape is fixed:
//!
//! ```text
//! Limit
//!   Project
//!     Order
//!       Filter (HAVING)
//!         Aggregate
//!           Filter (WHERE)
//!             FROM items, cross-joined left to right
//! ```
//!
//! Nodes that have nothing to do are left out. Subquery expressions stay inside the
//! expressions that mention them; each subquery statement is planned on its own and
//! kept in [`LogicalPlan::subqueries`] until decorrelation either inlines it as a
//! join or leaves it for nested evaluation.

use crate::binder::{BindContext, BoundFrom, BoundSelect};
use qopt_core::error::{BindError, Error, OptimizeError};
use qopt_core::expr::{AggExpr, Expr, JoinType, SubqueryId, TableRefId};
use qopt_core::plan::LogicalNode;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A statement's logical plan plus the plans of its nested subqueries.
#[derive(Debug, Clone)]
pub struct LogicalPlan {
    pub root: Arc<LogicalNode>,
    pub subqueries: BTreeMap<SubqueryId, Arc<LogicalNode>>,
}

impl LogicalPlan {
    /// Root plan followed by every nested subquery plan.
    pub fn explain(&self) -> String {
        let mut out = self.root.explain();
        for (id, plan) in &self.subqueries {
            out.push_str(&format!("subquery {id}:\n"));
            for line in plan.explain().lines() {
                out.push_str("  ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

pub struct PlanBuilder<'c, 'a> {
    ctx: &'c BindContext<'a>,
}

impl<'c, 'a> PlanBuilder<'c, 'a> {
    pub fn new(ctx: &'c BindContext<'a>) -> Self {
        Self { ctx }
    }

    /// Plan the statement and every subquery the binder recorded.
    pub fn build(&self, select: &BoundSelect) -> Result<LogicalPlan, Error> {
        let root = self.build_select(select)?;
        let subqueries = self
            .ctx
            .subqueries()
            .iter()
            .map(|(id, sq)| Ok((*id, self.build_select(&sq.select)?)))
            .collect::<Result<BTreeMap<_, _>, Error>>()?;
        debug!(nodes = count_nodes(&root), subqueries = subqueries.len(), "built logical plan");
        Ok(LogicalPlan { root, subqueries })
    }

    pub fn build_select(&self, select: &BoundSelect) -> Result<Arc<LogicalNode>, Error> {
        let mut items = select.from.iter();
        let Some(first) = items.next() else {
            return Err(BindError::EmptyFrom.into());
        };
        let mut plan = self.build_from(first)?;
        for item in items {
            let right = self.build_from(item)?;
            plan = Arc::new(LogicalNode::join(JoinType::Inner, None, plan, right));
        }

        if let Some(ref pred) = select.selection {
            plan = Arc::new(LogicalNode::filter(pred.clone(), plan));
        }

        if select.is_aggregate() {
            let mut aggregates: Vec<AggExpr> = Vec::new();
            let having = select.having.iter();
            let order = select.order_by.iter().map(|k| &k.expr);
            for expr in select.projection.iter().chain(having).chain(order) {
                for agg in expr.aggregates() {
                    if !aggregates.contains(agg) {
                        aggregates.push(agg.clone());
                    }
                }
            }
            plan = Arc::new(LogicalNode::aggregate(select.group_by.clone(), aggregates, plan));
            if let Some(ref having) = select.having {
                plan = Arc::new(LogicalNode::filter(having.clone(), plan));
            }
        }

        if !select.order_by.is_empty() {
            plan = Arc::new(LogicalNode::order(select.order_by.clone(), plan));
        }
        plan = Arc::new(LogicalNode::project(
            select.projection.clone(),
            select.aliases.clone(),
            plan,
        ));
        if let Some(count) = select.limit {
            plan = Arc::new(LogicalNode::limit(count, plan));
        }
        Ok(plan)
    }

    fn build_from(&self, from: &BoundFrom) -> Result<Arc<LogicalNode>, Error> {
        match from {
            BoundFrom::Scan { table_ref, source } => {
                let output = self.columns(*table_ref)?;
                Ok(Arc::new(LogicalNode::scan(*table_ref, source.clone(), output)))
            }
            BoundFrom::Derived { table_ref, query } => {
                let inner = self.build_select(query)?;
                let output = self.columns(*table_ref)?;
                Ok(Arc::new(LogicalNode::from_query(*table_ref, output, inner)))
            }
            BoundFrom::Join {
                left,
                right,
                join_type,
                on,
                ..
            } => {
                let left = self.build_from(left)?;
                let right = self.build_from(right)?;
                Ok(Arc::new(LogicalNode::join(*join_type, on.clone(), left, right)))
            }
        }
    }

    fn columns(&self, table_ref: TableRefId) -> Result<Vec<Expr>, Error> {
        let info = self
            .ctx
            .tables()
            .get(table_ref)
            .ok_or(OptimizeError::UnknownTableRef(table_ref))?;
        Ok(info.column_refs().into_iter().map(Expr::Column).collect())
    }
}

fn count_nodes(node: &LogicalNode) -> usize {
    let mut n = 0;
    node.visit(&mut |_| n += 1);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use qopt_core::ast::{FromItem, SelectStmt};
    use qopt_core::catalog::{ColumnDef, InMemoryCatalog};
    use qopt_core::expr::{AggFunc, ColumnRef};
    use qopt_core::plan::{LogicalOp, LogicalOpKind};
    use qopt_core::value::DataType;

    fn catalog() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::new();
        for t in ["a", "b", "c"] {
            let cols = (1..=3).map(|i| ColumnDef::new(format!("{t}{i}"), DataType::Int)).collect();
            catalog.create_table(t, cols).unwrap();
        }
        catalog
    }

    fn plan(catalog: &InMemoryCatalog, stmt: &SelectStmt) -> LogicalPlan {
        let mut ctx = BindContext::new(catalog);
        let bound = ctx.bind_statement(stmt).unwrap();
        PlanBuilder::new(&ctx).build(&bound).unwrap()
    }

    #[test]
    fn test_from_list_becomes_cross_joins() {
        let catalog = catalog();
        let stmt = SelectStmt::star()
            .from_tables(&["a", "b", "c"])
            .filter(Expr::eq(Expr::unqualified("a1"), Expr::unqualified("b1")));
        let plan = plan(&catalog, &stmt);

        assert_eq!(plan.root.kind(), LogicalOpKind::Project);
        let filter = plan.root.child(0).unwrap();
        assert_eq!(filter.kind(), LogicalOpKind::Filter);
        let top_join = filter.child(0).unwrap();
        assert_eq!(top_join.op, LogicalOp::Join { join_type: JoinType::Inner, predicate: None });
        assert_eq!(top_join.output.len(), 9);
        assert_eq!(plan.root.count(LogicalOpKind::Scan), 3);
        assert!(plan.subqueries.is_empty());
    }

    #[test]
    fn test_aggregate_collects_every_call_once() {
        let catalog = catalog();
        let max = Expr::Aggregate(AggExpr::new(AggFunc::Max, Expr::unqualified("a2")));
        let stmt = SelectStmt::select(vec![Expr::unqualified("a1"), max.clone()])
            .from_tables(&["a"])
            .group_by(vec![Expr::unqualified("a1")])
            .having(Expr::binary(qopt_core::expr::BinaryOp::Gt, max, Expr::lit(3)))
            .order_by(Expr::unqualified("a1"), true)
            .limit(5);
        let plan = plan(&catalog, &stmt);

        let kinds: Vec<LogicalOpKind> = {
            let mut v = Vec::new();
            plan.root.visit(&mut |n| v.push(n.kind()));
            v
        };
        use LogicalOpKind::*;
        assert_eq!(kinds, vec![Limit, Project, Order, Filter, Aggregate, Scan]);

        let mut aggregates = 0;
        plan.root.visit(&mut |n| {
            if let LogicalOp::Aggregate { aggregates: ref a, .. } = n.op {
                aggregates = a.len();
            }
        });
        assert_eq!(aggregates, 1);
    }

    #[test]
    fn test_derived_table_exposes_its_own_reference() {
        let catalog = catalog();
        let inner = SelectStmt::select(vec![Expr::unqualified("b1")]).from_tables(&["b"]);
        let stmt = SelectStmt::select(vec![Expr::col("d", "b1")]).from(FromItem::Subquery {
            query: Box::new(inner),
            alias: "d".into(),
        });
        let plan = plan(&catalog, &stmt);
        let from = plan.root.child(0).unwrap();
        let LogicalOp::FromQuery { table_ref } = from.op else {
            panic!("expected a derived table, got {}", from.op);
        };
        let Expr::Column(ColumnRef { binding: Some(b), .. }) = &from.output[0] else {
            panic!("expected a bound column");
        };
        assert_eq!(b.table_ref, table_ref);
        assert_eq!(from.child(0).unwrap().kind(), LogicalOpKind::Project);
    }

    #[test]
    fn test_subquery_plans_are_kept_separately() {
        let catalog = catalog();
        let inner = SelectStmt::select(vec![Expr::lit(1)])
            .from_tables(&["b"])
            .filter(Expr::eq(Expr::col("b", "b1"), Expr::col("a", "a1")));
        let stmt = SelectStmt::star().from_tables(&["a"]).filter(Expr::exists(inner));
        let plan = plan(&catalog, &stmt);
        assert_eq!(plan.subqueries.len(), 1);
        assert_eq!(plan.subqueries[&0].count(LogicalOpKind::Scan), 1);
        assert!(plan.explain().contains("subquery 0:"));
    }
}
