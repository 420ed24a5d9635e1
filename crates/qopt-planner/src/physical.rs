//! # Direct Physical Translation
//!
//! Maps a logical tree onto physical operators without building a memo. Each node
//! gets the cheapest algorithm the cost model allows for it given its already
//! translated inputs; only joins have more than one candidate.
//!
//! ## Join Regions
//!
//! A maximal tree of inner joins is a region. When a join-order strategy is set and
//! a region has at least the configured number of leaves, the region is flattened
//! into a [`JoinGraph`] and solved by the DPccp or DPBushy resolver instead of being
//! translated in its written order:
//!
//! - conjuncts over a single leaf become a filter on that leaf,
//! - conjuncts over exactly two leaves become edges,
//! - everything else stays in a filter above the resolved tree.

use crate::pushdown::is_pushable;
use qopt_core::cost::{Cost, CostModel};
use qopt_core::error::{Error, JoinOrderError, OptimizeError};
use qopt_core::expr::{and_all, Expr, JoinType, TableRefId};
use qopt_core::join_graph::{JoinGraph, JoinVertex, MAX_JOIN_RELATIONS};
use qopt_core::join_order::{resolve_join_order, JoinOrderStrategy, ResolverConfig};
use qopt_core::plan::{BuildSide, LogicalNode, LogicalOp, PhysicalNode, PhysicalOp, ScanSource};
use qopt_core::rule::OptContext;
use qopt_core::stats::{join_selectivity, InputEstimate};
use qopt_rules::impl_join::has_hash_key;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub struct DirectPlanner<'a> {
    ctx: OptContext<'a>,
    cost_model: Arc<dyn CostModel>,
    join_order: Option<JoinOrderStrategy>,
    region_threshold: usize,
    resolver: ResolverConfig,
}

impl<'a> DirectPlanner<'a> {
    /// A planner that keeps every join in its written order.
    pub fn new(ctx: OptContext<'a>, cost_model: Arc<dyn CostModel>) -> Self {
        Self {
            ctx,
            cost_model,
            join_order: None,
            region_threshold: usize::MAX,
            resolver: ResolverConfig::default(),
        }
    }

    /// Resolve inner-join regions of at least `threshold` leaves with `strategy`.
    pub fn with_join_order(mut self, strategy: JoinOrderStrategy, threshold: usize, resolver: ResolverConfig) -> Self {
        self.join_order = Some(strategy);
        self.region_threshold = threshold.max(2);
        self.resolver = resolver;
        self
    }

    /// Translate an owned logical tree. Group placeholders are rejected.
    pub fn plan(&self, node: &Arc<LogicalNode>) -> Result<PhysicalNode, Error> {
        if let Some(strategy) = self.join_order {
            if node.op.is_inner_join() {
                let mut region = Region::default();
                region.collect(node);
                let leaves = region.leaves.len();
                if leaves >= self.region_threshold && leaves <= MAX_JOIN_RELATIONS {
                    return self.plan_region(strategy, region);
                }
            }
        }

        let children = node
            .children
            .iter()
            .map(|c| match c.as_node() {
                Some(child) => self.plan(child),
                None => Err(OptimizeError::UnknownGroup(c.as_group().unwrap_or_default()).into()),
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let input_cards: Vec<f64> = children.iter().map(|c| c.card).collect();
        let child_costs: Vec<Cost> = children.iter().map(|c| c.cost).collect();
        let card = node.cardinality(&self.ctx);

        let (first, alternatives) = self.candidates(node, &children);
        let mut best = (first, self.cost_model.compute_cost(&first, &node.op, &input_cards, &child_costs, card));
        for op in alternatives {
            let cost = self.cost_model.compute_cost(&op, &node.op, &input_cards, &child_costs, card);
            if cost.total < best.1.total {
                best = (op, cost);
            }
        }
        trace!(op = ?best.0, cost = best.1.total, card, "translated");
        Ok(PhysicalNode::new(best.0, Arc::clone(node), children, best.1, card))
    }

    /// The always-applicable algorithm for `node` and any alternatives to cost
    /// against it.
    fn candidates(&self, node: &LogicalNode, children: &[PhysicalNode]) -> (PhysicalOp, Vec<PhysicalOp>) {
        match &node.op {
            LogicalOp::Scan {
                source: ScanSource::Table(_),
                ..
            } => (PhysicalOp::TableScan, vec![]),
            LogicalOp::Scan {
                source: ScanSource::File(_),
                ..
            } => (PhysicalOp::FileScan, vec![]),
            LogicalOp::Filter { .. } => (PhysicalOp::Filter, vec![]),
            LogicalOp::Aggregate { .. } => (PhysicalOp::HashAggregate, vec![]),
            LogicalOp::Order { .. } => (PhysicalOp::Sort, vec![]),
            LogicalOp::Limit { .. } => (PhysicalOp::Limit, vec![]),
            LogicalOp::Project { .. } => (PhysicalOp::Project, vec![]),
            LogicalOp::FromQuery { .. } => (PhysicalOp::Materialize, vec![]),
            LogicalOp::Join { join_type, predicate } => {
                let mut hash = Vec::new();
                if let (Some(pred), [left, right]) = (predicate, children) {
                    if has_hash_key(pred, &left.logic.tables(), &right.logic.tables()) {
                        hash.push(PhysicalOp::HashJoin {
                            build_side: BuildSide::Right,
                        });
                        // only an inner join may hash its left input
                        if *join_type == JoinType::Inner {
                            hash.push(PhysicalOp::HashJoin {
                                build_side: BuildSide::Left,
                            });
                        }
                    }
                }
                (PhysicalOp::NestedLoopJoin, hash)
            }
        }
    }

    fn plan_region(&self, strategy: JoinOrderStrategy, region: Region) -> Result<PhysicalNode, Error> {
        let leaf_tables: Vec<BTreeSet<TableRefId>> = region.leaves.iter().map(|l| l.tables()).collect();
        let mut local: Vec<Vec<Expr>> = vec![Vec::new(); region.leaves.len()];
        let mut edges = Vec::new();
        let mut residual = Vec::new();

        for conjunct in region.conjuncts {
            let tables = conjunct.tables();
            let touched: Vec<usize> = leaf_tables
                .iter()
                .enumerate()
                .filter(|(_, t)| !t.is_disjoint(&tables))
                .map(|(i, _)| i)
                .collect();
            match touched[..] {
                [i] if is_pushable(&conjunct) => local[i].push(conjunct),
                [l, r] if is_pushable(&conjunct) => edges.push((l, r, conjunct)),
                _ => residual.push(conjunct),
            }
        }

        let mut graph = JoinGraph::new();
        for (leaf, preds) in region.leaves.into_iter().zip(local) {
            let name = self.leaf_name(&leaf);
            let leaf = match and_all(preds) {
                Some(pred) => Arc::new(LogicalNode::filter(pred, leaf)),
                None => leaf,
            };
            graph.add_vertex(JoinVertex::new(name, self.plan(&leaf)?));
        }
        for (l, r, pred) in edges {
            let left = InputEstimate {
                card: graph.vertex(l).card(),
                tables: &leaf_tables[l],
            };
            let right = InputEstimate {
                card: graph.vertex(r).card(),
                tables: &leaf_tables[r],
            };
            let selectivity = join_selectivity(Some(&pred), &left, &right, &self.ctx);
            graph.add_edge(l, r, Some(pred), selectivity);
        }
        if graph.is_empty() {
            return Err(JoinOrderError::EmptyGraph.into());
        }

        debug!(
            relations = graph.len(),
            edges = graph.edges().len(),
            residual = residual.len(),
            ?strategy,
            "resolving join region"
        );
        let plan = match resolve_join_order(strategy, &graph, Arc::clone(&self.cost_model), self.resolver.clone()) {
            Err(JoinOrderError::SubsetBudgetExhausted { max_subsets }) => {
                warn!(
                    relations = graph.len(),
                    max_subsets, "region too large for exhaustive enumeration, using DPccp"
                );
                resolve_join_order(
                    JoinOrderStrategy::DpCcp,
                    &graph,
                    Arc::clone(&self.cost_model),
                    self.resolver.clone(),
                )?
            }
            result => result?,
        };
        let Some(pred) = and_all(residual) else {
            return Ok(plan);
        };
        let logic = Arc::new(LogicalNode::filter(pred, Arc::clone(&plan.logic)));
        let card = logic.cardinality(&self.ctx);
        let cost = self
            .cost_model
            .compute_cost(&PhysicalOp::Filter, &logic.op, &[plan.card], &[plan.cost], card);
        Ok(PhysicalNode::new(PhysicalOp::Filter, logic, vec![plan], cost, card))
    }

    fn leaf_name(&self, leaf: &LogicalNode) -> String {
        match &leaf.op {
            LogicalOp::Scan { table_ref, .. } | LogicalOp::FromQuery { table_ref } => self
                .ctx
                .tables
                .get(*table_ref)
                .map(|info| info.alias.clone())
                .unwrap_or_else(|| format!("t{table_ref}")),
            op => op.to_string(),
        }
    }
}

/// Leaves and pooled conjuncts of one inner-join region.
#[derive(Default)]
struct Region {
    leaves: Vec<Arc<LogicalNode>>,
    conjuncts: Vec<Expr>,
}

impl Region {
    fn collect(&mut self, node: &Arc<LogicalNode>) {
        let LogicalOp::Join {
            join_type: JoinType::Inner,
            predicate,
        } = &node.op
        else {
            self.leaves.push(Arc::clone(node));
            return;
        };
        if let Some(pred) = predicate {
            self.conjuncts.extend(pred.clone().into_conjuncts().into_iter().filter(|c| !c.is_true()));
        }
        for child in node.child_nodes() {
            self.collect(child);
        }
    }
}

/// Leaf count of the largest inner-join region anywhere in `node`.
pub fn largest_join_region(node: &Arc<LogicalNode>) -> usize {
    let mut largest = 0;
    let mut stack = vec![Arc::clone(node)];
    while let Some(n) = stack.pop() {
        if n.op.is_inner_join() {
            let mut region = Region::default();
            region.collect(&n);
            largest = largest.max(region.leaves.len());
            stack.extend(region.leaves);
        } else {
            stack.extend(n.child_nodes().cloned());
        }
    }
    largest
}

#[cfg(test)]
mod tests {
    use super::*;
    use qopt_core::catalog::{ColumnDef, InMemoryCatalog};
    use qopt_core::cost::DefaultCostModel;
    use qopt_core::expr::{BinaryOp, ColumnRef};
    use qopt_core::stats::{ColumnStatistics, Statistics};
    use qopt_core::tableref::{TableRefKind, TableRefRegistry};
    use qopt_core::value::DataType;

    const ROWS: [(&str, f64); 4] = [("a", 1_000.0), ("b", 10.0), ("c", 500.0), ("d", 50.0)];

    struct Fixture {
        catalog: InMemoryCatalog,
        tables: TableRefRegistry,
    }

    fn fixture() -> Fixture {
        let mut catalog = InMemoryCatalog::new();
        let mut tables = TableRefRegistry::new();
        for (name, rows) in ROWS {
            let columns = vec![ColumnDef::new("id", DataType::Int)];
            let stats = Statistics::new(rows).with_column("id", ColumnStatistics::new(rows, 0.0));
            catalog.add_table(name, columns.clone(), stats).unwrap();
            tables.add(name, TableRefKind::Base { table: name.into() }, columns, 0);
        }
        Fixture { catalog, tables }
    }

    fn id(r: TableRefId) -> Expr {
        Expr::Column(ColumnRef::bound(ROWS[r as usize].0, "id", r, 0))
    }

    fn scan(r: TableRefId) -> Arc<LogicalNode> {
        let name = ROWS[r as usize].0;
        Arc::new(LogicalNode::scan(r, ScanSource::Table(name.into()), vec![id(r)]))
    }

    fn join(pred: Option<Expr>, l: Arc<LogicalNode>, r: Arc<LogicalNode>) -> Arc<LogicalNode> {
        Arc::new(LogicalNode::join(JoinType::Inner, pred, l, r))
    }

    /// `((a × b) × c) × d` with every predicate written in the top join.
    fn chain() -> Arc<LogicalNode> {
        let abc = join(None, join(None, scan(0), scan(1)), scan(2));
        let pred = Expr::And(vec![
            Expr::eq(id(0), id(1)),
            Expr::eq(id(1), id(2)),
            Expr::eq(id(2), id(3)),
            Expr::binary(BinaryOp::Gt, id(3), Expr::lit(7)),
        ]);
        join(Some(pred), abc, scan(3))
    }

    #[test]
    fn test_equality_join_prefers_hash() {
        let fx = fixture();
        let ctx = OptContext::new(&fx.catalog, &fx.tables);
        let planner = DirectPlanner::new(ctx, Arc::new(DefaultCostModel::default()));
        let plan = planner.plan(&join(Some(Expr::eq(id(0), id(1))), scan(0), scan(1))).unwrap();
        assert!(matches!(plan.op, PhysicalOp::HashJoin { .. }));
        assert_eq!(plan.children.len(), 2);
        // 10_000 pairs over 1_000 distinct keys
        assert_eq!(plan.card, 10.0);
    }

    #[test]
    fn test_written_order_keeps_cross_products() {
        let fx = fixture();
        let ctx = OptContext::new(&fx.catalog, &fx.tables);
        let planner = DirectPlanner::new(ctx, Arc::new(DefaultCostModel::default()));
        let plan = planner.plan(&chain()).unwrap();
        // the two lower joins have no predicate
        assert_eq!(plan.count(|n| n.op == PhysicalOp::NestedLoopJoin), 2);
    }

    #[test]
    fn test_region_is_resolved_when_large_enough() {
        let fx = fixture();
        let ctx = OptContext::new(&fx.catalog, &fx.tables);
        let model: Arc<dyn CostModel> = Arc::new(DefaultCostModel::default());
        let written = DirectPlanner::new(ctx, Arc::clone(&model)).plan(&chain()).unwrap();

        for strategy in [JoinOrderStrategy::DpCcp, JoinOrderStrategy::DpBushy] {
            let planner = DirectPlanner::new(ctx, Arc::clone(&model)).with_join_order(
                strategy,
                4,
                ResolverConfig::default(),
            );
            let plan = planner.plan(&chain()).unwrap();
            assert!(plan.cost.total < written.cost.total, "{strategy:?}");
            assert_eq!(plan.count(|n| n.op == PhysicalOp::NestedLoopJoin), 0);
            let mut scanned = plan.scanned_tables();
            scanned.sort_unstable();
            assert_eq!(scanned, vec![0, 1, 2, 3]);
            // the single-table conjunct sits on d's scan side
            let filter = plan.find(&|n: &PhysicalNode| n.op == PhysicalOp::Filter).unwrap();
            assert_eq!(filter.scanned_tables(), vec![3]);
        }
    }

    #[test]
    fn test_bushy_region_past_subset_budget_uses_ccp() {
        let fx = fixture();
        let ctx = OptContext::new(&fx.catalog, &fx.tables);
        let model: Arc<dyn CostModel> = Arc::new(DefaultCostModel::default());
        let ccp = DirectPlanner::new(ctx, Arc::clone(&model))
            .with_join_order(JoinOrderStrategy::DpCcp, 4, ResolverConfig::default())
            .plan(&chain())
            .unwrap();
        let tight = ResolverConfig {
            max_subsets: 8,
            ..ResolverConfig::default()
        };
        let bushy = DirectPlanner::new(ctx, model)
            .with_join_order(JoinOrderStrategy::DpBushy, 4, tight)
            .plan(&chain())
            .unwrap();
        assert_eq!(bushy.cost.total, ccp.cost.total);
        assert_eq!(bushy.count(|n| n.op == PhysicalOp::NestedLoopJoin), 0);
    }

    #[test]
    fn test_small_region_stays_in_written_order() {
        let fx = fixture();
        let ctx = OptContext::new(&fx.catalog, &fx.tables);
        let planner = DirectPlanner::new(ctx, Arc::new(DefaultCostModel::default())).with_join_order(
            JoinOrderStrategy::DpCcp,
            5,
            ResolverConfig::default(),
        );
        let plan = planner.plan(&chain()).unwrap();
        assert_eq!(plan.count(|n| n.op == PhysicalOp::NestedLoopJoin), 2);
    }

    #[test]
    fn test_largest_region_skips_non_inner_boundaries() {
        let semi = Arc::new(LogicalNode::join(
            JoinType::Semi,
            Some(Expr::eq(id(0), id(3))),
            join(Some(Expr::eq(id(0), id(1))), scan(0), scan(1)),
            join(Some(Expr::eq(id(2), id(3))), scan(2), scan(3)),
        ));
        assert_eq!(largest_join_region(&semi), 2);
        assert_eq!(largest_join_region(&chain()), 4);
        assert_eq!(largest_join_region(&scan(0)), 0);
    }
}
