//! # Join-Order Resolvers
//!
//! Dynamic-programming enumerators that find the cheapest bushy join tree over a
//! [`JoinGraph`] without going through the memo.
//!
//! ## DPBushy
//!
//! Walks every subset `S` of the vertices in increasing bit-vector order. For each
//! connected `S` it tries every split into connected halves `S1 < S2` and combines
//! the best trees of the halves. Simple and exhaustive, so it doubles as the oracle
//! the faster resolver is checked against. Every subset and split it scans counts
//! against `max_subsets`, so sparse graphs cannot run away while staying under the
//! pair budget.
//!
//! ## DPccp
//!
//! Generates only csg-cmp pairs: a connected subgraph `S1` and a connected
//! complement `S2` adjacent to it. Subgraphs are grown from each vertex in
//! descending index order, and an exclusion set keeps any subgraph from being
//! produced by two seeds. The vertices are renumbered breadth-first before the
//! enumeration, and the pairs are solved in order of the size of `S1 ∪ S2`, so both
//! halves of a pair are always solved first.
//!
//! ## Combining Two Subtrees
//!
//! [`MinimalJoinTree`] tries both orientations with every applicable algorithm
//! (nested loop always, hash join when an equality edge connects the halves) and
//! keeps the cheapest. [`BestTree`] only replaces an entry with a strictly cheaper
//! tree, so ties keep the first tree found.
//!
//! ## Disconnected Graphs
//!
//! With `allow_cross_products` off a disconnected graph is rejected. With it on the
//! components are chained together with cross edges before enumeration.

use crate::cost::CostModel;
use crate::error::JoinOrderError;
use crate::expr::{and_all, JoinType};
use crate::join_graph::{JoinGraph, TableSet, MAX_JOIN_RELATIONS};
use crate::plan::{BuildSide, LogicalNode, LogicalOp, PhysicalNode, PhysicalOp, PlanChild};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Which enumerator solves join regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinOrderStrategy {
    DpCcp,
    DpBushy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Join disconnected components with cross products instead of failing.
    pub allow_cross_products: bool,
    /// Upper bound on the subtree pairs combined in one resolution.
    pub max_pairs: u64,
    /// Upper bound on the vertex subsets DPBushy scans, connected or not.
    pub max_subsets: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            allow_cross_products: true,
            max_pairs: 10_000_000,
            max_subsets: 1 << 24,
        }
    }
}

/// Cheapest known tree per vertex subset.
#[derive(Debug, Default)]
pub struct BestTree {
    best: HashMap<TableSet, PhysicalNode>,
    /// Trees that were replaced by cheaper ones, for diagnostics.
    candidates: Vec<(TableSet, PhysicalNode)>,
}

impl BestTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `plan` for `set` if it is strictly cheaper than the current entry.
    pub fn insert(&mut self, set: TableSet, plan: PhysicalNode) -> bool {
        match self.best.get(&set) {
            Some(current) if current.cost.total <= plan.cost.total => false,
            _ => {
                if let Some(old) = self.best.insert(set, plan) {
                    self.candidates.push((set, old));
                }
                true
            }
        }
    }

    pub fn get(&self, set: TableSet) -> Option<&PhysicalNode> {
        self.best.get(&set)
    }

    pub fn len(&self) -> usize {
        self.best.len()
    }

    pub fn is_empty(&self) -> bool {
        self.best.is_empty()
    }

    pub fn candidates(&self) -> &[(TableSet, PhysicalNode)] {
        &self.candidates
    }
}

/// Builds the cheapest join of two solved subsets.
pub struct MinimalJoinTree<'a> {
    cost_model: &'a dyn CostModel,
}

impl<'a> MinimalJoinTree<'a> {
    pub fn new(cost_model: &'a dyn CostModel) -> Self {
        Self { cost_model }
    }

    pub fn build(
        &self,
        graph: &JoinGraph,
        s1: TableSet,
        s2: TableSet,
        t1: &PhysicalNode,
        t2: &PhysicalNode,
    ) -> PhysicalNode {
        let edges = graph.edges_between(s1, s2);
        let hashable = edges.iter().any(|e| e.is_equi());
        let predicate = and_all(edges.iter().filter_map(|e| e.predicate.clone()));
        let card = graph.card(s1 | s2);

        let candidate = |l: &PhysicalNode, r: &PhysicalNode, op: PhysicalOp| {
            let output = l.output().iter().chain(r.output()).cloned().collect();
            let logic = Arc::new(LogicalNode::new(
                LogicalOp::Join {
                    join_type: JoinType::Inner,
                    predicate: predicate.clone(),
                },
                vec![
                    PlanChild::Node(Arc::clone(&l.logic)),
                    PlanChild::Node(Arc::clone(&r.logic)),
                ],
                output,
            ));
            let cost = self
                .cost_model
                .compute_cost(&op, &logic.op, &[l.card, r.card], &[l.cost, r.cost], card);
            PhysicalNode::new(op, logic, vec![l.clone(), r.clone()], cost, card)
        };

        let mut best = candidate(t1, t2, PhysicalOp::NestedLoopJoin);
        for (l, r) in [(t1, t2), (t2, t1)] {
            let mut ops = vec![PhysicalOp::NestedLoopJoin];
            if hashable {
                ops.push(PhysicalOp::HashJoin {
                    build_side: BuildSide::Right,
                });
            }
            for op in ops {
                let tree = candidate(l, r, op);
                if tree.cost < best.cost {
                    best = tree;
                }
            }
        }
        best
    }
}

/// Validate the graph and apply the cross-product policy.
fn prepare(graph: &JoinGraph, config: &ResolverConfig) -> Result<JoinGraph, JoinOrderError> {
    if graph.is_empty() {
        return Err(JoinOrderError::EmptyGraph);
    }
    if graph.len() > MAX_JOIN_RELATIONS {
        return Err(JoinOrderError::TooManyRelations(graph.len()));
    }
    let components = graph.components().len();
    if components > 1 {
        if !config.allow_cross_products {
            return Err(JoinOrderError::Disconnected { components });
        }
        debug!(components, "joining disconnected components with cross products");
        return Ok(graph.with_cross_edges());
    }
    Ok(graph.clone())
}

fn seed(graph: &JoinGraph) -> BestTree {
    let mut best = BestTree::new();
    for (i, v) in graph.vertices().iter().enumerate() {
        best.insert(TableSet::singleton(i), v.plan.clone());
    }
    best
}

fn combine(
    graph: &JoinGraph,
    best: &mut BestTree,
    builder: &MinimalJoinTree,
    s1: TableSet,
    s2: TableSet,
) -> Result<(), JoinOrderError> {
    let t1 = best.get(s1).ok_or(JoinOrderError::MissingSubplan(s1))?;
    let t2 = best.get(s2).ok_or(JoinOrderError::MissingSubplan(s2))?;
    let tree = builder.build(graph, s1, s2, t1, t2);
    trace!(%s1, %s2, cost = tree.cost.total, "combined pair");
    best.insert(s1 | s2, tree);
    Ok(())
}

fn root_of(graph: &JoinGraph, best: &mut BestTree) -> Result<PhysicalNode, JoinOrderError> {
    let all = graph.all();
    best.best.remove(&all).ok_or(JoinOrderError::MissingSubplan(all))
}

/// Exhaustive subset enumeration.
pub struct DpBushy {
    cost_model: Arc<dyn CostModel>,
    config: ResolverConfig,
    /// Connected splits combined by the last resolution.
    pub considered_pairs: u64,
    /// Subsets and splits scanned by the last resolution.
    pub scanned_subsets: u64,
}

impl DpBushy {
    pub fn new(cost_model: Arc<dyn CostModel>, config: ResolverConfig) -> Self {
        Self {
            cost_model,
            config,
            considered_pairs: 0,
            scanned_subsets: 0,
        }
    }

    pub fn resolve(&mut self, graph: &JoinGraph) -> Result<PhysicalNode, JoinOrderError> {
        let graph = prepare(graph, &self.config)?;
        let cost_model = Arc::clone(&self.cost_model);
        let builder = MinimalJoinTree::new(cost_model.as_ref());
        let mut best = seed(&graph);
        self.considered_pairs = 0;
        self.scanned_subsets = 0;

        let n = graph.len();
        // the outer loop alone visits every subset
        if graph.all().0 > self.config.max_subsets {
            return Err(JoinOrderError::SubsetBudgetExhausted {
                max_subsets: self.config.max_subsets,
            });
        }
        for bits in 1..=graph.all().0 {
            self.scan_subset()?;
            let set = TableSet(bits);
            if set.len() < 2 || !graph.is_connected(set) {
                continue;
            }
            for s1 in set.proper_subsets() {
                self.scan_subset()?;
                let s2 = set - s1;
                if s1.0 > s2.0 || !graph.is_connected(s1) || !graph.is_connected(s2) {
                    continue;
                }
                self.considered_pairs += 1;
                if self.considered_pairs > self.config.max_pairs {
                    return Err(JoinOrderError::BudgetExhausted {
                        max_pairs: self.config.max_pairs,
                    });
                }
                combine(&graph, &mut best, &builder, s1, s2)?;
            }
        }
        debug!(
            relations = n,
            pairs = self.considered_pairs,
            subsets = self.scanned_subsets,
            "DPBushy resolved join order"
        );
        root_of(&graph, &mut best)
    }

    fn scan_subset(&mut self) -> Result<(), JoinOrderError> {
        self.scanned_subsets += 1;
        if self.scanned_subsets > self.config.max_subsets {
            return Err(JoinOrderError::SubsetBudgetExhausted {
                max_subsets: self.config.max_subsets,
            });
        }
        Ok(())
    }
}

/// Connected-subgraph / complement-pair enumeration.
pub struct DpCcp {
    cost_model: Arc<dyn CostModel>,
    config: ResolverConfig,
    /// csg-cmp pairs emitted by the last resolution.
    pub emitted_pairs: u64,
}

impl DpCcp {
    pub fn new(cost_model: Arc<dyn CostModel>, config: ResolverConfig) -> Self {
        Self {
            cost_model,
            config,
            emitted_pairs: 0,
        }
    }

    pub fn resolve(&mut self, graph: &JoinGraph) -> Result<PhysicalNode, JoinOrderError> {
        let (graph, _) = prepare(graph, &self.config)?.bfs_reordered();
        let builder = MinimalJoinTree::new(self.cost_model.as_ref());
        let mut best = seed(&graph);

        let mut pairs = CsgCmpPairs::new(&graph, self.config.max_pairs);
        let result = pairs.enumerate();
        self.emitted_pairs = pairs.emitted;
        result?;

        let mut pairs = pairs.pairs;
        pairs.sort_by_key(|(s1, s2)| (*s1 | *s2).len());
        for (s1, s2) in pairs {
            combine(&graph, &mut best, &builder, s1, s2)?;
        }
        debug!(relations = graph.len(), pairs = self.emitted_pairs, "DPccp resolved join order");
        root_of(&graph, &mut best)
    }
}

/// Generator of all csg-cmp pairs of a connected graph.
struct CsgCmpPairs<'g> {
    graph: &'g JoinGraph,
    max_pairs: u64,
    emitted: u64,
    pairs: Vec<(TableSet, TableSet)>,
}

impl<'g> CsgCmpPairs<'g> {
    fn new(graph: &'g JoinGraph, max_pairs: u64) -> Self {
        Self {
            graph,
            max_pairs,
            emitted: 0,
            pairs: Vec::new(),
        }
    }

    fn enumerate(&mut self) -> Result<(), JoinOrderError> {
        for i in (0..self.graph.len()).rev() {
            let v = TableSet::singleton(i);
            self.emit_csg(v)?;
            self.enumerate_csg_rec(v, TableSet::complement_before(i))?;
        }
        Ok(())
    }

    fn enumerate_csg_rec(&mut self, s: TableSet, x: TableSet) -> Result<(), JoinOrderError> {
        let n = self.graph.neighborhood(s, x);
        for sub in n.subsets() {
            self.emit_csg(s | sub)?;
        }
        for sub in n.subsets() {
            self.enumerate_csg_rec(s | sub, x | n)?;
        }
        Ok(())
    }

    /// Emit every complement of the connected subgraph `s1`.
    fn emit_csg(&mut self, s1: TableSet) -> Result<(), JoinOrderError> {
        let Some(min) = s1.lowest() else {
            return Ok(());
        };
        let x = s1 | TableSet::complement_before(min);
        let n = self.graph.neighborhood(s1, x);
        for i in n.iter_desc() {
            let s2 = TableSet::singleton(i);
            self.emit_pair(s1, s2)?;
            self.enumerate_cmp_rec(s1, s2, x | (TableSet::complement_before(i) & n))?;
        }
        Ok(())
    }

    fn enumerate_cmp_rec(&mut self, s1: TableSet, s2: TableSet, x: TableSet) -> Result<(), JoinOrderError> {
        let n = self.graph.neighborhood(s2, x);
        // s2 is already adjacent to s1, so every extension of it is too
        for sub in n.subsets() {
            self.emit_pair(s1, s2 | sub)?;
        }
        for sub in n.subsets() {
            self.enumerate_cmp_rec(s1, s2 | sub, x | n)?;
        }
        Ok(())
    }

    fn emit_pair(&mut self, s1: TableSet, s2: TableSet) -> Result<(), JoinOrderError> {
        self.emitted += 1;
        if self.emitted > self.max_pairs {
            return Err(JoinOrderError::BudgetExhausted {
                max_pairs: self.max_pairs,
            });
        }
        self.pairs.push((s1, s2));
        Ok(())
    }
}

/// Solve `graph` with the chosen strategy.
pub fn resolve_join_order(
    strategy: JoinOrderStrategy,
    graph: &JoinGraph,
    cost_model: Arc<dyn CostModel>,
    config: ResolverConfig,
) -> Result<PhysicalNode, JoinOrderError> {
    match strategy {
        JoinOrderStrategy::DpCcp => DpCcp::new(cost_model, config).resolve(graph),
        JoinOrderStrategy::DpBushy => DpBushy::new(cost_model, config).resolve(graph),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::{Cost, DefaultCostModel};
    use crate::expr::Expr;
    use crate::join_graph::JoinVertex;

    fn graph(cards: &[f64], edges: &[(usize, usize)]) -> JoinGraph {
        let mut g = JoinGraph::new();
        for (i, card) in cards.iter().enumerate() {
            g.add_vertex(JoinVertex::scan(i as u32, &format!("t{i}"), &["id"], *card));
        }
        for &(l, r) in edges {
            let pred = Expr::eq(g.vertex(l).column(0).unwrap().clone(), g.vertex(r).column(0).unwrap().clone());
            g.add_edge(l, r, Some(pred), 0.01);
        }
        g
    }

    #[test]
    fn test_best_tree_keeps_first_on_tie() {
        let g = graph(&[10.0, 20.0], &[]);
        let mut best = BestTree::new();
        assert!(best.insert(TableSet(1), g.vertex(0).plan.clone()));
        let mut same = g.vertex(1).plan.clone();
        same.cost = g.vertex(0).plan.cost;
        assert!(!best.insert(TableSet(1), same));
        let mut cheaper = g.vertex(1).plan.clone();
        cheaper.cost = Cost::new(1.0);
        assert!(best.insert(TableSet(1), cheaper));
        assert_eq!(best.candidates().len(), 1);
        assert_eq!(best.get(TableSet(1)).unwrap().cost.total, 1.0);
    }

    #[test]
    fn test_two_tables_pick_hash_join() {
        let g = graph(&[1000.0, 100.0], &[(0, 1)]);
        let plan = DpCcp::new(Arc::new(DefaultCostModel::default()), ResolverConfig::default())
            .resolve(&g)
            .unwrap();
        assert!(matches!(plan.op, PhysicalOp::HashJoin { .. }));
        // the smaller input is built
        assert_eq!(plan.children[1].scanned_tables(), vec![1]);
        assert!((plan.card - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_vertex_is_its_own_plan() {
        let g = graph(&[42.0], &[]);
        let mut ccp = DpCcp::new(Arc::new(DefaultCostModel::default()), ResolverConfig::default());
        let plan = ccp.resolve(&g).unwrap();
        assert_eq!(plan.op, PhysicalOp::TableScan);
        assert_eq!(ccp.emitted_pairs, 0);
    }

    #[test]
    fn test_empty_graph_is_rejected() {
        let err = DpBushy::new(Arc::new(DefaultCostModel::default()), ResolverConfig::default())
            .resolve(&JoinGraph::new())
            .unwrap_err();
        assert_eq!(err, JoinOrderError::EmptyGraph);
    }

    #[test]
    fn test_strategy_deserializes() {
        let s: JoinOrderStrategy = serde_json::from_str(r#""dp_bushy""#).unwrap();
        assert_eq!(s, JoinOrderStrategy::DpBushy);
        let c: ResolverConfig = serde_json::from_str(r#"{"allow_cross_products": false}"#).unwrap();
        assert!(!c.allow_cross_products);
        assert_eq!(c.max_pairs, ResolverConfig::default().max_pairs);
    }
}
