//! # Join Graph
//!
//! A join region flattened into a graph: each vertex is an input relation with its
//! best plan so far, each edge carries the join predicate between two vertices.
//! Subsets of vertices are [`TableSet`] bit vectors, with vertex `i` at bit `i`.
//!
//! ## Bit-Set Algebra
//!
//! `TableSet` supports union (`|`), intersection (`&`), and difference (`-`), plus
//! the two helpers the enumerators lean on:
//!
//! - `complement_before(i)`: the set `{0, ..., i}`, used to exclude lower-numbered
//!   vertices so each connected subgraph is generated from exactly one seed.
//! - `subsets()`: every non-empty proper subset in increasing numeric order, via the
//!   `(sub - set) & set` trick.
//!
//! ## Connectivity
//!
//! A subset is connected when the subgraph induced by its vertices and the edges
//! with both endpoints inside it has a single component.

use crate::cost::Cost;
use crate::expr::{and_all, ColumnRef, Expr, TableRefId};
use crate::plan::{LogicalNode, PhysicalNode, PhysicalOp, ScanSource};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::ops::{BitAnd, BitOr, Sub};
use std::sync::Arc;

/// Largest graph a `u64` bit set can describe.
pub const MAX_JOIN_RELATIONS: usize = 63;

/// A set of join graph vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TableSet(pub u64);

impl TableSet {
    pub const EMPTY: TableSet = TableSet(0);

    pub fn singleton(i: usize) -> Self {
        TableSet(1 << i)
    }

    /// `{0, ..., n-1}`.
    pub fn all(n: usize) -> Self {
        if n >= 64 {
            TableSet(u64::MAX)
        } else {
            TableSet((1u64 << n) - 1)
        }
    }

    /// `{0, ..., i}`.
    pub fn complement_before(i: usize) -> Self {
        Self::all(i + 1)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, i: usize) -> bool {
        i < 64 && self.0 & (1 << i) != 0
    }

    pub fn is_subset(self, other: TableSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn intersects(self, other: TableSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: TableSet) -> Self {
        TableSet(self.0 | other.0)
    }

    pub fn intersect(self, other: TableSet) -> Self {
        TableSet(self.0 & other.0)
    }

    pub fn subtract(self, other: TableSet) -> Self {
        TableSet(self.0 & !other.0)
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Index of the lowest member.
    pub fn lowest(self) -> Option<usize> {
        (!self.is_empty()).then(|| self.0.trailing_zeros() as usize)
    }

    /// Members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..64).filter(move |i| self.contains(*i))
    }

    /// Members in descending order.
    pub fn iter_desc(self) -> impl Iterator<Item = usize> {
        (0..64).rev().filter(move |i| self.contains(*i))
    }

    /// Non-empty subsets, smallest value first. Includes the set itself last.
    pub fn subsets(self) -> Subsets {
        Subsets {
            set: self.0,
            cur: 0,
            done: self.is_empty(),
        }
    }

    /// Non-empty proper subsets.
    pub fn proper_subsets(self) -> impl Iterator<Item = TableSet> {
        self.subsets().filter(move |s| *s != self)
    }
}

/// Iterator over the non-empty subsets of a bit set.
pub struct Subsets {
    set: u64,
    cur: u64,
    done: bool,
}

impl Iterator for Subsets {
    type Item = TableSet;

    fn next(&mut self) -> Option<TableSet> {
        if self.done {
            return None;
        }
        self.cur = self.cur.wrapping_sub(self.set) & self.set;
        if self.cur == self.set {
            self.done = true;
        }
        Some(TableSet(self.cur))
    }
}

impl BitOr for TableSet {
    type Output = TableSet;
    fn bitor(self, rhs: TableSet) -> TableSet {
        self.union(rhs)
    }
}

impl BitAnd for TableSet {
    type Output = TableSet;
    fn bitand(self, rhs: TableSet) -> TableSet {
        self.intersect(rhs)
    }
}

impl Sub for TableSet {
    type Output = TableSet;
    fn sub(self, rhs: TableSet) -> TableSet {
        self.subtract(rhs)
    }
}

impl fmt::Display for TableSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members: Vec<String> = self.iter().map(|i| i.to_string()).collect();
        write!(f, "{{{}}}", members.join(","))
    }
}

/// A relation taking part in the join.
#[derive(Debug, Clone)]
pub struct JoinVertex {
    pub name: String,
    /// Best plan for this relation on its own.
    pub plan: PhysicalNode,
}

impl JoinVertex {
    pub fn new(name: impl Into<String>, plan: PhysicalNode) -> Self {
        Self {
            name: name.into(),
            plan,
        }
    }

    /// A base table scan producing `card` rows through the given columns. The scan's
    /// cost is one unit per row.
    pub fn scan(table_ref: TableRefId, name: &str, columns: &[&str], card: f64) -> Self {
        let output = columns
            .iter()
            .enumerate()
            .map(|(i, c)| Expr::Column(ColumnRef::bound(name, *c, table_ref, i)))
            .collect();
        let logic = Arc::new(LogicalNode::scan(table_ref, ScanSource::Table(name.into()), output));
        let plan = PhysicalNode::new(PhysicalOp::TableScan, logic, vec![], Cost::new(card), card);
        Self::new(name, plan)
    }

    pub fn card(&self) -> f64 {
        self.plan.card
    }

    pub fn tables(&self) -> BTreeSet<TableRefId> {
        self.plan.logic.tables()
    }

    /// Column `i` of this vertex's output.
    pub fn column(&self, i: usize) -> Option<&Expr> {
        self.plan.output().get(i)
    }
}

/// Join predicate between two vertices. A `None` predicate is a cross edge.
#[derive(Debug, Clone)]
pub struct JoinEdge {
    pub left: usize,
    pub right: usize,
    pub predicate: Option<Expr>,
    /// Fraction of the two vertices' cross product the predicate keeps.
    pub selectivity: f64,
}

impl JoinEdge {
    /// Whether the predicate has a `col = col` conjunct joining two tables, usable
    /// as a hash key.
    pub fn is_equi(&self) -> bool {
        self.predicate.as_ref().is_some_and(|p| {
            p.conjuncts().iter().any(|c| {
                c.as_column_equality()
                    .is_some_and(|(a, b)| !a.is_outer() && !b.is_outer() && a.table_ref() != b.table_ref())
            })
        })
    }

    fn set(&self) -> TableSet {
        TableSet::singleton(self.left) | TableSet::singleton(self.right)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JoinGraph {
    vertices: Vec<JoinVertex>,
    edges: Vec<JoinEdge>,
    adjacency: Vec<TableSet>,
}

impl JoinGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, vertex: JoinVertex) -> usize {
        self.vertices.push(vertex);
        self.adjacency.push(TableSet::EMPTY);
        self.vertices.len() - 1
    }

    /// Connect two vertices. A second edge between the same pair is merged into the
    /// first: predicates are AND-ed and selectivities multiplied.
    pub fn add_edge(&mut self, left: usize, right: usize, predicate: Option<Expr>, selectivity: f64) {
        debug_assert!(left != right && left < self.len() && right < self.len());
        let pair = TableSet::singleton(left) | TableSet::singleton(right);
        if let Some(existing) = self.edges.iter_mut().find(|e| e.set() == pair) {
            existing.predicate = and_all(existing.predicate.take().into_iter().chain(predicate));
            existing.selectivity *= selectivity;
            return;
        }
        self.edges.push(JoinEdge {
            left,
            right,
            predicate,
            selectivity,
        });
        self.adjacency[left] = self.adjacency[left] | TableSet::singleton(right);
        self.adjacency[right] = self.adjacency[right] | TableSet::singleton(left);
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertex(&self, i: usize) -> &JoinVertex {
        &self.vertices[i]
    }

    pub fn vertices(&self) -> &[JoinVertex] {
        &self.vertices
    }

    pub fn edges(&self) -> &[JoinEdge] {
        &self.edges
    }

    pub fn all(&self) -> TableSet {
        TableSet::all(self.len())
    }

    pub fn neighbors(&self, i: usize) -> TableSet {
        self.adjacency[i]
    }

    /// Vertices adjacent to `set`, excluding `set` and `exclude`.
    pub fn neighborhood(&self, set: TableSet, exclude: TableSet) -> TableSet {
        let mut n = TableSet::EMPTY;
        for i in set.iter() {
            n = n | self.adjacency[i];
        }
        n - set - exclude
    }

    pub fn is_connected(&self, set: TableSet) -> bool {
        let Some(start) = set.lowest() else {
            return false;
        };
        let mut seen = TableSet::singleton(start);
        let mut frontier = seen;
        while !frontier.is_empty() {
            let next = self.neighborhood(frontier, seen) & set;
            seen = seen | next;
            frontier = next;
        }
        seen == set
    }

    /// Edges with one endpoint in each set.
    pub fn edges_between(&self, a: TableSet, b: TableSet) -> Vec<&JoinEdge> {
        self.edges
            .iter()
            .filter(|e| {
                (a.contains(e.left) && b.contains(e.right)) || (b.contains(e.left) && a.contains(e.right))
            })
            .collect()
    }

    /// Connected components, ordered by lowest member.
    pub fn components(&self) -> Vec<TableSet> {
        let mut out = Vec::new();
        let mut remaining = self.all();
        while let Some(start) = remaining.lowest() {
            let mut comp = TableSet::singleton(start);
            let mut frontier = comp;
            while !frontier.is_empty() {
                let next = self.neighborhood(frontier, comp);
                comp = comp | next;
                frontier = next;
            }
            out.push(comp);
            remaining = remaining - comp;
        }
        out
    }

    /// Copy of this graph with cross edges chaining the components together, so the
    /// result is connected.
    pub fn with_cross_edges(&self) -> JoinGraph {
        let mut g = self.clone();
        let roots: Vec<usize> = self.components().iter().filter_map(|c| c.lowest()).collect();
        for pair in roots.windows(2) {
            g.add_edge(pair[0], pair[1], None, 1.0);
        }
        g
    }

    /// Copy of this graph with vertices renumbered in breadth-first discovery order
    /// from vertex 0. Returns the graph and the old index of each new vertex.
    pub fn bfs_reordered(&self) -> (JoinGraph, Vec<usize>) {
        let mut order = Vec::with_capacity(self.len());
        let mut seen = TableSet::EMPTY;
        for start in 0..self.len() {
            if seen.contains(start) {
                continue;
            }
            seen = seen | TableSet::singleton(start);
            let mut queue = VecDeque::from([start]);
            while let Some(v) = queue.pop_front() {
                order.push(v);
                for n in (self.adjacency[v] - seen).iter() {
                    seen = seen | TableSet::singleton(n);
                    queue.push_back(n);
                }
            }
        }
        let mut new_index = vec![0; self.len()];
        for (new, old) in order.iter().enumerate() {
            new_index[*old] = new;
        }
        let mut g = JoinGraph::new();
        for old in &order {
            g.add_vertex(self.vertices[*old].clone());
        }
        for e in &self.edges {
            g.add_edge(new_index[e.left], new_index[e.right], e.predicate.clone(), e.selectivity);
        }
        (g, order)
    }

    /// Estimated rows of the join over `set`: the product of the vertex cardinalities
    /// and of the selectivities of the edges inside `set`, at least 1.
    pub fn card(&self, set: TableSet) -> f64 {
        let rows: f64 = set.iter().map(|i| self.vertices[i].card()).product();
        let sel: f64 = self
            .edges
            .iter()
            .filter(|e| set.contains(e.left) && set.contains(e.right))
            .map(|e| e.selectivity)
            .product();
        (rows * sel).max(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize) -> JoinGraph {
        let mut g = JoinGraph::new();
        for i in 0..n {
            g.add_vertex(JoinVertex::scan(i as TableRefId, &format!("t{i}"), &["id"], 10.0));
        }
        for i in 1..n {
            g.add_edge(i - 1, i, None, 0.1);
        }
        g
    }

    #[test]
    fn test_set_algebra() {
        let a = TableSet::singleton(0) | TableSet::singleton(2);
        let b = TableSet::singleton(2) | TableSet::singleton(3);
        assert_eq!((a | b).len(), 3);
        assert_eq!(a & b, TableSet::singleton(2));
        assert_eq!(a - b, TableSet::singleton(0));
        assert_eq!(TableSet::complement_before(2), TableSet(0b111));
        assert_eq!(TableSet::complement_before(63), TableSet(u64::MAX));
        assert_eq!(a.to_string(), "{0,2}");
        assert_eq!(b.lowest(), Some(2));
        assert_eq!(b.iter_desc().collect::<Vec<_>>(), vec![3, 2]);
    }

    #[test]
    fn test_subsets_enumerates_each_once() {
        let s = TableSet(0b1011);
        let subs: Vec<TableSet> = s.subsets().collect();
        assert_eq!(subs.len(), 7);
        assert!(subs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*subs.last().unwrap(), s);
        assert_eq!(s.proper_subsets().count(), 6);
        assert_eq!(TableSet::EMPTY.subsets().count(), 0);
    }

    #[test]
    fn test_connectivity_and_neighborhood() {
        let g = chain(4);
        assert!(g.is_connected(TableSet(0b0111)));
        assert!(!g.is_connected(TableSet(0b0101)));
        assert_eq!(g.neighborhood(TableSet(0b0010), TableSet::EMPTY), TableSet(0b0101));
        assert_eq!(g.neighborhood(TableSet(0b0010), TableSet(0b0001)), TableSet(0b0100));
        assert_eq!(g.edges_between(TableSet(0b0011), TableSet(0b1100)).len(), 1);
        assert_eq!(g.components(), vec![TableSet(0b1111)]);
        assert!((g.card(TableSet(0b0011)) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_cross_edges_connect_components() {
        let mut g = JoinGraph::new();
        for i in 0..4 {
            g.add_vertex(JoinVertex::scan(i, &format!("t{i}"), &["id"], 5.0));
        }
        g.add_edge(0, 1, None, 0.5);
        g.add_edge(2, 3, None, 0.5);
        assert_eq!(g.components().len(), 2);
        let joined = g.with_cross_edges();
        assert_eq!(joined.components().len(), 1);
        assert_eq!(joined.edges().len(), 3);
    }

    #[test]
    fn test_bfs_reorder_keeps_edges() {
        // star centered on the last vertex
        let mut g = JoinGraph::new();
        for i in 0..4 {
            g.add_vertex(JoinVertex::scan(i, &format!("t{i}"), &["id"], 5.0));
        }
        for i in 0..3 {
            g.add_edge(i, 3, None, 0.5);
        }
        let (r, order) = g.bfs_reordered();
        assert_eq!(order, vec![0, 3, 1, 2]);
        assert_eq!(r.neighbors(1), TableSet(0b1101));
        assert_eq!(r.vertex(1).name, "t3");
    }

    #[test]
    fn test_duplicate_edges_merge() {
        let mut g = chain(2);
        g.add_edge(1, 0, None, 0.5);
        assert_eq!(g.edges().len(), 1);
        assert!((g.edges()[0].selectivity - 0.05).abs() < 1e-12);
    }
}
