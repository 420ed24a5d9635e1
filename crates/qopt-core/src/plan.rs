//! # Plan Nodes
//!
//! This module defines the two plan layers the optimizer moves between.
//!
//! ## Logical Nodes (`LogicalNode`)
//! A logical node says *what* to compute: scan, filter, join, aggregate, order,
//! limit, project, or read a derived table. Every node carries its output column
//! list. Children are [`PlanChild`]s: either an owned subtree or a placeholder
//! pointing at a memo group. Plans handed to the memo use owned children; the memo
//! stores shallow nodes whose children are all group placeholders.
//!
//! Nodes are immutable once built. Rewrite passes produce new nodes and share the
//! untouched subtrees through `Arc`.
//!
//! ## Physical Nodes (`PhysicalNode`)
//! A physical node says *how*: which algorithm implements the logical node it wraps.
//! It never changes its logical node's identity; explain output reads predicates and
//! output columns through it.

use crate::cost::Cost;
use crate::expr::{AggExpr, Expr, JoinType, SortKey, TableRefId};
use crate::memo::GroupId;
use crate::rule::OptContext;
use crate::stats::{derive_cardinality, InputEstimate};
use std::collections::BTreeSet;
use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

/// Where a scan reads from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScanSource {
    Table(String),
    File(String),
}

/// Logical operators.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    /// Read one table reference, applying an optional pushed-down predicate.
    Scan {
        table_ref: TableRefId,
        source: ScanSource,
        predicate: Option<Expr>,
    },
    /// `movable` filters may be pushed below other operators. Filters created by
    /// decorrelation above a single join are pinned in place.
    Filter { predicate: Expr, movable: bool },
    /// Two-input join. An inner join without a predicate is a cross product.
    Join {
        join_type: JoinType,
        predicate: Option<Expr>,
    },
    Aggregate {
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
    },
    Order { keys: Vec<SortKey> },
    Limit { count: u64 },
    Project {
        exprs: Vec<Expr>,
        aliases: Vec<Option<String>>,
    },
    /// Expose a nested query's output under a table reference.
    FromQuery { table_ref: TableRefId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOpKind {
    Scan,
    Filter,
    Join,
    Aggregate,
    Order,
    Limit,
    Project,
    FromQuery,
}

impl LogicalOp {
    pub fn kind(&self) -> LogicalOpKind {
        match self {
            LogicalOp::Scan { .. } => LogicalOpKind::Scan,
            LogicalOp::Filter { .. } => LogicalOpKind::Filter,
            LogicalOp::Join { .. } => LogicalOpKind::Join,
            LogicalOp::Aggregate { .. } => LogicalOpKind::Aggregate,
            LogicalOp::Order { .. } => LogicalOpKind::Order,
            LogicalOp::Limit { .. } => LogicalOpKind::Limit,
            LogicalOp::Project { .. } => LogicalOpKind::Project,
            LogicalOp::FromQuery { .. } => LogicalOpKind::FromQuery,
        }
    }

    /// Expressions held directly by the operator.
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            LogicalOp::Scan { predicate, .. } | LogicalOp::Join { predicate, .. } => predicate.iter().collect(),
            LogicalOp::Filter { predicate, .. } => vec![predicate],
            LogicalOp::Aggregate { group_by, aggregates } => {
                let mut out: Vec<&Expr> = group_by.iter().collect();
                out.extend(aggregates.iter().filter_map(|a| a.arg.as_deref()));
                out
            }
            LogicalOp::Order { keys } => keys.iter().map(|k| &k.expr).collect(),
            LogicalOp::Project { exprs, .. } => exprs.iter().collect(),
            LogicalOp::Limit { .. } | LogicalOp::FromQuery { .. } => vec![],
        }
    }

    /// The join type, for join operators.
    pub fn join_type(&self) -> Option<JoinType> {
        match self {
            LogicalOp::Join { join_type, .. } => Some(*join_type),
            _ => None,
        }
    }

    /// Whether this is an inner join, the only kind that forms reorderable regions.
    pub fn is_inner_join(&self) -> bool {
        matches!(
            self,
            LogicalOp::Join {
                join_type: JoinType::Inner,
                ..
            }
        )
    }
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::Scan { source, .. } => match source {
                ScanSource::Table(t) => write!(f, "Scan {t}"),
                ScanSource::File(p) => write!(f, "Scan file '{p}'"),
            },
            LogicalOp::Filter { movable: true, .. } => write!(f, "Filter"),
            LogicalOp::Filter { movable: false, .. } => write!(f, "Filter [pinned]"),
            LogicalOp::Join { join_type, .. } => write!(f, "Join [{}]", join_type.name()),
            LogicalOp::Aggregate { group_by, aggregates } => {
                write!(f, "Aggregate")?;
                if !group_by.is_empty() {
                    write!(f, " by {}", join_exprs(group_by))?;
                }
                let aggs: Vec<String> = aggregates.iter().map(|a| a.to_string()).collect();
                write!(f, " [{}]", aggs.join(", "))
            }
            LogicalOp::Order { keys } => {
                let keys: Vec<String> = keys
                    .iter()
                    .map(|k| format!("{}{}", k.expr, if k.ascending { "" } else { " desc" }))
                    .collect();
                write!(f, "Order by {}", keys.join(", "))
            }
            LogicalOp::Limit { count } => write!(f, "Limit {count}"),
            LogicalOp::Project { exprs, .. } => write!(f, "Project {}", join_exprs(exprs)),
            LogicalOp::FromQuery { table_ref } => write!(f, "FromQuery #{table_ref}"),
        }
    }
}

fn join_exprs(exprs: &[Expr]) -> String {
    exprs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ")
}

/// A child slot: an owned subtree or a memo group placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PlanChild<N> {
    Node(Arc<N>),
    Group(GroupId),
}

impl<N> PlanChild<N> {
    pub fn as_node(&self) -> Option<&Arc<N>> {
        match self {
            PlanChild::Node(n) => Some(n),
            PlanChild::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<GroupId> {
        match self {
            PlanChild::Group(g) => Some(*g),
            PlanChild::Node(_) => None,
        }
    }
}

/// Logical plan node.
#[derive(Debug, Clone)]
pub struct LogicalNode {
    pub op: LogicalOp,
    pub children: Vec<PlanChild<LogicalNode>>,
    /// Output columns, in order.
    pub output: Vec<Expr>,
    card: OnceLock<f64>,
}

// Equality and hashing ignore the cached cardinality.
impl PartialEq for LogicalNode {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op && self.children == other.children && self.output == other.output
    }
}

impl Eq for LogicalNode {}

impl Hash for LogicalNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.op.hash(state);
        self.children.hash(state);
        self.output.hash(state);
    }
}

impl LogicalNode {
    pub fn new(op: LogicalOp, children: Vec<PlanChild<LogicalNode>>, output: Vec<Expr>) -> Self {
        Self {
            op,
            children,
            output,
            card: OnceLock::new(),
        }
    }

    pub fn scan(table_ref: TableRefId, source: ScanSource, output: Vec<Expr>) -> Self {
        Self::new(
            LogicalOp::Scan {
                table_ref,
                source,
                predicate: None,
            },
            vec![],
            output,
        )
    }

    pub fn filter(predicate: Expr, child: Arc<LogicalNode>) -> Self {
        Self::unary(LogicalOp::Filter { predicate, movable: true }, child)
    }

    /// A filter that pushdown must leave where it is.
    pub fn pinned_filter(predicate: Expr, child: Arc<LogicalNode>) -> Self {
        Self::unary(
            LogicalOp::Filter {
                predicate,
                movable: false,
            },
            child,
        )
    }

    pub fn join(join_type: JoinType, predicate: Option<Expr>, left: Arc<LogicalNode>, right: Arc<LogicalNode>) -> Self {
        let output = Self::join_output(join_type, &left.output, &right.output);
        Self::new(
            LogicalOp::Join { join_type, predicate },
            vec![PlanChild::Node(left), PlanChild::Node(right)],
            output,
        )
    }

    /// Output columns of a join: both sides for inner, left, and single joins; the
    /// left side for semi and anti joins; the marker followed by the left side for
    /// mark joins.
    pub fn join_output(join_type: JoinType, left: &[Expr], right: &[Expr]) -> Vec<Expr> {
        match join_type {
            JoinType::Inner | JoinType::Left | JoinType::Single => left.iter().chain(right).cloned().collect(),
            JoinType::Semi | JoinType::Anti => left.to_vec(),
            JoinType::Mark(id) => std::iter::once(Expr::Marker(id)).chain(left.iter().cloned()).collect(),
        }
    }

    pub fn aggregate(group_by: Vec<Expr>, aggregates: Vec<AggExpr>, child: Arc<LogicalNode>) -> Self {
        let output = group_by
            .iter()
            .cloned()
            .chain(aggregates.iter().cloned().map(Expr::Aggregate))
            .collect();
        Self::new(
            LogicalOp::Aggregate { group_by, aggregates },
            vec![PlanChild::Node(child)],
            output,
        )
    }

    pub fn order(keys: Vec<SortKey>, child: Arc<LogicalNode>) -> Self {
        Self::unary(LogicalOp::Order { keys }, child)
    }

    pub fn limit(count: u64, child: Arc<LogicalNode>) -> Self {
        Self::unary(LogicalOp::Limit { count }, child)
    }

    pub fn project(exprs: Vec<Expr>, aliases: Vec<Option<String>>, child: Arc<LogicalNode>) -> Self {
        let output = exprs.clone();
        Self::new(
            LogicalOp::Project { exprs, aliases },
            vec![PlanChild::Node(child)],
            output,
        )
    }

    pub fn from_query(table_ref: TableRefId, output: Vec<Expr>, child: Arc<LogicalNode>) -> Self {
        Self::new(LogicalOp::FromQuery { table_ref }, vec![PlanChild::Node(child)], output)
    }

    /// Same-output unary node.
    fn unary(op: LogicalOp, child: Arc<LogicalNode>) -> Self {
        let output = child.output.clone();
        Self::new(op, vec![PlanChild::Node(child)], output)
    }

    pub fn kind(&self) -> LogicalOpKind {
        self.op.kind()
    }

    pub fn child(&self, i: usize) -> Option<&Arc<LogicalNode>> {
        self.children.get(i).and_then(PlanChild::as_node)
    }

    /// Owned children, skipping group placeholders.
    pub fn child_nodes(&self) -> impl Iterator<Item = &Arc<LogicalNode>> {
        self.children.iter().filter_map(PlanChild::as_node)
    }

    /// Copy of this node with new children and the same output.
    pub fn with_children(&self, children: Vec<PlanChild<LogicalNode>>) -> LogicalNode {
        LogicalNode::new(self.op.clone(), children, self.output.clone())
    }

    /// Table references whose columns appear in the output.
    pub fn tables(&self) -> BTreeSet<TableRefId> {
        output_tables(&self.output)
    }

    /// Pre-order visit of owned nodes.
    pub fn visit(&self, f: &mut impl FnMut(&LogicalNode)) {
        f(self);
        for c in self.child_nodes() {
            c.visit(f);
        }
    }

    /// Number of owned nodes of `kind` in this tree.
    pub fn count(&self, kind: LogicalOpKind) -> usize {
        let mut n = 0;
        self.visit(&mut |node| {
            if node.kind() == kind {
                n += 1;
            }
        });
        n
    }

    /// Estimated output rows of an owned tree, computed once per node.
    pub fn cardinality(&self, ctx: &OptContext) -> f64 {
        *self.card.get_or_init(|| {
            let children: Vec<(f64, BTreeSet<TableRefId>)> = self
                .child_nodes()
                .map(|c| (c.cardinality(ctx), c.tables()))
                .collect();
            let inputs: Vec<InputEstimate> = children
                .iter()
                .map(|(card, tables)| InputEstimate { card: *card, tables })
                .collect();
            derive_cardinality(&self.op, &inputs, ctx)
        })
    }

    /// Indented tree rendering.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.explain_into(&mut out, 0);
        out
    }

    fn explain_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        let _ = writeln!(out, "{pad}{}", self.op);
        if let Some(pred) = predicate_of(&self.op) {
            let _ = writeln!(out, "{pad}    predicate: {pred}");
        }
        for c in &self.children {
            match c {
                PlanChild::Node(n) => n.explain_into(out, depth + 1),
                PlanChild::Group(g) => {
                    let _ = writeln!(out, "{pad}  <group {g}>");
                }
            }
        }
    }
}

impl fmt::Display for LogicalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.explain())
    }
}

/// Table references whose non-outer columns appear in `output`.
pub fn output_tables(output: &[Expr]) -> BTreeSet<TableRefId> {
    output.iter().flat_map(|e| e.tables()).collect()
}

fn predicate_of(op: &LogicalOp) -> Option<&Expr> {
    match op {
        LogicalOp::Scan { predicate, .. } | LogicalOp::Join { predicate, .. } => predicate.as_ref(),
        LogicalOp::Filter { predicate, .. } => Some(predicate),
        _ => None,
    }
}

/// Which input a hash join builds its table from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildSide {
    Left,
    Right,
}

/// Physical algorithms. Join type, predicates, and expressions are read from the
/// wrapped logical node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalOp {
    TableScan,
    FileScan,
    Filter,
    NestedLoopJoin,
    HashJoin { build_side: BuildSide },
    HashAggregate,
    Sort,
    Limit,
    Project,
    /// Materialize a derived table's rows.
    Materialize,
}

impl PhysicalOp {
    pub fn is_join(&self) -> bool {
        matches!(self, PhysicalOp::NestedLoopJoin | PhysicalOp::HashJoin { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PhysicalOp::TableScan => "TableScan",
            PhysicalOp::FileScan => "FileScan",
            PhysicalOp::Filter => "Filter",
            PhysicalOp::NestedLoopJoin => "NestedLoopJoin",
            PhysicalOp::HashJoin { .. } => "HashJoin",
            PhysicalOp::HashAggregate => "HashAggregate",
            PhysicalOp::Sort => "Sort",
            PhysicalOp::Limit => "Limit",
            PhysicalOp::Project => "Project",
            PhysicalOp::Materialize => "Materialize",
        }
    }
}

/// Physical plan node wrapping the logical node it implements.
#[derive(Debug, Clone)]
pub struct PhysicalNode {
    pub op: PhysicalOp,
    pub logic: Arc<LogicalNode>,
    pub children: Vec<PhysicalNode>,
    /// Cumulative cost of this subtree.
    pub cost: Cost,
    /// Estimated output rows.
    pub card: f64,
    /// Rows produced at run time, filled in when profiling.
    pub actual_rows: Option<u64>,
}

impl PhysicalNode {
    pub fn new(op: PhysicalOp, logic: Arc<LogicalNode>, children: Vec<PhysicalNode>, cost: Cost, card: f64) -> Self {
        Self {
            op,
            logic,
            children,
            cost,
            card,
            actual_rows: None,
        }
    }

    pub fn output(&self) -> &[Expr] {
        &self.logic.output
    }

    pub fn join_type(&self) -> Option<JoinType> {
        self.logic.op.join_type()
    }

    /// Pre-order visit.
    pub fn visit(&self, f: &mut impl FnMut(&PhysicalNode)) {
        f(self);
        for c in &self.children {
            c.visit(f);
        }
    }

    /// Number of nodes in this tree matching `pred`.
    pub fn count(&self, pred: impl Fn(&PhysicalNode) -> bool) -> usize {
        let mut n = 0;
        self.visit(&mut |node| {
            if pred(node) {
                n += 1;
            }
        });
        n
    }

    /// First node in pre-order matching `pred`.
    pub fn find(&self, pred: &impl Fn(&PhysicalNode) -> bool) -> Option<&PhysicalNode> {
        if pred(self) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(pred))
    }

    /// Table references scanned by this subtree, in scan order.
    pub fn scanned_tables(&self) -> Vec<TableRefId> {
        let mut out = Vec::new();
        self.visit(&mut |n| {
            if let LogicalOp::Scan { table_ref, .. } = &n.logic.op {
                out.push(*table_ref);
            }
        });
        out
    }

    fn describe(&self) -> String {
        match (&self.op, &self.logic.op) {
            (PhysicalOp::HashJoin { build_side }, LogicalOp::Join { join_type, .. }) => {
                let side = match build_side {
                    BuildSide::Left => "left",
                    BuildSide::Right => "right",
                };
                format!("HashJoin [{}, build={}]", join_type.name(), side)
            }
            (PhysicalOp::NestedLoopJoin, LogicalOp::Join { join_type, .. }) => {
                format!("NestedLoopJoin [{}]", join_type.name())
            }
            (PhysicalOp::TableScan, LogicalOp::Scan { source: ScanSource::Table(t), .. }) => format!("TableScan {t}"),
            (PhysicalOp::FileScan, LogicalOp::Scan { source: ScanSource::File(p), .. }) => format!("FileScan '{p}'"),
            (PhysicalOp::HashAggregate | PhysicalOp::Sort | PhysicalOp::Limit | PhysicalOp::Project, logic) => {
                // reuse the logical description but with the physical name
                let text = logic.to_string();
                let rest = text.split_once(' ').map(|(_, r)| r).unwrap_or("");
                format!("{} {}", self.op.name(), rest).trim_end().to_string()
            }
            (op, _) => op.name().to_string(),
        }
    }

    /// Indented plan rendering with cost and row estimates. With `profile` set,
    /// actual row counts recorded by the executor are shown too.
    pub fn explain(&self, profile: bool) -> String {
        let mut out = String::new();
        self.explain_into(&mut out, 0, profile);
        out
    }

    fn explain_into(&self, out: &mut String, depth: usize, profile: bool) {
        let pad = "  ".repeat(depth);
        let _ = write!(
            out,
            "{pad}{} (cost={:.2}, rows={:.0}",
            self.describe(),
            self.cost.total,
            self.card
        );
        if profile {
            match self.actual_rows {
                Some(rows) => {
                    let _ = write!(out, ", actual={rows}");
                }
                None => out.push_str(", actual=?"),
            }
        }
        out.push_str(")\n");
        if let Some(pred) = predicate_of(&self.logic.op) {
            let _ = writeln!(out, "{pad}    predicate: {pred}");
        }
        for c in &self.children {
            c.explain_into(out, depth + 1, profile);
        }
    }
}

impl fmt::Display for PhysicalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.explain(false))
    }
}
