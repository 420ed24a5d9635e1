//! # Scalar Expressions
//!
//! This module defines the scalar expression tree used in predicates, projections,
//! join conditions, aggregates, and sort keys.
//!
//! ## Column Binding
//!
//! A parsed `ColumnRef` carries only the names the user wrote. The binder fills in a
//! [`ColumnBinding`]: the identity of the table reference the column resolves to, the
//! column's ordinal within that reference, and whether the reference crosses a
//! subquery boundary (an *outer* reference). Once bound, an expression is never bound
//! again; the binder rejects it.
//!
//! ## Subqueries
//!
//! `EXISTS`, `IN`, and scalar subqueries appear as [`Expr::Subquery`]. The nested
//! statement is not a child expression: it has its own scope and is bound and planned
//! separately. The binder assigns each subquery a per-statement id and records whether
//! it is correlated. After decorrelation into a mark join, the subquery's truth value
//! is read back through [`Expr::Marker`].
//!
//! ## Traversal
//!
//! Child traversal is explicit ([`Expr::children`], [`Expr::transform`]) so every
//! rewrite pass sees the same set of children.

use crate::ast::SelectStmt;
use crate::value::{DataType, Value};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of one table reference (FROM item) within a statement.
pub type TableRefId = u32;
/// Identity of one subquery expression within a statement.
pub type SubqueryId = u32;
/// Identity of one binding scope within a statement.
pub type ScopeId = u32;

/// Where a bound column lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnBinding {
    pub table_ref: TableRefId,
    pub ordinal: usize,
    /// The column was resolved in an enclosing scope.
    pub outer: bool,
}

/// Reference to a column, bound or unbound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Qualifier as written, or the resolved table alias after binding.
    pub table: Option<String>,
    pub name: String,
    pub binding: Option<ColumnBinding>,
}

impl ColumnRef {
    pub fn new(table: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            table: table.map(str::to_string),
            name: name.into(),
            binding: None,
        }
    }

    /// A column that is already bound to a table reference.
    pub fn bound(table: impl Into<String>, name: impl Into<String>, table_ref: TableRefId, ordinal: usize) -> Self {
        Self {
            table: Some(table.into()),
            name: name.into(),
            binding: Some(ColumnBinding {
                table_ref,
                ordinal,
                outer: false,
            }),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn is_outer(&self) -> bool {
        self.binding.map(|b| b.outer).unwrap_or(false)
    }

    pub fn table_ref(&self) -> Option<TableRefId> {
        self.binding.map(|b| b.table_ref)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_outer() {
            write!(f, "^")?;
        }
        match self.table {
            Some(ref t) => write!(f, "{}.{}", t, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Binary operators for comparison and arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
        )
    }

    /// The operator with its operands swapped: `a < b` is `b > a`.
    pub fn flip(self) -> Self {
        match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::LtEq => BinaryOp::GtEq,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::GtEq => BinaryOp::LtEq,
            other => other,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    IsNull,
    IsNotNull,
}

/// SQL join types.
///
/// Only `Inner` joins are commutative and associative. An inner join without a
/// predicate is a cross product. `Semi`, `Anti`, `Single`, and `Mark` are produced
/// by decorrelation and keep the left side's rows: `Single` adds at most one
/// matching right row (or NULLs), `Mark` prepends a boolean marker column named by
/// the subquery it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Semi,
    Anti,
    Single,
    Mark(SubqueryId),
}

impl JoinType {
    /// Joins whose inputs may be reordered freely.
    pub fn is_reorderable(self) -> bool {
        matches!(self, JoinType::Inner)
    }

    /// Whether right-side columns appear in the join output.
    pub fn outputs_right(self) -> bool {
        matches!(self, JoinType::Inner | JoinType::Left | JoinType::Single)
    }

    pub fn name(self) -> &'static str {
        match self {
            JoinType::Inner => "inner",
            JoinType::Left => "left",
            JoinType::Semi => "semi",
            JoinType::Anti => "anti",
            JoinType::Single => "single",
            JoinType::Mark(_) => "mark",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn name(self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }
}

/// Aggregate call. `arg` is `None` for `count(*)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggExpr {
    pub func: AggFunc,
    pub arg: Option<Box<Expr>>,
    pub distinct: bool,
}

impl AggExpr {
    pub fn new(func: AggFunc, arg: Expr) -> Self {
        Self {
            func,
            arg: Some(Box::new(arg)),
            distinct: false,
        }
    }

    pub fn count_star() -> Self {
        Self {
            func: AggFunc::Count,
            arg: None,
            distinct: false,
        }
    }
}

impl fmt::Display for AggExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let distinct = if self.distinct { "distinct " } else { "" };
        match self.arg {
            Some(ref a) => write!(f, "{}({}{})", self.func.name(), distinct, a),
            None => write!(f, "{}(*)", self.func.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub expr: Expr,
    pub ascending: bool,
}

/// The three flavours of subquery expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubqueryKind {
    Exists { negated: bool },
    /// `lhs [NOT] IN (subquery)`.
    In { lhs: Box<Expr>, negated: bool },
    /// Produces a single value; more than one row is a runtime error.
    Scalar,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubqueryExpr {
    pub kind: SubqueryKind,
    /// The nested statement as written. Bound and planned on its own.
    pub query: Box<SelectStmt>,
    /// Assigned by the binder.
    pub id: Option<SubqueryId>,
    /// Set by the binder when the nested statement references an enclosing scope.
    pub correlated: bool,
}

/// Scalar expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Column(ColumnRef),
    Literal(Value),
    BinaryOp {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Function {
        name: String,
        args: Vec<Expr>,
    },
    Aggregate(AggExpr),
    /// Flat conjunction.
    And(Vec<Expr>),
    /// Flat disjunction.
    Or(Vec<Expr>),
    /// `CASE [operand] WHEN .. THEN .. ELSE .. END`.
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    Cast {
        expr: Box<Expr>,
        to: DataType,
    },
    Subquery(SubqueryExpr),
    /// Boolean column produced by the mark join that replaced subquery `id`.
    Marker(SubqueryId),
}

impl Expr {
    pub fn col(table: &str, name: &str) -> Self {
        Expr::Column(ColumnRef::new(Some(table), name))
    }

    pub fn unqualified(name: &str) -> Self {
        Expr::Column(ColumnRef::new(None, name))
    }

    pub fn lit(v: impl Into<Value>) -> Self {
        Expr::Literal(v.into())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::binary(BinaryOp::Eq, left, right)
    }

    pub fn not(operand: Expr) -> Self {
        Expr::UnaryOp {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        }
    }

    pub fn exists(query: SelectStmt) -> Self {
        Expr::subquery(SubqueryKind::Exists { negated: false }, query)
    }

    pub fn not_exists(query: SelectStmt) -> Self {
        Expr::subquery(SubqueryKind::Exists { negated: true }, query)
    }

    pub fn in_subquery(lhs: Expr, query: SelectStmt) -> Self {
        Expr::subquery(
            SubqueryKind::In {
                lhs: Box::new(lhs),
                negated: false,
            },
            query,
        )
    }

    pub fn not_in_subquery(lhs: Expr, query: SelectStmt) -> Self {
        Expr::subquery(
            SubqueryKind::In {
                lhs: Box::new(lhs),
                negated: true,
            },
            query,
        )
    }

    pub fn scalar_subquery(query: SelectStmt) -> Self {
        Expr::subquery(SubqueryKind::Scalar, query)
    }

    fn subquery(kind: SubqueryKind, query: SelectStmt) -> Self {
        Expr::Subquery(SubqueryExpr {
            kind,
            query: Box::new(query),
            id: None,
            correlated: false,
        })
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Expr::Literal(Value::Bool(true)))
    }

    /// Direct children. Nested subquery statements are not children; the `IN`
    /// left-hand side is.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Column(_) | Expr::Literal(_) | Expr::Marker(_) => vec![],
            Expr::BinaryOp { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Expr::UnaryOp { operand, .. } => vec![operand.as_ref()],
            Expr::Function { args, .. } => args.iter().collect(),
            Expr::Aggregate(agg) => agg.arg.iter().map(|a| a.as_ref()).collect(),
            Expr::And(exprs) | Expr::Or(exprs) => exprs.iter().collect(),
            Expr::Case {
                operand,
                branches,
                else_expr,
            } => {
                let mut out: Vec<&Expr> = operand.iter().map(|e| e.as_ref()).collect();
                for (w, t) in branches {
                    out.push(w);
                    out.push(t);
                }
                out.extend(else_expr.iter().map(|e| e.as_ref()));
                out
            }
            Expr::Cast { expr, .. } => vec![expr.as_ref()],
            Expr::Subquery(sq) => match sq.kind {
                SubqueryKind::In { ref lhs, .. } => vec![lhs.as_ref()],
                _ => vec![],
            },
        }
    }

    /// Mutable counterpart of [`Expr::children`], in the same order.
    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Column(_) | Expr::Literal(_) | Expr::Marker(_) => vec![],
            Expr::BinaryOp { left, right, .. } => vec![left.as_mut(), right.as_mut()],
            Expr::UnaryOp { operand, .. } => vec![operand.as_mut()],
            Expr::Function { args, .. } => args.iter_mut().collect(),
            Expr::Aggregate(agg) => agg.arg.iter_mut().map(|a| a.as_mut()).collect(),
            Expr::And(exprs) | Expr::Or(exprs) => exprs.iter_mut().collect(),
            Expr::Case {
                operand,
                branches,
                else_expr,
            } => {
                let mut out: Vec<&mut Expr> = operand.iter_mut().map(|e| e.as_mut()).collect();
                for (w, t) in branches.iter_mut() {
                    out.push(w);
                    out.push(t);
                }
                out.extend(else_expr.iter_mut().map(|e| e.as_mut()));
                out
            }
            Expr::Cast { expr, .. } => vec![expr.as_mut()],
            Expr::Subquery(sq) => match sq.kind {
                SubqueryKind::In { ref mut lhs, .. } => vec![lhs.as_mut()],
                _ => vec![],
            },
        }
    }

    /// Pre-order visit of this expression and all descendants.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        for c in self.children() {
            c.visit(f);
        }
    }

    /// Bottom-up rewrite. `f` sees each node after its children were rewritten.
    pub fn transform(mut self, f: &mut impl FnMut(Expr) -> Expr) -> Expr {
        for c in self.children_mut() {
            let child = std::mem::replace(c, Expr::Literal(Value::Null));
            *c = child.transform(f);
        }
        f(self)
    }

    /// Return all column references in this expression.
    pub fn columns(&self) -> Vec<&ColumnRef> {
        let mut cols = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Column(c) = e {
                cols.push(c);
            }
        });
        cols
    }

    /// Table references read by non-outer columns.
    pub fn tables(&self) -> BTreeSet<TableRefId> {
        self.columns()
            .into_iter()
            .filter(|c| !c.is_outer())
            .filter_map(|c| c.table_ref())
            .collect()
    }

    /// Outer (correlated) column references.
    pub fn outer_refs(&self) -> Vec<&ColumnRef> {
        self.columns().into_iter().filter(|c| c.is_outer()).collect()
    }

    pub fn has_outer_refs(&self) -> bool {
        !self.outer_refs().is_empty()
    }

    /// Subquery expressions reachable without entering another subquery.
    pub fn subqueries(&self) -> Vec<&SubqueryExpr> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Subquery(sq) = e {
                out.push(sq);
            }
        });
        out
    }

    pub fn has_subquery(&self) -> bool {
        !self.subqueries().is_empty()
    }

    pub fn has_correlated_subquery(&self) -> bool {
        self.subqueries().iter().any(|sq| sq.correlated)
    }

    pub fn has_marker(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= matches!(e, Expr::Marker(_)));
        found
    }

    pub fn has_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= matches!(e, Expr::Aggregate(_)));
        found
    }

    /// Aggregate calls in this expression, outermost first.
    pub fn aggregates(&self) -> Vec<&AggExpr> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Aggregate(a) = e {
                out.push(a);
            }
        });
        out
    }

    /// Flatten AND-chains: (A AND (B AND C)) → [A, B, C].
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::And(exprs) => exprs.iter().flat_map(|e| e.conjuncts()).collect(),
            other => vec![other],
        }
    }

    /// Owned variant of [`Expr::conjuncts`].
    pub fn into_conjuncts(self) -> Vec<Expr> {
        match self {
            Expr::And(exprs) => exprs.into_iter().flat_map(|e| e.into_conjuncts()).collect(),
            other => vec![other],
        }
    }

    /// If this is `column = column`, the two columns.
    pub fn as_column_equality(&self) -> Option<(&ColumnRef, &ColumnRef)> {
        match self {
            Expr::BinaryOp {
                op: BinaryOp::Eq,
                left,
                right,
            } => match (left.as_ref(), right.as_ref()) {
                (Expr::Column(l), Expr::Column(r)) => Some((l, r)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Hash that ignores operand order of `=` and `<>`, so `a.x = b.y` and
    /// `b.y = a.x` identify the same conjunct.
    pub fn canonical_hash(&self) -> u64 {
        let mut h = DefaultHasher::new();
        match self {
            Expr::BinaryOp {
                op: op @ (BinaryOp::Eq | BinaryOp::NotEq),
                left,
                right,
            } => {
                let (a, b) = (left.canonical_hash(), right.canonical_hash());
                op.hash(&mut h);
                a.min(b).hash(&mut h);
                a.max(b).hash(&mut h);
            }
            other => other.hash(&mut h),
        }
        h.finish()
    }

    /// Turn outer references into `tables` into ordinary local references.
    pub fn localize_outer_refs(self, tables: &BTreeSet<TableRefId>) -> Expr {
        self.transform(&mut |e| match e {
            Expr::Column(mut c) => {
                if let Some(ref mut b) = c.binding {
                    if b.outer && tables.contains(&b.table_ref) {
                        b.outer = false;
                    }
                }
                Expr::Column(c)
            }
            other => other,
        })
    }
}

/// Join conjuncts back into one predicate. Trivially true conjuncts are dropped;
/// returns `None` when nothing remains.
pub fn and_all(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
    let mut flat: Vec<Expr> = exprs
        .into_iter()
        .flat_map(Expr::into_conjuncts)
        .filter(|e| !e.is_true())
        .collect();
    match flat.len() {
        0 => None,
        1 => flat.pop(),
        _ => Some(Expr::And(flat)),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "{c}"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::BinaryOp { op, left, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            Expr::UnaryOp { op, operand } => match op {
                UnaryOp::Not => write!(f, "NOT ({operand})"),
                UnaryOp::Neg => write!(f, "-{operand}"),
                UnaryOp::IsNull => write!(f, "{operand} IS NULL"),
                UnaryOp::IsNotNull => write!(f, "{operand} IS NOT NULL"),
            },
            Expr::Function { name, args } => {
                write!(f, "{name}(")?;
                write_list(f, args, ", ")?;
                write!(f, ")")
            }
            Expr::Aggregate(a) => write!(f, "{a}"),
            Expr::And(exprs) => write_list(f, exprs, " AND "),
            Expr::Or(exprs) => {
                write!(f, "(")?;
                write_list(f, exprs, " OR ")?;
                write!(f, ")")
            }
            Expr::Case {
                operand,
                branches,
                else_expr,
            } => {
                write!(f, "CASE")?;
                if let Some(o) = operand {
                    write!(f, " {o}")?;
                }
                for (w, t) in branches {
                    write!(f, " WHEN {w} THEN {t}")?;
                }
                if let Some(e) = else_expr {
                    write!(f, " ELSE {e}")?;
                }
                write!(f, " END")
            }
            Expr::Cast { expr, to } => write!(f, "CAST({expr} AS {to})"),
            Expr::Subquery(sq) => {
                let id = sq.id.map(|i| i.to_string()).unwrap_or_else(|| "?".into());
                let corr = if sq.correlated { ", correlated" } else { "" };
                match sq.kind {
                    SubqueryKind::Exists { negated: false } => write!(f, "EXISTS(subquery {id}{corr})"),
                    SubqueryKind::Exists { negated: true } => write!(f, "NOT EXISTS(subquery {id}{corr})"),
                    SubqueryKind::In { ref lhs, negated } => {
                        let not = if negated { "NOT " } else { "" };
                        write!(f, "{lhs} {not}IN (subquery {id}{corr})")
                    }
                    SubqueryKind::Scalar => write!(f, "(subquery {id}{corr})"),
                }
            }
            Expr::Marker(id) => write!(f, "#marker{id}"),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, exprs: &[Expr], sep: &str) -> fmt::Result {
    for (i, e) in exprs.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{e}")?;
    }
    Ok(())
}
