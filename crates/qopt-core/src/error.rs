//! # Error Taxonomy
//!
//! Each optimizer layer reports its own error enum so callers can match on the
//! failure they care about. [`Error`] unifies them for the end-to-end pipeline.

use crate::expr::TableRefId;
use crate::join_graph::TableSet;
use crate::memo::GroupId;

/// Convenience alias used throughout the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Any error raised while compiling a query.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Optimize(#[from] OptimizeError),
    #[error(transparent)]
    JoinOrder(#[from] JoinOrderError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Catalog lookups and DDL.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    /// No table with this name is registered.
    #[error("table not found: {0}")]
    TableNotFound(String),
    /// CREATE TABLE for a name that already exists.
    #[error("table already exists: {0}")]
    TableExists(String),
    /// Two columns of one table share a name.
    #[error("duplicate column {column} in table {table}")]
    DuplicateColumn { table: String, column: String },
    /// Statistics were supplied for a column the table does not have.
    #[error("unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },
}

/// Name resolution failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BindError {
    /// The column is not visible from the current scope or any ancestor.
    #[error("column not found: {0}")]
    ColumnNotFound(String),
    /// More than one table in the same scope exposes the column.
    #[error("ambiguous column reference: {0}")]
    AmbiguousColumn(String),
    /// A qualifier or alias does not name any table in scope.
    #[error("table or alias not found: {0}")]
    TableNotFound(String),
    /// The same expression tree was handed to the binder twice.
    #[error("expression already bound: {0}")]
    AlreadyBound(String),
    /// Scalar and IN subqueries must produce exactly one column.
    #[error("subquery must return exactly one column, found {found}")]
    SubqueryColumnCount { found: usize },
    /// Two FROM items in one scope use the same alias.
    #[error("duplicate table alias: {0}")]
    DuplicateAlias(String),
    /// LIMIT takes a non-negative integer literal.
    #[error("invalid LIMIT expression: {0}")]
    InvalidLimit(String),
    /// A statement without FROM items has no input to plan.
    #[error("SELECT without FROM is not supported")]
    EmptyFrom,
    /// Aggregates are not allowed in WHERE or GROUP BY.
    #[error("aggregate not allowed in {0}")]
    MisplacedAggregate(&'static str),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Memo search failures. All of these indicate an internal inconsistency
/// except `BudgetExhausted`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptimizeError {
    /// After exploration a group still has no physical member to cost.
    #[error("group {0} has no physical implementation")]
    NoPhysicalPlan(GroupId),
    /// A rule produced a node whose signature differs from its target group.
    #[error("rule {rule} produced signature {found:#x} for group {group} (expected {expected:#x})")]
    SignatureMismatch {
        rule: String,
        group: GroupId,
        expected: u64,
        found: u64,
    },
    /// A plan referenced a group that does not exist.
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),
    /// A scan refers to a table reference the bind context does not know.
    #[error("unknown table reference {0}")]
    UnknownTableRef(TableRefId),
    /// The search stopped before any plan could be costed.
    #[error("search budget exhausted after {iterations} rule applications")]
    BudgetExhausted { iterations: usize },
}

/// Join-order resolver failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JoinOrderError {
    /// The join graph has no relations.
    #[error("join graph is empty")]
    EmptyGraph,
    /// The bit-set representation caps the number of relations.
    #[error("join graph has {0} relations, at most {max} supported", max = crate::join_graph::MAX_JOIN_RELATIONS)]
    TooManyRelations(usize),
    /// The graph is not connected and cross products are disabled.
    #[error("join graph is disconnected ({components} components) and cross products are not allowed")]
    Disconnected { components: usize },
    /// A pair referenced a subset with no best tree yet.
    #[error("no plan recorded for table set {0}")]
    MissingSubplan(TableSet),
    /// Enumeration exceeded the configured pair budget.
    #[error("join enumeration exceeded {max_pairs} pairs")]
    BudgetExhausted { max_pairs: u64 },
    /// Exhaustive enumeration would scan more subsets than allowed.
    #[error("join enumeration exceeded {max_subsets} subsets")]
    SubsetBudgetExhausted { max_subsets: u64 },
}

/// Failures of the row-level evaluation side channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    /// A scalar subquery produced more than one row.
    #[error("scalar subquery returned more than one row")]
    ScalarSubqueryMultipleRows,
    /// A correlated column was read with no outer row bound for its table.
    #[error("no outer row bound for table reference {0}")]
    MissingParameter(TableRefId),
    /// The row does not carry the requested column.
    #[error("column {column} (ordinal {ordinal}) not available in row")]
    MissingColumn { column: String, ordinal: usize },
    /// Evaluated a column reference that never went through the binder.
    #[error("unbound column: {0}")]
    UnboundColumn(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("division by zero")]
    DivisionByZero,
    /// The expression kind is evaluated by a plan operator, not row by row.
    #[error("cannot evaluate {0} row by row")]
    Unsupported(String),
}
