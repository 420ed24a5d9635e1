//! # Statement Input Model
//!
//! The parser is an external component; it hands the optimizer a `SelectStmt` tree.
//! Expressions inside the tree are unbound [`Expr`]s. The small builder methods on
//! `SelectStmt` exist so embedders and tests can assemble statements without a parser.

use crate::catalog::ColumnDef;
use crate::expr::{Expr, JoinType};
use serde::{Deserialize, Serialize};

/// A `SELECT` statement, possibly with CTEs and an `EXPLAIN` prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectStmt {
    pub ctes: Vec<Cte>,
    pub projection: Vec<SelectItem>,
    pub from: Vec<FromItem>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<Expr>,
    /// `EXPLAIN SELECT ...`: plan only, print the plan.
    pub explain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectItem {
    Expr { expr: Expr, alias: Option<String> },
    /// `*`
    Wildcard,
    /// `t.*`
    QualifiedWildcard(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FromItem {
    /// A catalog table or, when the name matches a CTE in scope, a CTE reference.
    Table { name: String, alias: Option<String> },
    /// An external file read through a declared column list.
    File {
        path: String,
        columns: Vec<ColumnDef>,
        alias: String,
    },
    /// A derived table `(SELECT ...) AS alias`.
    Subquery { query: Box<SelectStmt>, alias: String },
    Join {
        left: Box<FromItem>,
        right: Box<FromItem>,
        join_type: JoinType,
        on: Option<Expr>,
    },
}

impl FromItem {
    pub fn table(name: &str) -> Self {
        FromItem::Table {
            name: name.to_string(),
            alias: None,
        }
    }

    pub fn aliased(name: &str, alias: &str) -> Self {
        FromItem::Table {
            name: name.to_string(),
            alias: Some(alias.to_string()),
        }
    }

    pub fn join(self, right: FromItem, join_type: JoinType, on: Option<Expr>) -> Self {
        FromItem::Join {
            left: Box::new(self),
            right: Box::new(right),
            join_type,
            on,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cte {
    pub name: String,
    pub query: SelectStmt,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderTerm {
    pub expr: Expr,
    pub ascending: bool,
}

impl SelectStmt {
    /// `SELECT *`
    pub fn star() -> Self {
        Self {
            projection: vec![SelectItem::Wildcard],
            ..Default::default()
        }
    }

    /// `SELECT e1, e2, ...`
    pub fn select(exprs: Vec<Expr>) -> Self {
        Self {
            projection: exprs
                .into_iter()
                .map(|expr| SelectItem::Expr { expr, alias: None })
                .collect(),
            ..Default::default()
        }
    }

    pub fn from(mut self, item: FromItem) -> Self {
        self.from.push(item);
        self
    }

    pub fn from_tables(mut self, names: &[&str]) -> Self {
        self.from.extend(names.iter().map(|n| FromItem::table(n)));
        self
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.selection = Some(predicate);
        self
    }

    pub fn group_by(mut self, keys: Vec<Expr>) -> Self {
        self.group_by = keys;
        self
    }

    pub fn having(mut self, predicate: Expr) -> Self {
        self.having = Some(predicate);
        self
    }

    pub fn order_by(mut self, expr: Expr, ascending: bool) -> Self {
        self.order_by.push(OrderTerm { expr, ascending });
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(Expr::lit(n));
        self
    }

    pub fn with_cte(mut self, name: &str, query: SelectStmt) -> Self {
        self.ctes.push(Cte {
            name: name.to_string(),
            query,
        });
        self
    }

    pub fn explain(mut self) -> Self {
        self.explain = true;
        self
    }
}
