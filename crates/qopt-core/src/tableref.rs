//! # Table References
//!
//! Every FROM item of a statement (base table, file, derived table, CTE reference,
//! or parenthesized join) becomes one `TableRefInfo` in a statement-wide registry.
//! Bound columns point into this registry by [`TableRefId`], and the cardinality
//! estimator follows those ids back to catalog statistics.

use crate::catalog::{Catalog, ColumnDef};
use crate::expr::{ColumnBinding, ColumnRef, ScopeId, TableRefId};
use crate::stats::ColumnStatistics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableRefKind {
    Base { table: String },
    File { path: String },
    /// Derived table `(SELECT ...) AS alias`.
    Subquery,
    Cte { name: String },
    /// A join tree used as a FROM item. Its members are bound individually.
    JoinGroup { members: Vec<TableRefId> },
}

#[derive(Debug, Clone)]
pub struct TableRefInfo {
    pub id: TableRefId,
    pub alias: String,
    pub kind: TableRefKind,
    pub columns: Vec<ColumnDef>,
    /// Scope whose FROM clause introduced this reference.
    pub scope: ScopeId,
    /// Columns of this reference read from inside a nested subquery.
    pub correlated_columns: Vec<ColumnRef>,
}

impl TableRefInfo {
    /// The reference's columns as bound column expressions.
    pub fn column_refs(&self) -> Vec<ColumnRef> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, c)| ColumnRef::bound(self.alias.clone(), c.name.clone(), self.id, i))
            .collect()
    }

    pub fn base_table(&self) -> Option<&str> {
        match self.kind {
            TableRefKind::Base { ref table } => Some(table),
            _ => None,
        }
    }
}

/// Arena of table references for one statement.
#[derive(Debug, Clone, Default)]
pub struct TableRefRegistry {
    refs: Vec<TableRefInfo>,
}

impl TableRefRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, alias: impl Into<String>, kind: TableRefKind, columns: Vec<ColumnDef>, scope: ScopeId) -> TableRefId {
        let id = self.refs.len() as TableRefId;
        self.refs.push(TableRefInfo {
            id,
            alias: alias.into(),
            kind,
            columns,
            scope,
            correlated_columns: Vec::new(),
        });
        id
    }

    pub fn get(&self, id: TableRefId) -> Option<&TableRefInfo> {
        self.refs.get(id as usize)
    }

    pub fn get_mut(&mut self, id: TableRefId) -> Option<&mut TableRefInfo> {
        self.refs.get_mut(id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableRefInfo> {
        self.refs.iter()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Record a column read through an outer reference, once per column.
    pub fn add_correlated_column(&mut self, column: &ColumnRef) {
        let Some(info) = column.table_ref().and_then(|id| self.get_mut(id)) else {
            return;
        };
        let ordinal = column.binding.map(|b| b.ordinal);
        if !info
            .correlated_columns
            .iter()
            .any(|c| c.binding.map(|b| b.ordinal) == ordinal)
        {
            info.correlated_columns.push(column.clone());
        }
    }

    /// Catalog statistics behind a bound column. Only base tables carry statistics.
    pub fn column_stats<'c>(&self, binding: &ColumnBinding, catalog: &'c dyn Catalog) -> Option<&'c ColumnStatistics> {
        let info = self.get(binding.table_ref)?;
        let table = info.base_table()?;
        let column = info.columns.get(binding.ordinal)?;
        catalog.column_stats(table, &column.name)
    }

    /// Row count of the table behind a reference, when it is an analyzed base table.
    pub fn base_row_count(&self, id: TableRefId, catalog: &dyn Catalog) -> Option<f64> {
        let table = self.get(id)?.base_table()?;
        catalog.table_stats(table).map(|s| s.row_count)
    }
}
