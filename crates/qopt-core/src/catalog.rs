//! # Catalog Interface
//!
//! The catalog provides the optimizer with table definitions and statistics. The
//! binder uses column definitions to resolve names and expand `*`; the cardinality
//! estimator uses row counts, per-column distinct counts, null fractions, and
//! histograms.
//!
//! ## Trait Design
//!
//! `Catalog` is object safe and shared as `Arc<dyn Catalog>` so different metadata
//! backends can be plugged in. `InMemoryCatalog` is a HashMap-backed implementation
//! with the small DDL surface the optimizer needs: create, drop, and attach
//! statistics.

use crate::error::CatalogError;
use crate::stats::{ColumnStatistics, Statistics};
use crate::value::DataType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A column of a table (or of a file source).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Catalog provides schema and statistics information.
pub trait Catalog: Send + Sync {
    fn table(&self, name: &str) -> Result<Arc<TableDef>, CatalogError>;

    /// Statistics for a table, `None` when never analyzed.
    fn table_stats(&self, name: &str) -> Option<&Statistics>;

    fn column_stats(&self, table: &str, column: &str) -> Option<&ColumnStatistics> {
        self.table_stats(table)?.column_stats.get(column)
    }
}

#[derive(Debug, Clone)]
struct TableEntry {
    def: Arc<TableDef>,
    stats: Option<Statistics>,
}

/// In-memory catalog for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    tables: HashMap<String, TableEntry>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// `CREATE TABLE name (columns...)`.
    pub fn create_table(&mut self, name: &str, columns: Vec<ColumnDef>) -> Result<(), CatalogError> {
        if self.tables.contains_key(name) {
            return Err(CatalogError::TableExists(name.to_string()));
        }
        for (i, c) in columns.iter().enumerate() {
            if columns[..i].iter().any(|p| p.name == c.name) {
                return Err(CatalogError::DuplicateColumn {
                    table: name.to_string(),
                    column: c.name.clone(),
                });
            }
        }
        debug!(table = name, columns = columns.len(), "create table");
        self.tables.insert(
            name.to_string(),
            TableEntry {
                def: Arc::new(TableDef {
                    name: name.to_string(),
                    columns,
                }),
                stats: None,
            },
        );
        Ok(())
    }

    /// `DROP TABLE name`.
    pub fn drop_table(&mut self, name: &str) -> Result<(), CatalogError> {
        self.tables
            .remove(name)
            .map(|_| debug!(table = name, "drop table"))
            .ok_or_else(|| CatalogError::TableNotFound(name.to_string()))
    }

    /// Attach (or replace) statistics. Column statistics must name existing columns.
    pub fn set_stats(&mut self, name: &str, stats: Statistics) -> Result<(), CatalogError> {
        let entry = self
            .tables
            .get_mut(name)
            .ok_or_else(|| CatalogError::TableNotFound(name.to_string()))?;
        if let Some(col) = stats
            .column_stats
            .keys()
            .find(|c| entry.def.column_index(c).is_none())
        {
            return Err(CatalogError::UnknownColumn {
                table: name.to_string(),
                column: col.clone(),
            });
        }
        entry.stats = Some(stats);
        Ok(())
    }

    /// Create a table with statistics in one step.
    pub fn add_table(&mut self, name: &str, columns: Vec<ColumnDef>, stats: Statistics) -> Result<(), CatalogError> {
        self.create_table(name, columns)?;
        self.set_stats(name, stats)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

impl Catalog for InMemoryCatalog {
    fn table(&self, name: &str) -> Result<Arc<TableDef>, CatalogError> {
        self.tables
            .get(name)
            .map(|e| Arc::clone(&e.def))
            .ok_or_else(|| CatalogError::TableNotFound(name.to_string()))
    }

    fn table_stats(&self, name: &str) -> Option<&Statistics> {
        self.tables.get(name)?.stats.as_ref()
    }
}
