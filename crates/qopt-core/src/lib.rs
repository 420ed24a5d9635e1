//! # qopt-core: Query Optimizer Core
//!
//! Data model and search machinery for a cost-based SQL query optimizer: plan and
//! expression trees, statistics and cardinality estimation, a memo with a
//! Cascades-lite search, and dynamic-programming join-order resolvers.
//!
//! ## Module Overview
//!
//! - **`value`**: the closed value type used by literals, histograms, and evaluation.
//! - **`expr`**: scalar expressions, column bindings, subquery expressions.
//! - **`ast`**: the statement tree handed over by the SQL front end.
//! - **`catalog`**: table definitions and statistics lookup.
//! - **`tableref`**: per-statement registry of table references.
//! - **`stats`**: statistics, equal-depth histograms, selectivity and cardinality.
//! - **`cost`**: cost type and the pluggable cost model.
//! - **`plan`**: logical and physical plan nodes, explain output.
//! - **`memo`**: groups of equivalent plan fragments keyed by signature.
//! - **`rule`** / **`pattern`**: rule trait, registry, declarative matching.
//! - **`search`**: memo exploration and bottom-up costing.
//! - **`join_graph`**: bit-set algebra and join graphs.
//! - **`join_order`**: DPccp and DPBushy resolvers.
//! - **`exec`**: correlated-parameter side channel and scalar evaluation.
//! - **`error`**: error enums for every layer.

pub mod ast;
pub mod catalog;
pub mod cost;
pub mod error;
pub mod exec;
pub mod expr;
pub mod join_graph;
pub mod join_order;
pub mod memo;
pub mod pattern;
pub mod plan;
pub mod rule;
pub mod search;
pub mod stats;
pub mod tableref;
pub mod value;

pub use error::{Error, Result};
