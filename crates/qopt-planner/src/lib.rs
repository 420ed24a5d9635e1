//! # qopt-planner: Statement to Physical Plan
//!
//! The front half of the optimizer and the driver that ties it to the search in
//! `qopt-core`. A statement arrives as a [`SelectStmt`](qopt_core::ast::SelectStmt)
//! from an external parser and leaves as a costed
//! [`PhysicalNode`](qopt_core::plan::PhysicalNode) tree.
//!
//! ## Module Overview
//!
//! - **`binder`**: scopes, name resolution, table references, subquery ids and
//!   correlation flags.
//! - **`builder`**: the fixed-shape logical plan for a bound statement.
//! - **`decorrelate`**: correlated subqueries to semi, anti, single and mark joins.
//! - **`pushdown`**: movable filters into scans and join predicates.
//! - **`physical`**: translation without the memo, with DPccp/DPBushy for large
//!   join regions.
//! - **`optimizer`**: the end-to-end pipeline and its configuration.

pub mod binder;
pub mod builder;
pub mod decorrelate;
pub mod optimizer;
pub mod physical;
pub mod pushdown;

pub use binder::{BindContext, BoundSelect};
pub use builder::{LogicalPlan, PlanBuilder};
pub use decorrelate::{decorrelate, DecorrelationReport};
pub use optimizer::{CompiledQuery, Optimizer, OptimizerConfig, PreparedQuery};
