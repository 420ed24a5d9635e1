//! TPC-H Q5 through the full pipeline, with SF=1 statistics.
//!
//! ## What These Tests Verify
//! - The six-way join compiles through the memo and through both DP resolvers
//! - DPccp and DPBushy agree on the cost of the best tree
//! - Reordering never loses to the join order written in the FROM list
//! - The region filter on `r_name` lands on the region scan

use qopt_core::ast::SelectStmt;
use qopt_core::catalog::{Catalog, ColumnDef, InMemoryCatalog};
use qopt_core::expr::{AggExpr, AggFunc, BinaryOp, Expr};
use qopt_core::join_order::JoinOrderStrategy;
use qopt_core::plan::{LogicalOp, PhysicalNode, PhysicalOp};
use qopt_core::stats::{ColumnStatistics, Statistics};
use qopt_core::value::DataType;
use qopt_planner::{CompiledQuery, Optimizer, OptimizerConfig};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// `(table, rows, [(column, type, distinct values)])`
type TableSpec = (&'static str, f64, &'static [(&'static str, DataType, f64)]);

const TPCH: [TableSpec; 6] = [
    (
        "region",
        5.0,
        &[("r_regionkey", DataType::Int, 5.0), ("r_name", DataType::Str, 5.0)],
    ),
    (
        "nation",
        25.0,
        &[
            ("n_nationkey", DataType::Int, 25.0),
            ("n_regionkey", DataType::Int, 5.0),
            ("n_name", DataType::Str, 25.0),
        ],
    ),
    (
        "supplier",
        10_000.0,
        &[("s_suppkey", DataType::Int, 10_000.0), ("s_nationkey", DataType::Int, 25.0)],
    ),
    (
        "customer",
        150_000.0,
        &[("c_custkey", DataType::Int, 150_000.0), ("c_nationkey", DataType::Int, 25.0)],
    ),
    (
        "orders",
        1_500_000.0,
        &[
            ("o_orderkey", DataType::Int, 1_500_000.0),
            ("o_custkey", DataType::Int, 100_000.0),
        ],
    ),
    (
        "lineitem",
        6_000_000.0,
        &[
            ("l_orderkey", DataType::Int, 1_500_000.0),
            ("l_suppkey", DataType::Int, 10_000.0),
            ("l_extendedprice", DataType::Float, 1_000_000.0),
        ],
    ),
];

fn catalog() -> Arc<dyn Catalog> {
    let mut catalog = InMemoryCatalog::new();
    for (name, rows, columns) in TPCH {
        let mut stats = Statistics::new(rows);
        let mut defs = Vec::new();
        for (column, data_type, distinct) in columns {
            defs.push(ColumnDef::new(*column, *data_type));
            stats = stats.with_column(*column, ColumnStatistics::new(*distinct, 0.0));
        }
        catalog.add_table(name, defs, stats).unwrap();
    }
    Arc::new(catalog)
}

fn c(name: &str) -> Expr {
    Expr::unqualified(name)
}

/// Q5 without the date range, FROM list in the benchmark's order.
fn q5() -> SelectStmt {
    let revenue = Expr::Aggregate(AggExpr::new(AggFunc::Sum, c("l_extendedprice")));
    SelectStmt::select(vec![c("n_name"), revenue.clone()])
        .from_tables(&["customer", "orders", "lineitem", "supplier", "nation", "region"])
        .filter(Expr::And(vec![
            Expr::eq(c("c_custkey"), c("o_custkey")),
            Expr::eq(c("l_orderkey"), c("o_orderkey")),
            Expr::eq(c("l_suppkey"), c("s_suppkey")),
            Expr::eq(c("c_nationkey"), c("s_nationkey")),
            Expr::eq(c("s_nationkey"), c("n_nationkey")),
            Expr::eq(c("n_regionkey"), c("r_regionkey")),
            Expr::eq(c("r_name"), Expr::lit("ASIA")),
        ]))
        .group_by(vec![c("n_name")])
        .order_by(revenue, false)
}

fn compile(config: OptimizerConfig) -> CompiledQuery {
    let optimizer = Optimizer::new(catalog(), Arc::new(qopt_rules::default_rule_registry()), config);
    optimizer.compile(&q5()).unwrap()
}

fn resolver(strategy: JoinOrderStrategy) -> OptimizerConfig {
    OptimizerConfig {
        join_order: Some(strategy),
        join_region_threshold: 6,
        ..OptimizerConfig::default()
    }
}

fn joins(plan: &PhysicalNode) -> usize {
    plan.count(|n| n.op.is_join())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_resolvers_agree_on_q5() {
    let ccp = compile(resolver(JoinOrderStrategy::DpCcp));
    let bushy = compile(resolver(JoinOrderStrategy::DpBushy));

    let (x, y) = (ccp.plan.cost.total, bushy.plan.cost.total);
    assert!((x - y).abs() <= 1e-9 * x.abs().max(1.0), "DPccp {x} != DPBushy {y}");
    for plan in [&ccp.plan, &bushy.plan] {
        assert_eq!(joins(plan), 5);
        assert_eq!(plan.count(|n| n.op == PhysicalOp::NestedLoopJoin), 0, "{}", plan.explain(false));
        let mut scanned = plan.scanned_tables();
        scanned.sort_unstable();
        assert_eq!(scanned, vec![0, 1, 2, 3, 4, 5]);
    }
}

#[test]
fn test_reordering_beats_written_order() {
    let written = compile(OptimizerConfig {
        use_memo: false,
        join_order: None,
        ..OptimizerConfig::default()
    });
    let memo = compile(OptimizerConfig {
        join_order: None,
        ..OptimizerConfig::default()
    });
    let ccp = compile(resolver(JoinOrderStrategy::DpCcp));

    assert_eq!(joins(&written.plan), 5);
    assert!(memo.plan.cost.total <= written.plan.cost.total);
    assert!(ccp.plan.cost.total <= written.plan.cost.total);
}

#[test]
fn test_region_filter_reaches_its_scan() {
    let compiled = compile(resolver(JoinOrderStrategy::DpCcp));
    let region = compiled
        .plan
        .find(&|n: &PhysicalNode| n.op == PhysicalOp::TableScan && n.scanned_tables() == vec![5])
        .unwrap();
    let LogicalOp::Scan {
        predicate: Some(ref pred),
        ..
    } = region.logic.op
    else {
        panic!("expected the r_name filter on the region scan");
    };
    assert!(
        matches!(pred, Expr::BinaryOp { op: BinaryOp::Eq, right, .. } if **right == Expr::lit("ASIA")),
        "{pred}"
    );
    // one region of five, not a cross product
    assert!(region.card < 5.0);
}

#[test]
fn test_aggregate_and_order_stay_above_the_joins() {
    let compiled = compile(resolver(JoinOrderStrategy::DpBushy));
    let text = compiled.explain();
    let sort = text.find("Sort").unwrap();
    let agg = text.find("HashAggregate").unwrap();
    let join = text.find("HashJoin").unwrap();
    assert!(sort < agg && agg < join, "{text}");
}
