//! End-to-end compilation of small statements.
//!
//! ## What These Tests Verify
//! - An equi-join keeps nested-loop and hash alternatives in one memo group and
//!   picks the hash join with the expected cardinality
//! - Correlated EXISTS, scalar and OR-ed subqueries compile into semi, single and
//!   mark joins with no nested plan left behind
//! - A COUNT subquery stays nested and is reported
//! - Decorrelating a decorrelated plan changes nothing
//! - Explain output carries costs, predicates and profiling columns

use qopt_core::ast::SelectStmt;
use qopt_core::catalog::{Catalog, ColumnDef, InMemoryCatalog};
use qopt_core::expr::{AggExpr, AggFunc, BinaryOp, Expr, JoinType};
use qopt_core::plan::{LogicalOp, PhysicalNode, PhysicalOp};
use qopt_core::stats::{ColumnStatistics, Statistics};
use qopt_core::value::DataType;
use qopt_planner::decorrelate::remaining_correlated;
use qopt_planner::{decorrelate, Optimizer, OptimizerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Fixture: a(a1..a4) with 1000 rows, b(b1..b4) with 100 rows
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn catalog() -> Arc<dyn Catalog> {
    let mut catalog = InMemoryCatalog::new();
    for (name, rows) in [("a", 1_000.0), ("b", 100.0)] {
        let columns: Vec<ColumnDef> = (1..=4)
            .map(|i| ColumnDef::new(format!("{name}{i}"), DataType::Int))
            .collect();
        let mut stats = Statistics::new(rows);
        for (i, c) in columns.iter().enumerate() {
            // the first column is a key, the rest repeat
            let distinct = if i == 0 { rows } else { rows / 10.0 };
            stats = stats.with_column(c.name.clone(), ColumnStatistics::new(distinct, 0.0));
        }
        catalog.add_table(name, columns, stats).unwrap();
    }
    Arc::new(catalog)
}

fn optimizer() -> Optimizer {
    init_tracing();
    Optimizer::with_defaults(catalog())
}

fn col(name: &str) -> Expr {
    Expr::unqualified(name)
}

fn correlated_b() -> SelectStmt {
    SelectStmt::star()
        .from_tables(&["b"])
        .filter(Expr::eq(col("b1"), col("a1")))
}

fn has_join(plan: &PhysicalNode, join_type: JoinType) -> bool {
    plan.find(&|n: &PhysicalNode| n.join_type() == Some(join_type)).is_some()
}

// ---------------------------------------------------------------------------
// Equi-join
// ---------------------------------------------------------------------------

#[test]
fn test_equi_join_memo_group_holds_both_algorithms() {
    let optimizer = optimizer();
    let stmt = SelectStmt::star()
        .from_tables(&["a", "b"])
        .filter(Expr::eq(col("a1"), col("b1")));
    let prepared = optimizer.prepare(&stmt).unwrap();

    // the equality ends up on the join between the two scans
    let mut on = None;
    prepared.logical.root.visit(&mut |n| {
        if let LogicalOp::Join { predicate, .. } = &n.op {
            on = predicate.clone();
        }
    });
    assert_eq!(on.map(|p| p.to_string()), Some("a.a1 = b.b1".to_string()));

    let (best, memo, _) = optimizer
        .optimize_with_memo(&prepared.logical.root, &prepared.tables)
        .unwrap();
    let join_group = memo
        .groups()
        .find(|g| g.physical_exprs.iter().any(|&e| memo.expr(e).physical().is_some_and(|p| p.op.is_join())))
        .unwrap();
    let ops: Vec<PhysicalOp> = join_group
        .physical_exprs
        .iter()
        .filter_map(|&e| memo.expr(e).physical().map(|p| p.op))
        .collect();
    assert!(ops.contains(&PhysicalOp::NestedLoopJoin), "{}", memo.dump());
    assert!(ops.iter().any(|op| matches!(op, PhysicalOp::HashJoin { .. })), "{}", memo.dump());

    let join = best.find(&|n: &PhysicalNode| n.op.is_join()).unwrap();
    assert!(matches!(join.op, PhysicalOp::HashJoin { .. }));
    // max(1, 1000 * 100 / max(1000, 100))
    assert_eq!(join.card, 100.0);
}

#[test]
fn test_compile_is_repeatable() {
    let optimizer = optimizer();
    let stmt = SelectStmt::star()
        .from_tables(&["a", "b"])
        .filter(Expr::eq(col("a1"), col("b1")));
    let first = optimizer.compile(&stmt).unwrap();
    let second = optimizer.compile(&stmt).unwrap();
    assert_eq!(first.plan.cost.total, second.plan.cost.total);
    assert_eq!(first.explain(), second.explain());
}

// ---------------------------------------------------------------------------
// Subqueries
// ---------------------------------------------------------------------------

#[test]
fn test_exists_compiles_to_semi_join() {
    let optimizer = optimizer();
    let stmt = SelectStmt::star().from_tables(&["a"]).filter(Expr::exists(correlated_b()));
    let compiled = optimizer.compile(&stmt).unwrap();

    assert_eq!(compiled.report.semi_joins, 1);
    assert!(compiled.subqueries.is_empty());
    assert!(remaining_correlated(&compiled.logical).is_empty());
    assert!(has_join(&compiled.plan, JoinType::Semi));
    let mut scanned = compiled.plan.scanned_tables();
    scanned.sort_unstable();
    assert_eq!(scanned.len(), 2);
}

#[test]
fn test_not_exists_compiles_to_anti_join() {
    let optimizer = optimizer();
    let stmt = SelectStmt::star().from_tables(&["a"]).filter(Expr::not_exists(correlated_b()));
    let compiled = optimizer.compile(&stmt).unwrap();
    assert_eq!(compiled.report.anti_joins, 1);
    assert!(has_join(&compiled.plan, JoinType::Anti));
}

#[test]
fn test_scalar_aggregate_compiles_to_single_join() {
    let optimizer = optimizer();
    let inner = SelectStmt::select(vec![Expr::Aggregate(AggExpr::new(AggFunc::Max, col("b2")))])
        .from_tables(&["b"])
        .filter(Expr::eq(col("b1"), col("a1")));
    let stmt = SelectStmt::star()
        .from_tables(&["a"])
        .filter(Expr::eq(col("a2"), Expr::scalar_subquery(inner)));
    let compiled = optimizer.compile(&stmt).unwrap();

    assert_eq!(compiled.report.single_joins, 1);
    assert!(compiled.subqueries.is_empty());
    assert!(has_join(&compiled.plan, JoinType::Single));
    // the comparison with the subquery's value is evaluated above the join
    let pinned = compiled
        .plan
        .find(&|n: &PhysicalNode| matches!(n.logic.op, LogicalOp::Filter { movable: false, .. }))
        .unwrap();
    assert!(has_join(&pinned.children[0], JoinType::Single));
    assert!(compiled.plan.find(&|n: &PhysicalNode| n.op == PhysicalOp::HashAggregate).is_some());
}

#[test]
fn test_disjunctive_exists_compiles_to_mark_join() {
    let optimizer = optimizer();
    let stmt = SelectStmt::star().from_tables(&["a"]).filter(Expr::Or(vec![
        Expr::binary(BinaryOp::Gt, col("a3"), Expr::lit(5)),
        Expr::exists(correlated_b()),
    ]));
    let compiled = optimizer.compile(&stmt).unwrap();
    assert_eq!(compiled.report.mark_joins, 1);
    assert!(has_join(&compiled.plan, JoinType::Mark(0)));
    assert!(compiled.subqueries.is_empty());
}

#[test]
fn test_count_subquery_stays_nested() {
    let optimizer = optimizer();
    let inner = SelectStmt::select(vec![Expr::Aggregate(AggExpr::count_star())])
        .from_tables(&["b"])
        .filter(Expr::eq(col("b1"), col("a1")));
    let stmt = SelectStmt::star()
        .from_tables(&["a"])
        .filter(Expr::binary(BinaryOp::Gt, Expr::scalar_subquery(inner), Expr::lit(1)));
    let compiled = optimizer.compile(&stmt).unwrap();

    assert_eq!(compiled.report.rewrites(), 0);
    assert_eq!(compiled.report.unsupported.len(), 1);
    assert_eq!(remaining_correlated(&compiled.logical), vec![0]);
    // the nested plan is optimized on its own
    assert_eq!(compiled.subqueries[&0].scanned_tables(), vec![1]);
    assert!(compiled.explain().contains("subquery 0:"));
}

#[test]
fn test_decorrelation_reaches_a_fixed_point() {
    let optimizer = optimizer();
    let stmt = SelectStmt::star()
        .from_tables(&["a"])
        .filter(Expr::And(vec![
            Expr::exists(correlated_b()),
            Expr::in_subquery(
                col("a2"),
                SelectStmt::select(vec![col("b2")])
                    .from_tables(&["b"])
                    .filter(Expr::eq(col("b3"), col("a3"))),
            ),
        ]));
    let prepared = optimizer.prepare(&stmt).unwrap();
    assert_eq!(prepared.report.semi_joins, 2);

    let (again, report) = decorrelate(&prepared.logical);
    assert_eq!(report.rewrites(), 0);
    assert!(Arc::ptr_eq(&again.root, &prepared.logical.root));
}

// ---------------------------------------------------------------------------
// Explain and configuration
// ---------------------------------------------------------------------------

#[test]
fn test_explain_with_profiling() {
    init_tracing();
    let config = OptimizerConfig {
        profile: true,
        ..OptimizerConfig::default()
    };
    let optimizer = Optimizer::new(catalog(), Arc::new(qopt_rules::default_rule_registry()), config);
    let stmt = SelectStmt::star()
        .from_tables(&["a", "b"])
        .filter(Expr::eq(col("a1"), col("b1")))
        .explain();
    let compiled = optimizer.compile(&stmt).unwrap();

    assert!(compiled.explain);
    let text = compiled.explain();
    assert!(text.contains("cost="), "{text}");
    assert!(text.contains("actual=?"), "{text}");
    assert!(text.contains("predicate: a.a1 = b.b1"), "{text}");
}

#[test]
fn test_config_from_json_drives_direct_translation() {
    init_tracing();
    let config: OptimizerConfig =
        serde_json::from_str(r#"{"use_memo": false, "join_order": null, "cost": {"memory_weight": 2.0}}"#).unwrap();
    assert_eq!(config.cost.memory_weight, 2.0);
    assert_eq!(config.cost.cpu_weight, 1.0);

    let optimizer = Optimizer::new(catalog(), Arc::new(qopt_rules::default_rule_registry()), config);
    let stmt = SelectStmt::star()
        .from_tables(&["a", "b"])
        .filter(Expr::eq(col("a1"), col("b1")));
    let compiled = optimizer.compile(&stmt).unwrap();
    let join = compiled.plan.find(&|n: &PhysicalNode| n.op.is_join()).unwrap();
    assert!(matches!(join.op, PhysicalOp::HashJoin { .. }));
    assert_eq!(join.card, 100.0);
}

#[test]
fn test_bind_errors_surface_from_compile() {
    let optimizer = optimizer();
    let stmt = SelectStmt::star().from_tables(&["a", "b"]).filter(Expr::eq(col("a1"), col("nope")));
    let err = optimizer.compile(&stmt).unwrap_err();
    assert!(err.to_string().contains("nope"), "{err}");

    let stmt = SelectStmt::star().from_tables(&["missing"]);
    assert!(optimizer.compile(&stmt).is_err());
}
