//! # Statistics and Cardinality Estimation
//!
//! This module defines the statistics structures kept in the catalog and the
//! formulas that turn them into row-count estimates for plan nodes.
//!
//! ## Statistics Hierarchy
//!
//! - **Table-level**: row count.
//! - **Column-level**: number of distinct values (NDV), null fraction, min/max, and an
//!   optional equal-depth histogram.
//!
//! ## Derivation Formulas
//!
//! Cardinalities are derived bottom-up:
//!
//! - **Scan**: base rows × selectivity of the pushed-down predicate, floored at 1.
//! - **Filter**: input rows × selectivity, floored at 1.
//! - **Aggregate**: product of the group keys' NDVs (1 for a key without statistics),
//!   capped by input rows, floored at 1. A global aggregate yields one row.
//! - **Join**: `|L| × |R| / max(1, d)` where `d` is the smallest, over the equality
//!   conjuncts, of `max(NDV(left key), NDV(right key))`. When any conjunct is not a
//!   column equality the join is treated as a cross product filtered by the combined
//!   selectivity of all conjuncts. Floored at 1.
//!
//! ## Selectivity Estimation
//!
//! A comparison between a column and a literal uses the column's histogram when
//! present: `=` is `1 / (buckets × distinct values in the value's bucket)`, `>` and
//! `>=` count the buckets strictly or inclusively above the value's bucket, `<` and
//! `<=` count the buckets at or below it. Without a histogram, equality is `1 / NDV`
//! and ranges use a flat 1/3. Without any statistics the defaults below apply.
//! AND multiplies, OR uses inclusion-exclusion, NOT complements. Every estimate is
//! renormalized into `(0, 1]`; zero becomes [`SELECTIVITY_EPSILON`].

use crate::expr::{BinaryOp, ColumnRef, Expr, JoinType, TableRefId, UnaryOp};
use crate::plan::LogicalOp;
use crate::rule::OptContext;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Default filter selectivity when we can't determine it.
pub const DEFAULT_FILTER_SELECTIVITY: f64 = 0.1;
/// Range predicate selectivity without a histogram.
pub const DEFAULT_RANGE_SELECTIVITY: f64 = 1.0 / 3.0;
/// Smallest selectivity ever reported.
pub const SELECTIVITY_EPSILON: f64 = 0.001;
/// Row count assumed for sources without statistics.
pub const DEFAULT_ROW_COUNT: f64 = 1000.0;
/// Bucket count used by [`Statistics::analyze`].
pub const DEFAULT_HISTOGRAM_BUCKETS: usize = 64;

/// Table-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub row_count: f64,
    pub column_stats: HashMap<String, ColumnStatistics>,
}

impl Statistics {
    pub fn new(row_count: f64) -> Self {
        Self {
            row_count,
            column_stats: HashMap::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, stats: ColumnStatistics) -> Self {
        self.column_stats.insert(name.into(), stats);
        self
    }

    /// Gather statistics from sample rows, as `ANALYZE` would. Rows are in column order.
    pub fn analyze(columns: &[&str], rows: &[Vec<Value>], buckets: usize) -> Self {
        let mut stats = Statistics::new(rows.len() as f64);
        for (i, name) in columns.iter().enumerate() {
            let values: Vec<Value> = rows.iter().map(|r| r.get(i).cloned().unwrap_or(Value::Null)).collect();
            stats
                .column_stats
                .insert(name.to_string(), ColumnStatistics::from_values(&values, buckets));
        }
        stats
    }
}

/// Per-column statistics used for selectivity estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnStatistics {
    /// Number of distinct values (NDV).
    pub distinct_count: f64,
    /// Fraction of rows that are NULL [0.0, 1.0].
    pub null_fraction: f64,
    pub min_value: Option<Value>,
    pub max_value: Option<Value>,
    pub histogram: Option<Histogram>,
}

impl ColumnStatistics {
    pub fn new(distinct_count: f64, null_fraction: f64) -> Self {
        Self {
            distinct_count,
            null_fraction,
            min_value: None,
            max_value: None,
            histogram: None,
        }
    }

    pub fn with_histogram(mut self, histogram: Histogram) -> Self {
        self.histogram = Some(histogram);
        self
    }

    /// Build statistics, including a histogram, from a column sample.
    pub fn from_values(values: &[Value], buckets: usize) -> Self {
        let non_null: Vec<Value> = values.iter().filter(|v| !v.is_null()).cloned().collect();
        let distinct: BTreeSet<&Value> = non_null.iter().collect();
        let null_fraction = if values.is_empty() {
            0.0
        } else {
            (values.len() - non_null.len()) as f64 / values.len() as f64
        };
        Self {
            distinct_count: distinct.len() as f64,
            null_fraction,
            min_value: distinct.first().map(|v| (*v).clone()),
            max_value: distinct.last().map(|v| (*v).clone()),
            histogram: Histogram::from_values(&non_null, buckets),
        }
    }
}

/// Equal-depth histogram.
///
/// Bucket `i` holds the values in `(boundaries[i-1], boundaries[i]]`, each bucket
/// holding `depth` sampled rows (the last one possibly fewer). `distincts[i]` is the
/// number of distinct values seen in bucket `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// Smallest sampled value, the lower edge of bucket 0.
    #[serde(default)]
    pub min: Option<Value>,
    pub boundaries: Vec<Value>,
    pub distincts: Vec<u64>,
    pub depth: u64,
}

impl Histogram {
    /// Build from non-null values. `None` for an empty sample.
    pub fn from_values(values: &[Value], max_buckets: usize) -> Option<Self> {
        if values.is_empty() || max_buckets == 0 {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort();
        let buckets = max_buckets.min(sorted.len());
        let depth = sorted.len().div_ceil(buckets);
        let mut boundaries = Vec::with_capacity(buckets);
        let mut distincts = Vec::with_capacity(buckets);
        for chunk in sorted.chunks(depth) {
            let mut distinct = 1u64;
            for w in chunk.windows(2) {
                if w[0] != w[1] {
                    distinct += 1;
                }
            }
            // chunks() never yields an empty slice
            if let Some(last) = chunk.last() {
                boundaries.push(last.clone());
                distincts.push(distinct);
            }
        }
        Some(Self {
            min: sorted.first().cloned(),
            boundaries,
            distincts,
            depth: depth as u64,
        })
    }

    pub fn num_buckets(&self) -> usize {
        self.boundaries.len()
    }

    /// Index of the first bucket whose upper boundary is `>= value`. Values above
    /// every boundary map to `num_buckets()`.
    pub fn bucket_of(&self, value: &Value) -> usize {
        self.boundaries.partition_point(|b| b < value)
    }

    /// Selectivity of `column <op> value`, renormalized into `(0, 1]`.
    pub fn selectivity(&self, op: BinaryOp, value: &Value) -> f64 {
        let nb = self.num_buckets();
        if nb == 0 {
            return normalize_selectivity(DEFAULT_FILTER_SELECTIVITY);
        }
        let n = nb as f64;
        let idx = self.bucket_of(value);
        let above_all = idx >= nb;
        let below_all = self.min.as_ref().is_some_and(|min| value < min);
        let eq = if above_all || below_all {
            0.0
        } else {
            1.0 / (n * self.distincts[idx].max(1) as f64)
        };
        let raw = match op {
            BinaryOp::Eq => eq,
            BinaryOp::NotEq => 1.0 - eq,
            BinaryOp::Gt | BinaryOp::GtEq if above_all => 0.0,
            BinaryOp::Gt | BinaryOp::GtEq if below_all => 1.0,
            BinaryOp::Gt => (nb - idx - 1) as f64 / n,
            BinaryOp::GtEq => (nb - idx) as f64 / n,
            BinaryOp::Lt | BinaryOp::LtEq if below_all => 0.0,
            BinaryOp::Lt | BinaryOp::LtEq => (idx + 1).min(nb) as f64 / n,
            _ => DEFAULT_FILTER_SELECTIVITY,
        };
        normalize_selectivity(raw)
    }
}

/// Clamp a raw estimate into `(0, 1]`. Zero, negative, and NaN become epsilon.
pub fn normalize_selectivity(sel: f64) -> f64 {
    if sel.is_nan() || sel <= 0.0 {
        SELECTIVITY_EPSILON
    } else {
        sel.max(SELECTIVITY_EPSILON).min(1.0)
    }
}

/// Estimate the fraction of rows satisfying `pred`.
pub fn estimate_selectivity(pred: &Expr, ctx: &OptContext) -> f64 {
    let raw = match pred {
        Expr::And(conjuncts) => conjuncts.iter().map(|c| estimate_selectivity(c, ctx)).product::<f64>(),
        Expr::Or(disjuncts) => 1.0 - disjuncts
            .iter()
            .map(|d| 1.0 - estimate_selectivity(d, ctx))
            .product::<f64>(),
        Expr::UnaryOp { op: UnaryOp::Not, operand } => 1.0 - estimate_selectivity(operand, ctx),
        Expr::UnaryOp {
            op: op @ (UnaryOp::IsNull | UnaryOp::IsNotNull),
            operand,
        } => {
            let null_fraction = match operand.as_ref() {
                Expr::Column(c) => ctx.column_stats(c).map(|s| s.null_fraction),
                _ => None,
            };
            match (op, null_fraction) {
                (UnaryOp::IsNull, Some(f)) => f,
                (_, Some(f)) => 1.0 - f,
                (UnaryOp::IsNull, None) => DEFAULT_FILTER_SELECTIVITY,
                (_, None) => 1.0 - DEFAULT_FILTER_SELECTIVITY,
            }
        }
        Expr::BinaryOp { op, left, right } if op.is_comparison() => {
            comparison_selectivity(*op, left, right, ctx)
        }
        Expr::Literal(Value::Bool(true)) => 1.0,
        Expr::Literal(Value::Bool(false)) | Expr::Literal(Value::Null) => 0.0,
        _ => DEFAULT_FILTER_SELECTIVITY,
    };
    normalize_selectivity(raw)
}

fn comparison_selectivity(op: BinaryOp, left: &Expr, right: &Expr, ctx: &OptContext) -> f64 {
    match (left, right) {
        (Expr::Column(c), Expr::Literal(v)) => column_literal_selectivity(c, op, v, ctx),
        (Expr::Literal(v), Expr::Column(c)) => column_literal_selectivity(c, op.flip(), v, ctx),
        (Expr::Column(l), Expr::Column(r)) if op == BinaryOp::Eq => {
            match (ctx.column_stats(l), ctx.column_stats(r)) {
                (Some(ls), Some(rs)) => 1.0 / ls.distinct_count.max(rs.distinct_count).max(1.0),
                (Some(s), None) | (None, Some(s)) => 1.0 / s.distinct_count.max(1.0),
                (None, None) => DEFAULT_FILTER_SELECTIVITY,
            }
        }
        _ => match op {
            BinaryOp::Eq => DEFAULT_FILTER_SELECTIVITY,
            BinaryOp::NotEq => 1.0 - DEFAULT_FILTER_SELECTIVITY,
            _ => DEFAULT_RANGE_SELECTIVITY,
        },
    }
}

fn column_literal_selectivity(col: &ColumnRef, op: BinaryOp, value: &Value, ctx: &OptContext) -> f64 {
    if value.is_null() {
        // comparisons with NULL never hold
        return 0.0;
    }
    let Some(stats) = ctx.column_stats(col) else {
        return match op {
            BinaryOp::Eq => DEFAULT_FILTER_SELECTIVITY,
            BinaryOp::NotEq => 1.0 - DEFAULT_FILTER_SELECTIVITY,
            _ => DEFAULT_RANGE_SELECTIVITY,
        };
    };
    if let Some(ref h) = stats.histogram {
        return h.selectivity(op, value);
    }
    let eq = 1.0 / stats.distinct_count.max(1.0);
    match op {
        BinaryOp::Eq => eq,
        BinaryOp::NotEq => 1.0 - eq,
        _ => DEFAULT_RANGE_SELECTIVITY,
    }
}

/// Row estimate and produced table references of one plan input.
#[derive(Debug, Clone, Copy)]
pub struct InputEstimate<'a> {
    pub card: f64,
    pub tables: &'a BTreeSet<TableRefId>,
}

/// Output cardinality of `op` given its inputs' estimates.
pub fn derive_cardinality(op: &LogicalOp, inputs: &[InputEstimate], ctx: &OptContext) -> f64 {
    let child = inputs.first().map(|i| i.card).unwrap_or(1.0);
    let card = match op {
        LogicalOp::Scan {
            table_ref, predicate, ..
        } => {
            let base = ctx.base_row_count(*table_ref).unwrap_or(DEFAULT_ROW_COUNT);
            let sel = predicate.as_ref().map_or(1.0, |p| estimate_selectivity(p, ctx));
            base * sel
        }
        LogicalOp::Filter { predicate, .. } => child * estimate_selectivity(predicate, ctx),
        LogicalOp::Join {
            join_type, predicate, ..
        } => match inputs {
            [left, right] => derive_join_card(*join_type, predicate.as_ref(), left, right, ctx),
            _ => child,
        },
        LogicalOp::Aggregate { group_by, .. } => {
            let groups: f64 = group_by.iter().map(|k| key_distinct(k, ctx).unwrap_or(1.0)).product();
            groups.min(child)
        }
        LogicalOp::Limit { count } => child.min(*count as f64),
        LogicalOp::Order { .. } | LogicalOp::Project { .. } | LogicalOp::FromQuery { .. } => child,
    };
    card.max(1.0)
}

/// Cardinality of a join of two inputs.
pub fn derive_join_card(
    join_type: JoinType,
    predicate: Option<&Expr>,
    left: &InputEstimate,
    right: &InputEstimate,
    ctx: &OptContext,
) -> f64 {
    let inner = (left.card * right.card * join_selectivity(predicate, left, right, ctx)).max(1.0);
    let card = match join_type {
        JoinType::Inner => inner,
        JoinType::Left => inner.max(left.card),
        JoinType::Semi => inner.min(left.card),
        JoinType::Anti => left.card - inner.min(left.card),
        JoinType::Single | JoinType::Mark(_) => left.card,
    };
    card.max(1.0)
}

/// Fraction of the cross product of `left` and `right` kept by `predicate`.
pub fn join_selectivity(predicate: Option<&Expr>, left: &InputEstimate, right: &InputEstimate, ctx: &OptContext) -> f64 {
    let conjuncts: Vec<&Expr> = predicate
        .map(|p| p.conjuncts())
        .unwrap_or_default()
        .into_iter()
        .filter(|c| !c.is_true())
        .collect();
    if conjuncts.is_empty() {
        return 1.0;
    }
    let mut min_distinct = f64::INFINITY;
    for c in &conjuncts {
        match equi_key_distinct(c, left, right, ctx) {
            Some(d) => min_distinct = min_distinct.min(d),
            None => {
                // Non-equality join: filtered cross product.
                return normalize_selectivity(conjuncts.iter().map(|c| estimate_selectivity(c, ctx)).product());
            }
        }
    }
    normalize_selectivity(1.0 / min_distinct.max(1.0))
}

/// `max(NDV(l), NDV(r))` for a `left.col = right.col` conjunct. A key without
/// statistics counts its side's cardinality as its NDV.
fn equi_key_distinct(conjunct: &Expr, left: &InputEstimate, right: &InputEstimate, ctx: &OptContext) -> Option<f64> {
    let (a, b) = conjunct.as_column_equality()?;
    let side_of = |c: &ColumnRef| {
        let t = c.table_ref()?;
        if c.is_outer() {
            None
        } else if left.tables.contains(&t) {
            Some(true)
        } else if right.tables.contains(&t) {
            Some(false)
        } else {
            None
        }
    };
    let (lc, rc) = match (side_of(a)?, side_of(b)?) {
        (true, false) => (a, b),
        (false, true) => (b, a),
        _ => return None,
    };
    let ldv = ctx.column_stats(lc).map_or(left.card, |s| s.distinct_count);
    let rdv = ctx.column_stats(rc).map_or(right.card, |s| s.distinct_count);
    Some(ldv.max(rdv))
}

fn key_distinct(key: &Expr, ctx: &OptContext) -> Option<f64> {
    match key {
        Expr::Column(c) => ctx.column_stats(c).map(|s| s.distinct_count.max(1.0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(range: std::ops::Range<i64>) -> Vec<Value> {
        range.map(Value::Int).collect()
    }

    #[test]
    fn test_histogram_equal_depth() {
        let h = Histogram::from_values(&ints(0..100), 10).unwrap();
        assert_eq!(h.num_buckets(), 10);
        assert_eq!(h.depth, 10);
        assert_eq!(h.boundaries[0], Value::Int(9));
        assert!(h.distincts.iter().all(|d| *d == 10));
        assert_eq!(h.bucket_of(&Value::Int(9)), 0);
        assert_eq!(h.bucket_of(&Value::Int(10)), 1);
        assert_eq!(h.bucket_of(&Value::Int(1000)), 10);
    }

    #[test]
    fn test_histogram_selectivity_formulas() {
        let h = Histogram::from_values(&ints(0..100), 10).unwrap();
        let v = Value::Int(35);
        assert!((h.selectivity(BinaryOp::Eq, &v) - 0.01).abs() < 1e-9);
        assert!((h.selectivity(BinaryOp::Gt, &v) - 0.6).abs() < 1e-9);
        assert!((h.selectivity(BinaryOp::GtEq, &v) - 0.7).abs() < 1e-9);
        assert!((h.selectivity(BinaryOp::Lt, &v) - 0.4).abs() < 1e-9);
        assert!((h.selectivity(BinaryOp::LtEq, &v) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_zero_selectivity_clamps_to_epsilon() {
        let h = Histogram::from_values(&ints(0..100), 10).unwrap();
        assert_eq!(h.selectivity(BinaryOp::Eq, &Value::Int(5000)), SELECTIVITY_EPSILON);
        assert_eq!(h.selectivity(BinaryOp::Gt, &Value::Int(99)), SELECTIVITY_EPSILON);
        assert_eq!(normalize_selectivity(f64::NAN), SELECTIVITY_EPSILON);
        assert_eq!(normalize_selectivity(3.0), 1.0);
    }

    #[test]
    fn test_probes_outside_the_sample_range() {
        let h = Histogram::from_values(&ints(10..110), 10).unwrap();
        assert_eq!(h.min, Some(Value::Int(10)));
        let below = Value::Int(-5);
        assert_eq!(h.selectivity(BinaryOp::Gt, &below), 1.0);
        assert_eq!(h.selectivity(BinaryOp::GtEq, &below), 1.0);
        assert_eq!(h.selectivity(BinaryOp::Lt, &below), SELECTIVITY_EPSILON);
        assert_eq!(h.selectivity(BinaryOp::LtEq, &below), SELECTIVITY_EPSILON);
        assert_eq!(h.selectivity(BinaryOp::Eq, &below), SELECTIVITY_EPSILON);
        assert_eq!(h.selectivity(BinaryOp::NotEq, &below), 1.0);
        // the minimum itself is inside bucket 0
        assert!((h.selectivity(BinaryOp::LtEq, &Value::Int(10)) - 0.1).abs() < 1e-9);
        assert_eq!(h.selectivity(BinaryOp::GtEq, &Value::Int(500)), SELECTIVITY_EPSILON);
    }

    #[test]
    fn test_skewed_histogram_distincts() {
        let mut values = vec![Value::Int(7); 90];
        values.extend(ints(0..10));
        let h = Histogram::from_values(&values, 10).unwrap();
        // 0..=6 and the first 7s share bucket 0; the middle buckets hold only 7
        assert_eq!(h.distincts[0], 8);
        assert!(h.distincts[1..9].iter().all(|d| *d == 1));
        assert_eq!(h.distincts[9], 3);
        let eq = h.selectivity(BinaryOp::Eq, &Value::Int(7));
        assert!((eq - 1.0 / 80.0).abs() < 1e-9, "eq selectivity {eq}");
    }

    #[test]
    fn test_column_stats_from_values() {
        let values = vec![Value::Int(1), Value::Null, Value::Int(1), Value::Int(3)];
        let cs = ColumnStatistics::from_values(&values, 4);
        assert_eq!(cs.distinct_count, 2.0);
        assert!((cs.null_fraction - 0.25).abs() < 1e-9);
        assert_eq!(cs.min_value, Some(Value::Int(1)));
        assert_eq!(cs.max_value, Some(Value::Int(3)));
        assert_eq!(cs.histogram.unwrap().num_buckets(), 3);
    }

    #[test]
    fn test_analyze_rows() {
        let rows: Vec<Vec<Value>> = (0..20).map(|i| vec![Value::Int(i % 5), Value::Int(i)]).collect();
        let stats = Statistics::analyze(&["k", "v"], &rows, 4);
        assert_eq!(stats.row_count, 20.0);
        assert_eq!(stats.column_stats["k"].distinct_count, 5.0);
        assert_eq!(stats.column_stats["v"].distinct_count, 20.0);
    }
}
