//! # Correlated Evaluation Side Channel
//!
//! The executor is outside this crate, but two contracts belong to the optimizer
//! because the plans it produces depend on them:
//!
//! - **Parameters.** A correlated column is not read from the row flowing through
//!   the inner plan. Before evaluating a correlated subtree the executor binds the
//!   current outer row under its table reference in a [`ParamContext`]; outer column
//!   references read from there. One row is active per table reference; binding
//!   again replaces it.
//! - **Row lookup.** Local columns are addressed by `(table reference, ordinal)`
//!   through [`RowView`], so operators may lay out joined rows however they like.
//!
//! [`evaluate`] implements SQL three-valued logic for scalar expressions. Aggregates
//! and subqueries are computed by plan operators and cannot be evaluated here.

use crate::error::ExecError;
use crate::expr::{BinaryOp, ColumnRef, Expr, SubqueryId, TableRefId, UnaryOp};
use crate::value::{DataType, Value};
use ordered_float::OrderedFloat;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::trace;

pub type Row = Vec<Value>;

/// Column access for a row produced by some plan operator.
pub trait RowView {
    /// Column `ordinal` of table reference `table_ref`, if the row carries it.
    fn value(&self, table_ref: TableRefId, ordinal: usize) -> Option<&Value>;

    /// Marker column produced by the mark join that replaced subquery `id`.
    fn marker(&self, _id: SubqueryId) -> Option<Value> {
        None
    }
}

/// A row assembled from the rows of several table references.
#[derive(Debug, Clone, Default)]
pub struct JoinedRow {
    parts: HashMap<TableRefId, Row>,
    markers: HashMap<SubqueryId, Value>,
}

impl JoinedRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, table_ref: TableRefId, row: Row) -> Self {
        self.parts.insert(table_ref, row);
        self
    }

    pub fn with_marker(mut self, id: SubqueryId, value: Value) -> Self {
        self.markers.insert(id, value);
        self
    }
}

impl RowView for JoinedRow {
    fn value(&self, table_ref: TableRefId, ordinal: usize) -> Option<&Value> {
        self.parts.get(&table_ref).and_then(|r| r.get(ordinal))
    }

    fn marker(&self, id: SubqueryId) -> Option<Value> {
        self.markers.get(&id).cloned()
    }
}

/// Active outer rows, keyed by the table reference that produced them.
#[derive(Debug, Clone, Default)]
pub struct ParamContext {
    params: HashMap<TableRefId, Row>,
}

impl ParamContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `row` the active binding for `table_ref`, returning the previous one.
    pub fn bind(&mut self, table_ref: TableRefId, row: Row) -> Option<Row> {
        trace!(table_ref, "bound correlation parameter");
        self.params.insert(table_ref, row)
    }

    pub fn unbind(&mut self, table_ref: TableRefId) -> Option<Row> {
        self.params.remove(&table_ref)
    }

    pub fn is_bound(&self, table_ref: TableRefId) -> bool {
        self.params.contains_key(&table_ref)
    }

    pub fn get(&self, column: &ColumnRef, table_ref: TableRefId, ordinal: usize) -> Result<&Value, ExecError> {
        let row = self
            .params
            .get(&table_ref)
            .ok_or(ExecError::MissingParameter(table_ref))?;
        row.get(ordinal).ok_or_else(|| ExecError::MissingColumn {
            column: column.to_string(),
            ordinal,
        })
    }
}

/// The single row a scalar subquery produced: `None` for no rows, an error for more
/// than one.
pub fn single_row<T>(rows: impl IntoIterator<Item = T>) -> Result<Option<T>, ExecError> {
    let mut rows = rows.into_iter();
    let first = rows.next();
    if rows.next().is_some() {
        return Err(ExecError::ScalarSubqueryMultipleRows);
    }
    Ok(first)
}

/// Evaluate a bound scalar expression against `row`, reading outer references from
/// `params`.
pub fn evaluate(expr: &Expr, row: &dyn RowView, params: &ParamContext) -> Result<Value, ExecError> {
    match expr {
        Expr::Column(c) => {
            let binding = c.binding.ok_or_else(|| ExecError::UnboundColumn(c.to_string()))?;
            if binding.outer {
                return params.get(c, binding.table_ref, binding.ordinal).cloned();
            }
            row.value(binding.table_ref, binding.ordinal)
                .cloned()
                .ok_or_else(|| ExecError::MissingColumn {
                    column: c.to_string(),
                    ordinal: binding.ordinal,
                })
        }
        Expr::Literal(v) => Ok(v.clone()),
        Expr::BinaryOp { op, left, right } => {
            let l = evaluate(left, row, params)?;
            let r = evaluate(right, row, params)?;
            binary(*op, l, r)
        }
        Expr::UnaryOp { op, operand } => {
            let v = evaluate(operand, row, params)?;
            match op {
                UnaryOp::IsNull => Ok(Value::Bool(v.is_null())),
                UnaryOp::IsNotNull => Ok(Value::Bool(!v.is_null())),
                UnaryOp::Not => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(ExecError::TypeMismatch(format!("NOT {other}"))),
                },
                UnaryOp::Neg => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(ExecError::TypeMismatch(format!("-{other}"))),
                },
            }
        }
        Expr::And(items) => {
            // false wins over null
            let mut saw_null = false;
            for e in items {
                match truth(evaluate(e, row, params)?)? {
                    Some(false) => return Ok(Value::Bool(false)),
                    None => saw_null = true,
                    Some(true) => {}
                }
            }
            Ok(if saw_null { Value::Null } else { Value::Bool(true) })
        }
        Expr::Or(items) => {
            let mut saw_null = false;
            for e in items {
                match truth(evaluate(e, row, params)?)? {
                    Some(true) => return Ok(Value::Bool(true)),
                    None => saw_null = true,
                    Some(false) => {}
                }
            }
            Ok(if saw_null { Value::Null } else { Value::Bool(false) })
        }
        Expr::Case {
            operand,
            branches,
            else_expr,
        } => {
            let subject = operand.as_ref().map(|o| evaluate(o, row, params)).transpose()?;
            for (when, then) in branches {
                let w = evaluate(when, row, params)?;
                let hit = match subject {
                    Some(ref s) => truth(binary(BinaryOp::Eq, s.clone(), w)?)?,
                    None => truth(w)?,
                };
                if hit == Some(true) {
                    return evaluate(then, row, params);
                }
            }
            match else_expr {
                Some(e) => evaluate(e, row, params),
                None => Ok(Value::Null),
            }
        }
        Expr::Cast { expr, to } => cast(evaluate(expr, row, params)?, *to),
        Expr::Function { name, args } => {
            let values = args
                .iter()
                .map(|a| evaluate(a, row, params))
                .collect::<Result<Vec<_>, _>>()?;
            function(name, values)
        }
        Expr::Marker(id) => Ok(row.marker(*id).unwrap_or(Value::Null)),
        Expr::Aggregate(a) => Err(ExecError::Unsupported(a.to_string())),
        Expr::Subquery(_) => Err(ExecError::Unsupported("subquery".into())),
    }
}

fn truth(v: Value) -> Result<Option<bool>, ExecError> {
    match v {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(b)),
        other => Err(ExecError::TypeMismatch(format!("expected boolean, found {other}"))),
    }
}

fn comparable(l: &Value, r: &Value) -> bool {
    match (l.data_type(), r.data_type()) {
        (Some(a), Some(b)) => a == b || (numeric(a) && numeric(b)),
        _ => false,
    }
}

fn numeric(t: DataType) -> bool {
    matches!(t, DataType::Int | DataType::Float)
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, ExecError> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    if op.is_comparison() {
        if !comparable(&l, &r) {
            return Err(ExecError::TypeMismatch(format!("{l} {} {r}", op.symbol())));
        }
        let ord = l.cmp(&r);
        let b = match op {
            BinaryOp::Eq => ord == Ordering::Equal,
            BinaryOp::NotEq => ord != Ordering::Equal,
            BinaryOp::Lt => ord == Ordering::Less,
            BinaryOp::LtEq => ord != Ordering::Greater,
            BinaryOp::Gt => ord == Ordering::Greater,
            _ => ord != Ordering::Less,
        };
        return Ok(Value::Bool(b));
    }
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => {
            let v = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                _ => {
                    if b == 0 {
                        return Err(ExecError::DivisionByZero);
                    }
                    a.checked_div(b)
                }
            };
            v.map(Value::Int)
                .ok_or_else(|| ExecError::TypeMismatch(format!("integer overflow in {a} {} {b}", op.symbol())))
        }
        (l, r) => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Err(ExecError::TypeMismatch(format!("{l} {} {r}", op.symbol())));
            };
            let v = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                _ => {
                    if b == 0.0 {
                        return Err(ExecError::DivisionByZero);
                    }
                    a / b
                }
            };
            Ok(Value::Float(OrderedFloat(v)))
        }
    }
}

fn cast(v: Value, to: DataType) -> Result<Value, ExecError> {
    let mismatch = |v: &Value| ExecError::TypeMismatch(format!("cannot cast {v} to {to}"));
    Ok(match (v, to) {
        (Value::Null, _) => Value::Null,
        (Value::Int(i), DataType::Float) => Value::float(i as f64),
        (Value::Float(f), DataType::Int) => Value::Int(f.0 as i64),
        (Value::Int(i), DataType::Bool) => Value::Bool(i != 0),
        (Value::DateTime(s), DataType::Int) => Value::Int(s),
        (Value::Int(i), DataType::DateTime) => Value::DateTime(i),
        (Value::Str(s), DataType::Int) => Value::Int(s.trim().parse().map_err(|_| mismatch(&Value::Str(s.clone())))?),
        (Value::Str(s), DataType::Float) => {
            Value::float(s.trim().parse().map_err(|_| mismatch(&Value::Str(s.clone())))?)
        }
        (v, DataType::Str) => Value::Str(v.to_string()),
        (v, t) if v.data_type() == Some(t) => v,
        (v, _) => return Err(mismatch(&v)),
    })
}

fn function(name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(ExecError::TypeMismatch(format!("{name} takes {n} argument(s), got {}", args.len())))
        }
    };
    match name.to_ascii_lowercase().as_str() {
        "coalesce" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "abs" => {
            arity(1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(i.abs())),
                Value::Float(f) => Ok(Value::float(f.0.abs())),
                Value::Null => Ok(Value::Null),
                other => Err(ExecError::TypeMismatch(format!("abs({other})"))),
            }
        }
        "upper" | "lower" | "length" => {
            arity(1)?;
            match &args[0] {
                Value::Null => Ok(Value::Null),
                Value::Str(s) => Ok(match name.to_ascii_lowercase().as_str() {
                    "upper" => Value::Str(s.to_uppercase()),
                    "lower" => Value::Str(s.to_lowercase()),
                    _ => Value::Int(s.chars().count() as i64),
                }),
                other => Err(ExecError::TypeMismatch(format!("{name}({other})"))),
            }
        }
        _ => Err(ExecError::Unsupported(format!("function {name}"))),
    }
}
