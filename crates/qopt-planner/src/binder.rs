//! # Binder
//!
//! Resolves every name in a [`SelectStmt`] against the catalog and the statement's
//! FROM items, producing a [`BoundSelect`] whose expressions carry column bindings.
//!
//! ## Scopes
//!
//! Each SELECT opens a scope. FROM items register table references in it; columns
//! are looked up in the current scope first and then outward through the parent
//! chain. A column found in an ancestor scope is an *outer* reference: it is marked
//! as such, recorded on its table reference's correlated-column list, and every
//! subquery scope crossed on the way out is flagged correlated.
//!
//! Derived tables and CTE bodies get their own scope whose parent is the enclosing
//! scope, but they cannot see the enclosing FROM list (no lateral references);
//! lookups from them skip straight to the grandparent.
//!
//! ## Subqueries
//!
//! Subquery ids come from one counter owned by the [`BindContext`], so they are
//! unique across the statement. Each subquery's bound statement is kept in the
//! context, keyed by id; the expression tree keeps the id and the correlation flag.
//!
//! ## Binding Once
//!
//! Binding is not idempotent on purpose: a column reference that already carries a
//! binding, or a subquery that already has an id, is rejected with
//! [`BindError::AlreadyBound`]. A context binds exactly one statement.

use qopt_core::ast::{FromItem, SelectItem, SelectStmt};
use qopt_core::catalog::{Catalog, ColumnDef};
use qopt_core::error::BindError;
use qopt_core::expr::{
    AggFunc, BinaryOp, ColumnBinding, ColumnRef, Expr, JoinType, ScopeId, SortKey, SubqueryId, SubqueryKind,
    TableRefId, UnaryOp,
};
use qopt_core::plan::ScanSource;
use qopt_core::tableref::{TableRefKind, TableRefRegistry};
use qopt_core::value::{DataType, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Statement clause an expression is bound in. Aggregates are rejected in some.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Select,
    Where,
    GroupBy,
    Having,
    OrderBy,
    JoinOn,
}

impl Clause {
    fn allows_aggregates(self) -> bool {
        matches!(self, Clause::Select | Clause::Having | Clause::OrderBy)
    }

    fn name(self) -> &'static str {
        match self {
            Clause::Select => "SELECT",
            Clause::Where => "WHERE",
            Clause::GroupBy => "GROUP BY",
            Clause::Having => "HAVING",
            Clause::OrderBy => "ORDER BY",
            Clause::JoinOn => "JOIN ON",
        }
    }
}

/// A binding scope: one SELECT's FROM list plus its CTE definitions.
#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    /// Subquery whose statement opened this scope.
    pub subquery: Option<SubqueryId>,
    /// Derived table or CTE body: the parent's FROM list is not visible.
    pub derived: bool,
    /// Table references visible for column lookup, in FROM order.
    pub tables: Vec<TableRefId>,
    ctes: Vec<(String, SelectStmt)>,
}

/// A bound FROM item.
#[derive(Debug, Clone)]
pub enum BoundFrom {
    Scan {
        table_ref: TableRefId,
        source: ScanSource,
    },
    /// Derived table or CTE reference.
    Derived {
        table_ref: TableRefId,
        query: Box<BoundSelect>,
    },
    Join {
        table_ref: TableRefId,
        left: Box<BoundFrom>,
        right: Box<BoundFrom>,
        join_type: JoinType,
        on: Option<Expr>,
    },
}

/// A fully bound SELECT.
#[derive(Debug, Clone)]
pub struct BoundSelect {
    pub scope: ScopeId,
    pub from: Vec<BoundFrom>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<SortKey>,
    /// Output expressions after wildcard expansion.
    pub projection: Vec<Expr>,
    pub aliases: Vec<Option<String>>,
    pub limit: Option<u64>,
    pub explain: bool,
}

impl BoundSelect {
    /// Output column names: the alias, else the column name, else `colN`.
    pub fn output_names(&self) -> Vec<String> {
        self.projection
            .iter()
            .zip(&self.aliases)
            .enumerate()
            .map(|(i, (expr, alias))| match (alias, expr) {
                (Some(a), _) => a.clone(),
                (None, Expr::Column(c)) => c.name.clone(),
                _ => format!("col{}", i + 1),
            })
            .collect()
    }

    /// Whether the statement aggregates (GROUP BY or an aggregate in the output,
    /// HAVING, or ORDER BY).
    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty()
            || self.having.is_some()
            || self.projection.iter().any(Expr::has_aggregate)
            || self.order_by.iter().any(|k| k.expr.has_aggregate())
    }
}

/// A bound subquery statement.
#[derive(Debug, Clone)]
pub struct BoundSubquery {
    pub id: SubqueryId,
    pub select: BoundSelect,
    pub correlated: bool,
}

/// Per-statement binding state.
pub struct BindContext<'a> {
    catalog: &'a dyn Catalog,
    tables: TableRefRegistry,
    scopes: Vec<Scope>,
    next_subquery_id: SubqueryId,
    subqueries: BTreeMap<SubqueryId, BoundSubquery>,
    correlated: BTreeSet<SubqueryId>,
    root: Option<ScopeId>,
}

impl<'a> BindContext<'a> {
    pub fn new(catalog: &'a dyn Catalog) -> Self {
        Self {
            catalog,
            tables: TableRefRegistry::new(),
            scopes: Vec::new(),
            next_subquery_id: 0,
            subqueries: BTreeMap::new(),
            correlated: BTreeSet::new(),
            root: None,
        }
    }

    pub fn tables(&self) -> &TableRefRegistry {
        &self.tables
    }

    pub fn into_tables(self) -> TableRefRegistry {
        self.tables
    }

    pub fn subqueries(&self) -> &BTreeMap<SubqueryId, BoundSubquery> {
        &self.subqueries
    }

    pub fn subquery(&self, id: SubqueryId) -> Option<&BoundSubquery> {
        self.subqueries.get(&id)
    }

    pub fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id as usize)
    }

    /// Bind the top-level statement.
    pub fn bind_statement(&mut self, stmt: &SelectStmt) -> Result<BoundSelect, BindError> {
        if self.root.is_some() {
            return Err(BindError::AlreadyBound("statement".into()));
        }
        let bound = self.bind_select(stmt, None, None, false)?;
        self.root = Some(bound.scope);
        debug!(
            tables = self.tables.len(),
            subqueries = self.subqueries.len(),
            correlated = self.correlated.len(),
            "bound statement"
        );
        Ok(bound)
    }

    /// Bind a stand-alone expression in an existing scope.
    pub fn bind_expr(&mut self, mut expr: Expr, scope: ScopeId) -> Result<Expr, BindError> {
        self.bind_in_place(&mut expr, scope, Clause::Select)?;
        Ok(expr)
    }

    fn bind_select(
        &mut self,
        stmt: &SelectStmt,
        parent: Option<ScopeId>,
        subquery: Option<SubqueryId>,
        derived: bool,
    ) -> Result<BoundSelect, BindError> {
        let scope = self.new_scope(parent, subquery, derived);
        for cte in &stmt.ctes {
            self.scopes[scope as usize].ctes.push((cte.name.clone(), cte.query.clone()));
        }

        if stmt.from.is_empty() {
            return Err(BindError::EmptyFrom);
        }
        let from = stmt
            .from
            .iter()
            .map(|item| self.bind_from(item, scope))
            .collect::<Result<Vec<_>, _>>()?;

        let selection = stmt
            .selection
            .clone()
            .map(|e| self.bind_owned(e, scope, Clause::Where))
            .transpose()?;
        let group_by = stmt
            .group_by
            .iter()
            .map(|e| self.bind_owned(e.clone(), scope, Clause::GroupBy))
            .collect::<Result<Vec<_>, _>>()?;

        let mut projection = Vec::new();
        let mut aliases = Vec::new();
        for item in &stmt.projection {
            match item {
                SelectItem::Expr { expr, alias } => {
                    projection.push(self.bind_owned(expr.clone(), scope, Clause::Select)?);
                    aliases.push(alias.clone());
                }
                SelectItem::Wildcard => {
                    for t in self.scopes[scope as usize].tables.clone() {
                        projection.extend(self.table_columns(t));
                    }
                    aliases.resize(projection.len(), None);
                }
                SelectItem::QualifiedWildcard(qualifier) => {
                    let t = self
                        .local_table(scope, qualifier)
                        .ok_or_else(|| BindError::TableNotFound(qualifier.clone()))?;
                    projection.extend(self.table_columns(t));
                    aliases.resize(projection.len(), None);
                }
            }
        }

        let having = stmt
            .having
            .clone()
            .map(|e| self.bind_owned(e, scope, Clause::Having))
            .transpose()?;

        let mut order_by = Vec::with_capacity(stmt.order_by.len());
        for term in &stmt.order_by {
            // ORDER BY may name an output alias
            let aliased = match term.expr {
                Expr::Column(ColumnRef {
                    table: None,
                    ref name,
                    binding: None,
                }) => aliases
                    .iter()
                    .position(|a| a.as_deref() == Some(name.as_str()))
                    .map(|i| projection[i].clone()),
                _ => None,
            };
            let expr = match aliased {
                Some(e) => e,
                None => self.bind_owned(term.expr.clone(), scope, Clause::OrderBy)?,
            };
            order_by.push(SortKey {
                expr,
                ascending: term.ascending,
            });
        }

        let limit = stmt.limit.as_ref().map(bind_limit).transpose()?;

        Ok(BoundSelect {
            scope,
            from,
            selection,
            group_by,
            having,
            order_by,
            projection,
            aliases,
            limit,
            explain: stmt.explain,
        })
    }

    fn new_scope(&mut self, parent: Option<ScopeId>, subquery: Option<SubqueryId>, derived: bool) -> ScopeId {
        let id = self.scopes.len() as ScopeId;
        self.scopes.push(Scope {
            id,
            parent,
            subquery,
            derived,
            tables: Vec::new(),
            ctes: Vec::new(),
        });
        trace!(scope = id, ?parent, ?subquery, "opened scope");
        id
    }

    fn bind_from(&mut self, item: &FromItem, scope: ScopeId) -> Result<BoundFrom, BindError> {
        match item {
            FromItem::Table { name, alias } => {
                let alias = alias.clone().unwrap_or_else(|| name.clone());
                if let Some(cte) = self.find_cte(scope, name) {
                    let query = self.bind_select(&cte, Some(scope), None, true)?;
                    let table_ref = self.register_derived(scope, &alias, TableRefKind::Cte { name: name.clone() }, &query)?;
                    return Ok(BoundFrom::Derived {
                        table_ref,
                        query: Box::new(query),
                    });
                }
                let def = self.catalog.table(name)?;
                let table_ref = self.register(
                    scope,
                    &alias,
                    TableRefKind::Base { table: name.clone() },
                    def.columns.clone(),
                )?;
                Ok(BoundFrom::Scan {
                    table_ref,
                    source: ScanSource::Table(name.clone()),
                })
            }
            FromItem::File { path, columns, alias } => {
                let table_ref = self.register(scope, alias, TableRefKind::File { path: path.clone() }, columns.clone())?;
                Ok(BoundFrom::Scan {
                    table_ref,
                    source: ScanSource::File(path.clone()),
                })
            }
            FromItem::Subquery { query, alias } => {
                let bound = self.bind_select(query, Some(scope), None, true)?;
                let table_ref = self.register_derived(scope, alias, TableRefKind::Subquery, &bound)?;
                Ok(BoundFrom::Derived {
                    table_ref,
                    query: Box::new(bound),
                })
            }
            FromItem::Join {
                left,
                right,
                join_type,
                on,
            } => {
                let left = self.bind_from(left, scope)?;
                let right = self.bind_from(right, scope)?;
                let on = on
                    .clone()
                    .map(|e| self.bind_owned(e, scope, Clause::JoinOn))
                    .transpose()?;
                let mut members = Vec::new();
                collect_members(&left, &mut members);
                collect_members(&right, &mut members);
                // the group itself is not visible for lookup; its members are
                let alias = format!("join#{}", self.tables.len());
                let table_ref = self.tables.add(
                    alias,
                    TableRefKind::JoinGroup { members },
                    Vec::new(),
                    scope,
                );
                Ok(BoundFrom::Join {
                    table_ref,
                    left: Box::new(left),
                    right: Box::new(right),
                    join_type: *join_type,
                    on,
                })
            }
        }
    }

    fn register(
        &mut self,
        scope: ScopeId,
        alias: &str,
        kind: TableRefKind,
        columns: Vec<ColumnDef>,
    ) -> Result<TableRefId, BindError> {
        if self.local_table(scope, alias).is_some() {
            return Err(BindError::DuplicateAlias(alias.to_string()));
        }
        let id = self.tables.add(alias, kind, columns, scope);
        self.scopes[scope as usize].tables.push(id);
        trace!(scope, table_ref = id, alias, "registered table reference");
        Ok(id)
    }

    fn register_derived(
        &mut self,
        scope: ScopeId,
        alias: &str,
        kind: TableRefKind,
        query: &BoundSelect,
    ) -> Result<TableRefId, BindError> {
        let columns = query
            .output_names()
            .into_iter()
            .zip(&query.projection)
            .map(|(name, expr)| ColumnDef::new(name, self.expr_type(expr)))
            .collect();
        self.register(scope, alias, kind, columns)
    }

    fn find_cte(&self, scope: ScopeId, name: &str) -> Option<SelectStmt> {
        let mut current = Some(scope);
        while let Some(s) = current {
            let sc = &self.scopes[s as usize];
            if let Some((_, q)) = sc.ctes.iter().rev().find(|(n, _)| n == name) {
                return Some(q.clone());
            }
            current = sc.parent;
        }
        None
    }

    fn local_table(&self, scope: ScopeId, alias: &str) -> Option<TableRefId> {
        self.scopes[scope as usize]
            .tables
            .iter()
            .copied()
            .find(|&t| self.tables.get(t).is_some_and(|info| info.alias == alias))
    }

    fn table_columns(&self, table_ref: TableRefId) -> Vec<Expr> {
        self.tables
            .get(table_ref)
            .map(|info| info.column_refs().into_iter().map(Expr::Column).collect())
            .unwrap_or_default()
    }

    fn bind_owned(&mut self, mut expr: Expr, scope: ScopeId, clause: Clause) -> Result<Expr, BindError> {
        self.bind_in_place(&mut expr, scope, clause)?;
        Ok(expr)
    }

    fn bind_in_place(&mut self, expr: &mut Expr, scope: ScopeId, clause: Clause) -> Result<(), BindError> {
        match expr {
            Expr::Column(col) => {
                if col.is_bound() {
                    return Err(BindError::AlreadyBound(col.to_string()));
                }
                *col = self.resolve(col, scope)?;
                Ok(())
            }
            Expr::Subquery(sq) => {
                if let Some(id) = sq.id {
                    return Err(BindError::AlreadyBound(format!("subquery #{id}")));
                }
                if let SubqueryKind::In { ref mut lhs, .. } = sq.kind {
                    self.bind_in_place(lhs.as_mut(), scope, clause)?;
                }
                let id = self.next_subquery_id;
                self.next_subquery_id += 1;
                let select = self.bind_select(&sq.query, Some(scope), Some(id), false)?;
                if matches!(sq.kind, SubqueryKind::Scalar | SubqueryKind::In { .. }) && select.projection.len() != 1 {
                    return Err(BindError::SubqueryColumnCount {
                        found: select.projection.len(),
                    });
                }
                let correlated = self.correlated.contains(&id);
                sq.id = Some(id);
                sq.correlated = correlated;
                debug!(subquery = id, correlated, "bound subquery");
                self.subqueries.insert(id, BoundSubquery { id, select, correlated });
                Ok(())
            }
            Expr::Aggregate(_) if !clause.allows_aggregates() => Err(BindError::MisplacedAggregate(clause.name())),
            other => {
                for child in other.children_mut() {
                    self.bind_in_place(child, scope, clause)?;
                }
                Ok(())
            }
        }
    }

    /// Resolve a column outward from `scope`.
    fn resolve(&mut self, col: &ColumnRef, scope: ScopeId) -> Result<ColumnRef, BindError> {
        let mut crossed: Vec<ScopeId> = Vec::new();
        let mut current = Some(scope);
        let mut skip = false;
        while let Some(s) = current {
            if !skip {
                if let Some((table_ref, ordinal)) = self.lookup(col, s)? {
                    return Ok(self.finish_binding(col, table_ref, ordinal, &crossed));
                }
            }
            crossed.push(s);
            let sc = &self.scopes[s as usize];
            skip = sc.derived;
            current = sc.parent;
        }
        match col.table {
            Some(ref q) if !self.qualifier_exists(q) => Err(BindError::TableNotFound(q.clone())),
            _ => Err(BindError::ColumnNotFound(col.to_string())),
        }
    }

    /// Look a column up among one scope's tables.
    fn lookup(&self, col: &ColumnRef, scope: ScopeId) -> Result<Option<(TableRefId, usize)>, BindError> {
        let sc = &self.scopes[scope as usize];
        let mut found = None;
        for &t in &sc.tables {
            let Some(info) = self.tables.get(t) else {
                continue;
            };
            if let Some(ref q) = col.table {
                if &info.alias != q {
                    continue;
                }
            }
            let mut matching = info.columns.iter().enumerate().filter(|(_, c)| c.name == col.name);
            let Some((ordinal, _)) = matching.next() else {
                if col.table.is_some() {
                    // qualifier matched but the table lacks the column
                    return Err(BindError::ColumnNotFound(col.to_string()));
                }
                continue;
            };
            if matching.next().is_some() || found.is_some() {
                return Err(BindError::AmbiguousColumn(col.to_string()));
            }
            found = Some((t, ordinal));
        }
        Ok(found)
    }

    fn finish_binding(&mut self, col: &ColumnRef, table_ref: TableRefId, ordinal: usize, crossed: &[ScopeId]) -> ColumnRef {
        let outer = !crossed.is_empty();
        let alias = self.tables.get(table_ref).map(|i| i.alias.clone());
        let bound = ColumnRef {
            table: alias.or_else(|| col.table.clone()),
            name: col.name.clone(),
            binding: Some(ColumnBinding {
                table_ref,
                ordinal,
                outer,
            }),
        };
        if outer {
            for s in crossed {
                if let Some(id) = self.scopes[*s as usize].subquery {
                    self.correlated.insert(id);
                }
            }
            self.tables.add_correlated_column(&bound);
            trace!(column = %bound, table_ref, "outer reference");
        }
        bound
    }

    fn qualifier_exists(&self, qualifier: &str) -> bool {
        self.scopes
            .iter()
            .any(|s| self.local_table(s.id, qualifier).is_some())
    }

    /// Result type of a bound expression, used for derived-table column definitions.
    pub fn expr_type(&self, expr: &Expr) -> DataType {
        match expr {
            Expr::Column(c) => c
                .binding
                .and_then(|b| self.tables.get(b.table_ref)?.columns.get(b.ordinal).map(|d| d.data_type))
                .unwrap_or(DataType::Int),
            Expr::Literal(v) => v.data_type().unwrap_or(DataType::Int),
            Expr::BinaryOp { op, left, right } => {
                if op.is_comparison() {
                    DataType::Bool
                } else if *op == BinaryOp::Div
                    || self.expr_type(left) == DataType::Float
                    || self.expr_type(right) == DataType::Float
                {
                    DataType::Float
                } else {
                    DataType::Int
                }
            }
            Expr::UnaryOp { op: UnaryOp::Neg, operand } => self.expr_type(operand),
            Expr::UnaryOp { .. } | Expr::And(_) | Expr::Or(_) | Expr::Marker(_) => DataType::Bool,
            Expr::Function { name, args } => match name.as_str() {
                "upper" | "lower" => DataType::Str,
                "length" => DataType::Int,
                _ => args.first().map_or(DataType::Int, |a| self.expr_type(a)),
            },
            Expr::Aggregate(agg) => match agg.func {
                AggFunc::Count => DataType::Int,
                AggFunc::Avg => DataType::Float,
                _ => agg.arg.as_deref().map_or(DataType::Int, |a| self.expr_type(a)),
            },
            Expr::Case { branches, else_expr, .. } => branches
                .first()
                .map(|(_, then)| then)
                .or(else_expr.as_deref())
                .map_or(DataType::Int, |e| self.expr_type(e)),
            Expr::Cast { to, .. } => *to,
            Expr::Subquery(sq) => match sq.kind {
                SubqueryKind::Scalar => sq
                    .id
                    .and_then(|id| self.subqueries.get(&id))
                    .and_then(|b| b.select.projection.first())
                    .map_or(DataType::Int, |e| self.expr_type(e)),
                _ => DataType::Bool,
            },
        }
    }
}

fn collect_members(from: &BoundFrom, out: &mut Vec<TableRefId>) {
    match from {
        BoundFrom::Scan { table_ref, .. } | BoundFrom::Derived { table_ref, .. } => out.push(*table_ref),
        BoundFrom::Join { left, right, .. } => {
            collect_members(left, out);
            collect_members(right, out);
        }
    }
}

fn bind_limit(expr: &Expr) -> Result<u64, BindError> {
    match expr {
        Expr::Literal(Value::Int(n)) if *n >= 0 => Ok(*n as u64),
        other => Err(BindError::InvalidLimit(other.to_string())),
    }
}
