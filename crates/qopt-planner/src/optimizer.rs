//! # Optimizer Pipeline
//!
//! [`Optimizer::compile`] takes a parsed statement through every stage:
//!
//! 1. bind names against the catalog and assign subquery ids
//! 2. build the logical plan
//! 3. decorrelate subqueries into joins where possible
//! 4. push movable filters down
//! 5. pick physical operators, through the memo search or by direct translation
//!
//! ## Choosing a Physical Planner
//!
//! The memo search explores join orders with the exploration rules, which grows
//! quickly with the number of joined relations. When a join-order strategy is
//! configured and the largest inner-join region of a plan has at least
//! `join_region_threshold` leaves, that plan is translated directly and its
//! regions are handed to the DPccp or DPBushy resolver instead. Setting `use_memo`
//! to false always translates directly.

use crate::binder::BindContext;
use crate::builder::{LogicalPlan, PlanBuilder};
use crate::decorrelate::{decorrelate, DecorrelationReport};
use crate::physical::{largest_join_region, DirectPlanner};
use crate::pushdown::push_down_filters;
use qopt_core::ast::SelectStmt;
use qopt_core::catalog::Catalog;
use qopt_core::cost::{CostModel, DefaultCostModel};
use qopt_core::error::Result;
use qopt_core::expr::SubqueryId;
use qopt_core::join_order::{JoinOrderStrategy, ResolverConfig};
use qopt_core::memo::{GroupId, Memo};
use qopt_core::plan::{LogicalNode, PhysicalNode};
use qopt_core::rule::{OptContext, RuleRegistry};
use qopt_core::search::{CascadesSearch, SearchConfig};
use qopt_core::tableref::TableRefRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Run the memo search for plans whose join regions are below the threshold.
    pub use_memo: bool,
    /// Resolver for large join regions. `None` leaves them to the memo.
    pub join_order: Option<JoinOrderStrategy>,
    /// Smallest region, in leaves, handed to the resolver.
    pub join_region_threshold: usize,
    pub search: SearchConfig,
    pub resolver: ResolverConfig,
    pub cost: DefaultCostModel,
    /// Print actual row counts in explain output.
    pub profile: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            use_memo: true,
            join_order: Some(JoinOrderStrategy::DpCcp),
            join_region_threshold: 8,
            search: SearchConfig::default(),
            resolver: ResolverConfig::default(),
            cost: DefaultCostModel::default(),
            profile: false,
        }
    }
}

/// A statement after binding, planning, decorrelation and pushdown.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub logical: LogicalPlan,
    pub tables: TableRefRegistry,
    pub report: DecorrelationReport,
    pub explain: bool,
}

/// A fully optimized statement.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub plan: PhysicalNode,
    /// Plans of subqueries left for nested evaluation.
    pub subqueries: BTreeMap<SubqueryId, PhysicalNode>,
    pub logical: LogicalPlan,
    pub tables: TableRefRegistry,
    pub report: DecorrelationReport,
    /// The statement asked for its plan instead of its rows.
    pub explain: bool,
    profile: bool,
}

impl CompiledQuery {
    pub fn explain(&self) -> String {
        let mut out = self.plan.explain(self.profile);
        for (id, plan) in &self.subqueries {
            out.push_str(&format!("subquery {id}:\n"));
            for line in plan.explain(self.profile).lines() {
                out.push_str("  ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

pub struct Optimizer {
    catalog: Arc<dyn Catalog>,
    rules: Arc<RuleRegistry>,
    cost_model: Arc<dyn CostModel>,
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(catalog: Arc<dyn Catalog>, rules: Arc<RuleRegistry>, config: OptimizerConfig) -> Self {
        let cost_model: Arc<dyn CostModel> = Arc::new(config.cost.clone());
        Self {
            catalog,
            rules,
            cost_model,
            config,
        }
    }

    /// An optimizer over `catalog` with the built-in rules and default settings.
    pub fn with_defaults(catalog: Arc<dyn Catalog>) -> Self {
        Self::new(
            catalog,
            Arc::new(qopt_rules::default_rule_registry()),
            OptimizerConfig::default(),
        )
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn compile(&self, stmt: &SelectStmt) -> Result<CompiledQuery> {
        let prepared = self.prepare(stmt)?;
        let ctx = OptContext::new(self.catalog.as_ref(), &prepared.tables);
        let plan = self.physical(&prepared.logical.root, ctx)?;
        let subqueries = prepared
            .logical
            .subqueries
            .iter()
            .map(|(id, sub)| Ok((*id, self.physical(sub, ctx)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        debug!(
            cost = plan.cost.total,
            rows = plan.card,
            nested = subqueries.len(),
            "compiled statement"
        );
        Ok(CompiledQuery {
            plan,
            subqueries,
            logical: prepared.logical,
            tables: prepared.tables,
            report: prepared.report,
            explain: prepared.explain,
            profile: self.config.profile,
        })
    }

    /// Everything up to physical planning.
    pub fn prepare(&self, stmt: &SelectStmt) -> Result<PreparedQuery> {
        let mut binder = BindContext::new(self.catalog.as_ref());
        let bound = binder.bind_statement(stmt)?;
        let built = PlanBuilder::new(&binder).build(&bound)?;
        let tables = binder.into_tables();

        let (decorrelated, report) = decorrelate(&built);
        for (id, reason) in &report.unsupported {
            warn!(subquery = id, reason, "subquery left correlated");
        }
        let logical = LogicalPlan {
            root: push_down_filters(&decorrelated.root),
            subqueries: decorrelated
                .subqueries
                .iter()
                .map(|(id, plan)| (*id, push_down_filters(plan)))
                .collect(),
        };
        Ok(PreparedQuery {
            logical,
            tables,
            report,
            explain: bound.explain,
        })
    }

    /// Run the memo search over `plan` and hand back the memo for inspection.
    pub fn optimize_with_memo(
        &self,
        plan: &LogicalNode,
        tables: &TableRefRegistry,
    ) -> Result<(PhysicalNode, Memo, GroupId)> {
        let ctx = OptContext::new(self.catalog.as_ref(), tables);
        self.search(plan, ctx)
    }

    fn physical(&self, plan: &Arc<LogicalNode>, ctx: OptContext) -> Result<PhysicalNode> {
        let region = largest_join_region(plan);
        let resolve = self.config.join_order.filter(|_| region >= self.config.join_region_threshold);
        if self.config.use_memo && resolve.is_none() {
            return Ok(self.search(plan, ctx)?.0);
        }
        debug!(region, strategy = ?resolve, "translating without the memo");
        let mut planner = DirectPlanner::new(ctx, Arc::clone(&self.cost_model));
        if let Some(strategy) = self.config.join_order {
            planner = planner.with_join_order(
                strategy,
                self.config.join_region_threshold,
                self.config.resolver.clone(),
            );
        }
        planner.plan(plan)
    }

    fn search(&self, plan: &LogicalNode, ctx: OptContext) -> Result<(PhysicalNode, Memo, GroupId)> {
        let mut memo = Memo::new();
        let root = memo.insert_plan(plan)?;
        let mut search = CascadesSearch::new(
            memo,
            Arc::clone(&self.rules),
            Arc::clone(&self.cost_model),
            ctx,
            self.config.search.clone(),
        );
        let best = search.optimize(root)?;
        if search.budget_exhausted() {
            warn!(iterations = search.iterations(), "memo search stopped at its budget");
        }
        Ok((best, search.memo, root))
    }
}
