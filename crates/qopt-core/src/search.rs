//! # Memo Search
//!
//! A Cascades-lite search over the [`Memo`]: rules expand each group with equivalent
//! logical members and physical implementations, then every group is costed
//! bottom-up and the cheapest physical member wins.
//!
//! ## Exploration Order
//!
//! Exploration runs off an explicit work stack of tasks and is post-order.
//! Before rules run on a logical member, all of its child groups are fully explored,
//! so a rule that inspects a child group (associativity looks for joins in its right
//! input) sees the complete set of alternatives.
//!
//! Each group walks its members by index, so members that rules add while the group
//! is being explored are explored in the same pass. Groups created by a member's rule
//! results are pushed on top of the stack and explored before the current group
//! continues. A new member that lands in a group which already finished exploring is
//! pushed on its own.
//!
//! Exploration and implementation rules run in one pass over each member. The memo
//! records every `(member, rule)` pair that fired so nothing is applied twice.
//!
//! ## Budget
//!
//! When the iteration or group budget runs out the search logs a warning and stops
//! applying exploration rules. Implementation rules keep running, so every group
//! that exists still gets a physical plan.
//!
//! ## Costing
//!
//! Group cardinality is derived once, from the group's first logical member, and
//! cached on the group. Costs accumulate through [`CostModel::compute_cost`].

use crate::cost::{Cost, CostModel};
use crate::error::OptimizeError;
use crate::expr::TableRefId;
use crate::memo::{ExprId, GroupId, GroupState, Memo, PhysicalMember, Winner};
use crate::plan::PhysicalNode;
use crate::rule::{OptContext, RuleRegistry, RuleResult, RuleType};
use crate::stats::{derive_cardinality, InputEstimate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Limits that keep the search bounded on very large queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Upper bound on the number of groups before exploration stops.
    pub max_memo_groups: usize,
    /// Upper bound on the total number of rule applications.
    pub max_iterations: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_memo_groups: 100_000,
            max_iterations: 1_000_000,
        }
    }
}

/// One unit of exploration work.
#[derive(Debug, Clone, Copy)]
enum Task {
    ExploreGroup(GroupId),
    /// Continue a group's member walk at this index.
    NextMember(GroupId, usize),
    /// Explore a member's child groups, then apply rules to it.
    ExploreExpr(ExprId),
    ApplyRules(ExprId),
}

/// The search engine. Owns the memo for the duration of one optimization.
pub struct CascadesSearch<'a> {
    pub memo: Memo,
    rules: Arc<RuleRegistry>,
    cost_model: Arc<dyn CostModel>,
    ctx: OptContext<'a>,
    config: SearchConfig,
    /// Rule applications so far.
    iterations: usize,
    exhausted: bool,
}

impl<'a> CascadesSearch<'a> {
    pub fn new(
        memo: Memo,
        rules: Arc<RuleRegistry>,
        cost_model: Arc<dyn CostModel>,
        ctx: OptContext<'a>,
        config: SearchConfig,
    ) -> Self {
        Self {
            memo,
            rules,
            cost_model,
            ctx,
            config,
            iterations: 0,
            exhausted: false,
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Whether exploration was cut short by the budget.
    pub fn budget_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Explore and cost everything reachable from `root`, then extract the cheapest plan.
    pub fn optimize(&mut self, root: GroupId) -> Result<PhysicalNode, OptimizeError> {
        self.memo.try_group(root)?;
        debug!(
            root,
            groups = self.memo.num_groups(),
            exprs = self.memo.num_exprs(),
            "starting memo search"
        );
        self.explore(root)?;
        let cost = self.cost_group(root)?;
        debug!(
            cost = cost.total,
            iterations = self.iterations,
            groups = self.memo.num_groups(),
            "memo search complete"
        );
        self.memo.extract_best_plan(root)
    }

    /// Drain the work stack seeded with `root`.
    fn explore(&mut self, root: GroupId) -> Result<(), OptimizeError> {
        let mut stack = vec![Task::ExploreGroup(root)];
        while let Some(task) = stack.pop() {
            match task {
                Task::ExploreGroup(gid) => {
                    if self.memo.group(gid).state != GroupState::New {
                        continue;
                    }
                    self.memo.group_mut(gid).state = GroupState::Exploring;
                    stack.push(Task::NextMember(gid, 0));
                }
                Task::NextMember(gid, i) => {
                    let next = self.memo.group(gid).logical_exprs.get(i).copied();
                    match next {
                        Some(eid) => {
                            stack.push(Task::NextMember(gid, i + 1));
                            stack.push(Task::ExploreExpr(eid));
                        }
                        None => {
                            self.memo.group_mut(gid).state = GroupState::Explored;
                            trace!(group = gid, members = i, "explored group");
                        }
                    }
                }
                Task::ExploreExpr(eid) => {
                    stack.push(Task::ApplyRules(eid));
                    let children = self.memo.expr(eid).children();
                    stack.extend(children.into_iter().rev().map(Task::ExploreGroup));
                }
                Task::ApplyRules(eid) => {
                    let (groups_before, exprs_before) = (self.memo.num_groups(), self.memo.num_exprs());
                    self.apply_rules(eid)?;
                    self.schedule_new(groups_before, exprs_before, &mut stack);
                }
            }
        }
        Ok(())
    }

    fn check_budget(&mut self) -> bool {
        if !self.exhausted
            && (self.iterations >= self.config.max_iterations || self.memo.num_groups() >= self.config.max_memo_groups)
        {
            warn!(
                iterations = self.iterations,
                groups = self.memo.num_groups(),
                "search budget exhausted, skipping further exploration"
            );
            self.exhausted = true;
        }
        self.exhausted
    }

    fn apply_rules(&mut self, eid: ExprId) -> Result<(), OptimizeError> {
        let Some(node) = self.memo.logical(eid).cloned() else {
            return Ok(());
        };
        let group = self.memo.expr(eid).group;
        let rules = Arc::clone(&self.rules);
        for rule in rules.rules() {
            if rule.rule_type() == RuleType::Exploration && self.check_budget() {
                continue;
            }
            let hash = rule.rule_hash();
            if self.memo.rule_applied(eid, hash) || !rule.is_applicable(self.memo.expr(eid), &self.memo) {
                continue;
            }
            self.memo.mark_rule_applied(eid, hash);
            self.iterations += 1;
            let results = rule.apply(self.memo.expr(eid), &node, &self.memo, &self.ctx);
            trace!(rule = rule.name(), expr = eid, results = results.len(), "applied rule");
            for result in results {
                match result {
                    RuleResult::Logical(alt) => {
                        self.memo
                            .insert_logical(&alt, Some(group))
                            .map_err(|e| with_rule_name(e, rule.name()))?;
                    }
                    RuleResult::Physical { op, children } => {
                        self.memo.insert_physical(
                            group,
                            PhysicalMember {
                                op,
                                logic: eid,
                                children,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Push groups and members created since the given memo sizes.
    fn schedule_new(&self, groups_before: usize, exprs_before: usize, stack: &mut Vec<Task>) {
        // members added to groups that already finished exploring
        let exprs_after = self.memo.num_exprs();
        for eid in (exprs_before..exprs_after).rev() {
            let expr = self.memo.expr(eid as ExprId);
            if !expr.is_logical() || (expr.group as usize) >= groups_before {
                continue;
            }
            if self.memo.group(expr.group).state == GroupState::Explored {
                stack.push(Task::ExploreExpr(eid as ExprId));
            }
        }
        let groups_after = self.memo.num_groups();
        stack.extend((groups_before..groups_after).rev().map(|gid| Task::ExploreGroup(gid as GroupId)));
    }

    /// Estimated output rows of a group.
    fn group_card(&mut self, gid: GroupId) -> Result<f64, OptimizeError> {
        if let Some(card) = self.memo.group(gid).card {
            return Ok(card);
        }
        let first = *self
            .memo
            .group(gid)
            .logical_exprs
            .first()
            .ok_or(OptimizeError::UnknownGroup(gid))?;
        let node = self.memo.logical(first).cloned().ok_or(OptimizeError::UnknownGroup(gid))?;
        let mut children: Vec<(f64, BTreeSet<TableRefId>)> = Vec::new();
        for child in self.memo.expr(first).children() {
            children.push((self.group_card(child)?, self.memo.group(child).tables.clone()));
        }
        let inputs: Vec<InputEstimate> = children
            .iter()
            .map(|(card, tables)| InputEstimate { card: *card, tables })
            .collect();
        let card = derive_cardinality(&node.op, &inputs, &self.ctx);
        self.memo.group_mut(gid).card = Some(card);
        Ok(card)
    }

    fn cost_group(&mut self, gid: GroupId) -> Result<Cost, OptimizeError> {
        if let Some(w) = self.memo.group(gid).winner {
            return Ok(w.cost);
        }
        let card = self.group_card(gid)?;
        let physical = self.memo.group(gid).physical_exprs.clone();
        if physical.is_empty() {
            if self.exhausted {
                return Err(OptimizeError::BudgetExhausted {
                    iterations: self.iterations,
                });
            }
            return Err(OptimizeError::NoPhysicalPlan(gid));
        }

        let mut best: Option<Winner> = None;
        for eid in physical {
            let Some(member) = self.memo.expr(eid).physical().cloned() else {
                continue;
            };
            let mut child_costs = Vec::with_capacity(member.children.len());
            let mut child_cards = Vec::with_capacity(member.children.len());
            for &child in &member.children {
                child_costs.push(self.cost_group(child)?);
                child_cards.push(self.group_card(child)?);
            }
            let logic = self
                .memo
                .logical(member.logic)
                .cloned()
                .ok_or(OptimizeError::NoPhysicalPlan(gid))?;
            let cost = self
                .cost_model
                .compute_cost(&member.op, &logic.op, &child_cards, &child_costs, card);
            trace!(group = gid, expr = eid, op = member.op.name(), cost = cost.total, "costed member");
            if best.map_or(true, |b| cost < b.cost) {
                best = Some(Winner { expr_id: eid, cost });
            }
        }
        let winner = best.ok_or(OptimizeError::NoPhysicalPlan(gid))?;
        self.memo.group_mut(gid).winner = Some(winner);
        Ok(winner.cost)
    }
}

fn with_rule_name(err: OptimizeError, rule: &str) -> OptimizeError {
    match err {
        OptimizeError::SignatureMismatch {
            group, expected, found, ..
        } => OptimizeError::SignatureMismatch {
            rule: rule.to_string(),
            group,
            expected,
            found,
        },
        other => other,
    }
}
