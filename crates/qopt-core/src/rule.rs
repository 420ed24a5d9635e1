//! # Rule System
//!
//! This module defines the rule trait and rule registry that drive the memo search.
//!
//! ## Rule Types
//!
//! - **Exploration rules** (`RuleType::Exploration`): rewrite a logical member into an
//!   equivalent logical node, e.g. join commutativity (A ⋈ B → B ⋈ A). The result may
//!   carry owned sub-nodes (associativity builds a new A ⋈ B); the search inserts
//!   those into the groups matching their signatures, creating groups as needed.
//!
//! - **Implementation rules** (`RuleType::Implementation`): map a logical member to
//!   one or more physical algorithms over the same child groups, e.g. a join to a
//!   hash join and a nested-loop join.
//!
//! ## Pattern Matching
//!
//! Each rule declares a `Pattern`. The search checks it before calling `apply`.
//!
//! ## Rule Deduplication
//!
//! Each rule has a `rule_hash()` fingerprint. The memo records which rules already
//! ran on each member so commutativity cannot bounce A ⋈ B and B ⋈ A forever. The
//! registry ignores a second rule registered under an existing name.

use crate::catalog::Catalog;
use crate::expr::ColumnRef;
use crate::memo::{GroupId, Memo, MemoExpr};
use crate::pattern::{matches, Pattern};
use crate::plan::{LogicalNode, PhysicalOp};
use crate::stats::ColumnStatistics;
use crate::tableref::TableRefRegistry;
use crate::expr::TableRefId;
use std::hash::{Hash, Hasher};
use tracing::warn;

/// Classification of optimization rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    /// Logical → logical.
    Exploration,
    /// Logical → physical.
    Implementation,
}

/// Read-only context for rules and estimators: catalog plus the statement's table
/// references.
#[derive(Clone, Copy)]
pub struct OptContext<'a> {
    pub catalog: &'a dyn Catalog,
    pub tables: &'a TableRefRegistry,
}

impl<'a> OptContext<'a> {
    pub fn new(catalog: &'a dyn Catalog, tables: &'a TableRefRegistry) -> Self {
        Self { catalog, tables }
    }

    /// Statistics for a bound, local column of an analyzed base table.
    pub fn column_stats(&self, col: &ColumnRef) -> Option<&'a ColumnStatistics> {
        let binding = col.binding?;
        if binding.outer {
            return None;
        }
        self.tables.column_stats(&binding, self.catalog)
    }

    pub fn base_row_count(&self, table_ref: TableRefId) -> Option<f64> {
        self.tables.base_row_count(table_ref, self.catalog)
    }
}

/// Result of applying a rule to a member.
#[derive(Debug, Clone)]
pub enum RuleResult {
    /// An equivalent logical node for the member's group. Children are group
    /// placeholders or owned sub-nodes destined for their own groups.
    Logical(LogicalNode),
    /// A physical algorithm implementing the member over the given child groups.
    Physical { op: PhysicalOp, children: Vec<GroupId> },
}

/// A rule transforms or implements memo members.
pub trait Rule: Send + Sync {
    /// Unique name of this rule.
    fn name(&self) -> &str;

    fn rule_type(&self) -> RuleType;

    /// Pattern that this rule matches against.
    fn pattern(&self) -> Pattern;

    /// Apply the rule to a matching logical member.
    fn apply(&self, expr: &MemoExpr, node: &LogicalNode, memo: &Memo, ctx: &OptContext) -> Vec<RuleResult>;

    /// Hash for fingerprinting (to avoid re-applying rules).
    fn rule_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.name().hash(&mut hasher);
        hasher.finish()
    }

    fn is_applicable(&self, expr: &MemoExpr, memo: &Memo) -> bool {
        matches(memo, expr.id, &self.pattern())
    }
}

/// Registry of optimization rules, in registration order.
#[derive(Default)]
pub struct RuleRegistry {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule. Returns false (and keeps the first one) when a rule with the
    /// same name is already registered.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) -> bool {
        if self.rules.iter().any(|r| r.name() == rule.name()) {
            warn!(rule = rule.name(), "rule already registered, ignoring duplicate");
            return false;
        }
        self.rules.push(rule);
        true
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &dyn Rule> {
        self.rules.iter().map(|r| r.as_ref())
    }

    pub fn exploration_rules(&self) -> Vec<&dyn Rule> {
        self.rules().filter(|r| r.rule_type() == RuleType::Exploration).collect()
    }

    pub fn implementation_rules(&self) -> Vec<&dyn Rule> {
        self.rules().filter(|r| r.rule_type() == RuleType::Implementation).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Rule for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn rule_type(&self) -> RuleType {
            RuleType::Exploration
        }
        fn pattern(&self) -> Pattern {
            Pattern::Any
        }
        fn apply(&self, _: &MemoExpr, _: &LogicalNode, _: &Memo, _: &OptContext) -> Vec<RuleResult> {
            vec![]
        }
    }

    #[test]
    fn test_registry_ignores_duplicate_names() {
        let mut reg = RuleRegistry::new();
        assert!(reg.add_rule(Box::new(Named("a"))));
        assert!(reg.add_rule(Box::new(Named("b"))));
        assert!(!reg.add_rule(Box::new(Named("a"))));
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.exploration_rules().len(), 2);
        assert!(reg.implementation_rules().is_empty());
    }

    #[test]
    fn test_rule_hash_follows_name() {
        assert_eq!(Named("x").rule_hash(), Named("x").rule_hash());
        assert_ne!(Named("x").rule_hash(), Named("y").rule_hash());
    }
}
