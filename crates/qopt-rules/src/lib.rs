//! # Built-in Optimization Rules
//!
//! This crate provides the default rule set for the memo search in `qopt-core`.
//! Rules are divided into two categories:
//!
//! ## Exploration Rules (Logical -> Logical)
//!
//! These rules grow the search space with equivalent join trees:
//!
//! - **`JoinCommutativityRule`**: swaps the inputs of an inner join (A ⋈ B -> B ⋈ A).
//! - **`JoinAssociativityRule`**: regroups A ⋈ (B ⋈ C) into (A ⋈ B) ⋈ C, moving each
//!   join conjunct to the lowest join that sees all of its tables.
//!
//! ## Implementation Rules (Logical -> Physical)
//!
//! These rules produce the physical alternatives the cost model scores:
//!
//! - **`ImplHashJoinRule`**: hash join, when the predicate has an equality key.
//! - **`ImplNestedLoopJoinRule`**: nested loop join, the universal fallback.
//! - **`ImplScanRule`**: table or file scan.
//! - **`ImplHashAggregateRule`**: hash aggregation.
//! - **`ImplUnaryRule`**: filter, sort, limit, project, and materialize.

pub mod impl_agg;
pub mod impl_join;
pub mod impl_scan;
pub mod impl_unary;
pub mod join_associativity;
pub mod join_commutativity;

use qopt_core::rule::RuleRegistry;

/// Create a rule registry holding every built-in rule.
///
/// Extra rules can be added to the returned registry with `add_rule()`; a rule
/// whose name is already registered is ignored.
pub fn default_rule_registry() -> RuleRegistry {
    let mut registry = RuleRegistry::new();

    // Exploration rules: expand the logical search space.
    registry.add_rule(Box::new(join_commutativity::JoinCommutativityRule));
    registry.add_rule(Box::new(join_associativity::JoinAssociativityRule));

    // Implementation rules: map logical operators to physical alternatives.
    add_implementation_rules(&mut registry);

    registry
}

/// Registry with implementation rules only. The search then costs the plan's own
/// join order without exploring alternatives.
pub fn implementation_rule_registry() -> RuleRegistry {
    let mut registry = RuleRegistry::new();
    add_implementation_rules(&mut registry);
    registry
}

fn add_implementation_rules(registry: &mut RuleRegistry) {
    registry.add_rule(Box::new(impl_join::ImplHashJoinRule));
    registry.add_rule(Box::new(impl_join::ImplNestedLoopJoinRule));
    registry.add_rule(Box::new(impl_scan::ImplScanRule));
    registry.add_rule(Box::new(impl_agg::ImplHashAggregateRule));
    for rule in impl_unary::ImplUnaryRule::all() {
        registry.add_rule(Box::new(rule));
    }
}
