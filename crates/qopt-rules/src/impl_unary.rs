//! # Single-Input Implementation Rules
//!
//! Filter, order, limit, project, and derived-table operators each have exactly one
//! physical algorithm. `ImplUnaryRule` maps one logical kind to its algorithm and
//! keeps the child as a group reference:
//!
//! | Logical     | Physical      |
//! |-------------|---------------|
//! | `Filter`    | `Filter`      |
//! | `Order`     | `Sort`        |
//! | `Limit`     | `Limit`       |
//! | `Project`   | `Project`     |
//! | `FromQuery` | `Materialize` |

use qopt_core::memo::{Memo, MemoExpr};
use qopt_core::pattern::Pattern;
use qopt_core::plan::{LogicalNode, LogicalOpKind, PhysicalOp};
use qopt_core::rule::{OptContext, Rule, RuleResult, RuleType};

/// One-to-one implementation of a single-input logical operator.
pub struct ImplUnaryRule {
    name: &'static str,
    kind: LogicalOpKind,
    op: PhysicalOp,
}

impl ImplUnaryRule {
    pub fn filter() -> Self {
        Self {
            name: "ImplFilter",
            kind: LogicalOpKind::Filter,
            op: PhysicalOp::Filter,
        }
    }

    pub fn sort() -> Self {
        Self {
            name: "ImplSort",
            kind: LogicalOpKind::Order,
            op: PhysicalOp::Sort,
        }
    }

    pub fn limit() -> Self {
        Self {
            name: "ImplLimit",
            kind: LogicalOpKind::Limit,
            op: PhysicalOp::Limit,
        }
    }

    pub fn project() -> Self {
        Self {
            name: "ImplProject",
            kind: LogicalOpKind::Project,
            op: PhysicalOp::Project,
        }
    }

    pub fn materialize() -> Self {
        Self {
            name: "ImplMaterialize",
            kind: LogicalOpKind::FromQuery,
            op: PhysicalOp::Materialize,
        }
    }

    /// All single-input rules.
    pub fn all() -> Vec<Self> {
        vec![
            Self::filter(),
            Self::sort(),
            Self::limit(),
            Self::project(),
            Self::materialize(),
        ]
    }
}

impl Rule for ImplUnaryRule {
    fn name(&self) -> &str {
        self.name
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::unary(self.kind)
    }

    fn apply(&self, expr: &MemoExpr, node: &LogicalNode, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        if node.kind() != self.kind {
            return vec![];
        }
        vec![RuleResult::Physical {
            op: self.op,
            children: expr.children(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qopt_core::catalog::InMemoryCatalog;
    use qopt_core::expr::{ColumnRef, Expr, SortKey};
    use qopt_core::pattern::matches;
    use qopt_core::plan::ScanSource;
    use qopt_core::tableref::TableRefRegistry;
    use std::sync::Arc;

    #[test]
    fn test_order_becomes_sort_over_the_same_child() {
        let col = Expr::Column(ColumnRef::bound("t", "k", 0, 0));
        let scan = Arc::new(LogicalNode::scan(0, ScanSource::Table("t".into()), vec![col.clone()]));
        let order = LogicalNode::order(vec![SortKey { expr: col, ascending: false }], scan);
        let mut memo = Memo::new();
        let root = memo.insert_plan(&order).unwrap();
        let eid = memo.group(root).logical_exprs[0];

        let sort = ImplUnaryRule::sort();
        assert!(sort.is_applicable(memo.expr(eid), &memo));
        assert!(!matches(&memo, eid, &ImplUnaryRule::filter().pattern()));

        let catalog = InMemoryCatalog::new();
        let tables = TableRefRegistry::new();
        let node = memo.logical(eid).unwrap().clone();
        let out = sort.apply(memo.expr(eid), &node, &memo, &OptContext::new(&catalog, &tables));
        assert!(matches!(
            out[..],
            [RuleResult::Physical { op: PhysicalOp::Sort, ref children }] if children == &vec![0]
        ));
    }

    #[test]
    fn test_rule_names_are_distinct() {
        let mut names: Vec<&str> = ImplUnaryRule::all().iter().map(|r| r.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 5);
    }
}
