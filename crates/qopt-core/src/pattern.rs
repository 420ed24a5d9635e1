//! # Declarative Pattern Matching for Optimization Rules
//!
//! Each rule declares a `Pattern` describing the shape of logical members it can
//! handle. The search checks the pattern before calling `apply()`.
//!
//! ## Pattern Language
//!
//! - `Pattern::Operator(kind, children)`: a logical member of the given operator kind
//!   whose child groups match the child patterns.
//! - `Pattern::Any`: matches any member or group.
//! - `Pattern::Leaf`: matches members without children.
//!
//! ## Group-Level Matching
//!
//! A non-`Any` child pattern matches a child group when *any* logical member of that
//! group satisfies it. All members of a group are equivalent, so one witness suffices.

use crate::memo::{ExprId, Memo};
use crate::plan::LogicalOpKind;

/// Pattern for matching memo members.
#[derive(Debug, Clone)]
pub enum Pattern {
    Operator(LogicalOpKind, Vec<Pattern>),
    Any,
    Leaf,
}

impl Pattern {
    /// A logical join with two any-children.
    pub fn join() -> Self {
        Pattern::Operator(LogicalOpKind::Join, vec![Pattern::Any, Pattern::Any])
    }

    /// A logical join whose right child group contains a join.
    pub fn join_join_right() -> Self {
        Pattern::Operator(LogicalOpKind::Join, vec![Pattern::Any, Pattern::join()])
    }

    pub fn scan() -> Self {
        Pattern::Operator(LogicalOpKind::Scan, vec![])
    }

    pub fn unary(kind: LogicalOpKind) -> Self {
        Pattern::Operator(kind, vec![Pattern::Any])
    }
}

/// Check if a memo member matches a pattern.
pub fn matches(memo: &Memo, expr_id: ExprId, pattern: &Pattern) -> bool {
    let expr = memo.expr(expr_id);
    match pattern {
        Pattern::Any => true,
        Pattern::Leaf => expr.children().is_empty(),
        Pattern::Operator(kind, child_patterns) => {
            let Some(node) = expr.logical() else {
                return false;
            };
            if node.kind() != *kind {
                return false;
            }
            let children = expr.children();
            if children.len() != child_patterns.len() {
                return false;
            }
            children.iter().zip(child_patterns).all(|(gid, p)| match p {
                Pattern::Any => true,
                _ => memo
                    .group(*gid)
                    .logical_exprs
                    .iter()
                    .any(|&eid| matches(memo, eid, p)),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ColumnRef, Expr, JoinType};
    use crate::plan::{LogicalNode, ScanSource};
    use std::sync::Arc;

    fn scan(r: u32) -> Arc<LogicalNode> {
        let col = Expr::Column(ColumnRef::bound(format!("t{r}"), "k", r, 0));
        Arc::new(LogicalNode::scan(r, ScanSource::Table(format!("t{r}")), vec![col]))
    }

    #[test]
    fn test_nested_join_pattern() {
        let mut memo = Memo::new();
        let bc = Arc::new(LogicalNode::join(JoinType::Inner, None, scan(1), scan(2)));
        let root = memo
            .insert_plan(&LogicalNode::join(JoinType::Inner, None, scan(0), bc))
            .unwrap();
        let top = memo.group(root).logical_exprs[0];
        assert!(matches(&memo, top, &Pattern::join()));
        assert!(matches(&memo, top, &Pattern::join_join_right()));

        let left_child = memo.expr(top).children()[0];
        let scan_expr = memo.group(left_child).logical_exprs[0];
        assert!(matches(&memo, scan_expr, &Pattern::scan()));
        assert!(matches(&memo, scan_expr, &Pattern::Leaf));
        assert!(!matches(&memo, scan_expr, &Pattern::join()));
    }
}
