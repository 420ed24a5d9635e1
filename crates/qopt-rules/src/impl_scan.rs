//! # Scan Implementation Rule
//!
//! Maps a logical scan to a physical scan. Catalog tables become a `TableScan`;
//! a scan over a file path becomes a `FileScan`. A pushed-down predicate stays on
//! the wrapped logical node and is evaluated by the scan itself.

use qopt_core::memo::{Memo, MemoExpr};
use qopt_core::pattern::Pattern;
use qopt_core::plan::{LogicalNode, LogicalOp, PhysicalOp, ScanSource};
use qopt_core::rule::{OptContext, Rule, RuleResult, RuleType};

/// Implement a logical scan as a full scan of its source.
pub struct ImplScanRule;

impl Rule for ImplScanRule {
    fn name(&self) -> &str {
        "ImplScan"
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Implementation
    }

    fn pattern(&self) -> Pattern {
        Pattern::scan()
    }

    fn apply(&self, _expr: &MemoExpr, node: &LogicalNode, _memo: &Memo, _ctx: &OptContext) -> Vec<RuleResult> {
        let LogicalOp::Scan { source, .. } = &node.op else {
            return vec![];
        };
        let op = match source {
            ScanSource::Table(_) => PhysicalOp::TableScan,
            ScanSource::File(_) => PhysicalOp::FileScan,
        };
        vec![RuleResult::Physical { op, children: vec![] }]
    }
}
