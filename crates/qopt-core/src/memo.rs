//! # Memo
//!
//! The memo is the central data structure of the search: a set of **groups**, each
//! holding logically equivalent **members**. A logical member is a shallow
//! [`LogicalNode`] whose children are group placeholders; a physical member names an
//! algorithm, the logical member it implements, and its child groups.
//!
//! ## Signatures
//!
//! Each group is keyed by a signature, so that a rule rediscovering an existing
//! sub-plan lands in the existing group instead of a new one:
//!
//! - An inner join (with or without a predicate) is part of a *join region*. Its
//!   signature hashes the set of leaf groups below the region together with the set
//!   of predicate conjuncts used anywhere in the region. Every join order over the
//!   same leaves and predicates therefore shares one group.
//! - Any other node hashes its operator payload and its child group ids. Semi, anti,
//!   single, mark, and left joins are leaves of the regions above them.
//!
//! Conjuncts are hashed with [`Expr::canonical_hash`], which ignores the operand order
//! of `=`.
//!
//! ## Arena Layout
//!
//! Groups and members live in vectors and refer to each other by integer id, so the
//! memo owns every node and parents never hold references into it.

use crate::cost::Cost;
use crate::error::OptimizeError;
use crate::expr::{Expr, TableRefId};
use crate::plan::{output_tables, LogicalNode, LogicalOp, PhysicalNode, PhysicalOp, PlanChild};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::trace;

pub type GroupId = u32;
pub type ExprId = u32;

/// Group key; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub u64);

/// A physical alternative inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhysicalMember {
    pub op: PhysicalOp,
    /// The logical member this implements.
    pub logic: ExprId,
    pub children: Vec<GroupId>,
}

#[derive(Debug, Clone)]
pub enum Member {
    Logical(Arc<LogicalNode>),
    Physical(PhysicalMember),
}

#[derive(Debug, Clone)]
pub struct MemoExpr {
    pub id: ExprId,
    pub group: GroupId,
    pub member: Member,
}

impl MemoExpr {
    pub fn logical(&self) -> Option<&Arc<LogicalNode>> {
        match self.member {
            Member::Logical(ref n) => Some(n),
            Member::Physical(_) => None,
        }
    }

    pub fn physical(&self) -> Option<&PhysicalMember> {
        match self.member {
            Member::Physical(ref p) => Some(p),
            Member::Logical(_) => None,
        }
    }

    pub fn is_logical(&self) -> bool {
        self.logical().is_some()
    }

    /// Child groups, in input order.
    pub fn children(&self) -> Vec<GroupId> {
        match self.member {
            Member::Logical(ref n) => n.children.iter().filter_map(PlanChild::as_group).collect(),
            Member::Physical(ref p) => p.children.clone(),
        }
    }
}

/// Exploration progress of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    New,
    Exploring,
    /// Rules have run on every member. Members may still be added from outside,
    /// but the group is not scanned again in the same search.
    Explored,
}

/// Cheapest physical member found for a group.
#[derive(Debug, Clone, Copy)]
pub struct Winner {
    pub expr_id: ExprId,
    pub cost: Cost,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub signature: Signature,
    pub logical_exprs: Vec<ExprId>,
    pub physical_exprs: Vec<ExprId>,
    pub state: GroupState,
    /// Output columns shared by every member.
    pub output: Vec<Expr>,
    pub tables: BTreeSet<TableRefId>,
    /// Inner-join group: part of a reorderable join region.
    pub is_region: bool,
    /// Leaf groups of the join region, or `{id}` for a non-region group.
    pub leaves: BTreeSet<GroupId>,
    /// Canonical conjunct hashes used inside the join region.
    pub region_preds: BTreeSet<u64>,
    pub card: Option<f64>,
    pub winner: Option<Winner>,
}

/// Result of inserting a logical node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    pub group: GroupId,
    pub expr: ExprId,
    /// False when an identical member already existed.
    pub is_new: bool,
}

#[derive(Debug, Default)]
pub struct Memo {
    groups: Vec<Group>,
    exprs: Vec<MemoExpr>,
    by_signature: HashMap<Signature, GroupId>,
    logical_index: HashMap<Arc<LogicalNode>, ExprId>,
    physical_index: HashMap<PhysicalMember, ExprId>,
    applied: HashSet<(ExprId, u64)>,
}

impl Memo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn num_exprs(&self) -> usize {
        self.exprs.len()
    }

    pub fn group(&self, id: GroupId) -> &Group {
        &self.groups[id as usize]
    }

    pub fn group_mut(&mut self, id: GroupId) -> &mut Group {
        &mut self.groups[id as usize]
    }

    pub fn try_group(&self, id: GroupId) -> Result<&Group, OptimizeError> {
        self.groups.get(id as usize).ok_or(OptimizeError::UnknownGroup(id))
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    pub fn expr(&self, id: ExprId) -> &MemoExpr {
        &self.exprs[id as usize]
    }

    /// The logical node of a logical member.
    pub fn logical(&self, id: ExprId) -> Option<&Arc<LogicalNode>> {
        self.exprs.get(id as usize).and_then(MemoExpr::logical)
    }

    pub fn rule_applied(&self, expr: ExprId, rule_hash: u64) -> bool {
        self.applied.contains(&(expr, rule_hash))
    }

    pub fn mark_rule_applied(&mut self, expr: ExprId, rule_hash: u64) {
        self.applied.insert((expr, rule_hash));
    }

    /// Copy an owned plan into the memo bottom-up and return its root group.
    pub fn insert_plan(&mut self, plan: &LogicalNode) -> Result<GroupId, OptimizeError> {
        Ok(self.insert_logical(plan, None)?.group)
    }

    /// Insert a logical node. Owned children are inserted first, each into the group
    /// matching its signature. With `target` set, the node must belong to that group.
    pub fn insert_logical(&mut self, node: &LogicalNode, target: Option<GroupId>) -> Result<Inserted, OptimizeError> {
        let mut children = Vec::with_capacity(node.children.len());
        for c in &node.children {
            let gid = match c {
                PlanChild::Group(g) => self.try_group(*g)?.id,
                PlanChild::Node(n) => self.insert_logical(n, None)?.group,
            };
            children.push(PlanChild::Group(gid));
        }
        let mut shallow = node.with_children(children);
        let sig = self.signature_of(&shallow);

        let existing = match target {
            Some(t) => {
                let expected = self.try_group(t)?.signature;
                if expected != sig {
                    return Err(OptimizeError::SignatureMismatch {
                        rule: String::new(),
                        group: t,
                        expected: expected.0,
                        found: sig.0,
                    });
                }
                Some(t)
            }
            None => self.by_signature.get(&sig).copied(),
        };
        if let Some(gid) = existing {
            // all members of a group expose the group's column order
            shallow.output = self.group(gid).output.clone();
        }
        let shallow = Arc::new(shallow);
        if let Some(&eid) = self.logical_index.get(&shallow) {
            return Ok(Inserted {
                group: self.expr(eid).group,
                expr: eid,
                is_new: false,
            });
        }

        let gid = match existing {
            Some(g) => g,
            None => self.new_group(sig, &shallow),
        };
        let eid = self.exprs.len() as ExprId;
        self.exprs.push(MemoExpr {
            id: eid,
            group: gid,
            member: Member::Logical(Arc::clone(&shallow)),
        });
        self.logical_index.insert(shallow, eid);
        self.group_mut(gid).logical_exprs.push(eid);
        trace!(group = gid, expr = eid, "inserted logical member");
        Ok(Inserted {
            group: gid,
            expr: eid,
            is_new: true,
        })
    }

    /// Add a physical member to `group`. Duplicates return the existing id.
    pub fn insert_physical(&mut self, group: GroupId, member: PhysicalMember) -> ExprId {
        if let Some(&eid) = self.physical_index.get(&member) {
            return eid;
        }
        let eid = self.exprs.len() as ExprId;
        self.exprs.push(MemoExpr {
            id: eid,
            group,
            member: Member::Physical(member.clone()),
        });
        self.physical_index.insert(member, eid);
        self.group_mut(group).physical_exprs.push(eid);
        eid
    }

    fn new_group(&mut self, signature: Signature, node: &LogicalNode) -> GroupId {
        let id = self.groups.len() as GroupId;
        let is_region = node.op.is_inner_join();
        let (leaves, region_preds) = if is_region {
            self.region_of(node)
        } else {
            (BTreeSet::from([id]), BTreeSet::new())
        };
        self.groups.push(Group {
            id,
            signature,
            logical_exprs: Vec::new(),
            physical_exprs: Vec::new(),
            state: GroupState::New,
            output: node.output.clone(),
            tables: output_tables(&node.output),
            is_region,
            leaves,
            region_preds,
            card: None,
            winner: None,
        });
        self.by_signature.insert(signature, id);
        trace!(group = id, signature = signature.0, "created group");
        id
    }

    /// Signature of a shallow node (all children are group placeholders).
    pub fn signature_of(&self, node: &LogicalNode) -> Signature {
        let mut h = DefaultHasher::new();
        if node.op.is_inner_join() {
            let (leaves, preds) = self.region_of(node);
            "join-region".hash(&mut h);
            leaves.hash(&mut h);
            preds.hash(&mut h);
        } else {
            node.op.hash(&mut h);
            for c in &node.children {
                c.as_group().hash(&mut h);
            }
        }
        Signature(h.finish())
    }

    fn region_of(&self, node: &LogicalNode) -> (BTreeSet<GroupId>, BTreeSet<u64>) {
        let mut leaves = BTreeSet::new();
        let mut preds = BTreeSet::new();
        for gid in node.children.iter().filter_map(PlanChild::as_group) {
            let g = self.group(gid);
            if g.is_region {
                leaves.extend(g.leaves.iter().copied());
                preds.extend(g.region_preds.iter().copied());
            } else {
                leaves.insert(gid);
            }
        }
        if let LogicalOp::Join {
            predicate: Some(ref p), ..
        } = node.op
        {
            preds.extend(p.conjuncts().into_iter().filter(|c| !c.is_true()).map(Expr::canonical_hash));
        }
        (leaves, preds)
    }

    /// Materialize the winning physical plan rooted at `group`.
    pub fn extract_best_plan(&self, group: GroupId) -> Result<PhysicalNode, OptimizeError> {
        let g = self.try_group(group)?;
        let winner = g.winner.ok_or(OptimizeError::NoPhysicalPlan(group))?;
        let member = self
            .expr(winner.expr_id)
            .physical()
            .ok_or(OptimizeError::NoPhysicalPlan(group))?;
        let logic = self
            .logical(member.logic)
            .cloned()
            .ok_or(OptimizeError::NoPhysicalPlan(group))?;
        let children = member
            .children
            .iter()
            .map(|c| self.extract_best_plan(*c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PhysicalNode::new(
            member.op,
            logic,
            children,
            winner.cost,
            g.card.unwrap_or(1.0),
        ))
    }

    /// Text dump of every group, for debugging and tests.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for g in &self.groups {
            let _ = writeln!(
                out,
                "group {} [{:?}] leaves={:?} card={:?}",
                g.id, g.state, g.leaves, g.card
            );
            for e in g.logical_exprs.iter().chain(&g.physical_exprs) {
                let expr = self.expr(*e);
                match expr.member {
                    Member::Logical(ref n) => {
                        let _ = writeln!(out, "  {e}: {} {:?}", n.op, expr.children());
                    }
                    Member::Physical(ref p) => {
                        let _ = writeln!(out, "  {e}: {} of {} {:?}", p.op.name(), p.logic, p.children);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ColumnRef, JoinType};
    use crate::plan::ScanSource;

    fn col(t: &str, r: TableRefId) -> Expr {
        Expr::Column(ColumnRef::bound(t, "k", r, 0))
    }

    fn scan(t: &str, r: TableRefId) -> Arc<LogicalNode> {
        Arc::new(LogicalNode::scan(r, ScanSource::Table(t.into()), vec![col(t, r)]))
    }

    fn join(l: Arc<LogicalNode>, r: Arc<LogicalNode>, pred: Option<Expr>) -> Arc<LogicalNode> {
        Arc::new(LogicalNode::join(JoinType::Inner, pred, l, r))
    }

    #[test]
    fn test_identical_subplans_share_groups() {
        let mut memo = Memo::new();
        let a = scan("a", 0);
        let root = memo.insert_plan(&join(a.clone(), scan("b", 1), None)).unwrap();
        assert_eq!(memo.num_groups(), 3);
        // inserting the scan again finds the existing member
        let again = memo.insert_logical(&a, None).unwrap();
        assert!(!again.is_new);
        assert_ne!(again.group, root);
        assert_eq!(memo.num_groups(), 3);
    }

    #[test]
    fn test_join_orders_share_one_signature() {
        let (a, b, c) = (scan("a", 0), scan("b", 1), scan("c", 2));
        let ab = Expr::eq(col("a", 0), col("b", 1));
        let bc = Expr::eq(col("b", 1), col("c", 2));

        let mut memo = Memo::new();
        let left_deep = join(join(a.clone(), b.clone(), Some(ab.clone())), c.clone(), Some(bc.clone()));
        let root = memo.insert_plan(&left_deep).unwrap();

        // A ⋈ (B ⋈ C), with the B-C equality written the other way round
        let right_deep = join(a, join(b, c, Some(Expr::eq(col("c", 2), col("b", 1)))), Some(ab));
        let inserted = memo.insert_logical(&right_deep, Some(root)).unwrap();
        assert_eq!(inserted.group, root);
        assert_eq!(memo.group(root).logical_exprs.len(), 2);
        assert_eq!(memo.group(root).leaves.len(), 3);
    }

    #[test]
    fn test_signature_mismatch_is_reported() {
        let mut memo = Memo::new();
        let root = memo.insert_plan(&join(scan("a", 0), scan("b", 1), None)).unwrap();
        let other = join(scan("a", 0), scan("c", 2), None);
        let err = memo.insert_logical(&other, Some(root)).unwrap_err();
        assert!(matches!(err, OptimizeError::SignatureMismatch { group, .. } if group == root));
    }

    #[test]
    fn test_semi_join_is_a_region_leaf() {
        let mut memo = Memo::new();
        let semi = Arc::new(LogicalNode::join(JoinType::Semi, None, scan("a", 0), scan("b", 1)));
        let root = memo.insert_plan(&join(semi, scan("c", 2), None)).unwrap();
        let g = memo.group(root);
        assert!(g.is_region);
        assert_eq!(g.leaves.len(), 2);
        assert_eq!(g.tables, BTreeSet::from([0, 2]));
    }

    #[test]
    fn test_physical_members_dedup() {
        let mut memo = Memo::new();
        let gid = memo.insert_plan(&scan("a", 0)).unwrap();
        let logic = memo.group(gid).logical_exprs[0];
        let m = PhysicalMember {
            op: PhysicalOp::TableScan,
            logic,
            children: vec![],
        };
        let e1 = memo.insert_physical(gid, m.clone());
        let e2 = memo.insert_physical(gid, m);
        assert_eq!(e1, e2);
        assert_eq!(memo.group(gid).physical_exprs.len(), 1);
        assert!(memo.extract_best_plan(gid).is_err());
    }
}
