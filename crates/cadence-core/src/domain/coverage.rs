//! Coverage tree recording which flows and steps actually executed.
//!
//! The shape of a tree is fixed once it is built; only the covered flags
//! change. Each invocation works on its own copy obtained through
//! [`CoverageNode::duplicate`], so nodes are never shared between
//! concurrent runs.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Which structural element a node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageKind {
    /// A flow (root of a flow tree, or a nested flow below a step)
    Flow,
    /// A step within a flow
    Step,
}

/// Build-time description of a coverage tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageShape {
    /// Element name
    pub name: String,
    /// Element kind
    pub kind: CoverageKind,
    /// Ordered children
    pub children: Vec<CoverageShape>,
}

impl CoverageShape {
    /// A flow element with the given children
    pub fn flow(name: impl Into<String>, children: Vec<CoverageShape>) -> Self {
        Self {
            name: name.into(),
            kind: CoverageKind::Flow,
            children,
        }
    }

    /// A step element with the given children (nested flows)
    pub fn step(name: impl Into<String>, children: Vec<CoverageShape>) -> Self {
        Self {
            name: name.into(),
            kind: CoverageKind::Step,
            children,
        }
    }
}

/// One element of a coverage tree
#[derive(Debug)]
pub struct CoverageNode {
    name: String,
    kind: CoverageKind,
    covered: AtomicBool,
    parent: Weak<CoverageNode>,
    children: Vec<Arc<CoverageNode>>,
}

impl CoverageNode {
    /// Build an uncovered tree from a shape
    pub fn build(shape: &CoverageShape) -> Arc<Self> {
        Self::build_under(shape, Weak::new())
    }

    fn build_under(shape: &CoverageShape, parent: Weak<CoverageNode>) -> Arc<Self> {
        Arc::new_cyclic(|me| CoverageNode {
            name: shape.name.clone(),
            kind: shape.kind,
            covered: AtomicBool::new(false),
            parent,
            children: shape
                .children
                .iter()
                .map(|child| Self::build_under(child, me.clone()))
                .collect(),
        })
    }

    /// Fresh, uncovered copy of this subtree with the same shape
    pub fn duplicate(&self) -> Arc<Self> {
        Self::build(&self.shape())
    }

    /// The shape of this subtree
    pub fn shape(&self) -> CoverageShape {
        CoverageShape {
            name: self.name.clone(),
            kind: self.kind,
            children: self.children.iter().map(|child| child.shape()).collect(),
        }
    }

    /// Element name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element kind
    pub fn kind(&self) -> CoverageKind {
        self.kind
    }

    /// Own covered flag, independent of the children
    pub fn is_covered(&self) -> bool {
        self.covered.load(Ordering::Acquire)
    }

    /// Mark this element as executed
    pub fn mark_covered(&self) {
        self.set_covered(true);
    }

    /// Set the covered flag explicitly
    pub fn set_covered(&self, covered: bool) {
        self.covered.store(covered, Ordering::Release);
    }

    /// Back-pointer to the parent, if it is still alive
    pub fn parent(&self) -> Option<Arc<CoverageNode>> {
        self.parent.upgrade()
    }

    /// Ordered children
    pub fn children(&self) -> &[Arc<CoverageNode>] {
        &self.children
    }

    /// Child at a position
    pub fn child(&self, index: usize) -> Option<&Arc<CoverageNode>> {
        self.children.get(index)
    }

    /// Nested flow subtree registered under this node
    pub fn nested_flow(&self, name: &str) -> Option<&Arc<CoverageNode>> {
        self.children
            .iter()
            .find(|child| child.kind == CoverageKind::Flow && child.name == name)
    }

    /// Slash separated names from the root down to this node
    pub fn path(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}/{}", parent.path(), self.name),
            None => self.name.clone(),
        }
    }

    /// Number of elements in this subtree, this node included
    pub fn total_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.total_count()).sum::<usize>()
    }

    /// Number of covered elements in this subtree, this node included
    pub fn covered_count(&self) -> usize {
        usize::from(self.is_covered())
            + self.children.iter().map(|c| c.covered_count()).sum::<usize>()
    }

    /// Number of step elements in this subtree
    pub fn total_steps(&self) -> usize {
        usize::from(self.kind == CoverageKind::Step)
            + self.children.iter().map(|c| c.total_steps()).sum::<usize>()
    }

    /// Number of covered step elements in this subtree
    pub fn covered_steps(&self) -> usize {
        usize::from(self.kind == CoverageKind::Step && self.is_covered())
            + self.children.iter().map(|c| c.covered_steps()).sum::<usize>()
    }

    /// Covered over total, in `[0, 1]`
    pub fn ratio(&self) -> f64 {
        ratio(self.covered_count(), self.total_count())
    }

    /// Clear every covered flag, keeping the structure
    pub fn reset(&self) {
        self.set_covered(false);
        for child in &self.children {
            child.reset();
        }
    }

    /// Mark covered every element that is covered in `other`.
    ///
    /// Both trees must share a shape; mismatching children are skipped.
    pub fn absorb(&self, other: &CoverageNode) {
        if self.name != other.name || self.kind != other.kind {
            return;
        }
        if other.is_covered() {
            self.mark_covered();
        }
        for (mine, theirs) in self.children.iter().zip(other.children.iter()) {
            mine.absorb(theirs);
        }
    }

    /// Structured report of this subtree
    pub fn report(&self) -> CoverageReport {
        let covered_count = self.covered_count();
        let total_count = self.total_count();
        CoverageReport {
            name: self.name.clone(),
            kind: self.kind,
            covered: self.is_covered(),
            covered_count,
            total_count,
            ratio: ratio(covered_count, total_count),
            children: self.children.iter().map(|c| c.report()).collect(),
        }
    }
}

fn ratio(covered: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64
    }
}

/// Serializable dump of a coverage tree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    /// Element name
    pub name: String,
    /// Element kind
    pub kind: CoverageKind,
    /// Own covered flag
    pub covered: bool,
    /// Covered elements in the subtree
    pub covered_count: usize,
    /// All elements in the subtree
    pub total_count: usize,
    /// `covered_count / total_count`
    pub ratio: f64,
    /// Child reports in declaration order
    pub children: Vec<CoverageReport>,
}

impl CoverageReport {
    fn render(&self, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.covered { "x" } else { " " };
        let label = match self.kind {
            CoverageKind::Flow => "flow",
            CoverageKind::Step => "step",
        };
        writeln!(
            f,
            "{:indent$}[{}] {} {} ({}/{}, {:.1}%)",
            "",
            mark,
            label,
            self.name,
            self.covered_count,
            self.total_count,
            self.ratio * 100.0,
            indent = depth * 2
        )?;
        for child in &self.children {
            child.render(depth + 1, f)?;
        }
        Ok(())
    }
}

impl fmt::Display for CoverageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(0, f)
    }
}
