//! Assertion helpers for coverage trees.

use cadence_core::CoverageNode;
use thiserror::Error;

/// Why a coverage expectation failed
#[derive(Debug, Error)]
pub enum CoverageAssertionError {
    /// No node at the path
    #[error("no coverage node at '{0}'")]
    MissingNode(String),

    /// The node's covered flag differs
    #[error("expected '{path}' to be {expected}")]
    Mismatch {
        /// Node path
        path: String,
        /// Expected state
        expected: &'static str,
    },
}

/// Find a node by its `/`-separated path of names below `root`, starting
/// with the root's own name
pub fn find_node<'a>(root: &'a CoverageNode, path: &str) -> Option<&'a CoverageNode> {
    let mut parts = path.split('/');
    if parts.next()? != root.name() {
        return None;
    }
    let mut node = root;
    for part in parts {
        node = node.children().iter().find(|child| child.name() == part)?;
    }
    Some(node)
}

/// Check the covered flag of the node at `path`
pub fn check_covered(root: &CoverageNode, path: &str, covered: bool) -> Result<(), CoverageAssertionError> {
    let node = find_node(root, path).ok_or_else(|| CoverageAssertionError::MissingNode(path.to_string()))?;
    if node.is_covered() != covered {
        return Err(CoverageAssertionError::Mismatch {
            path: path.to_string(),
            expected: if covered { "covered" } else { "not covered" },
        });
    }
    Ok(())
}

/// Panic unless the node at `path` is covered
pub fn assert_covered(root: &CoverageNode, path: &str) {
    if let Err(error) = check_covered(root, path, true) {
        panic!("{error}\n{}", root.report());
    }
}

/// Panic unless the node at `path` is not covered
pub fn assert_not_covered(root: &CoverageNode, path: &str) {
    if let Err(error) = check_covered(root, path, false) {
        panic!("{error}\n{}", root.report());
    }
}
