//! Structural validation of solve files.
//!
//! Checks the label tree described by a [`SolveFile`](crate::SolveFile) before
//! any volume is read: unique names, resolvable parents, a single root, and
//! data terms exactly on the leaves. The extent must be non-empty and small
//! enough that a field's byte size fits in `usize`. Cycles and orphaned subtrees are caught
//! later, when hmflow-core builds the hierarchy.
//!
//! # Example
//!
//! ```rust
//! use hmflow_config::{NodeConfig, SolveFile, ValidationError, validate_solve_file};
//! use hmflow_core::Extent;
//!
//! let file = SolveFile::new("t", Extent::new(4, 4, 1))
//!     .with_node(NodeConfig::root("root"))
//!     .with_node(NodeConfig::child("a", "root"));
//! assert_eq!(
//!     validate_solve_file(&file),
//!     Err(ValidationError::MissingData("a".into()))
//! );
//! ```

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::solve_file::SolveFile;

/// Bytes per stored voxel value.
const VALUE_BYTES: usize = core::mem::size_of::<f32>();

/// Validation error types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// The grid has a zero dimension.
    #[error("extent {x}x{y}x{z} is empty")]
    EmptyExtent {
        /// Voxels along x.
        x: usize,
        /// Voxels along y.
        y: usize,
        /// Voxels along z.
        z: usize,
    },

    /// The grid has more voxels than one field can address in bytes.
    #[error("extent {x}x{y}x{z} is too large")]
    ExtentOverflow {
        /// Voxels along x.
        x: usize,
        /// Voxels along y.
        y: usize,
        /// Voxels along z.
        z: usize,
    },

    /// Two nodes share a name.
    #[error("duplicate node '{0}'")]
    DuplicateNode(String),

    /// A node names a parent that does not exist.
    #[error("node '{node}' has unknown parent '{parent}'")]
    UnknownParent {
        /// Name of the node.
        node: String,
        /// The missing parent name.
        parent: String,
    },

    /// No node lacks a parent.
    #[error("no root node (every node has a parent)")]
    NoRoot,

    /// More than one node lacks a parent.
    #[error("multiple root nodes: {}", .0.join(", "))]
    MultipleRoots(Vec<String>),

    /// A leaf has no data term file.
    #[error("leaf '{0}' has no data file")]
    MissingData(String),

    /// A non-leaf node has a data term file.
    #[error("node '{0}' has children and cannot take a data file")]
    DataOnBranch(String),

    /// The root has a smoothness field or weight, which would be ignored.
    #[error("root '{0}' cannot take smoothness or alpha")]
    RegularizedRoot(String),

    /// A leaf has no output file.
    #[error("leaf '{0}' has no output file")]
    MissingOutput(String),

    /// Multiple validation errors.
    #[error("multiple validation errors: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Checks the structure of a solve file.
///
/// Every problem found is reported; a single one is returned as is, several
/// are wrapped in [`ValidationError::Multiple`].
pub fn validate_solve_file(file: &SolveFile) -> ValidationResult<()> {
    let mut errors = Vec::new();

    let e = file.extent;
    if e.x == 0 || e.y == 0 || e.z == 0 {
        errors.push(ValidationError::EmptyExtent {
            x: e.x,
            y: e.y,
            z: e.z,
        });
    } else if e
        .x
        .checked_mul(e.y)
        .and_then(|v| v.checked_mul(e.z))
        .and_then(|v| v.checked_mul(VALUE_BYTES))
        .is_none()
    {
        errors.push(ValidationError::ExtentOverflow {
            x: e.x,
            y: e.y,
            z: e.z,
        });
    }

    let mut seen = HashSet::new();
    for node in &file.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNode(node.id.clone()));
        }
    }

    let mut child_count: HashMap<&str, usize> = HashMap::new();
    let mut roots = Vec::new();
    for node in &file.nodes {
        match node.parent.as_deref() {
            None => roots.push(node.id.clone()),
            Some(parent) if seen.contains(parent) => {
                *child_count.entry(parent).or_default() += 1;
            }
            Some(parent) => errors.push(ValidationError::UnknownParent {
                node: node.id.clone(),
                parent: parent.to_string(),
            }),
        }
    }
    match roots.len() {
        0 => errors.push(ValidationError::NoRoot),
        1 => {}
        _ => errors.push(ValidationError::MultipleRoots(roots)),
    }

    for node in &file.nodes {
        let is_leaf = !child_count.contains_key(node.id.as_str());
        if node.parent.is_none() {
            if node.smoothness.is_some() || node.alpha.is_some() {
                errors.push(ValidationError::RegularizedRoot(node.id.clone()));
            }
            if node.data.is_some() {
                errors.push(ValidationError::DataOnBranch(node.id.clone()));
            }
            continue;
        }
        match (is_leaf, node.data.is_some()) {
            (true, false) => errors.push(ValidationError::MissingData(node.id.clone())),
            (false, true) => errors.push(ValidationError::DataOnBranch(node.id.clone())),
            _ => {}
        }
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solve_file::NodeConfig;
    use hmflow_core::Extent;

    fn base() -> SolveFile {
        SolveFile::new("t", Extent::new(2, 2, 1))
            .with_node(NodeConfig::root("root"))
            .with_node(NodeConfig::child("a", "root").with_data("a.f32"))
            .with_node(NodeConfig::child("b", "root").with_data("b.f32"))
    }

    #[test]
    fn valid_file_passes() {
        assert_eq!(validate_solve_file(&base()), Ok(()));
    }

    #[test]
    fn duplicate_names() {
        let file = base().with_node(NodeConfig::child("a", "root").with_data("x.f32"));
        assert_eq!(
            validate_solve_file(&file),
            Err(ValidationError::DuplicateNode("a".into()))
        );
    }

    #[test]
    fn unknown_parent() {
        let file = base().with_node(NodeConfig::child("c", "nowhere").with_data("c.f32"));
        assert_eq!(
            validate_solve_file(&file),
            Err(ValidationError::UnknownParent {
                node: "c".into(),
                parent: "nowhere".into()
            })
        );
    }

    #[test]
    fn root_count() {
        let file = base().with_node(NodeConfig::root("other"));
        assert_eq!(
            validate_solve_file(&file),
            Err(ValidationError::MultipleRoots(vec![
                "root".into(),
                "other".into()
            ]))
        );

        let rootless = SolveFile::new("t", Extent::new(1, 1, 1))
            .with_node(NodeConfig::child("a", "b"))
            .with_node(NodeConfig::child("b", "a"));
        // each has a child, so neither is a leaf needing data
        assert_eq!(validate_solve_file(&rootless), Err(ValidationError::NoRoot));
    }

    #[test]
    fn data_placement() {
        let file = SolveFile::new("t", Extent::new(2, 2, 1))
            .with_node(NodeConfig::root("root"))
            .with_node(NodeConfig::child("obj", "root").with_data("obj.f32"))
            .with_node(NodeConfig::child("a", "obj"));
        let Err(ValidationError::Multiple(errors)) = validate_solve_file(&file) else {
            panic!("expected several errors");
        };
        assert!(errors.contains(&ValidationError::DataOnBranch("obj".into())));
        assert!(errors.contains(&ValidationError::MissingData("a".into())));
    }

    #[test]
    fn root_regularization_rejected() {
        let mut file = base();
        file.nodes[0].alpha = Some(2.0);
        assert_eq!(
            validate_solve_file(&file),
            Err(ValidationError::RegularizedRoot("root".into()))
        );
    }

    #[test]
    fn empty_extent() {
        let mut file = base();
        file.extent.y = 0;
        assert!(matches!(
            validate_solve_file(&file),
            Err(ValidationError::EmptyExtent { y: 0, .. })
        ));
    }

    #[test]
    fn oversized_extent() {
        let mut file = base();
        let side = 1 << 22;
        file.extent.x = side;
        file.extent.y = side;
        file.extent.z = side;
        assert_eq!(
            validate_solve_file(&file),
            Err(ValidationError::ExtentOverflow {
                x: side,
                y: side,
                z: side
            })
        );

        // fits in voxels but not in bytes
        file.extent.x = usize::MAX / 2;
        file.extent.y = 1;
        file.extent.z = 1;
        assert!(matches!(
            validate_solve_file(&file),
            Err(ValidationError::ExtentOverflow { .. })
        ));
    }
}
