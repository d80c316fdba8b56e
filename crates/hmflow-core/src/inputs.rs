//! Per-node solve inputs: data terms, smoothness fields and weights.

use std::collections::BTreeMap;

use crate::error::ConfigurationError;
use crate::hierarchy::{Hierarchy, NodeId, NodeRole};
use crate::volume::{Extent, Volume};

/// Inputs attached to hierarchy nodes.
///
/// Leaves need a data term (the cost of assigning a voxel to that label).
/// Any non-root node may carry a smoothness field, which defaults to a
/// constant 1, and an alpha weight, which defaults to 1.
#[derive(Clone, Debug, Default)]
pub struct SolveInputs {
    data: BTreeMap<NodeId, Volume>,
    smoothness: BTreeMap<NodeId, Volume>,
    alpha: BTreeMap<NodeId, f32>,
}

impl SolveInputs {
    /// Empty inputs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a leaf's data term.
    pub fn set_data_term(&mut self, leaf: NodeId, term: Volume) {
        self.data.insert(leaf, term);
    }

    /// Sets a node's smoothness field.
    pub fn set_smoothness(&mut self, node: NodeId, field: Volume) {
        self.smoothness.insert(node, field);
    }

    /// Sets a node's smoothness weight.
    pub fn set_alpha(&mut self, node: NodeId, alpha: f32) {
        self.alpha.insert(node, alpha);
    }

    /// Data term of a leaf, if set.
    pub fn data_term(&self, leaf: NodeId) -> Option<&Volume> {
        self.data.get(&leaf)
    }

    /// Smoothness field of a node, if set.
    pub fn smoothness(&self, node: NodeId) -> Option<&Volume> {
        self.smoothness.get(&node)
    }

    /// Smoothness weight of a node (1 unless set).
    pub fn alpha(&self, node: NodeId) -> f32 {
        self.alpha.get(&node).copied().unwrap_or(1.0)
    }

    /// Checks the inputs against `hierarchy` and returns the common extent.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError`] for foreign node ids, data terms on non-leaves,
    /// leaves without a data term, negative or non-finite weights, volumes
    /// whose extent differs from the first leaf's, or an empty extent.
    pub fn validate(&self, hierarchy: &Hierarchy) -> Result<Extent, ConfigurationError> {
        for &node in self.data.keys() {
            hierarchy.check(node)?;
            if hierarchy.role(node) != NodeRole::Leaf {
                return Err(ConfigurationError::DataTermOnNonLeaf(node));
            }
        }
        for &node in self.smoothness.keys().chain(self.alpha.keys()) {
            hierarchy.check(node)?;
        }
        for &alpha in self.alpha.values() {
            if !alpha.is_finite() || alpha < 0.0 {
                return Err(ConfigurationError::InvalidParameter {
                    name: "alpha",
                    value: f64::from(alpha),
                    range: "[0, inf)",
                });
            }
        }

        let mut extent = None;
        for leaf in hierarchy.leaves() {
            let term = self
                .data
                .get(&leaf)
                .ok_or(ConfigurationError::MissingDataTerm(leaf))?;
            let expected = *extent.get_or_insert(term.extent());
            check_extent(hierarchy, "data term", leaf, expected, term)?;
        }
        let extent = extent.ok_or(ConfigurationError::NoLeaves)?;
        for (&node, field) in &self.smoothness {
            check_extent(hierarchy, "smoothness", node, extent, field)?;
        }
        if extent.is_empty() {
            return Err(ConfigurationError::EmptyExtent(extent));
        }
        Ok(extent)
    }
}

fn check_extent(
    hierarchy: &Hierarchy,
    what: &str,
    node: NodeId,
    expected: Extent,
    volume: &Volume,
) -> Result<(), ConfigurationError> {
    if volume.extent() == expected {
        return Ok(());
    }
    Err(ConfigurationError::ExtentMismatch {
        what: format!("{what} of '{}'", hierarchy.label(node)),
        expected,
        actual: volume.extent(),
    })
}
