//! Host-side evaluation of the hierarchical segmentation energy.
//!
//! For a labelling `u` of the leaves, every non-root node `n` gets the label
//! `u_n = Σ u_leaf` over its leaf descendants and contributes
//!
//! ```text
//! F(leaf)   = Σ_x D_n(x) u_n(x) + α_n Σ_x S_n(x) |∇u_n(x)|
//! F(branch) =                     α_n Σ_x S_n(x) |∇u_n(x)|
//! ```
//!
//! The root contributes nothing. The gradient uses the same forward
//! differences as the solver's flow update, so the total is the primal
//! objective the solver relaxes.

use std::collections::BTreeMap;

use crate::error::ConfigurationError;
use crate::hierarchy::{Hierarchy, NodeId, NodeRole};
use crate::inputs::SolveInputs;
use crate::volume::{Extent, Volume};

/// Energy of a labelling, split by node.
#[derive(Clone, Debug, PartialEq)]
pub struct EnergyReport {
    /// Sum over every node.
    pub total: f64,
    /// Contribution of each node, root included (always 0).
    pub per_node: BTreeMap<NodeId, f64>,
}

impl EnergyReport {
    /// Contribution of one node.
    pub fn node(&self, node: NodeId) -> Option<f64> {
        self.per_node.get(&node).copied()
    }
}

/// Evaluates the energy of `labels` (one volume per leaf).
///
/// # Errors
///
/// Invalid `inputs` (see [`SolveInputs::validate`]),
/// [`ConfigurationError::MissingLabel`] if a leaf has no volume, or
/// [`ConfigurationError::ExtentMismatch`] if a label volume has the wrong size.
pub fn decompose(
    hierarchy: &Hierarchy,
    inputs: &SolveInputs,
    labels: &BTreeMap<NodeId, Volume>,
) -> Result<EnergyReport, ConfigurationError> {
    let extent = inputs.validate(hierarchy)?;
    for leaf in hierarchy.leaves() {
        let label = labels
            .get(&leaf)
            .ok_or(ConfigurationError::MissingLabel(leaf))?;
        if label.extent() != extent {
            return Err(ConfigurationError::ExtentMismatch {
                what: format!("label of '{}'", hierarchy.label(leaf)),
                expected: extent,
                actual: label.extent(),
            });
        }
    }

    let mut per_node = BTreeMap::new();
    let mut total = 0.0;
    for node in hierarchy.nodes() {
        let energy = match hierarchy.role(node) {
            NodeRole::Root => 0.0,
            NodeRole::Leaf => {
                let u = labels[&node].as_slice();
                let data = inputs
                    .data_term(node)
                    .ok_or(ConfigurationError::MissingDataTerm(node))?
                    .as_slice();
                let fidelity: f64 = data
                    .iter()
                    .zip(u)
                    .map(|(&d, &u)| f64::from(d) * f64::from(u))
                    .sum();
                fidelity + regularity(extent, u, inputs.smoothness(node), inputs.alpha(node))
            }
            NodeRole::Branch => {
                let mut u = vec![0.0_f32; extent.voxels()];
                for leaf in hierarchy.leaf_descendants(node) {
                    for (acc, &v) in u.iter_mut().zip(labels[&leaf].as_slice()) {
                        *acc += v;
                    }
                }
                regularity(extent, &u, inputs.smoothness(node), inputs.alpha(node))
            }
        };
        total += energy;
        per_node.insert(node, energy);
    }
    Ok(EnergyReport { total, per_node })
}

/// `α Σ_x S(x) |∇u(x)|` with forward differences, zero at the upper faces.
fn regularity(extent: Extent, u: &[f32], smoothness: Option<&Volume>, alpha: f32) -> f64 {
    let (sx, sy, sz) = extent.strides();
    let mut sum = 0.0_f64;
    for z in 0..extent.z {
        for y in 0..extent.y {
            for x in 0..extent.x {
                let i = extent.index(x, y, z);
                let gx = if x + 1 < extent.x { u[i + sx] - u[i] } else { 0.0 };
                let gy = if y + 1 < extent.y { u[i + sy] - u[i] } else { 0.0 };
                let gz = if z + 1 < extent.z { u[i + sz] - u[i] } else { 0.0 };
                let weight = smoothness.map_or(1.0, |s| s.as_slice()[i]);
                sum += f64::from(weight) * f64::from((gx * gx + gy * gy + gz * gz).sqrt());
            }
        }
    }
    f64::from(alpha) * sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::HierarchyBuilder;

    #[test]
    fn constant_labels_have_data_energy_only() {
        let mut b = HierarchyBuilder::new();
        let root = b.root();
        let a = b.add_child(root);
        let c = b.add_child(root);
        let h = b.build().unwrap();
        let e = Extent::new(3, 2, 1);
        let mut inputs = SolveInputs::new();
        inputs.set_data_term(a, Volume::filled(e, 2.0));
        inputs.set_data_term(c, Volume::filled(e, 1.0));
        let labels = BTreeMap::from([(a, Volume::filled(e, 0.25)), (c, Volume::filled(e, 0.75))]);

        let report = decompose(&h, &inputs, &labels).unwrap();
        assert!((report.node(a).unwrap() - 3.0).abs() < 1e-9);
        assert!((report.node(c).unwrap() - 4.5).abs() < 1e-9);
        assert_eq!(report.node(root), Some(0.0));
        assert!((report.total - 7.5).abs() < 1e-9);
    }

    #[test]
    fn boundary_costs_weighted_by_alpha() {
        let mut b = HierarchyBuilder::new();
        let root = b.root();
        let obj = b.add_child(root);
        let a = b.add_child(obj);
        let c = b.add_child(obj);
        let bg = b.add_child(root);
        let h = b.build().unwrap();

        let e = Extent::new(4, 1, 1);
        let mut inputs = SolveInputs::new();
        for leaf in [a, c, bg] {
            inputs.set_data_term(leaf, Volume::zeros(e));
        }
        inputs.set_alpha(obj, 2.0);
        inputs.set_alpha(a, 0.0);
        inputs.set_alpha(c, 0.0);
        // object occupies the left half, split evenly between a and c
        let half = |v: f32| Volume::from_vec(e, vec![v, v, 0.0, 0.0]).unwrap();
        let labels = BTreeMap::from([
            (a, half(0.5)),
            (c, half(0.5)),
            (bg, Volume::from_vec(e, vec![0.0, 0.0, 1.0, 1.0]).unwrap()),
        ]);

        let report = decompose(&h, &inputs, &labels).unwrap();
        // one unit jump in the object label, doubled by alpha
        assert!((report.node(obj).unwrap() - 2.0).abs() < 1e-9);
        assert!((report.node(bg).unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(report.node(a), Some(0.0));
        assert!((report.total - 3.0).abs() < 1e-9);
    }

    #[test]
    fn missing_label_is_an_error() {
        let mut b = HierarchyBuilder::new();
        let root = b.root();
        let a = b.add_child(root);
        let c = b.add_child(root);
        let h = b.build().unwrap();
        let e = Extent::new(2, 2, 1);
        let mut inputs = SolveInputs::new();
        inputs.set_data_term(a, Volume::zeros(e));
        inputs.set_data_term(c, Volume::zeros(e));
        let labels = BTreeMap::from([(a, Volume::zeros(e))]);
        assert_eq!(
            decompose(&h, &inputs, &labels),
            Err(ConfigurationError::MissingLabel(c))
        );
    }
}
