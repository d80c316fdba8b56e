//! Synthetic segmentation problems for demos and tests.
//!
//! A phantom is a disc centred in every z-slice, split into angular sectors
//! (one per object label), on a background. Data terms are low where a label
//! matches the ground truth and high elsewhere, with deterministic noise.
//!
//! With `labels == 2` the tree is `root → {background, object_0}`. With more
//! labels the object leaves sit under an `object` branch, so the generated
//! file exercises the full root/branch/leaf structure.

use std::f32::consts::TAU;
use std::path::{Path, PathBuf};

use hmflow_core::{Extent, Volume};

use crate::error::ConfigError;
use crate::solve_file::{NodeConfig, ParamsConfig, SolveFile};
use crate::validation::validate_solve_file;
use crate::volume_io::write_volume;

/// File name of the generated solve description.
pub const SOLVE_FILE_NAME: &str = "solve.toml";

/// Cost of the true label before noise.
const MATCH_COST: f32 = 0.2;
/// Cost of any other label before noise.
const MISMATCH_COST: f32 = 0.8;
/// Peak noise amplitude.
const NOISE: f32 = 0.15;

/// Shape and noise of a generated problem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Phantom {
    /// Grid size.
    pub extent: Extent,
    /// Number of leaf labels, at least 2.
    pub labels: usize,
    /// Noise seed.
    pub seed: u64,
}

impl Phantom {
    /// A phantom with the default seed.
    pub fn new(extent: Extent, labels: usize) -> Self {
        Self {
            extent,
            labels: labels.max(2),
            seed: 0x5eed,
        }
    }

    /// Ground-truth label of every voxel: 0 is background, `1..labels` are
    /// the object sectors.
    pub fn truth(&self) -> Vec<usize> {
        let e = self.extent;
        let sectors = self.labels - 1;
        let cx = (e.x as f32 - 1.0) / 2.0;
        let cy = (e.y as f32 - 1.0) / 2.0;
        let radius = 0.35 * e.x.min(e.y) as f32;
        let mut out = Vec::with_capacity(e.voxels());
        for _z in 0..e.z {
            for y in 0..e.y {
                for x in 0..e.x {
                    let dx = x as f32 - cx;
                    let dy = y as f32 - cy;
                    if dx.hypot(dy) > radius {
                        out.push(0);
                    } else {
                        let angle = dy.atan2(dx).rem_euclid(TAU);
                        let sector = ((angle / TAU) * sectors as f32) as usize;
                        out.push(1 + sector.min(sectors - 1));
                    }
                }
            }
        }
        out
    }

    /// Data term of every label, background first.
    pub fn data_terms(&self) -> Vec<Volume> {
        let truth = self.truth();
        let mut rng = SplitMix(self.seed);
        (0..self.labels)
            .map(|label| {
                let values = truth
                    .iter()
                    .map(|&t| {
                        let base = if t == label { MATCH_COST } else { MISMATCH_COST };
                        (base + NOISE * rng.next_signed()).clamp(0.0, 1.0)
                    })
                    .collect();
                Volume::from_vec(self.extent, values).unwrap_or_else(|| Volume::zeros(self.extent))
            })
            .collect()
    }

    /// The solve description, with files named relative to its directory.
    pub fn solve_file(&self) -> SolveFile {
        let mut file = SolveFile::new("phantom", self.extent)
            .with_params(ParamsConfig {
                iterations: Some(100),
                ..ParamsConfig::default()
            })
            .with_node(NodeConfig::root("root"))
            .with_node(
                NodeConfig::child("background", "root")
                    .with_data("background_cost.f32")
                    .with_output("background_prob.f32"),
            );
        let parent = if self.labels > 2 {
            file = file.with_node(NodeConfig::child("object", "root").with_alpha(0.5));
            "object"
        } else {
            "root"
        };
        for i in 0..self.labels - 1 {
            let id = format!("object_{i}");
            file = file.with_node(
                NodeConfig::child(id.clone(), parent)
                    .with_data(format!("{id}_cost.f32"))
                    .with_output(format!("{id}_prob.f32")),
            );
        }
        file
    }

    /// Writes the data terms and `solve.toml` into `dir`, returning the
    /// path of the solve file.
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<PathBuf, ConfigError> {
        let dir = dir.as_ref();
        let file = self.solve_file();
        validate_solve_file(&file)?;
        let leaves = file.nodes.iter().filter(|n| n.data.is_some());
        for (node, volume) in leaves.zip(self.data_terms()) {
            if let Some(data) = &node.data {
                write_volume(dir.join(data), &volume)?;
            }
        }
        let path = dir.join(SOLVE_FILE_NAME);
        file.save(&path)?;
        Ok(path)
    }
}

/// Small deterministic generator for the noise field.
struct SplitMix(u64);

impl SplitMix {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform in `[-1, 1)`.
    fn next_signed(&mut self) -> f32 {
        let unit = (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32;
        unit * 2.0 - 1.0
    }
}
