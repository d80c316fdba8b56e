//! Solve description file format and its conversion into solver inputs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use hmflow_core::{
    DeviceId, Extent, Hierarchy, HierarchyBuilder, NodeId, SolveInputs, SolveParams, Volume,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::validation::{ValidationError, validate_solve_file};
use crate::volume_io::read_volume;

/// A segmentation problem: grid, label tree, volume files, and parameters.
///
/// Roles are derived from structure: the node without a parent is the root,
/// nodes without children are leaves, everything else is a branch. Relative
/// paths resolve against the directory holding the file.
///
/// # TOML Format
///
/// ```toml
/// name = "phantom"
///
/// [extent]
/// x = 64
/// y = 64
/// z = 1
///
/// [params]
/// iterations = 100
/// cc = 0.25
///
/// [[nodes]]
/// id = "root"
///
/// [[nodes]]
/// id = "object"
/// parent = "root"
/// alpha = 0.5
///
/// [[nodes]]
/// id = "a"
/// parent = "object"
/// data = "a_cost.f32"
/// output = "a_prob.f32"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SolveFile {
    /// Name of the problem.
    #[serde(default)]
    pub name: String,

    /// Voxel grid shared by every volume.
    pub extent: ExtentConfig,

    /// Solve parameters; unset fields fall back to user defaults.
    #[serde(default)]
    pub params: ParamsConfig,

    /// Label tree nodes, in any order.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Grid dimensions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtentConfig {
    /// Voxels along x.
    pub x: usize,
    /// Voxels along y.
    pub y: usize,
    /// Voxels along z (defaults to 1).
    #[serde(default = "default_depth")]
    pub z: usize,
}

fn default_depth() -> usize {
    1
}

impl From<ExtentConfig> for Extent {
    fn from(e: ExtentConfig) -> Self {
        Extent::new(e.x, e.y, e.z)
    }
}

impl From<Extent> for ExtentConfig {
    fn from(e: Extent) -> Self {
        Self {
            x: e.x,
            y: e.y,
            z: e.z,
        }
    }
}

/// Partial solve parameters; `None` means "inherit".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParamsConfig {
    /// Number of passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<usize>,
    /// Augmented-Lagrangian weight in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<f32>,
    /// Flow and label step size in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_size: Option<f32>,
    /// Share of free device memory to claim, in `(0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_memory_fraction: Option<f32>,
    /// Device indices taking part in the solve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<u32>>,
}

impl ParamsConfig {
    /// Fields set in `over` replace those in `self`.
    pub fn merged(&self, over: &ParamsConfig) -> ParamsConfig {
        ParamsConfig {
            iterations: over.iterations.or(self.iterations),
            cc: over.cc.or(self.cc),
            step_size: over.step_size.or(self.step_size),
            device_memory_fraction: over.device_memory_fraction.or(self.device_memory_fraction),
            devices: over.devices.clone().or_else(|| self.devices.clone()),
        }
    }

    /// Applies the set fields on top of `base`.
    pub fn apply(&self, mut base: SolveParams) -> SolveParams {
        if let Some(v) = self.iterations {
            base.iterations = v;
        }
        if let Some(v) = self.cc {
            base.cc = v;
        }
        if let Some(v) = self.step_size {
            base.step_size = v;
        }
        if let Some(v) = self.device_memory_fraction {
            base.device_memory_fraction = v;
        }
        if let Some(devices) = &self.devices {
            base.devices = devices.iter().copied().map(DeviceId).collect();
        }
        base
    }
}

/// One node of the label tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Unique node name.
    pub id: String,
    /// Parent name; absent for the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Smoothness weight (defaults to 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f32>,
    /// Smoothness volume file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoothness: Option<PathBuf>,
    /// Data term volume file; required for leaves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PathBuf>,
    /// Where the leaf's probability volume is written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl NodeConfig {
    /// The root node.
    pub fn root(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// A node under `parent`.
    pub fn child(id: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: Some(parent.into()),
            ..Self::default()
        }
    }

    /// Sets the data term file.
    pub fn with_data(mut self, path: impl Into<PathBuf>) -> Self {
        self.data = Some(path.into());
        self
    }

    /// Sets the output file.
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Sets the smoothness file.
    pub fn with_smoothness(mut self, path: impl Into<PathBuf>) -> Self {
        self.smoothness = Some(path.into());
        self
    }

    /// Sets the smoothness weight.
    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = Some(alpha);
        self
    }
}

impl SolveFile {
    /// Create an empty description.
    pub fn new(name: impl Into<String>, extent: Extent) -> Self {
        Self {
            name: name.into(),
            extent: extent.into(),
            params: ParamsConfig::default(),
            nodes: Vec::new(),
        }
    }

    /// Add a node.
    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    /// Set the parameters.
    pub fn with_params(mut self, params: ParamsConfig) -> Self {
        self.params = params;
        self
    }

    /// Load a description from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        Ok(toml::from_str(&content)?)
    }

    /// Load a description from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Convert the description to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save the description to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))
    }

    /// Look up a node by name.
    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Builds the label tree. Node `i` of the result is `self.nodes[i]`.
    pub fn hierarchy(&self) -> Result<Hierarchy, ConfigError> {
        validate_solve_file(self)?;
        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();
        let mut builder = HierarchyBuilder::new();
        for node in &self.nodes {
            let id = match node.parent.as_deref() {
                None => builder.root(),
                Some(parent) => {
                    let p = index
                        .get(parent)
                        .copied()
                        .ok_or_else(|| ValidationError::UnknownParent {
                            node: node.id.clone(),
                            parent: parent.to_string(),
                        })?;
                    builder.add_child(NodeId::new(p))
                }
            };
            builder.set_name(id, node.id.clone());
        }
        Ok(builder.build()?)
    }

    /// Resolves every reference, reads every volume, and checks the result.
    ///
    /// `base_dir` anchors relative paths; `defaults` supplies parameters the
    /// file leaves unset.
    pub fn prepare(
        &self,
        base_dir: &Path,
        defaults: &ParamsConfig,
    ) -> Result<SolveSetup, ConfigError> {
        let hierarchy = self.hierarchy()?;
        let extent = Extent::from(self.extent);
        let params = defaults.merged(&self.params).apply(SolveParams::default());
        params.validate()?;

        let mut inputs = SolveInputs::new();
        let mut outputs = BTreeMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let id = NodeId::new(i);
            if let Some(path) = &node.data {
                inputs.set_data_term(id, read_volume(resolve(base_dir, path), extent)?);
            }
            if let Some(path) = &node.smoothness {
                inputs.set_smoothness(id, read_volume(resolve(base_dir, path), extent)?);
            }
            if let Some(alpha) = node.alpha {
                inputs.set_alpha(id, alpha);
            }
            if let Some(path) = &node.output {
                outputs.insert(id, resolve(base_dir, path));
            }
        }
        inputs.validate(&hierarchy)?;

        Ok(SolveSetup {
            name: self.name.clone(),
            extent,
            hierarchy,
            inputs,
            params,
            outputs,
        })
    }
}

/// Loads a description and prepares it relative to its own directory.
pub fn load_setup(
    path: impl AsRef<Path>,
    defaults: &ParamsConfig,
) -> Result<SolveSetup, ConfigError> {
    let path = path.as_ref();
    let file = SolveFile::load(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    file.prepare(base, defaults)
}

/// `path` if absolute, otherwise `base.join(path)`.
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// A fully resolved solve, ready for the solver.
#[derive(Debug, Clone)]
pub struct SolveSetup {
    /// Problem name.
    pub name: String,
    /// Voxel grid.
    pub extent: Extent,
    /// Label tree, with node names from the file.
    pub hierarchy: Hierarchy,
    /// Data terms, smoothness fields, and weights.
    pub inputs: SolveInputs,
    /// Effective parameters after defaults.
    pub params: SolveParams,
    /// Output path of each leaf that has one.
    pub outputs: BTreeMap<NodeId, PathBuf>,
}

impl SolveSetup {
    /// Output path of every leaf.
    ///
    /// # Errors
    ///
    /// [`ValidationError::MissingOutput`] for leaves without one.
    pub fn leaf_outputs(&self) -> Result<Vec<(NodeId, &Path)>, ConfigError> {
        self.hierarchy
            .leaves()
            .map(|leaf| {
                self.outputs
                    .get(&leaf)
                    .map(|p| (leaf, p.as_path()))
                    .ok_or_else(|| {
                        ConfigError::from(ValidationError::MissingOutput(self.hierarchy.label(leaf)))
                    })
            })
            .collect()
    }

    /// Reads the probability volume written for every leaf.
    pub fn read_outputs(&self) -> Result<BTreeMap<NodeId, Volume>, ConfigError> {
        self.leaf_outputs()?
            .into_iter()
            .map(|(leaf, path)| Ok::<_, ConfigError>((leaf, read_volume(path, self.extent)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "phantom"

[extent]
x = 4
y = 3

[params]
iterations = 7
devices = [0, 1]

[[nodes]]
id = "a"
parent = "object"
data = "a.f32"
output = "out/a.f32"

[[nodes]]
id = "root"

[[nodes]]
id = "object"
parent = "root"
alpha = 0.5

[[nodes]]
id = "b"
parent = "object"
data = "/abs/b.f32"
"#;

    #[test]
    fn parses_sample() {
        let file = SolveFile::from_toml(SAMPLE).unwrap();
        assert_eq!(file.name, "phantom");
        assert_eq!(Extent::from(file.extent), Extent::new(4, 3, 1));
        assert_eq!(file.params.iterations, Some(7));
        assert_eq!(file.params.cc, None);
        assert_eq!(file.nodes.len(), 4);
        assert_eq!(file.node("object").unwrap().alpha, Some(0.5));
    }

    #[test]
    fn hierarchy_follows_names_in_any_order() {
        let file = SolveFile::from_toml(SAMPLE).unwrap();
        let h = file.hierarchy().unwrap();
        let root = h.find("root").unwrap();
        let object = h.find("object").unwrap();
        assert_eq!(h.root(), root);
        assert_eq!(h.parent(h.find("a").unwrap()), Some(object));
        assert_eq!(h.children(object).len(), 2);
        // node i is the file's i-th entry
        assert_eq!(h.find("a"), Some(NodeId::new(0)));
    }

    #[test]
    fn params_layering() {
        let defaults = ParamsConfig {
            iterations: Some(3),
            cc: Some(0.5),
            ..ParamsConfig::default()
        };
        let file = ParamsConfig {
            iterations: Some(9),
            ..ParamsConfig::default()
        };
        let params = defaults.merged(&file).apply(SolveParams::default());
        assert_eq!(params.iterations, 9);
        assert_eq!(params.cc, 0.5);
        assert_eq!(params.step_size, SolveParams::default().step_size);
        assert_eq!(params.devices, vec![DeviceId(0)]);
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let base = Path::new("/data/run");
        assert_eq!(resolve(base, Path::new("a.f32")), PathBuf::from("/data/run/a.f32"));
        assert_eq!(resolve(base, Path::new("/x/b.f32")), PathBuf::from("/x/b.f32"));
    }

    #[test]
    fn toml_roundtrip_keeps_structure() {
        let file = SolveFile::new("t", Extent::new(2, 2, 1))
            .with_node(NodeConfig::root("root"))
            .with_node(NodeConfig::child("a", "root").with_data("a.f32").with_alpha(2.0))
            .with_node(NodeConfig::child("b", "root").with_data("b.f32"));
        let text = file.to_toml().unwrap();
        assert_eq!(SolveFile::from_toml(&text).unwrap(), file);
    }
}
