//! Host buffer layout of a solve: which buffers each node owns, their initial
//! contents, and which device each node lives on.

use crate::arena::{BufferDescriptor, BufferField, BufferId, HostArena};
use crate::error::SchedulerError;
use crate::hierarchy::{Hierarchy, NodeId, NodeRole};
use crate::inputs::SolveInputs;

/// Buffers of a non-root node.
#[derive(Clone, Debug)]
pub(crate) struct FlowBuffers {
    pub flow: [BufferId; 3],
    pub divergence: BufferId,
    pub sink: BufferId,
    pub label: BufferId,
    pub incremental: BufferId,
    pub smoothness: Option<BufferId>,
    pub data: Option<BufferId>,
}

/// Buffers of one node, by role.
#[derive(Clone, Debug)]
pub(crate) enum NodeBuffers {
    Root {
        source: BufferId,
        label: BufferId,
        incremental: BufferId,
    },
    Flow(FlowBuffers),
}

impl NodeBuffers {
    pub fn label(&self) -> BufferId {
        match self {
            Self::Root { label, .. } => *label,
            Self::Flow(f) => f.label,
        }
    }

    /// Flow the node hands to its children: the root's source flow or a
    /// branch's sink flow.
    pub fn outflow(&self) -> BufferId {
        match self {
            Self::Root { source, .. } => *source,
            Self::Flow(f) => f.sink,
        }
    }
}

/// Node to buffer and node to device assignment.
pub(crate) struct Layout {
    nodes: Vec<NodeBuffers>,
    home: Vec<usize>,
    alpha: Vec<f32>,
}

impl Layout {
    /// Assigns each node to a worker: the root to worker 0, each top-level
    /// subtree round-robin, descendants with their subtree.
    pub fn place(hierarchy: &Hierarchy, workers: usize) -> Vec<usize> {
        let top = hierarchy.children(hierarchy.root());
        hierarchy
            .nodes()
            .map(|node| {
                hierarchy
                    .top_level_ancestor(node)
                    .and_then(|t| top.iter().position(|&c| c == t))
                    .map_or(0, |i| i % workers.max(1))
            })
            .collect()
    }

    /// Allocates and initializes every buffer of the solve.
    ///
    /// Every sink and source flow starts at the per-voxel minimum of the leaf
    /// data terms. Flows start at zero. Labels split their parent's share
    /// evenly between siblings, starting from 1 at the root.
    pub fn build(
        hierarchy: &Hierarchy,
        inputs: &SolveInputs,
        home: Vec<usize>,
        arena: &mut HostArena,
    ) -> Result<Self, SchedulerError> {
        let len = arena.slot_len();
        let mut init_flow = vec![f32::INFINITY; len];
        for leaf in hierarchy.leaves() {
            if let Some(term) = inputs.data_term(leaf) {
                for (f, &d) in init_flow.iter_mut().zip(term.as_slice()) {
                    *f = f.min(d);
                }
            }
        }

        let mut share = vec![1.0_f32; hierarchy.len()];
        for &node in hierarchy.pre_order() {
            let children = hierarchy.children(node);
            let child_share = share[node.index()] / children.len().max(1) as f32;
            for &c in children {
                share[c.index()] = child_share;
            }
        }

        let mut nodes = Vec::with_capacity(hierarchy.len());
        for node in hierarchy.nodes() {
            let priority = hierarchy.priority(node);
            let desc = |field| BufferDescriptor {
                node,
                field,
                priority,
            };
            let buffers = if hierarchy.role(node) == NodeRole::Root {
                NodeBuffers::Root {
                    source: arena.insert(desc(BufferField::Source), init_flow.clone())?,
                    label: arena.allocate(desc(BufferField::Label), 1.0),
                    incremental: arena.allocate(desc(BufferField::Incremental), 0.0),
                }
            } else {
                let smoothness = inputs
                    .smoothness(node)
                    .map(|v| arena.insert(desc(BufferField::Smoothness), v.as_slice().to_vec()))
                    .transpose()?;
                let data = inputs
                    .data_term(node)
                    .map(|v| arena.insert(desc(BufferField::Data), v.as_slice().to_vec()))
                    .transpose()?;
                NodeBuffers::Flow(FlowBuffers {
                    flow: [
                        arena.allocate(desc(BufferField::FlowX), 0.0),
                        arena.allocate(desc(BufferField::FlowY), 0.0),
                        arena.allocate(desc(BufferField::FlowZ), 0.0),
                    ],
                    divergence: arena.allocate(desc(BufferField::Divergence), 0.0),
                    sink: arena.insert(desc(BufferField::Sink), init_flow.clone())?,
                    label: arena.allocate(desc(BufferField::Label), share[node.index()]),
                    incremental: arena.allocate(desc(BufferField::Incremental), 0.0),
                    smoothness,
                    data,
                })
            };
            nodes.push(buffers);
        }

        let alpha = hierarchy.nodes().map(|n| inputs.alpha(n)).collect();
        Ok(Self { nodes, home, alpha })
    }

    /// A layout with no nodes, left behind once a solve has been closed.
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            home: Vec::new(),
            alpha: Vec::new(),
        }
    }

    pub fn node(&self, node: NodeId) -> &NodeBuffers {
        &self.nodes[node.index()]
    }

    pub fn home(&self, node: NodeId) -> usize {
        self.home[node.index()]
    }

    pub fn alpha(&self, node: NodeId) -> f32 {
        self.alpha[node.index()]
    }

    /// Number of host buffers homed on `worker`.
    pub fn buffers_on(&self, arena: &HostArena, worker: usize) -> usize {
        arena
            .iter()
            .filter(|(_, desc)| self.home(desc.node) == worker)
            .count()
    }

    /// Label buffers of every leaf, in leaf order.
    pub fn leaf_labels(&self, hierarchy: &Hierarchy) -> Vec<(NodeId, BufferId)> {
        hierarchy
            .leaves()
            .map(|leaf| (leaf, self.node(leaf).label()))
            .collect()
    }
}
