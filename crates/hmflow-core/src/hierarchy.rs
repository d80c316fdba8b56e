//! Label hierarchy: a rooted tree of Root, Branch and Leaf nodes.
//!
//! ```text
//!            root
//!          /      \
//!      object    background        ← branches (super-categories)
//!      /    \         |
//!    a       b        c            ← leaves (output labels)
//! ```
//!
//! A [`Hierarchy`] is immutable once built. Construction validates that the
//! parent table describes a single rooted tree and precomputes the traversal
//! orders the solver walks every pass.

use crate::error::ConfigurationError;

/// Identifier of a node in a [`Hierarchy`].
///
/// Ids are dense indices assigned in insertion order and stay stable for the
/// lifetime of the hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Creates an id from its index.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// Position of the node in the hierarchy's node table.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Structural role of a node, derived from its position in the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// The single node without a parent. Has no output channel.
    Root,
    /// An interior node grouping its children into a super-category.
    Branch,
    /// A node without children; maps to one output label.
    Leaf,
}

impl NodeRole {
    /// Lowercase role name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Branch => "branch",
            Self::Leaf => "leaf",
        }
    }
}

#[derive(Clone)]
struct NodeEntry {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    depth: usize,
    name: Option<String>,
}

/// A validated label tree.
#[derive(Clone)]
pub struct Hierarchy {
    nodes: Vec<NodeEntry>,
    root: NodeId,
    pre_order: Vec<NodeId>,
    post_order: Vec<NodeId>,
    max_depth: usize,
}

impl Hierarchy {
    /// Builds a hierarchy from a parent table: `parents[i]` is the parent of
    /// node `i`, `None` for the root.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError::NotATree`] if there is not exactly one root, a
    /// parent index is out of range, or some node cannot reach the root.
    /// [`ConfigurationError::NoLeaves`] if the root is the only node.
    pub fn from_parents(parents: &[Option<usize>]) -> Result<Self, ConfigurationError> {
        Self::build(parents, vec![None; parents.len()])
    }

    fn build(parents: &[Option<usize>], names: Vec<Option<String>>) -> Result<Self, ConfigurationError> {
        let n = parents.len();
        if n == 0 {
            return Err(ConfigurationError::NotATree("no nodes".into()));
        }

        let mut root = None;
        let mut nodes: Vec<NodeEntry> = names
            .into_iter()
            .map(|name| NodeEntry {
                parent: None,
                children: Vec::new(),
                depth: 0,
                name,
            })
            .collect();
        for (i, parent) in parents.iter().enumerate() {
            match *parent {
                None => {
                    if let Some(first) = root.replace(NodeId::new(i)) {
                        return Err(ConfigurationError::NotATree(format!(
                            "two roots: {first} and n{i}"
                        )));
                    }
                }
                Some(p) if p >= n => {
                    return Err(ConfigurationError::NotATree(format!(
                        "n{i} names missing parent n{p}"
                    )));
                }
                Some(p) if p == i => {
                    return Err(ConfigurationError::NotATree(format!("n{i} is its own parent")));
                }
                Some(p) => {
                    nodes[i].parent = Some(NodeId::new(p));
                    nodes[p].children.push(NodeId::new(i));
                }
            }
        }
        let root = root.ok_or_else(|| ConfigurationError::NotATree("no root".into()))?;

        // Every node has one parent, so a cycle can never be reached from the root.
        let mut pre_order = Vec::with_capacity(n);
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            pre_order.push(id);
            let depth = nodes[id.index()].depth + 1;
            let children = nodes[id.index()].children.clone();
            for &child in children.iter().rev() {
                nodes[child.index()].depth = depth;
                stack.push(child);
            }
        }
        if pre_order.len() != n {
            let unreachable = (0..n)
                .map(NodeId::new)
                .find(|id| !pre_order.contains(id))
                .map_or_else(String::new, |id| id.to_string());
            return Err(ConfigurationError::NotATree(format!(
                "{unreachable} is not connected to the root (cycle?)"
            )));
        }
        if n == 1 {
            return Err(ConfigurationError::NoLeaves);
        }

        let post_order = post_order_of(&nodes, root);
        let max_depth = nodes.iter().map(|e| e.depth).max().unwrap_or(0);

        Ok(Self {
            nodes,
            root,
            pre_order,
            post_order,
            max_depth,
        })
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a valid hierarchy has at least a root and one leaf.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Returns true if `node` belongs to this hierarchy.
    pub fn contains(&self, node: NodeId) -> bool {
        node.index() < self.nodes.len()
    }

    /// Fails with [`ConfigurationError::UnknownNode`] for foreign ids.
    pub fn check(&self, node: NodeId) -> Result<(), ConfigurationError> {
        if self.contains(node) {
            Ok(())
        } else {
            Err(ConfigurationError::UnknownNode(node))
        }
    }

    /// All node ids in index order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId::new)
    }

    /// Role of a node.
    ///
    /// # Panics
    ///
    /// Panics if `node` is not part of the hierarchy.
    pub fn role(&self, node: NodeId) -> NodeRole {
        let entry = &self.nodes[node.index()];
        match (entry.parent, entry.children.is_empty()) {
            (None, _) => NodeRole::Root,
            (Some(_), true) => NodeRole::Leaf,
            (Some(_), false) => NodeRole::Branch,
        }
    }

    /// Parent of a node, `None` for the root.
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.index()).and_then(|e| e.parent)
    }

    /// Children of a node in insertion order.
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node.index())
            .map_or(&[], |e| e.children.as_slice())
    }

    /// Distance from the root (root = 0).
    pub fn depth(&self, node: NodeId) -> usize {
        self.nodes.get(node.index()).map_or(0, |e| e.depth)
    }

    /// Depth of the deepest node.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Eviction priority of a node's buffers: `max_depth - depth`.
    ///
    /// Deeper nodes get lower levels and are evicted first; the root, read by
    /// every top-level child, gets the highest level.
    pub fn priority(&self, node: NodeId) -> usize {
        self.max_depth - self.depth(node)
    }

    /// Optional display name.
    pub fn name(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node.index()).and_then(|e| e.name.as_deref())
    }

    /// Display name, or the id when the node is unnamed.
    pub fn label(&self, node: NodeId) -> String {
        self.name(node)
            .map_or_else(|| node.to_string(), str::to_owned)
    }

    /// Looks a node up by display name.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes().find(|&id| self.name(id) == Some(name))
    }

    /// Leaves in index order.
    pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes().filter(|&id| self.role(id) == NodeRole::Leaf)
    }

    /// Children before parents; the root comes last.
    pub fn post_order(&self) -> &[NodeId] {
        &self.post_order
    }

    /// Parents before children; the root comes first.
    pub fn pre_order(&self) -> &[NodeId] {
        &self.pre_order
    }

    /// The child of the root whose subtree contains `node`; `None` for the root.
    pub fn top_level_ancestor(&self, node: NodeId) -> Option<NodeId> {
        let mut current = node;
        loop {
            let parent = self.parent(current)?;
            if parent == self.root {
                return Some(current);
            }
            current = parent;
        }
    }

    /// Leaves grouped by parent, in pre-order of the parents.
    ///
    /// Siblings in one group share a parent and are normalized together.
    pub fn sibling_leaf_groups(&self) -> Vec<(NodeId, Vec<NodeId>)> {
        self.pre_order
            .iter()
            .filter_map(|&parent| {
                let leaves: Vec<NodeId> = self
                    .children(parent)
                    .iter()
                    .copied()
                    .filter(|&c| self.role(c) == NodeRole::Leaf)
                    .collect();
                (!leaves.is_empty()).then_some((parent, leaves))
            })
            .collect()
    }

    /// Leaf descendants of a node (the node itself if it is a leaf).
    pub fn leaf_descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let children = self.children(id);
            if children.is_empty() && id != self.root {
                out.push(id);
            }
            stack.extend(children.iter().rev());
        }
        out
    }
}

impl core::fmt::Debug for Hierarchy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hierarchy")
            .field("nodes", &self.nodes.len())
            .field("root", &self.root)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

fn post_order_of(nodes: &[NodeEntry], root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::with_capacity(nodes.len());
    let mut stack = vec![(root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            out.push(id);
            continue;
        }
        stack.push((id, true));
        for &child in nodes[id.index()].children.iter().rev() {
            stack.push((child, false));
        }
    }
    out
}

/// Incremental construction of a [`Hierarchy`].
///
/// ```
/// use hmflow_core::HierarchyBuilder;
///
/// let mut b = HierarchyBuilder::new();
/// let root = b.root();
/// let a = b.add_child(root);
/// let c = b.add_child(root);
/// let h = b.build().unwrap();
/// assert_eq!(h.children(root), &[a, c]);
/// ```
#[derive(Default)]
pub struct HierarchyBuilder {
    parents: Vec<Option<usize>>,
    names: Vec<Option<String>>,
}

impl HierarchyBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parentless node. Calling this twice makes `build` fail.
    pub fn root(&mut self) -> NodeId {
        self.push(None, None)
    }

    /// Adds a child of `parent`.
    pub fn add_child(&mut self, parent: NodeId) -> NodeId {
        self.push(Some(parent.index()), None)
    }

    /// Adds a named child of `parent`.
    pub fn add_named_child(&mut self, parent: NodeId, name: impl Into<String>) -> NodeId {
        self.push(Some(parent.index()), Some(name.into()))
    }

    /// Names an already added node.
    pub fn set_name(&mut self, node: NodeId, name: impl Into<String>) {
        if let Some(slot) = self.names.get_mut(node.index()) {
            *slot = Some(name.into());
        }
    }

    fn push(&mut self, parent: Option<usize>, name: Option<String>) -> NodeId {
        self.parents.push(parent);
        self.names.push(name);
        NodeId::new(self.parents.len() - 1)
    }

    /// Validates and freezes the tree.
    ///
    /// # Errors
    ///
    /// Same as [`Hierarchy::from_parents`].
    pub fn build(self) -> Result<Hierarchy, ConfigurationError> {
        Hierarchy::build(&self.parents, self.names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// root → {object → {a, b}, c}
    fn sample() -> (Hierarchy, [NodeId; 5]) {
        let mut b = HierarchyBuilder::new();
        let root = b.root();
        let object = b.add_named_child(root, "object");
        let a = b.add_named_child(object, "a");
        let bb = b.add_named_child(object, "b");
        let c = b.add_named_child(root, "c");
        (b.build().unwrap(), [root, object, a, bb, c])
    }

    #[test]
    fn roles_and_depths() {
        let (h, [root, object, a, _, c]) = sample();
        assert_eq!(h.role(root), NodeRole::Root);
        assert_eq!(h.role(object), NodeRole::Branch);
        assert_eq!(h.role(a), NodeRole::Leaf);
        assert_eq!(h.role(c), NodeRole::Leaf);
        assert_eq!(h.depth(a), 2);
        assert_eq!(h.max_depth(), 2);
        assert_eq!(h.priority(a), 0);
        assert_eq!(h.priority(c), 1);
        assert_eq!(h.priority(root), 2);
    }

    #[test]
    fn traversal_orders() {
        let (h, [root, object, a, b, c]) = sample();
        assert_eq!(h.pre_order(), &[root, object, a, b, c]);
        assert_eq!(h.post_order(), &[a, b, object, c, root]);
    }

    #[test]
    fn sibling_groups_and_descendants() {
        let (h, [root, object, a, b, c]) = sample();
        assert_eq!(
            h.sibling_leaf_groups(),
            vec![(root, vec![c]), (object, vec![a, b])]
        );
        assert_eq!(h.leaf_descendants(root), vec![a, b, c]);
        assert_eq!(h.top_level_ancestor(b), Some(object));
        assert_eq!(h.top_level_ancestor(root), None);
        assert_eq!(h.find("c"), Some(c));
    }

    #[test]
    fn rejects_two_roots() {
        let err = Hierarchy::from_parents(&[None, None]).unwrap_err();
        assert!(matches!(err, ConfigurationError::NotATree(_)));
    }

    #[test]
    fn rejects_cycle() {
        // n1 and n2 point at each other and never reach the root.
        let err = Hierarchy::from_parents(&[None, Some(2), Some(1), Some(0)]).unwrap_err();
        assert!(matches!(err, ConfigurationError::NotATree(_)));
    }

    #[test]
    fn rejects_out_of_range_parent() {
        let err = Hierarchy::from_parents(&[None, Some(5)]).unwrap_err();
        assert!(matches!(err, ConfigurationError::NotATree(_)));
    }

    #[test]
    fn root_alone_has_no_leaves() {
        let err = Hierarchy::from_parents(&[None]).unwrap_err();
        assert_eq!(err, ConfigurationError::NoLeaves);
    }
}
