//! Resource dependency graph
//!
//! Nodes are desired resources; edges mean "must exist before". Edges are
//! taken from the typed references a resource's inputs carry, never from the
//! order in which resources were declared.
//!
//! A node can only reference nodes that were declared before it, so the graph
//! is acyclic by construction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;

use super::ids::ResourceKind;
use super::resources::ResourceSpec;
use crate::error::GraphError;

/// Position of a node in its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a resource: its kind plus its full resource path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// Typed handle to a declared node
///
/// Passing a `Ref` into another resource's inputs is what creates the
/// dependency edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ref<I> {
    node: NodeId,
    id: I,
}

impl<I> Ref<I> {
    pub(crate) fn new(node: NodeId, id: I) -> Self {
        Self { node, id }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn id(&self) -> &I {
        &self.id
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    key: ResourceKey,
    spec: ResourceSpec,
    depends_on: BTreeSet<NodeId>,
}

impl Node {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn spec(&self) -> &ResourceSpec {
        &self.spec
    }

    pub fn depends_on(&self) -> &BTreeSet<NodeId> {
        &self.depends_on
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<Node>,
    index: HashMap<ResourceKey, NodeId>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a desired resource.
    ///
    /// Declaring a resource whose key already exists with identical inputs
    /// returns the existing node; differing inputs are a conflict.
    pub fn declare(&mut self, spec: ResourceSpec) -> Result<NodeId, GraphError> {
        let key = spec.key();
        let depends_on: BTreeSet<NodeId> = spec.references().into_iter().collect();

        if let Some(dep) = depends_on.iter().find(|d| d.0 >= self.nodes.len()) {
            return Err(GraphError::UnknownDependency {
                resource: key,
                dependency: dep.0,
            });
        }

        if let Some(&existing) = self.index.get(&key) {
            let node = &self.nodes[existing.0];
            if node.spec == spec {
                return Ok(existing);
            }
            return Err(GraphError::ConflictingDeclaration(key));
        }

        let id = NodeId(self.nodes.len());
        self.index.insert(key.clone(), id);
        self.nodes.push(Node {
            key,
            spec,
            depends_on,
        });
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Panics if `id` was issued by another graph
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn find(&self, key: &ResourceKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.nodes.iter().filter(|n| n.key.kind == kind).count()
    }

    /// Nodes that directly depend on `id`
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.depends_on.contains(&id))
            .map(|(i, _)| i)
            .collect()
    }

    /// Every node reachable from `id` along reversed edges
    pub fn transitive_dependents(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut found = BTreeSet::new();
        // Dependents always have a higher index than their dependencies
        for (i, node) in self.nodes().skip(id.0 + 1) {
            if node.depends_on.contains(&id) || node.depends_on.iter().any(|d| found.contains(d)) {
                found.insert(i);
            }
        }
        found
    }

    /// Group nodes into waves: every node's dependencies sit in earlier waves
    pub fn waves(&self) -> Vec<Vec<NodeId>> {
        let mut depth = vec![0usize; self.nodes.len()];
        let mut waves: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();

        for (i, node) in self.nodes.iter().enumerate() {
            depth[i] = node
                .depends_on
                .iter()
                .map(|d| depth[d.0] + 1)
                .max()
                .unwrap_or(0);
            waves.entry(depth[i]).or_default().push(NodeId(i));
        }

        waves.into_values().collect()
    }
}
