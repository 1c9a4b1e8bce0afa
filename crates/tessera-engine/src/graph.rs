use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use tessera_core::ids::NodeId;
use tessera_core::node::{CodeNode, NodeKind};

use crate::error::GraphError;

/// A code node scheduled for agent work, with its ordering constraints.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentNode {
    pub id: NodeId,
    pub name: String,
    pub node: Arc<CodeNode>,
    pub bundle_path: PathBuf,
    pub upstream: BTreeSet<NodeId>,
    pub downstream: BTreeSet<NodeId>,
}

impl AgentNode {
    pub fn new(node: Arc<CodeNode>, bundle_path: PathBuf) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            node,
            bundle_path,
            upstream: BTreeSet::new(),
            downstream: BTreeSet::new(),
        }
    }
}

/// Dependency graph over agent nodes. Preserves input order.
#[derive(Clone, Debug, Default)]
pub struct AgentGraph {
    nodes: Vec<AgentNode>,
    index: HashMap<NodeId, usize>,
}

/// Build the graph, skipping nodes whose kind has no bundle or whose bundle is missing on disk.
pub fn build_graph(nodes: Vec<CodeNode>, bundles: &BTreeMap<NodeKind, PathBuf>) -> AgentGraph {
    build_graph_with(nodes, bundles, |p| p.exists())
}

/// `build_graph` with an injectable existence check.
///
/// Within a file nodes are ordered by `(start_line, start_byte)` and each node
/// depends on every node before it.
pub fn build_graph_with<F>(
    nodes: Vec<CodeNode>,
    bundles: &BTreeMap<NodeKind, PathBuf>,
    exists: F,
) -> AgentGraph
where
    F: Fn(&Path) -> bool,
{
    let mut seen = HashSet::new();
    let mut agent_nodes = Vec::new();
    for node in nodes {
        let Some(bundle) = bundles.get(&node.kind) else {
            debug!(node_id = %node.id, kind = %node.kind, "no bundle for node kind, skipping");
            continue;
        };
        if !exists(bundle) {
            debug!(node_id = %node.id, bundle = %bundle.display(), "bundle missing, skipping");
            continue;
        }
        if !seen.insert(node.id.clone()) {
            debug!(node_id = %node.id, "duplicate node id, keeping first");
            continue;
        }
        agent_nodes.push(AgentNode::new(Arc::new(node), bundle.clone()));
    }

    let mut by_file: BTreeMap<PathBuf, Vec<usize>> = BTreeMap::new();
    for (i, n) in agent_nodes.iter().enumerate() {
        by_file.entry(n.node.file_path.clone()).or_default().push(i);
    }

    for members in by_file.values_mut() {
        // stable: equal positions keep input order
        members.sort_by_key(|&i| (agent_nodes[i].node.start_line, agent_nodes[i].node.start_byte));
        for (pos, &later) in members.iter().enumerate() {
            for &earlier in &members[..pos] {
                let earlier_id = agent_nodes[earlier].id.clone();
                let later_id = agent_nodes[later].id.clone();
                agent_nodes[later].upstream.insert(earlier_id);
                agent_nodes[earlier].downstream.insert(later_id);
            }
        }
    }

    AgentGraph::index(agent_nodes)
}

impl AgentGraph {
    fn index(nodes: Vec<AgentNode>) -> Self {
        let index = nodes.iter().enumerate().map(|(i, n)| (n.id.clone(), i)).collect();
        Self { nodes, index }
    }

    /// Build from externally constructed nodes, validating references and edge symmetry.
    pub fn from_nodes(nodes: Vec<AgentNode>) -> Result<Self, GraphError> {
        let mut seen = HashSet::with_capacity(nodes.len());
        if let Some(dup) = nodes.iter().find(|n| !seen.insert(&n.id)) {
            return Err(GraphError::DuplicateNode(dup.id.clone()));
        }
        let graph = Self::index(nodes);
        for node in &graph.nodes {
            for up in &node.upstream {
                let dep = graph.get(up).ok_or_else(|| GraphError::UnknownDependency {
                    node: node.id.clone(),
                    dependency: up.clone(),
                })?;
                if !dep.downstream.contains(&node.id) {
                    return Err(GraphError::UnknownDependency {
                        node: up.clone(),
                        dependency: node.id.clone(),
                    });
                }
            }
            for down in &node.downstream {
                let dep = graph.get(down).ok_or_else(|| GraphError::UnknownDependency {
                    node: node.id.clone(),
                    dependency: down.clone(),
                })?;
                if !dep.upstream.contains(&node.id) {
                    return Err(GraphError::UnknownDependency {
                        node: down.clone(),
                        dependency: node.id.clone(),
                    });
                }
            }
        }
        Ok(graph)
    }

    pub fn nodes(&self) -> &[AgentNode] {
        &self.nodes
    }

    pub fn get(&self, id: &NodeId) -> Option<&AgentNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes not yet completed whose upstream is fully completed, in input order.
    pub fn ready_nodes(&self, completed: &HashSet<NodeId>) -> Vec<&AgentNode> {
        self.nodes
            .iter()
            .filter(|n| !completed.contains(&n.id))
            .filter(|n| n.upstream.iter().all(|u| completed.contains(u)))
            .collect()
    }

    /// Kahn's algorithm; ties broken by input order.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.upstream.len()).collect();
        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = queue.pop_front() {
            order.push(self.nodes[i].id.clone());
            let mut released: Vec<usize> = Vec::new();
            for down in &self.nodes[i].downstream {
                if let Some(&j) = self.index.get(down) {
                    in_degree[j] = in_degree[j].saturating_sub(1);
                    if in_degree[j] == 0 {
                        released.push(j);
                    }
                }
            }
            released.sort_unstable();
            queue.extend(released);
        }

        if order.len() != self.nodes.len() {
            let ordered: HashSet<&NodeId> = order.iter().collect();
            let remaining = self
                .nodes
                .iter()
                .filter(|n| !ordered.contains(&n.id))
                .map(|n| n.id.clone())
                .collect();
            return Err(GraphError::CycleDetected { remaining });
        }
        Ok(order)
    }

    /// Successive ready sets. Every node in a batch only depends on earlier batches.
    pub fn execution_batches(&self) -> Result<Vec<Vec<NodeId>>, GraphError> {
        let mut completed: HashSet<NodeId> = HashSet::new();
        let mut batches = Vec::new();
        while completed.len() < self.nodes.len() {
            let ready: Vec<NodeId> = self
                .ready_nodes(&completed)
                .into_iter()
                .map(|n| n.id.clone())
                .collect();
            if ready.is_empty() {
                let remaining = self
                    .nodes
                    .iter()
                    .filter(|n| !completed.contains(&n.id))
                    .map(|n| n.id.clone())
                    .collect();
                return Err(GraphError::Deadlock { remaining });
            }
            completed.extend(ready.iter().cloned());
            batches.push(ready);
        }
        Ok(batches)
    }
}
