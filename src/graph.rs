//! The graph being assembled by fluent calls.
//!
//! Nodes are engine tasks keyed by [`TaskId`]; edges carry the input slot of
//! their target. Several edges may leave one node (broadcast) and several may
//! enter one node (multi-input merge), but every input slot of a node is
//! taken at most once.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use petgraph::Direction;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::core::TaskId;
use crate::engine::EngineTask;
use crate::error::GraphError;

struct Node<T> {
    id: TaskId,
    task: T,
}

/// An ordered `(source, target, slot)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub source: TaskId,
    pub target: TaskId,
    pub slot: usize,
}

/// A directed multigraph of engine tasks.
pub struct TaskGraph<T> {
    graph: Graph<Node<T>, usize>,
    index: HashMap<TaskId, NodeIndex>,
}

impl<T> TaskGraph<T> {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            index: HashMap::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn index_of(&self, id: TaskId) -> Option<NodeIndex> {
        self.index.get(&id).copied()
    }

    pub fn task(&self, index: NodeIndex) -> &T {
        &self.graph[index].task
    }

    pub fn id(&self, index: NodeIndex) -> TaskId {
        self.graph[index].id
    }

    /// Predecessors of `index`, ordered by input slot.
    pub fn inputs(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut inputs: Vec<_> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|edge| (*edge.weight(), edge.source()))
            .collect();

        inputs.sort_by_key(|(slot, _)| *slot);
        inputs.into_iter().map(|(_, source)| source).collect()
    }

    /// Every node fed by `index`, one entry per edge.
    pub fn successors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| edge.target())
            .collect()
    }

    /// All edges, in the order they were connected.
    pub fn edges(&self) -> Vec<Edge> {
        self.graph
            .raw_edges()
            .iter()
            .map(|edge| Edge {
                source: self.graph[edge.source()].id,
                target: self.graph[edge.target()].id,
                slot: edge.weight,
            })
            .collect()
    }
}

impl<T: EngineTask> TaskGraph<T> {
    /// Inserts `task` unless a node with the same id already exists.
    pub fn add_task(&mut self, id: TaskId, task: &T) -> NodeIndex {
        if let Some(&index) = self.index.get(&id) {
            return index;
        }

        let index = self.graph.add_node(Node {
            id,
            task: task.clone(),
        });

        self.index.insert(id, index);
        index
    }

    /// Fails if `slot` of `target` is already occupied.
    pub fn check_slot(&self, target: NodeIndex, slot: usize) -> Result<(), GraphError> {
        let taken = self
            .graph
            .edges_directed(target, Direction::Incoming)
            .any(|edge| *edge.weight() == slot);

        if taken {
            return Err(GraphError::SlotTaken {
                task: self.name(target),
                slot,
            });
        }

        Ok(())
    }

    /// Fails if `target` already reaches `source`, so the edge
    /// `source -> target` would close a cycle.
    pub fn check_cycle(&self, source: NodeIndex, target: NodeIndex) -> Result<(), GraphError> {
        if petgraph::algo::has_path_connecting(&self.graph, target, source, None) {
            return Err(GraphError::Cycle(self.name(target)));
        }

        Ok(())
    }

    /// Checks whether the edge `source -> target` at `slot` could be added,
    /// without touching the graph. Tasks not in the graph yet have no edges.
    pub fn check_edge(&self, source: TaskId, target: TaskId, slot: usize) -> Result<(), GraphError> {
        let Some(target) = self.index_of(target) else {
            return Ok(());
        };

        self.check_slot(target, slot)?;

        match self.index_of(source) {
            Some(source) if source == target => Err(GraphError::SelfLoop(self.name(target))),
            Some(source) => self.check_cycle(source, target),
            None => Ok(()),
        }
    }

    /// Adds the edge `source -> target` feeding input `slot` of `target`.
    pub fn connect(
        &mut self,
        source: NodeIndex,
        target: NodeIndex,
        slot: usize,
    ) -> Result<(), GraphError> {
        if source == target {
            return Err(GraphError::SelfLoop(self.name(target)));
        }

        self.check_slot(target, slot)?;
        self.check_cycle(source, target)?;
        self.graph.add_edge(source, target, slot);

        tracing::debug!(
            source = %self.name(source),
            target = %self.name(target),
            slot,
            "connected"
        );

        Ok(())
    }

    /// Connects into slot 0.
    pub fn connect_default(&mut self, source: NodeIndex, target: NodeIndex) -> Result<(), GraphError> {
        self.connect(source, target, 0)
    }

    /// Removes the task `id` together with its edges.
    pub fn remove_task(&mut self, id: TaskId) -> Option<T> {
        let index = self.index.remove(&id)?;
        let node = self.graph.remove_node(index)?;

        // The last node takes over the freed index.
        if let Some(moved) = self.graph.node_weight(index) {
            self.index.insert(moved.id, index);
        }

        Some(node.task)
    }

    /// Checks that the input slots of every node run contiguously from 0 and
    /// that the graph has no cycles.
    pub fn validate(&self) -> Result<(), GraphError> {
        for index in self.graph.node_indices() {
            let mut slots: Vec<usize> = self
                .graph
                .edges_directed(index, Direction::Incoming)
                .map(|edge| *edge.weight())
                .collect();

            slots.sort_unstable();

            if let Some(slot) = slots.iter().enumerate().find_map(|(i, &s)| (i != s).then_some(i)) {
                return Err(GraphError::MissingSlot {
                    task: self.name(index),
                    slot,
                });
            }
        }

        petgraph::algo::toposort(&self.graph, None)
            .map_err(|cycle| GraphError::Cycle(self.name(cycle.node_id())))?;

        Ok(())
    }

    fn name(&self, index: NodeIndex) -> String {
        self.graph[index].task.plugin_name().to_string()
    }
}

impl<T> Default for TaskGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders the graph as a Mermaid flowchart, labelling edges with their slot.
impl<T: EngineTask> Display for TaskGraph<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let name = node.task.plugin_name().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", node.id.0, name)?;
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                self.graph[edge.source()].id.0,
                edge.weight,
                self.graph[edge.target()].id.0
            )?;
        }

        Ok(())
    }
}
