//! The execution graph: an arena of nodes plus dependency edges.
//!
//! The graph is immutable in structure after construction; only node state
//! mutates, and only while the owning agent holds its lock. Parent→child is
//! the stored direction; back-references are arena indices, never pointers.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::def::Step;
use crate::errors::GraphError;
use crate::node::Node;
use crate::status::{NodeSnapshot, NodeStatus, RunStatus, Status};

/// How a terminal parent gates a child's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Parent not terminal yet.
    Wait,
    /// Child may run.
    Proceed,
    /// Child can never run (unswallowed failure, cancellation).
    Block,
    /// Child is skipped along with its parent.
    Skip,
}

/// Liveness classification for a NotStarted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// May still execute.
    Live,
    /// Will resolve to Skipped without executing.
    SkipResolvable,
    /// Permanently blocked by a failed or cancelled ancestor.
    Dead,
}

pub struct ExecutionGraph {
    nodes: Vec<Node>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    /// Arena indices in topological order (parents before children).
    topo: Vec<usize>,
    cancel_requested: bool,
}

impl ExecutionGraph {
    /// Build and validate a graph from step definitions.
    pub fn build(steps: &[Step]) -> Result<ExecutionGraph, GraphError> {
        if steps.is_empty() {
            return Err(GraphError::EmptyDag);
        }

        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateStep(step.name.clone()));
            }
        }

        let mut parents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let node_ids: Vec<NodeIndex> = (0..steps.len()).map(|i| graph.add_node(i)).collect();

        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends {
                let &p = index.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                    step: step.name.clone(),
                    depends: dep.clone(),
                })?;
                parents[i].push(p);
                children[p].push(i);
                graph.add_edge(node_ids[p], node_ids[i], ());
            }
        }

        let topo = toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(steps[graph[cycle.node_id()]].name.clone()))?
            .into_iter()
            .map(|ix| graph[ix])
            .collect();

        Ok(ExecutionGraph {
            nodes: steps.iter().cloned().map(Node::new).collect(),
            parents,
            children,
            topo,
            cancel_requested: false,
        })
    }

    /// Rebuild from a persisted snapshot for retry: nodes that succeeded or
    /// were skipped keep their prior state (sub-run references included);
    /// everything else is re-opened as NotStarted.
    pub fn from_snapshot(prior: &Status) -> Result<ExecutionGraph, GraphError> {
        let steps: Vec<Step> = prior.nodes.iter().map(|n| n.step.clone()).collect();
        let mut graph = ExecutionGraph::build(&steps)?;
        for (i, snap) in prior.nodes.iter().enumerate() {
            if snap.status.is_success_like() || snap.status == NodeStatus::Skipped {
                graph.nodes[i] = Node::from_snapshot(snap);
            }
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub fn parents_of(&self, idx: usize) -> &[usize] {
        &self.parents[idx]
    }

    /// Record that cancellation was requested; no further nodes dispatch.
    pub fn mark_cancel(&mut self) {
        self.cancel_requested = true;
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    fn gate(&self, parent: usize) -> Gate {
        let node = &self.nodes[parent];
        match node.state.status {
            NodeStatus::NotStarted | NodeStatus::Running => Gate::Wait,
            NodeStatus::Success | NodeStatus::PartialSuccess => Gate::Proceed,
            NodeStatus::Failed => {
                if node.state.swallowed {
                    Gate::Proceed
                } else {
                    Gate::Block
                }
            }
            NodeStatus::Cancelled | NodeStatus::Rejected => Gate::Block,
            NodeStatus::Skipped => {
                if node.step.continue_on.skipped {
                    Gate::Proceed
                } else {
                    Gate::Skip
                }
            }
        }
    }

    /// Next node ready to dispatch, in declaration order.
    ///
    /// Restartable: call again after every join. As a side effect, children
    /// of skipped parents are themselves marked Skipped (recursively), so
    /// precondition-gated branches resolve without executing.
    pub fn next_ready(&mut self) -> Option<usize> {
        if self.cancel_requested {
            return None;
        }
        loop {
            let mut changed = false;
            'scan: for i in 0..self.nodes.len() {
                if self.nodes[i].state.status != NodeStatus::NotStarted {
                    continue;
                }
                let mut skip = false;
                for &p in &self.parents[i] {
                    match self.gate(p) {
                        Gate::Proceed => {}
                        Gate::Skip => skip = true,
                        Gate::Wait | Gate::Block => continue 'scan,
                    }
                }
                if skip {
                    self.nodes[i].mark_skipped(None);
                    changed = true;
                    continue;
                }
                return Some(i);
            }
            if !changed {
                return None;
            }
        }
    }

    /// Classify every NotStarted node by whether it can still run.
    fn pending_classes(&self) -> HashMap<usize, Pending> {
        let mut classes: HashMap<usize, Pending> = HashMap::new();
        for &i in &self.topo {
            if self.nodes[i].state.status != NodeStatus::NotStarted {
                continue;
            }
            let mut class = Pending::Live;
            for &p in &self.parents[i] {
                let parent_class = classes.get(&p).copied();
                if parent_class == Some(Pending::Dead) || self.gate(p) == Gate::Block {
                    class = Pending::Dead;
                    break;
                }
                if parent_class == Some(Pending::SkipResolvable) || self.gate(p) == Gate::Skip {
                    class = Pending::SkipResolvable;
                }
            }
            classes.insert(i, class);
        }
        classes
    }

    /// True when no node is running and none can still be dispatched.
    pub fn is_terminal(&self) -> bool {
        if self
            .nodes
            .iter()
            .any(|n| n.state.status == NodeStatus::Running)
        {
            return false;
        }
        if self.cancel_requested {
            return true;
        }
        !self
            .pending_classes()
            .values()
            .any(|&c| c == Pending::Live)
    }

    /// Aggregate the node states into a run status.
    pub fn aggregate(&self) -> RunStatus {
        let classes = self.pending_classes();

        let mut any_running = false;
        let mut all_not_started = true;
        let mut any_cancelled = false;
        let mut any_failed_hard = false;
        let mut any_swallowed = false;
        let mut any_partial = false;
        let mut any_pending_live = false;

        for (i, node) in self.nodes.iter().enumerate() {
            let status = node.state.status;
            if status != NodeStatus::NotStarted {
                all_not_started = false;
            }
            match status {
                NodeStatus::Running => any_running = true,
                NodeStatus::NotStarted => {
                    if classes.get(&i) == Some(&Pending::Live) {
                        any_pending_live = true;
                    }
                }
                NodeStatus::Cancelled => any_cancelled = true,
                NodeStatus::Failed => {
                    if node.state.swallowed {
                        any_swallowed = true;
                    } else {
                        any_failed_hard = true;
                    }
                }
                NodeStatus::PartialSuccess => any_partial = true,
                NodeStatus::Success | NodeStatus::Skipped | NodeStatus::Rejected => {}
            }
        }

        if all_not_started && !self.cancel_requested {
            return RunStatus::NotStarted;
        }
        if any_running {
            return RunStatus::Running;
        }
        if self.cancel_requested && (any_cancelled || any_pending_live || all_not_started) {
            return RunStatus::Cancelled;
        }
        if any_failed_hard {
            return RunStatus::Failed;
        }
        if any_cancelled {
            return RunStatus::Cancelled;
        }
        if any_pending_live {
            return RunStatus::Running;
        }
        if any_swallowed || any_partial {
            return RunStatus::PartialSuccess;
        }
        RunStatus::Success
    }

    /// Deep-copied node snapshots in declaration order.
    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(Node::snapshot).collect()
    }

    /// Output variables of every transitive ancestor whose outputs are
    /// observable (Success or PartialSuccess), nearest-ancestor-last so
    /// later producers win on key collisions.
    pub fn ancestor_outputs(
        &self,
        idx: usize,
    ) -> Vec<(String, std::collections::BTreeMap<String, serde_json::Value>)> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = self.parents[idx].to_vec();
        let mut ancestors: Vec<usize> = Vec::new();
        while let Some(p) = stack.pop() {
            if seen[p] {
                continue;
            }
            seen[p] = true;
            ancestors.push(p);
            stack.extend_from_slice(&self.parents[p]);
        }
        // Topological order so closer ancestors override farther ones.
        ancestors.sort_by_key(|i| self.topo.iter().position(|t| t == i));
        ancestors
            .into_iter()
            .filter(|&p| self.nodes[p].state.status.is_success_like())
            .map(|p| {
                (
                    self.nodes[p].step.name.clone(),
                    self.nodes[p].state.output_variables.clone(),
                )
            })
            .collect()
    }
}
