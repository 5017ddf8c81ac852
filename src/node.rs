//! Mutable execution state for one node of the graph.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::def::Step;
use crate::status::{NodeSnapshot, NodeStatus, RunRef};

/// A step plus its mutable run state.
///
/// Nodes transition monotonically: `NotStarted → Running → terminal`.
/// Once terminal a node never changes again unless a retry-mode agent
/// explicitly re-opens it (by resetting to `NotStarted` at graph build).
#[derive(Debug, Clone)]
pub struct Node {
    pub step: Step,
    pub state: NodeState,
}

#[derive(Debug, Clone)]
pub struct NodeState {
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout_path: String,
    pub stderr_path: String,
    pub exit_code: i32,
    pub retry_count: u32,
    pub repeat_count: u32,
    pub output_variables: BTreeMap<String, serde_json::Value>,
    pub error: Option<String>,
    pub sub_runs: Vec<RunRef>,
    pub sub_runs_repeated: Vec<RunRef>,
    /// A failure accepted by the continue-on policy.
    pub swallowed: bool,
}

impl Default for NodeState {
    fn default() -> Self {
        NodeState {
            status: NodeStatus::NotStarted,
            started_at: None,
            finished_at: None,
            stdout_path: String::new(),
            stderr_path: String::new(),
            exit_code: 0,
            retry_count: 0,
            repeat_count: 0,
            output_variables: BTreeMap::new(),
            error: None,
            sub_runs: Vec::new(),
            sub_runs_repeated: Vec::new(),
            swallowed: false,
        }
    }
}

impl Node {
    pub fn new(step: Step) -> Node {
        Node {
            step,
            state: NodeState::default(),
        }
    }

    /// Rebuild a node from a persisted snapshot (retry mode).
    pub fn from_snapshot(snap: &NodeSnapshot) -> Node {
        Node {
            step: snap.step.clone(),
            state: NodeState {
                status: snap.status,
                started_at: snap.started_at,
                finished_at: snap.finished_at,
                stdout_path: snap.stdout.clone(),
                stderr_path: snap.stderr.clone(),
                exit_code: snap.exit_code,
                retry_count: snap.retry_count,
                repeat_count: snap.repeat_count,
                output_variables: snap.output_variables.clone(),
                error: snap.error.clone(),
                sub_runs: snap.sub_runs.clone(),
                sub_runs_repeated: snap.sub_runs_repeated.clone(),
                swallowed: snap.swallowed,
            },
        }
    }

    pub fn mark_running(&mut self) {
        self.state.status = NodeStatus::Running;
        self.state.started_at = Some(Utc::now());
        self.state.finished_at = None;
    }

    /// Skipped nodes are terminal, so both timestamps are stamped: the
    /// snapshot invariant ties an empty `finishedAt` to NotStarted/Running.
    pub fn mark_skipped(&mut self, reason: Option<String>) {
        let now = Utc::now();
        self.state.status = NodeStatus::Skipped;
        self.state.started_at.get_or_insert(now);
        self.state.finished_at = Some(now);
        self.state.error = reason;
    }

    pub fn is_terminal(&self) -> bool {
        self.state.status.is_terminal()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let mut snap = NodeSnapshot::from_step(&self.step);
        snap.set_status(self.state.status);
        snap.started_at = self.state.started_at;
        snap.finished_at = self.state.finished_at;
        snap.exit_code = self.state.exit_code;
        snap.stdout = self.state.stdout_path.clone();
        snap.stderr = self.state.stderr_path.clone();
        snap.output_variables = self.state.output_variables.clone();
        snap.sub_runs = self.state.sub_runs.clone();
        snap.sub_runs_repeated = self.state.sub_runs_repeated.clone();
        snap.retry_count = self.state.retry_count;
        snap.repeat_count = self.state.repeat_count;
        snap.swallowed = self.state.swallowed;
        snap.error = self.state.error.clone();
        snap
    }
}
