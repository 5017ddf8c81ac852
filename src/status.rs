use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::def::{Dag, Step};

/// Execution status of an individual node.
///
/// Serialized as its numeric code so snapshots stay stable across releases;
/// the human label travels separately in `status_text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum NodeStatus {
    NotStarted,
    Skipped,
    Running,
    Success,
    Failed,
    Cancelled,
    PartialSuccess,
    Rejected,
}

impl NodeStatus {
    pub fn text(self) -> &'static str {
        match self {
            NodeStatus::NotStarted => "not started",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Running => "running",
            NodeStatus::Success => "finished",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "canceled",
            NodeStatus::PartialSuccess => "partial success",
            NodeStatus::Rejected => "rejected",
        }
    }

    /// Terminal states never change again without an explicit retry.
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeStatus::NotStarted | NodeStatus::Running)
    }

    /// States that make this node's outputs observable downstream.
    pub fn is_success_like(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::PartialSuccess)
    }
}

impl From<NodeStatus> for u8 {
    fn from(s: NodeStatus) -> u8 {
        match s {
            NodeStatus::NotStarted => 0,
            NodeStatus::Skipped => 1,
            NodeStatus::Running => 2,
            NodeStatus::Success => 3,
            NodeStatus::Failed => 4,
            NodeStatus::Cancelled => 5,
            NodeStatus::PartialSuccess => 6,
            NodeStatus::Rejected => 7,
        }
    }
}

impl From<u8> for NodeStatus {
    fn from(v: u8) -> NodeStatus {
        match v {
            1 => NodeStatus::Skipped,
            2 => NodeStatus::Running,
            3 => NodeStatus::Success,
            4 => NodeStatus::Failed,
            5 => NodeStatus::Cancelled,
            6 => NodeStatus::PartialSuccess,
            7 => NodeStatus::Rejected,
            // Unknown codes from a newer writer degrade to NotStarted.
            _ => NodeStatus::NotStarted,
        }
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum RunStatus {
    NotStarted,
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    PartialSuccess,
}

impl RunStatus {
    pub fn text(self) -> &'static str {
        match self {
            RunStatus::NotStarted => "not started",
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "finished",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "canceled",
            RunStatus::PartialSuccess => "partial success",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            RunStatus::NotStarted | RunStatus::Queued | RunStatus::Running
        )
    }
}

impl From<RunStatus> for u8 {
    fn from(s: RunStatus) -> u8 {
        match s {
            RunStatus::NotStarted => 0,
            RunStatus::Queued => 1,
            RunStatus::Running => 2,
            RunStatus::Success => 3,
            RunStatus::Failed => 4,
            RunStatus::Cancelled => 5,
            RunStatus::PartialSuccess => 6,
        }
    }
}

impl From<u8> for RunStatus {
    fn from(v: u8) -> RunStatus {
        match v {
            1 => RunStatus::Queued,
            2 => RunStatus::Running,
            3 => RunStatus::Success,
            4 => RunStatus::Failed,
            5 => RunStatus::Cancelled,
            6 => RunStatus::PartialSuccess,
            _ => RunStatus::NotStarted,
        }
    }
}

/// Reference to another run in the hierarchy (root or sub-run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRef {
    pub name: String,
    pub request_id: String,
}

/// Snapshot of one node, embedded in the run snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSnapshot {
    pub step: Step,
    pub status: NodeStatus,
    pub status_text: String,
    #[serde(with = "ts")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "ts")]
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub output_variables: BTreeMap<String, serde_json::Value>,
    pub sub_runs: Vec<RunRef>,
    pub sub_runs_repeated: Vec<RunRef>,
    pub retry_count: u32,
    pub repeat_count: u32,
    /// True when a failure was accepted by the step's continue-on policy.
    pub swallowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for NodeSnapshot {
    fn default() -> Self {
        NodeSnapshot {
            step: Step::default(),
            status: NodeStatus::NotStarted,
            status_text: NodeStatus::NotStarted.text().to_string(),
            started_at: None,
            finished_at: None,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            output_variables: BTreeMap::new(),
            sub_runs: Vec::new(),
            sub_runs_repeated: Vec::new(),
            retry_count: 0,
            repeat_count: 0,
            swallowed: false,
            error: None,
        }
    }
}

impl NodeSnapshot {
    pub fn from_step(step: &Step) -> Self {
        NodeSnapshot {
            step: step.clone(),
            ..Default::default()
        }
    }

    pub fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
        self.status_text = status.text().to_string();
    }
}

/// The canonical persisted run snapshot.
///
/// The JSON codec is lossless for every field written by this version, and
/// readers ignore unknown fields so newer writers stay compatible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Status {
    pub request_id: String,
    pub name: String,
    pub status: RunStatus,
    pub status_text: String,
    pub params: String,
    pub pid: i32,
    #[serde(with = "ts")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "ts")]
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_success: Option<NodeSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<NodeSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_cancel: Option<NodeSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<NodeSnapshot>,
    pub root_ref: Option<RunRef>,
    pub sub_run_refs: Vec<RunRef>,
    pub log_dir: String,
}

impl Default for Status {
    fn default() -> Self {
        Status {
            request_id: String::new(),
            name: String::new(),
            status: RunStatus::NotStarted,
            status_text: RunStatus::NotStarted.text().to_string(),
            params: String::new(),
            pid: 0,
            started_at: None,
            finished_at: None,
            nodes: Vec::new(),
            on_success: None,
            on_failure: None,
            on_cancel: None,
            on_exit: None,
            root_ref: None,
            sub_run_refs: Vec::new(),
            log_dir: String::new(),
        }
    }
}

impl Status {
    /// Factory: a `NotStarted` snapshot with every node `NotStarted`,
    /// suitable for UI initialization before any run exists.
    pub fn initial(dag: &Dag) -> Status {
        Status {
            name: dag.name.clone(),
            nodes: dag.steps.iter().map(NodeSnapshot::from_step).collect(),
            ..Default::default()
        }
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.status_text = status.text().to_string();
    }

    /// Normalize a snapshot read back for a run whose live process has
    /// vanished: a still-`Running` record is demoted to `Failed`, along
    /// with any node stuck in `Running`.
    pub fn mark_error_if_running(&mut self) {
        if self.status == RunStatus::Running {
            self.set_status(RunStatus::Failed);
            for node in &mut self.nodes {
                if node.status == NodeStatus::Running {
                    node.set_status(NodeStatus::Failed);
                    node.finished_at = Some(Utc::now());
                }
            }
            if self.finished_at.is_none() {
                self.finished_at = Some(Utc::now());
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Status> {
        serde_json::from_str(raw)
    }
}

/// RFC-3339 timestamps where "unset" is the empty string, per the snapshot
/// wire format: `finishedAt` is `""` exactly while a node has not finished.
pub mod ts {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => ser.serialize_str(&dt.to_rfc3339()),
            None => ser.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = String::deserialize(de)?;
        if raw.is_empty() {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom)
    }
}
