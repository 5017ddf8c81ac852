//! DAG and step definitions as loaded from YAML.
//!
//! The engine itself only ever reads these structs; they are immutable for
//! the lifetime of a run. A definition file may contain several
//! `---`-separated documents: the first is the root DAG, the rest are
//! locally-callable sub-DAGs.

mod load;
mod params;

pub use load::{load_file, resolve_call, DagFile};
pub use params::{parse_param_string, ParamSet};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Dag {
    /// Unique identifier; defaults to the file stem when omitted.
    pub name: String,

    /// Where this definition was loaded from (not part of the YAML).
    #[serde(skip)]
    pub location: PathBuf,

    /// `graph` (explicit `depends`) or `chain` (implicit linear order).
    #[serde(rename = "type")]
    pub dag_type: DagType,

    pub description: Option<String>,

    /// Default parameters, `KEY=value` or positional.
    pub params: Vec<String>,

    /// Environment entries (`KEY=value`) visible to every step.
    pub env: Vec<String>,

    /// Cron expressions; consumed by the (external) trigger scheduler.
    pub schedule: Vec<String>,

    /// The steps that make up this DAG.
    pub steps: Vec<Step>,

    /// Lifecycle handler steps.
    pub handlers: Handlers,

    /// Upper bound on concurrently executing nodes within one run.
    pub max_active_runs: usize,

    /// Run-level preconditions, checked before any node is scheduled.
    pub preconditions: Vec<Condition>,

    /// Free-form tags; the listing API filters on these.
    pub tags: Vec<String>,

    /// History retention horizon, consumed by the (external) sweeper.
    pub hist_retention_days: Option<u32>,

    /// Overall run deadline in seconds; exceeding it cancels the run.
    pub timeout_sec: Option<u64>,
}

impl Default for Dag {
    fn default() -> Self {
        Dag {
            name: String::new(),
            location: PathBuf::new(),
            dag_type: DagType::Graph,
            description: None,
            params: Vec::new(),
            env: Vec::new(),
            schedule: Vec::new(),
            steps: Vec::new(),
            handlers: Handlers::default(),
            max_active_runs: default_max_active(),
            preconditions: Vec::new(),
            tags: Vec::new(),
            hist_retention_days: None,
            timeout_sec: None,
        }
    }
}

fn default_max_active() -> usize {
    1
}

/// How step dependencies are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DagType {
    /// Edges come from each step's `depends` list.
    #[default]
    Graph,
    /// Steps run in declaration order; `depends` is filled in implicitly.
    Chain,
}

/// Lifecycle handler steps, each executed through the normal node runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Handlers {
    pub success: Option<Step>,
    pub failure: Option<Step>,
    pub cancel: Option<Step>,
    pub exit: Option<Step>,
}

/// A single step (one node of the execution graph).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Step {
    /// Unique step name within the DAG.
    pub name: String,

    pub description: Option<String>,

    /// Command line; run through the step shell unless `args` is given.
    pub command: Option<String>,

    /// Explicit argv; when present `command` is executed directly.
    pub args: Vec<String>,

    /// Inline script, written to a temp file and fed to the step shell.
    pub script: Option<String>,

    /// Shell override (default `$SHELL`, then `sh`).
    pub shell: Option<String>,

    /// Working directory override.
    pub dir: Option<String>,

    /// Redirect stdout to this path instead of the default capture file.
    pub stdout: Option<String>,

    /// Redirect stderr likewise.
    pub stderr: Option<String>,

    /// Name of the output variable capturing this step's stdout.
    pub output: Option<String>,

    /// Step names this one depends on (DAG edges).
    pub depends: Vec<String>,

    /// Policy converting an apparent failure into an accepted result.
    pub continue_on: ContinueOn,

    pub retry_policy: Option<RetryPolicy>,

    pub repeat_policy: Option<RepeatPolicy>,

    /// Boolean gates; all must match for the step to run.
    pub preconditions: Vec<Condition>,

    /// Signal sent on stop instead of SIGTERM (e.g. `SIGINT`).
    pub signal_on_stop: Option<String>,

    /// Which executor runs this step. Default: shell.
    pub executor: ExecutorConfig,

    /// Name of a sub-DAG to invoke instead of a command.
    pub call: Option<String>,

    /// Parameter string passed to the called sub-DAG.
    pub params: Option<String>,

    /// Fan the `call` out over a list of parameter items.
    pub parallel: Option<Parallel>,
}

/// Continue-on policy: which failure shapes children may proceed past.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContinueOn {
    pub failure: bool,
    pub skipped: bool,
    pub exit_code: Vec<i32>,
    /// Patterns matched against captured stdout; `re:` prefix for regex.
    pub output: Vec<String>,
}

impl ContinueOn {
    pub fn is_empty(&self) -> bool {
        !self.failure && !self.skipped && self.exit_code.is_empty() && self.output.is_empty()
    }
}

/// Automatic re-execution on failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub limit: u32,
    pub interval_sec: u64,
    /// Retry only these exit codes; empty means any non-zero exit.
    pub exit_codes: Vec<i32>,
}

/// Scheduled re-execution after success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepeatPolicy {
    pub repeat: bool,
    pub interval_sec: u64,
    pub limit: u32,
}

/// A boolean gate over the environment.
///
/// `condition` is expanded against the node environment; a backtick-wrapped
/// condition is run as a command and its trimmed stdout compared instead.
/// `expected` may be a literal or a `re:`-prefixed regex.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Condition {
    pub condition: String,
    pub expected: String,
}

/// Executor selection: either a bare name (`executor: shell`) or a map with
/// `type` and a free-form `config` blob the executor interprets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "ExecutorConfigRaw")]
pub struct ExecutorConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub config: serde_json::Value,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            kind: "shell".to_string(),
            config: serde_json::Value::Null,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExecutorConfigRaw {
    Name(String),
    Full {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        config: serde_json::Value,
    },
}

impl From<ExecutorConfigRaw> for ExecutorConfig {
    fn from(raw: ExecutorConfigRaw) -> Self {
        match raw {
            ExecutorConfigRaw::Name(kind) => ExecutorConfig {
                kind,
                config: serde_json::Value::Null,
            },
            ExecutorConfigRaw::Full { kind, config } => ExecutorConfig { kind, config },
        }
    }
}

/// Parallel fan-out of a `call` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Parallel {
    /// One parameter string per sub-run, tokenized shell-style.
    pub items: Vec<String>,
    pub max_concurrent: usize,
}

impl Default for Parallel {
    fn default() -> Self {
        Parallel {
            items: Vec::new(),
            max_concurrent: 1,
        }
    }
}
