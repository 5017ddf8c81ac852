use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced while loading or resolving DAG definitions.
#[derive(Debug, Error)]
pub enum DefError {
    #[error("failed to read dag file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse dag file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("dag file {0} contains no steps")]
    Empty(PathBuf),

    #[error("dag '{0}' not found")]
    NotFound(String),
}

/// Errors detected while building the execution graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cycle detected at step '{0}'")]
    Cycle(String),

    #[error("step '{step}' depends on unknown step '{depends}'")]
    UnknownDependency { step: String, depends: String },

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("dag has no steps")]
    EmptyDag,
}

/// Errors from the durable run store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No attempt exists for the requested key.
    #[error("no status data for dag '{0}'")]
    NoStatusData(String),

    #[error("stored snapshot is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Errors from the control-plane socket (server or client side).
#[derive(Debug, Error)]
pub enum SockError {
    /// The 3-second client deadline elapsed.
    #[error("control socket request timed out")]
    Timeout,

    /// No agent is listening (socket absent, or stale and garbage-collected).
    #[error("no agent is listening on the control socket")]
    NotRunning,

    #[error("malformed control request")]
    BadRequest,

    #[error("control socket returned status {0}")]
    BadResponse(u16),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while starting or dispatching an executor.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unknown executor type '{0}'")]
    UnknownExecutor(String),

    #[error("failed to launch command: {0}")]
    Launch(#[source] std::io::Error),

    #[error("failed waiting for command: {0}")]
    Wait(#[source] std::io::Error),

    #[error("executor has not been started")]
    NotStarted,
}

/// Errors from condition evaluation and variable expansion.
#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("command substitution failed for '{command}': {source}")]
    Substitution {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid regex pattern '{0}'")]
    BadPattern(String),
}

/// Errors from the run coordinator.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("dag '{name}' is already running (request id {request_id})")]
    AlreadyRunning { name: String, request_id: String },

    #[error(transparent)]
    Def(#[from] DefError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sock(#[from] SockError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors returned by the client façade.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The same request id is currently being executed by a live agent.
    #[error("dag is running; refusing to modify its status")]
    DagIsRunning,

    #[error(transparent)]
    Def(#[from] DefError),

    #[error(transparent)]
    Sock(#[from] SockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
