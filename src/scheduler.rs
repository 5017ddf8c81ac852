//! The scheduler: a single cooperative loop that walks the execution
//! graph, launches ready nodes up to the DAG's concurrency bound, joins
//! finished ones, and finally dispatches the lifecycle handler chain.
//!
//! Graph state is mutated only here (under the shared lock); node runtimes
//! receive cloned steps and a frozen environment, so sibling tasks never
//! observe half-merged state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::expand::VarEnv;
use crate::graph::ExecutionGraph;
use crate::runner::{run_node, NodeOutcome, RunContext};
use crate::status::{NodeSnapshot, NodeStatus, RunRef, RunStatus, Status};

/// Immutable identity of one run, used to compose status snapshots.
#[derive(Debug, Clone)]
pub struct RunMeta {
    pub name: String,
    pub request_id: String,
    pub params: String,
    pub pid: i32,
    pub root_ref: Option<RunRef>,
    pub log_dir: String,
}

/// Handler node snapshots, keyed by lifecycle event.
#[derive(Debug, Clone, Default)]
pub struct HandlerSnapshots {
    pub on_success: Option<NodeSnapshot>,
    pub on_failure: Option<NodeSnapshot>,
    pub on_cancel: Option<NodeSnapshot>,
    pub on_exit: Option<NodeSnapshot>,
}

/// State shared between the scheduler, the agent, and the control socket.
pub struct SharedRun {
    pub meta: RunMeta,
    pub graph: Mutex<ExecutionGraph>,
    pub handlers: Mutex<HandlerSnapshots>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Mutex<Option<DateTime<Utc>>>,
    /// Set once the run reaches its terminal status (handlers included).
    pub final_status: Mutex<Option<RunStatus>>,
}

impl SharedRun {
    pub fn new(meta: RunMeta, graph: ExecutionGraph) -> SharedRun {
        SharedRun {
            meta,
            graph: Mutex::new(graph),
            handlers: Mutex::new(HandlerSnapshots::default()),
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
            final_status: Mutex::new(None),
        }
    }

    /// Deep-copied snapshot of the whole run. Safe to call from any task;
    /// the graph lock is held only while nodes are copied out.
    pub fn compose(&self) -> Status {
        let (nodes, aggregate) = {
            let graph = self.graph.lock().unwrap();
            (graph.snapshots(), graph.aggregate())
        };
        let handlers = self.handlers.lock().unwrap().clone();
        let status_value = self.final_status.lock().unwrap().unwrap_or(aggregate);

        let mut status = Status::default();
        status.request_id = self.meta.request_id.clone();
        status.name = self.meta.name.clone();
        status.params = self.meta.params.clone();
        status.pid = self.meta.pid;
        status.started_at = Some(self.started_at);
        status.finished_at = *self.finished_at.lock().unwrap();
        status.root_ref = self.meta.root_ref.clone();
        status.log_dir = self.meta.log_dir.clone();
        status.sub_run_refs = nodes
            .iter()
            .flat_map(|n| n.sub_runs.iter().cloned())
            .collect();
        status.nodes = nodes;
        status.on_success = handlers.on_success;
        status.on_failure = handlers.on_failure;
        status.on_cancel = handlers.on_cancel;
        status.on_exit = handlers.on_exit;
        status.set_status(status_value);
        status
    }
}

/// Where snapshots go after every state transition.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn persist(&self, status: Status);
}

/// A sink for tests and dry runs.
pub struct NullSink;

#[async_trait]
impl StatusSink for NullSink {
    async fn persist(&self, _status: Status) {}
}

pub struct Scheduler {
    ctx: Arc<RunContext>,
    shared: Arc<SharedRun>,
    sink: Arc<dyn StatusSink>,
    base_env: VarEnv,
    max_active: usize,
    timeout: Option<Duration>,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<RunContext>,
        shared: Arc<SharedRun>,
        sink: Arc<dyn StatusSink>,
        base_env: VarEnv,
    ) -> Scheduler {
        let max_active = ctx.dag.max_active_runs.max(1);
        let timeout = ctx.dag.timeout_sec.map(Duration::from_secs);
        Scheduler {
            ctx,
            shared,
            sink,
            base_env,
            max_active,
            timeout,
        }
    }

    /// Drive the graph to its terminal state, then run handlers.
    pub async fn run(&self) -> RunStatus {
        let cancel = self.ctx.cancel.clone();
        let mut join: JoinSet<(usize, NodeOutcome)> = JoinSet::new();
        let mut cancel_handled = false;

        let far_future = tokio::time::Instant::now() + Duration::from_secs(86_400 * 365);
        let deadline = self
            .timeout
            .map(|t| tokio::time::Instant::now() + t)
            .unwrap_or(far_future);

        loop {
            if !cancel.is_cancelled() {
                self.launch_ready(&mut join).await;
            }
            if join.is_empty() {
                if cancel.is_cancelled() && !cancel_handled {
                    self.shared.graph.lock().unwrap().mark_cancel();
                }
                break;
            }

            tokio::select! {
                joined = join.join_next() => {
                    match joined {
                        Some(Ok((idx, outcome))) => self.merge(idx, outcome),
                        Some(Err(err)) => {
                            // Tasks catch node panics themselves; this is
                            // only reachable for aborted tasks.
                            error!(%err, "node task aborted");
                        }
                        None => {}
                    }
                    self.sink.persist(self.shared.compose()).await;
                }
                _ = cancel.cancelled(), if !cancel_handled => {
                    cancel_handled = true;
                    info!("cancellation requested; draining running nodes");
                    self.shared.graph.lock().unwrap().mark_cancel();
                    self.sink.persist(self.shared.compose()).await;
                }
                _ = tokio::time::sleep_until(deadline), if !cancel_handled => {
                    warn!("run exceeded its timeout; cancelling");
                    cancel_handled = true;
                    cancel.cancel();
                    self.shared.graph.lock().unwrap().mark_cancel();
                    self.sink.persist(self.shared.compose()).await;
                }
            }
        }

        let main_status = self.shared.graph.lock().unwrap().aggregate();
        let final_status = self.run_handlers(main_status).await;
        *self.shared.final_status.lock().unwrap() = Some(final_status);
        final_status
    }

    /// Launch ready nodes, in declaration order, up to the active bound.
    async fn launch_ready(&self, join: &mut JoinSet<(usize, NodeOutcome)>) {
        loop {
            if join.len() >= self.max_active {
                return;
            }
            let launched = {
                let mut graph = self.shared.graph.lock().unwrap();
                match graph.next_ready() {
                    Some(idx) => {
                        graph.node_mut(idx).mark_running();
                        let step = graph.node(idx).step.clone();
                        let env = self.node_env(&graph, idx);
                        Some((idx, step, env))
                    }
                    None => None,
                }
            };
            let Some((idx, step, env)) = launched else {
                return;
            };
            info!(step = %step.name, "dispatching step");
            self.sink.persist(self.shared.compose()).await;

            let ctx = self.ctx.clone();
            join.spawn(async move {
                let name = step.name.clone();
                // A panicking executor fails its node, never the run.
                let result = std::panic::AssertUnwindSafe(run_node(ctx, step, env))
                    .catch_unwind()
                    .await;
                let outcome = result.unwrap_or_else(|panic| {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "executor panicked".to_string());
                    error!(step = %name, %msg, "node panicked");
                    panic_outcome(msg)
                });
                (idx, outcome)
            });
        }
    }

    /// Environment a node observes: the run's base variables plus outputs
    /// of every transitive ancestor that finished successfully, frozen at
    /// dispatch time.
    fn node_env(&self, graph: &ExecutionGraph, idx: usize) -> VarEnv {
        let mut env = self.base_env.clone();
        for (step_name, outputs) in graph.ancestor_outputs(idx) {
            for (key, value) in &outputs {
                env.vars.insert(key.clone(), json_to_env_string(value));
            }
            env.outputs.insert(step_name, outputs);
        }
        env
    }

    fn merge(&self, idx: usize, outcome: NodeOutcome) {
        let mut graph = self.shared.graph.lock().unwrap();
        let node = graph.node_mut(idx);
        node.state.status = outcome.status;
        node.state.finished_at = Some(Utc::now());
        node.state.exit_code = outcome.exit_code;
        node.state.retry_count = outcome.retry_count;
        node.state.repeat_count = outcome.repeat_count;
        node.state.output_variables = outcome.output_variables;
        node.state.sub_runs = outcome.sub_runs;
        node.state.sub_runs_repeated.extend(outcome.sub_runs_repeated);
        node.state.swallowed = outcome.swallowed;
        node.state.error = outcome.error;
        if !outcome.stdout_path.is_empty() {
            node.state.stdout_path = outcome.stdout_path;
        }
        if !outcome.stderr_path.is_empty() {
            node.state.stderr_path = outcome.stderr_path;
        }
    }

    /// Dispatch lifecycle handlers in their fixed order. A failing handler
    /// demotes the run to Failed (cancellation is never overridden).
    async fn run_handlers(&self, main_status: RunStatus) -> RunStatus {
        let handlers = self.ctx.dag.handlers.clone();
        let mut status = main_status;

        let chain: [(&str, Option<&crate::def::Step>, bool); 4] = [
            (
                "failure",
                handlers.failure.as_ref(),
                matches!(status, RunStatus::Failed | RunStatus::PartialSuccess),
            ),
            (
                "success",
                handlers.success.as_ref(),
                status == RunStatus::Success,
            ),
            (
                "cancel",
                handlers.cancel.as_ref(),
                status == RunStatus::Cancelled,
            ),
            ("exit", handlers.exit.as_ref(), true),
        ];

        for (kind, step, applies) in chain {
            let Some(step) = step else { continue };
            if !applies {
                continue;
            }
            info!(handler = kind, step = %step.name, "running lifecycle handler");
            let snap = self.run_handler_step(step.clone()).await;
            let failed = snap.status == NodeStatus::Failed && !snap.swallowed;
            {
                let mut slots = self.shared.handlers.lock().unwrap();
                match kind {
                    "failure" => slots.on_failure = Some(snap),
                    "success" => slots.on_success = Some(snap),
                    "cancel" => slots.on_cancel = Some(snap),
                    _ => slots.on_exit = Some(snap),
                }
            }
            self.sink.persist(self.shared.compose()).await;
            if failed && status != RunStatus::Cancelled {
                status = RunStatus::Failed;
            }
        }
        status
    }

    async fn run_handler_step(&self, step: crate::def::Step) -> NodeSnapshot {
        // Handlers see every successful node's outputs, and they must run
        // even after a stop request, so they get a fresh cancel scope.
        let mut env = self.base_env.clone();
        {
            let graph = self.shared.graph.lock().unwrap();
            for i in 0..graph.len() {
                let node = graph.node(i);
                if node.state.status.is_success_like() {
                    for (key, value) in &node.state.output_variables {
                        env.vars.insert(key.clone(), json_to_env_string(value));
                    }
                    env.outputs.insert(
                        node.step.name.clone(),
                        node.state.output_variables.clone(),
                    );
                }
            }
        }

        let handler_ctx = Arc::new(RunContext {
            dag: self.ctx.dag.clone(),
            dag_file: self.ctx.dag_file.clone(),
            config: self.ctx.config.clone(),
            run_ref: self.ctx.run_ref.clone(),
            root: self.ctx.root.clone(),
            log_dir: self.ctx.log_dir.clone(),
            cancel: tokio_util::sync::CancellationToken::new(),
            sub_runner: self.ctx.sub_runner.clone(),
        });

        let started = Utc::now();
        let outcome = run_node(handler_ctx, step.clone(), env).await;

        let mut snap = NodeSnapshot::from_step(&step);
        snap.set_status(outcome.status);
        snap.started_at = Some(started);
        snap.finished_at = Some(Utc::now());
        snap.exit_code = outcome.exit_code;
        snap.stdout = outcome.stdout_path;
        snap.stderr = outcome.stderr_path;
        snap.output_variables = outcome.output_variables;
        snap.retry_count = outcome.retry_count;
        snap.swallowed = outcome.swallowed;
        snap.error = outcome.error;
        snap
    }
}

fn panic_outcome(message: String) -> NodeOutcome {
    NodeOutcome {
        status: NodeStatus::Failed,
        exit_code: -1,
        output_variables: Default::default(),
        sub_runs: Vec::new(),
        sub_runs_repeated: Vec::new(),
        error: Some(message),
        swallowed: false,
        retry_count: 0,
        repeat_count: 0,
        stdout_path: String::new(),
        stderr_path: String::new(),
    }
}

fn json_to_env_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
