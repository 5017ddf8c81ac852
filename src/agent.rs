//! The run coordinator.
//!
//! One agent owns exactly one run: it binds a parsed DAG to a request id,
//! proves liveness through the control socket, opens the store attempt,
//! drives the scheduler to a terminal state, and writes a final snapshot
//! on every exit path — including caught panics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::def::{resolve_call, DagFile, ParamSet};
use crate::errors::{AgentError, SockError};
use crate::expand::{eval_preconditions, VarEnv};
use crate::graph::ExecutionGraph;
use crate::runner::{RunContext, SubDagCall, SubDagRunner};
use crate::scheduler::{RunMeta, Scheduler, SharedRun, StatusSink};
use crate::sock::{self, SockServer, StatusSource};
use crate::status::{RunRef, RunStatus, Status};
use crate::store::{AttemptHandle, HistoryStore, SqliteStore};

/// How a run is bound to a request id and the wider hierarchy.
#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    /// Parameter override string (the CLI's `-p`).
    pub params: Option<String>,
    /// Reuse a specific request id (retry, or caller-chosen `--run-id`).
    pub request_id: Option<String>,
    /// Set for sub-runs: the top-level run this one belongs to.
    pub root: Option<RunRef>,
    /// Rebuild the graph from the persisted snapshot and walk only
    /// failed/pending nodes.
    pub retry: bool,
    /// External cancellation scope (CLI signals, parent run).
    pub cancel: Option<CancellationToken>,
}

pub struct Agent {
    config: Config,
    dag_file: DagFile,
    store: Arc<SqliteStore>,
}

impl Agent {
    pub fn new(config: Config, dag_file: DagFile, store: Arc<SqliteStore>) -> Agent {
        Agent {
            config,
            dag_file,
            store,
        }
    }

    /// Execute the run to completion and return the final snapshot.
    ///
    /// The process exit code is the caller's concern: a Failed run is a
    /// normal exit here — failure lives in the record.
    pub async fn run(self, opts: AgentOptions) -> Result<Status, AgentError> {
        let dag = self.dag_file.root.clone();
        let request_id = opts
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let run_ref = RunRef {
            name: dag.name.clone(),
            request_id: request_id.clone(),
        };
        let root = opts.root.clone().unwrap_or_else(|| run_ref.clone());
        let cancel = opts.cancel.clone().unwrap_or_default();

        // Liveness gate: a live socket for this (dag, request id) means a
        // second agent must not start. Stale files were already collected
        // by the probe itself.
        let sock_path = sock::run_sock_path(&self.config, &sock::dag_key(&dag), &request_id);
        if sock_path.exists() {
            match sock::get_status(&sock_path).await {
                Err(SockError::NotRunning) => {}
                Ok(_) | Err(_) => {
                    return Err(AgentError::AlreadyRunning {
                        name: dag.name.clone(),
                        request_id,
                    });
                }
            }
        }

        let params = if opts.retry {
            // A retry reuses the original run's parameters.
            let prior = self
                .store
                .find_by_request_id(&dag.name, &request_id)
                .await?;
            ParamSet::build(&dag.params, Some(&prior.params))
        } else {
            ParamSet::build(&dag.params, opts.params.as_deref())
        };

        let started_at = Utc::now();
        let attempt: Arc<dyn AttemptHandle> = Arc::from(
            self.store
                .open_attempt(&dag.name, &request_id, opts.root.as_ref(), started_at)
                .await?,
        );

        // Build (or rebuild) the execution graph. Validation failures are
        // recorded as a Failed attempt so the UI sees why nothing ran.
        let graph = if opts.retry {
            let prior = self
                .store
                .find_by_request_id(&dag.name, &request_id)
                .await?;
            ExecutionGraph::from_snapshot(&prior)
        } else {
            ExecutionGraph::build(&dag.steps)
        };
        let graph = match graph {
            Ok(graph) => graph,
            Err(err) => {
                let mut status = Status::initial(&dag);
                status.request_id = request_id.clone();
                status.params = params.render();
                status.started_at = Some(started_at);
                status.finished_at = Some(Utc::now());
                status.root_ref = opts.root.clone();
                status.set_status(RunStatus::Failed);
                attempt.write(&status).await?;
                attempt.close(Utc::now()).await?;
                return Err(err.into());
            }
        };

        let log_dir = self.config.run_log_dir(&dag.name, &request_id);
        let meta = RunMeta {
            name: dag.name.clone(),
            request_id: request_id.clone(),
            params: params.render(),
            pid: std::process::id() as i32,
            root_ref: opts.root.clone(),
            log_dir: log_dir.to_string_lossy().into_owned(),
        };
        let shared = Arc::new(SharedRun::new(meta, graph));
        let sink: Arc<dyn StatusSink> = Arc::new(StoreSink {
            attempt: attempt.clone(),
        });

        // Control socket: bind before scheduling so the liveness signal
        // exists for the whole time any node can be running.
        let server = SockServer::bind(&sock_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::AddrInUse {
                AgentError::AlreadyRunning {
                    name: dag.name.clone(),
                    request_id: request_id.clone(),
                }
            } else {
                AgentError::Io(err)
            }
        })?;
        let shutdown = CancellationToken::new();
        let server_task = tokio::spawn(server.serve(
            Arc::new(SharedSource(shared.clone())) as Arc<dyn StatusSource>,
            cancel.clone(),
            shutdown.clone(),
        ));
        info!(dag = %dag.name, %request_id, sock = %sock_path.display(), "agent started");

        let sub_runner: Arc<dyn SubDagRunner> = Arc::new(AgentSubRunner {
            config: self.config.clone(),
            store: self.store.clone(),
            dag_file: self.dag_file.clone(),
            cancel: cancel.clone(),
        });
        let ctx = Arc::new(RunContext {
            dag: dag.clone(),
            dag_file: self.dag_file.clone(),
            config: self.config.clone(),
            run_ref: run_ref.clone(),
            root,
            log_dir,
            cancel: cancel.clone(),
            sub_runner,
        });
        let base_env = build_base_env(&ctx, &params);

        // Run-level preconditions gate the whole run.
        let final_status = match eval_preconditions(&dag.preconditions, &base_env).await {
            Ok(None) => {
                let scheduler = Scheduler::new(ctx, shared.clone(), sink.clone(), base_env);
                match std::panic::AssertUnwindSafe(scheduler.run())
                    .catch_unwind()
                    .await
                {
                    Ok(status) => status,
                    Err(_) => {
                        error!(dag = %dag.name, "scheduler panicked; recording failure");
                        RunStatus::Failed
                    }
                }
            }
            Ok(Some(reason)) => {
                info!(dag = %dag.name, %reason, "run precondition unmet; not starting");
                shared.graph.lock().unwrap().mark_cancel();
                RunStatus::Cancelled
            }
            Err(err) => {
                warn!(dag = %dag.name, %err, "run precondition evaluation failed");
                RunStatus::Failed
            }
        };

        *shared.final_status.lock().unwrap() = Some(final_status);
        *shared.finished_at.lock().unwrap() = Some(Utc::now());
        let status = shared.compose();
        sink.persist(status.clone()).await;
        attempt.close(Utc::now()).await?;

        // Tear the socket down last; its absence means "not running".
        shutdown.cancel();
        let _ = server_task.await;
        info!(dag = %dag.name, %request_id, status = %status.status_text, "agent finished");
        Ok(status)
    }
}

/// The run's base environment: inherited process env, DAG env entries,
/// run params, and the standard DAGRUN_* exports.
fn build_base_env(ctx: &RunContext, params: &ParamSet) -> VarEnv {
    let mut env = VarEnv::default();
    for (key, value) in std::env::vars() {
        env.set(key, value);
    }
    for entry in &ctx.dag.env {
        if let Some((key, value)) = entry.split_once('=') {
            let expanded = env.expand(value);
            env.set(key.trim(), expanded);
        }
    }
    for (key, value) in params.variables() {
        env.set(key, value);
    }
    env.set("DAGRUN_DAG_NAME", ctx.dag.name.clone());
    env.set("DAGRUN_REQUEST_ID", ctx.run_ref.request_id.clone());
    env.set("DAGRUN_LOG_DIR", ctx.log_dir.to_string_lossy().into_owned());
    env.set("DAGRUN_HOME", ctx.config.home.to_string_lossy().into_owned());
    env
}

/// Snapshot writer with bounded retry for transient store errors.
struct StoreSink {
    attempt: Arc<dyn AttemptHandle>,
}

#[async_trait]
impl StatusSink for StoreSink {
    async fn persist(&self, status: Status) {
        for backoff in [0u64, 50, 200] {
            if backoff > 0 {
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            match self.attempt.write(&status).await {
                Ok(()) => return,
                Err(err) => warn!(%err, "snapshot write failed; retrying"),
            }
        }
        error!("giving up on snapshot write after retries");
    }
}

struct SharedSource(Arc<SharedRun>);

impl StatusSource for SharedSource {
    fn current(&self) -> Status {
        self.0.compose()
    }
}

/// Inline sub-DAG invocation: a fresh agent in the same process, sharing
/// the store and inheriting the parent's cancellation scope.
struct AgentSubRunner {
    config: Config,
    store: Arc<SqliteStore>,
    dag_file: DagFile,
    cancel: CancellationToken,
}

impl SubDagRunner for AgentSubRunner {
    fn run_sub(&self, call: SubDagCall) -> BoxFuture<'static, Result<Status, AgentError>> {
        let config = self.config.clone();
        let store = self.store.clone();
        let dag_file = self.dag_file.clone();
        let cancel = self.cancel.child_token();
        Box::pin(async move {
            let target = resolve_call(&dag_file, &config.dags_dir, &call.name)?;
            let agent = Agent::new(config, target, store);
            agent
                .run(AgentOptions {
                    params: call.params,
                    request_id: Some(call.request_id),
                    root: Some(call.root),
                    retry: false,
                    cancel: Some(cancel),
                })
                .await
        })
    }
}
