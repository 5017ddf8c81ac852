//! The node runtime: executes one step to a terminal outcome.
//!
//! One invocation owns the full per-node lifecycle: precondition gates,
//! variable expansion, executor dispatch, output capture, retry and repeat
//! policies, sub-DAG invocation, and continue-on evaluation. Failures are
//! returned as data, never unwound across the scheduler boundary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{sanitize, Config};
use crate::def::{Dag, DagFile, RetryPolicy, Step};
use crate::errors::AgentError;
use crate::exec::{new_executor, parse_signal, ExecContext, SIGKILL, SIGTERM};
use crate::expand::{eval_preconditions, match_pattern, VarEnv};
use crate::status::{NodeStatus, RunRef, RunStatus, Status};

/// Grace period between the stop signal and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Inline sub-DAG invocation, implemented by the agent. The boxed future
/// breaks the async recursion cycle agent → scheduler → runner → agent.
pub trait SubDagRunner: Send + Sync {
    fn run_sub(&self, call: SubDagCall) -> BoxFuture<'static, Result<Status, AgentError>>;
}

#[derive(Debug, Clone)]
pub struct SubDagCall {
    pub name: String,
    pub params: Option<String>,
    pub request_id: String,
    pub root: RunRef,
}

/// Shared, immutable context for every node of one run.
pub struct RunContext {
    pub dag: Dag,
    pub dag_file: DagFile,
    pub config: Config,
    pub run_ref: RunRef,
    pub root: RunRef,
    pub log_dir: PathBuf,
    pub cancel: CancellationToken,
    pub sub_runner: Arc<dyn SubDagRunner>,
}

/// Terminal result of one node execution.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub exit_code: i32,
    pub output_variables: BTreeMap<String, serde_json::Value>,
    pub sub_runs: Vec<RunRef>,
    pub sub_runs_repeated: Vec<RunRef>,
    pub error: Option<String>,
    pub swallowed: bool,
    pub retry_count: u32,
    pub repeat_count: u32,
    pub stdout_path: String,
    pub stderr_path: String,
}

impl NodeOutcome {
    fn new() -> NodeOutcome {
        NodeOutcome {
            status: NodeStatus::Failed,
            exit_code: 0,
            output_variables: BTreeMap::new(),
            sub_runs: Vec::new(),
            sub_runs_repeated: Vec::new(),
            error: None,
            swallowed: false,
            retry_count: 0,
            repeat_count: 0,
            stdout_path: String::new(),
            stderr_path: String::new(),
        }
    }
}

struct AttemptResult {
    status: NodeStatus,
    exit_code: i32,
    error: Option<String>,
    /// Launch failures and unknown executors never retry.
    no_retry: bool,
}

/// Execute one node to completion, honoring every step policy.
pub async fn run_node(ctx: Arc<RunContext>, step: Step, mut env: VarEnv) -> NodeOutcome {
    env.set("DAGRUN_STEP_NAME", step.name.clone());

    let mut outcome = NodeOutcome::new();
    let retry = step.retry_policy.clone().unwrap_or_default();
    let repeat = step.repeat_policy.clone().unwrap_or_default();
    // Every launch gets a fresh capture file; the sequence spans retries
    // and repeats so no attempt ever overwrites another's logs.
    let mut launch_seq: u32 = 0;

    'repeat: loop {
        let mut retries_done: u32 = 0;
        loop {
            // Phase 1: precondition gates. Evaluation errors follow the
            // retry policy the same way a failing command would.
            match eval_preconditions(&step.preconditions, &env).await {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    info!(step = %step.name, %reason, "step skipped");
                    outcome.status = NodeStatus::Skipped;
                    outcome.error = Some(reason);
                    return outcome;
                }
                Err(err) => {
                    outcome.error = Some(err.to_string());
                    outcome.exit_code = -1;
                    if should_retry(&retry, retries_done, -1)
                        && sleep_interval(&ctx.cancel, retry.interval_sec).await
                    {
                        retries_done += 1;
                        outcome.retry_count = retries_done;
                        continue;
                    }
                    outcome.status = if ctx.cancel.is_cancelled() {
                        NodeStatus::Cancelled
                    } else {
                        NodeStatus::Failed
                    };
                    break 'repeat;
                }
            }

            // Phase 2: dispatch. `call` steps run sub-DAGs inline; anything
            // else goes through an executor.
            let result = if step.call.is_some() {
                run_call(&ctx, &step, &env, &mut outcome).await
            } else {
                run_executor_attempt(&ctx, &step, &env, &mut outcome, launch_seq).await
            };
            launch_seq += 1;

            outcome.exit_code = result.exit_code;
            outcome.error = result.error;

            match result.status {
                NodeStatus::Failed if !result.no_retry => {
                    if should_retry(&retry, retries_done, result.exit_code) {
                        if sleep_interval(&ctx.cancel, retry.interval_sec).await {
                            retries_done += 1;
                            outcome.retry_count = retries_done;
                            // The final attempt's outputs win.
                            outcome.output_variables.clear();
                            debug!(step = %step.name, retry = retries_done, "retrying step");
                            continue;
                        }
                        // Stop arrived during the retry backoff.
                        outcome.status = NodeStatus::Cancelled;
                        break 'repeat;
                    }
                    outcome.status = NodeStatus::Failed;
                    break 'repeat;
                }
                status => {
                    outcome.status = status;
                    break;
                }
            }
        }

        // Phase 3: repeat after success, up to the limit.
        let more_repeats =
            repeat.repeat && (repeat.limit == 0 || outcome.repeat_count < repeat.limit);
        if outcome.status == NodeStatus::Success
            && more_repeats
            && sleep_interval(&ctx.cancel, repeat.interval_sec).await
        {
            outcome.repeat_count += 1;
            // Superseded sub-run references stay visible for audit.
            let prior = std::mem::take(&mut outcome.sub_runs);
            outcome.sub_runs_repeated.extend(prior);
            debug!(step = %step.name, repeat = outcome.repeat_count, "repeating step");
            continue;
        }
        break;
    }

    // Phase 4: continue-on turns an accepted failure into forward progress
    // for children; the node itself keeps its Failed status.
    if outcome.status == NodeStatus::Failed {
        outcome.swallowed = failure_swallowed(&step, &outcome).await;
        if outcome.swallowed {
            warn!(step = %step.name, exit = outcome.exit_code, "failure accepted by continue-on");
        }
    }
    outcome
}

fn should_retry(policy: &RetryPolicy, retries_done: u32, exit_code: i32) -> bool {
    retries_done < policy.limit
        && (policy.exit_codes.is_empty() || policy.exit_codes.contains(&exit_code))
}

/// Cancellable sleep; false when cancellation cut it short.
async fn sleep_interval(cancel: &CancellationToken, seconds: u64) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => true,
        _ = cancel.cancelled() => false,
    }
}

/// One executor launch: open capture files, start, wait (with stop
/// handling), capture the output variable.
async fn run_executor_attempt(
    ctx: &RunContext,
    step: &Step,
    env: &VarEnv,
    outcome: &mut NodeOutcome,
    launch_seq: u32,
) -> AttemptResult {
    let (stdout_path, stderr_path) = match capture_paths(ctx, step, env, launch_seq) {
        Ok(paths) => paths,
        Err(err) => {
            return AttemptResult {
                status: NodeStatus::Failed,
                exit_code: -1,
                error: Some(format!("failed to open capture files: {err}")),
                no_retry: true,
            }
        }
    };
    outcome.stdout_path = stdout_path.to_string_lossy().into_owned();
    outcome.stderr_path = stderr_path.to_string_lossy().into_owned();

    let files = open_capture_files(&stdout_path, &stderr_path);
    let (stdout_file, stderr_file) = match files {
        Ok(pair) => pair,
        Err(err) => {
            return AttemptResult {
                status: NodeStatus::Failed,
                exit_code: -1,
                error: Some(format!("failed to open capture files: {err}")),
                no_retry: true,
            }
        }
    };

    let mut executor = match new_executor(&step.executor.kind) {
        Ok(executor) => executor,
        Err(err) => {
            return AttemptResult {
                status: NodeStatus::Failed,
                exit_code: -1,
                error: Some(err.to_string()),
                no_retry: true,
            }
        }
    };

    let work_dir = step_dir(ctx, step, env);
    let exec_ctx = ExecContext {
        command: step.command.as_deref().map(|c| env.expand(c)),
        args: step.args.iter().map(|a| env.expand(a)).collect(),
        script: step.script.as_deref().map(|s| env.expand(s)),
        shell: step.shell.clone(),
        dir: work_dir,
        env: env.vars.clone(),
        stdout: stdout_file,
        stderr: stderr_file,
        scratch_dir: ctx.log_dir.clone(),
    };

    if let Err(err) = executor.start(exec_ctx).await {
        return AttemptResult {
            status: NodeStatus::Failed,
            exit_code: -1,
            error: Some(err.to_string()),
            no_retry: true,
        };
    }

    // The select only decides *whether* we were cancelled; the executor is
    // borrowed again afterwards for the signal-and-reap sequence.
    let waited = tokio::select! {
        res = executor.wait() => Some(res),
        _ = ctx.cancel.cancelled() => None,
    };
    let exit_code = match waited {
        Some(Ok(result)) => result.exit_code,
        Some(Err(err)) => {
            return AttemptResult {
                status: NodeStatus::Failed,
                exit_code: -1,
                error: Some(err.to_string()),
                no_retry: true,
            }
        }
        None => {
            // Stop requested: signal (the step's choice or SIGTERM), give
            // the group a grace period, then SIGKILL whatever remains.
            let stop_signal = step
                .signal_on_stop
                .as_deref()
                .and_then(parse_signal)
                .unwrap_or(SIGTERM);
            executor.signal(stop_signal);
            let reaped = tokio::select! {
                res = executor.wait() => Some(res),
                _ = tokio::time::sleep(KILL_GRACE) => None,
            };
            let exit = match reaped {
                Some(res) => res.map(|r| r.exit_code).unwrap_or(-1),
                None => {
                    executor.signal(SIGKILL);
                    executor.wait().await.map(|r| r.exit_code).unwrap_or(-1)
                }
            };
            return AttemptResult {
                status: NodeStatus::Cancelled,
                exit_code: exit,
                error: Some("canceled".to_string()),
                no_retry: true,
            };
        }
    };

    if exit_code != 0 {
        return AttemptResult {
            status: NodeStatus::Failed,
            exit_code,
            error: Some(format!("exit status {exit_code}")),
            no_retry: false,
        };
    }

    if let Some(output_key) = &step.output {
        capture_output(outcome, output_key, &stdout_path).await;
    }
    AttemptResult {
        status: NodeStatus::Success,
        exit_code: 0,
        error: None,
        no_retry: false,
    }
}

/// Capture file locations for one launch. The step may redirect either
/// stream; otherwise files land in the run's log dir, numbered per launch.
fn capture_paths(
    ctx: &RunContext,
    step: &Step,
    env: &VarEnv,
    launch_seq: u32,
) -> std::io::Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(&ctx.log_dir)?;
    let safe = sanitize(&step.name);
    let default_name = |ext: &str| {
        if launch_seq == 0 {
            ctx.log_dir.join(format!("{safe}.{ext}"))
        } else {
            ctx.log_dir.join(format!("{safe}.{ext}.{launch_seq}"))
        }
    };
    let resolve = |override_path: &Option<String>, ext: &str| match override_path {
        Some(raw) => {
            let p = PathBuf::from(env.expand(raw));
            if p.is_absolute() {
                p
            } else {
                step_dir(ctx, step, env).join(p)
            }
        }
        None => default_name(ext),
    };
    Ok((resolve(&step.stdout, "out"), resolve(&step.stderr, "err")))
}

fn open_capture_files(
    stdout_path: &PathBuf,
    stderr_path: &PathBuf,
) -> std::io::Result<(std::fs::File, std::fs::File)> {
    if let Some(parent) = stdout_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(parent) = stderr_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok((
        std::fs::File::create(stdout_path)?,
        std::fs::File::create(stderr_path)?,
    ))
}

fn step_dir(ctx: &RunContext, step: &Step, env: &VarEnv) -> PathBuf {
    match &step.dir {
        Some(dir) => {
            let p = PathBuf::from(env.expand(dir));
            if p.is_absolute() {
                p
            } else {
                ctx.config.step_work_dir(&ctx.dag.location).join(p)
            }
        }
        None => ctx.config.step_work_dir(&ctx.dag.location),
    }
}

/// Parse the captured stdout into the step's output variable: a JSON
/// document is stored whole (and stays deep-addressable); anything else
/// becomes the trimmed string.
async fn capture_output(outcome: &mut NodeOutcome, key: &str, stdout_path: &PathBuf) {
    let raw = match tokio::fs::read_to_string(stdout_path).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(%err, "could not read captured stdout for output variable");
            return;
        }
    };
    let trimmed = raw.trim();
    let value = serde_json::from_str::<serde_json::Value>(trimmed)
        .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()));
    outcome.output_variables.insert(key.to_string(), value);
}

async fn failure_swallowed(step: &Step, outcome: &NodeOutcome) -> bool {
    let co = &step.continue_on;
    if co.failure || co.exit_code.contains(&outcome.exit_code) {
        return true;
    }
    if !co.output.is_empty() && !outcome.stdout_path.is_empty() {
        if let Ok(text) = tokio::fs::read_to_string(&outcome.stdout_path).await {
            for pattern in &co.output {
                match match_pattern(pattern, &text) {
                    Ok(true) => return true,
                    Ok(false) => {}
                    Err(err) => warn!(%err, "bad continue-on output pattern"),
                }
            }
        }
    }
    false
}

/// Run a `call` step: a single inline sub-run, or a parallel fan-out over
/// `parallel.items` bounded by a semaphore.
async fn run_call(
    ctx: &Arc<RunContext>,
    step: &Step,
    env: &VarEnv,
    outcome: &mut NodeOutcome,
) -> AttemptResult {
    let target = step.call.clone().unwrap_or_default();
    // A fresh retry supersedes this node's previous sub-runs.
    let prior = std::mem::take(&mut outcome.sub_runs);
    outcome.sub_runs_repeated.extend(prior);

    match &step.parallel {
        None => {
            let request_id = uuid::Uuid::now_v7().to_string();
            let run_ref = RunRef {
                name: target.clone(),
                request_id: request_id.clone(),
            };
            outcome.sub_runs.push(run_ref);
            let call = SubDagCall {
                name: target,
                params: step.params.as_deref().map(|p| env.expand(p)),
                request_id,
                root: ctx.root.clone(),
            };
            let result = ctx.sub_runner.run_sub(call).await;
            sub_result_to_attempt(step, result, outcome)
        }
        Some(parallel) => {
            let semaphore = Arc::new(Semaphore::new(parallel.max_concurrent.max(1)));
            let mut join: JoinSet<(usize, Result<Status, AgentError>)> = JoinSet::new();

            for (i, item) in parallel.items.iter().enumerate() {
                let request_id = uuid::Uuid::now_v7().to_string();
                outcome.sub_runs.push(RunRef {
                    name: target.clone(),
                    request_id: request_id.clone(),
                });
                let call = SubDagCall {
                    name: target.clone(),
                    params: Some(env.expand(item)),
                    request_id,
                    root: ctx.root.clone(),
                };
                let semaphore = semaphore.clone();
                let runner = ctx.sub_runner.clone();
                join.spawn(async move {
                    // Closed only when the whole run aborts.
                    let _permit = semaphore.acquire_owned().await;
                    (i, runner.run_sub(call).await)
                });
            }

            let mut statuses: Vec<Option<RunStatus>> = vec![None; parallel.items.len()];
            let mut first_error: Option<String> = None;
            while let Some(joined) = join.join_next().await {
                match joined {
                    Ok((i, Ok(status))) => statuses[i] = Some(status.status),
                    Ok((i, Err(err))) => {
                        statuses[i] = Some(RunStatus::Failed);
                        first_error.get_or_insert(err.to_string());
                    }
                    Err(err) => {
                        first_error.get_or_insert(format!("sub-run task failed: {err}"));
                    }
                }
            }

            let failed = statuses
                .iter()
                .filter(|s| matches!(s, Some(RunStatus::Failed)))
                .count();
            let cancelled = statuses
                .iter()
                .filter(|s| matches!(s, Some(RunStatus::Cancelled)))
                .count();
            let partial = statuses
                .iter()
                .filter(|s| matches!(s, Some(RunStatus::PartialSuccess)))
                .count();

            if ctx.cancel.is_cancelled() && cancelled > 0 {
                return AttemptResult {
                    status: NodeStatus::Cancelled,
                    exit_code: -1,
                    error: Some("canceled".to_string()),
                    no_retry: true,
                };
            }
            if failed > 0 && !step.continue_on.failure {
                return AttemptResult {
                    status: NodeStatus::Failed,
                    exit_code: 1,
                    error: first_error
                        .or_else(|| Some(format!("{failed} of {} sub-runs failed", statuses.len()))),
                    no_retry: false,
                };
            }
            if failed > 0 || cancelled > 0 || partial > 0 {
                return AttemptResult {
                    status: NodeStatus::PartialSuccess,
                    exit_code: 0,
                    error: None,
                    no_retry: false,
                };
            }
            AttemptResult {
                status: NodeStatus::Success,
                exit_code: 0,
                error: None,
                no_retry: false,
            }
        }
    }
}

fn sub_result_to_attempt(
    step: &Step,
    result: Result<Status, AgentError>,
    outcome: &mut NodeOutcome,
) -> AttemptResult {
    match result {
        Ok(status) => match status.status {
            RunStatus::Success | RunStatus::PartialSuccess => {
                if let Some(output_key) = &step.output {
                    // A called DAG's observable result is the union of its
                    // nodes' output variables.
                    let mut merged = serde_json::Map::new();
                    for node in &status.nodes {
                        for (k, v) in &node.output_variables {
                            merged.insert(k.clone(), v.clone());
                        }
                    }
                    outcome
                        .output_variables
                        .insert(output_key.clone(), serde_json::Value::Object(merged));
                }
                AttemptResult {
                    status: if status.status == RunStatus::Success {
                        NodeStatus::Success
                    } else {
                        NodeStatus::PartialSuccess
                    },
                    exit_code: 0,
                    error: None,
                    no_retry: false,
                }
            }
            RunStatus::Cancelled => AttemptResult {
                status: NodeStatus::Cancelled,
                exit_code: -1,
                error: Some("sub-run canceled".to_string()),
                no_retry: true,
            },
            _ => AttemptResult {
                status: NodeStatus::Failed,
                exit_code: 1,
                error: Some(format!("sub-run finished with status {}", status.status_text)),
                no_retry: false,
            },
        },
        Err(err) => AttemptResult {
            status: NodeStatus::Failed,
            exit_code: -1,
            error: Some(err.to_string()),
            no_retry: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::{Condition, DagFile};
    use crate::status::RunRef;
    use chrono::FixedOffset;

    struct NoSubRuns;

    impl SubDagRunner for NoSubRuns {
        fn run_sub(&self, call: SubDagCall) -> BoxFuture<'static, Result<Status, AgentError>> {
            Box::pin(async move {
                let mut status = Status::default();
                status.request_id = call.request_id;
                status.set_status(RunStatus::Success);
                Ok(status)
            })
        }
    }

    fn test_ctx(home: &std::path::Path) -> Arc<RunContext> {
        let dag = Dag {
            name: "test".into(),
            location: home.join("test.yaml"),
            ..Default::default()
        };
        let config = Config {
            home: home.to_path_buf(),
            dags_dir: home.join("dags"),
            logs_dir: home.join("logs"),
            sock_dir: home.join("sock"),
            history_db: home.join("history.db"),
            work_dir: Some(home.to_path_buf()),
            tz_offset: None::<FixedOffset>,
        };
        let run_ref = RunRef {
            name: "test".into(),
            request_id: "req-1".into(),
        };
        Arc::new(RunContext {
            dag_file: DagFile {
                root: dag.clone(),
                locals: Vec::new(),
            },
            dag,
            config,
            root: run_ref.clone(),
            run_ref,
            log_dir: home.join("logs").join("run"),
            cancel: CancellationToken::new(),
            sub_runner: Arc::new(NoSubRuns),
        })
    }

    fn shell_step(name: &str, command: &str) -> Step {
        Step {
            name: name.into(),
            command: Some(command.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn successful_command_captures_stdout() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        let outcome = run_node(ctx, shell_step("a", "echo hi"), VarEnv::default()).await;
        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(outcome.exit_code, 0);
        let captured = std::fs::read_to_string(&outcome.stdout_path).unwrap();
        assert_eq!(captured, "hi\n");
    }

    #[tokio::test]
    async fn output_variable_prefers_json() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        let mut step = shell_step("j", r#"echo '{"rows": 2}'"#);
        step.output = Some("RESULT".into());
        let outcome = run_node(ctx.clone(), step, VarEnv::default()).await;
        assert_eq!(outcome.output_variables["RESULT"], serde_json::json!({"rows": 2}));

        let mut step = shell_step("s", "echo plain text");
        step.output = Some("RESULT".into());
        let outcome = run_node(ctx, step, VarEnv::default()).await;
        assert_eq!(
            outcome.output_variables["RESULT"],
            serde_json::json!("plain text")
        );
    }

    #[tokio::test]
    async fn retry_reruns_until_the_limit() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        // Fails on the first run, succeeds once the marker file exists.
        let marker = home.path().join("marker");
        let mut step = shell_step(
            "flaky",
            &format!("test -f {0} || (touch {0}; exit 1)", marker.display()),
        );
        step.retry_policy = Some(RetryPolicy {
            limit: 2,
            interval_sec: 0,
            exit_codes: Vec::new(),
        });
        let outcome = run_node(ctx, step, VarEnv::default()).await;
        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(outcome.retry_count, 1);
    }

    #[tokio::test]
    async fn retry_respects_exit_code_filter() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        let mut step = shell_step("nope", "exit 3");
        step.retry_policy = Some(RetryPolicy {
            limit: 5,
            interval_sec: 0,
            exit_codes: vec![7],
        });
        let outcome = run_node(ctx, step, VarEnv::default()).await;
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(outcome.retry_count, 0);
        assert_eq!(outcome.exit_code, 3);
    }

    #[tokio::test]
    async fn unmet_precondition_skips() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        let mut step = shell_step("gated", "echo never");
        step.preconditions = vec![Condition {
            condition: "`echo no`".into(),
            expected: "yes".into(),
        }];
        let outcome = run_node(ctx, step, VarEnv::default()).await;
        assert_eq!(outcome.status, NodeStatus::Skipped);
        assert!(outcome.error.unwrap().contains("condition unmet"));
    }

    #[tokio::test]
    async fn continue_on_exit_code_swallows_failure() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        let mut step = shell_step("tolerated", "exit 42");
        step.continue_on.exit_code = vec![42];
        let outcome = run_node(ctx, step, VarEnv::default()).await;
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert!(outcome.swallowed);
    }

    #[tokio::test]
    async fn continue_on_output_pattern_swallows_failure() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        let mut step = shell_step("warns", "echo 'known flake'; exit 1");
        step.continue_on.output = vec!["re:known.*flake".into()];
        let outcome = run_node(ctx, step, VarEnv::default()).await;
        assert!(outcome.swallowed);
    }

    #[tokio::test]
    async fn launch_failure_is_not_retried() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        let mut step = Step {
            name: "broken".into(),
            command: Some("/no/such/binary".into()),
            args: vec!["arg".into()],
            ..Default::default()
        };
        step.retry_policy = Some(RetryPolicy {
            limit: 3,
            interval_sec: 0,
            exit_codes: Vec::new(),
        });
        let outcome = run_node(ctx, step, VarEnv::default()).await;
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(outcome.retry_count, 0);
    }

    #[tokio::test]
    async fn cancellation_terminates_running_step() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        let cancel = ctx.cancel.clone();
        let handle = tokio::spawn(run_node(
            ctx,
            shell_step("long", "sleep 30"),
            VarEnv::default(),
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, NodeStatus::Cancelled);
    }

    #[tokio::test]
    async fn repeat_policy_reruns_after_success() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        let counter = home.path().join("count");
        let mut step = shell_step("again", &format!("echo x >> {}", counter.display()));
        step.repeat_policy = Some(crate::def::RepeatPolicy {
            repeat: true,
            interval_sec: 0,
            limit: 2,
        });
        let outcome = run_node(ctx, step, VarEnv::default()).await;
        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(outcome.repeat_count, 2);
        let lines = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(lines.lines().count(), 3);
    }

    #[tokio::test]
    async fn call_step_records_sub_run_reference() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        let step = Step {
            name: "fan".into(),
            call: Some("child".into()),
            ..Default::default()
        };
        let outcome = run_node(ctx, step, VarEnv::default()).await;
        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(outcome.sub_runs.len(), 1);
        assert_eq!(outcome.sub_runs[0].name, "child");
    }

    #[tokio::test]
    async fn parallel_call_fans_out_per_item() {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_ctx(home.path());
        let step = Step {
            name: "fan".into(),
            call: Some("child".into()),
            parallel: Some(crate::def::Parallel {
                items: vec!["X=1".into(), "X=2".into(), "X=3".into()],
                max_concurrent: 2,
            }),
            ..Default::default()
        };
        let outcome = run_node(ctx, step, VarEnv::default()).await;
        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(outcome.sub_runs.len(), 3);
    }
}
