use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dagrun::agent::{Agent, AgentOptions};
use dagrun::config::Config;
use dagrun::def;
use dagrun::errors::AgentError;
use dagrun::sock;
use dagrun::status::{NodeStatus, RunRef, RunStatus};
use dagrun::store::{HistoryStore, SqliteStore};

fn test_config(home: &Path) -> Config {
    Config {
        home: home.to_path_buf(),
        dags_dir: home.join("dags"),
        logs_dir: home.join("logs"),
        sock_dir: home.join("sock"),
        history_db: home.join("history.db"),
        work_dir: Some(home.to_path_buf()),
        tz_offset: None,
    }
}

/// Helper: write a DAG file under the home's dags dir.
fn write_dag(config: &Config, name: &str, contents: &str) -> PathBuf {
    std::fs::create_dir_all(&config.dags_dir).unwrap();
    let path = config.dags_dir.join(format!("{name}.yaml"));
    std::fs::write(&path, contents).unwrap();
    path
}

async fn new_agent(config: &Config, dag_path: &Path) -> (Agent, Arc<SqliteStore>) {
    config.ensure_dirs().unwrap();
    let dag = def::load_file(dag_path).unwrap();
    let store = Arc::new(SqliteStore::open(&config.history_db).await.unwrap());
    (Agent::new(config.clone(), dag, store.clone()), store)
}

#[tokio::test]
async fn simple_run_persists_a_success_snapshot() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "hello",
        "name: hello\nsteps:\n  - name: a\n    command: echo hi\n",
    );

    let (agent, store) = new_agent(&config, &path).await;
    let status = agent.run(AgentOptions::default()).await.unwrap();

    assert_eq!(status.status, RunStatus::Success);
    assert_eq!(status.nodes.len(), 1);
    assert_eq!(status.nodes[0].status, NodeStatus::Success);
    assert!(status.nodes[0].output_variables.is_empty());
    let stdout = std::fs::read_to_string(&status.nodes[0].stdout).unwrap();
    assert_eq!(stdout, "hi\n");

    // The persisted record matches what the agent returned.
    let persisted = store
        .find_by_request_id("hello", &status.request_id)
        .await
        .unwrap();
    assert_eq!(persisted.status, RunStatus::Success);
    assert_eq!(persisted.nodes[0].status, NodeStatus::Success);
    assert!(persisted.finished_at.is_some());
}

#[tokio::test]
async fn graph_validation_failure_is_recorded() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "cyclic",
        "name: cyclic\nsteps:\n  - name: a\n    command: 'true'\n    depends: [b]\n  - name: b\n    command: 'true'\n    depends: [a]\n",
    );

    let (agent, store) = new_agent(&config, &path).await;
    let err = agent
        .run(AgentOptions {
            request_id: Some("cyclic-req".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Graph(_)));

    // A Failed snapshot exists so the UI can explain why nothing ran.
    let persisted = store
        .find_by_request_id("cyclic", "cyclic-req")
        .await
        .unwrap();
    assert_eq!(persisted.status, RunStatus::Failed);
}

#[tokio::test]
async fn control_socket_serves_status_and_stop() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "long",
        "name: long\nsteps:\n  - name: wait\n    command: sleep 30\n",
    );

    let (agent, _store) = new_agent(&config, &path).await;
    let dag = def::load_file(&path).unwrap();
    let sock_path = sock::run_sock_path(&config, &sock::dag_key(&dag.root), "stop-req");

    let started = Instant::now();
    let handle = tokio::spawn(agent.run(AgentOptions {
        request_id: Some("stop-req".into()),
        ..Default::default()
    }));

    // The socket file is the liveness proof; wait for it, then query it.
    for _ in 0..100 {
        if sock_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(sock_path.exists(), "socket file should appear");

    let live = sock::get_status(&sock_path).await.unwrap();
    assert_eq!(live.request_id, "stop-req");
    assert_eq!(live.status, RunStatus::Running);
    assert_eq!(live.nodes.len(), 1);
    assert!(live.pid > 0);

    sock::post_stop(&sock_path).await.unwrap();
    // Repeated stop is a no-op, not an error.
    sock::post_stop(&sock_path).await.unwrap();

    let status = handle.await.unwrap().unwrap();
    assert_eq!(status.status, RunStatus::Cancelled);
    assert_eq!(status.nodes[0].status, NodeStatus::Cancelled);
    // SIGTERM + 5s grace bound, far below the 30s sleep.
    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(!sock_path.exists(), "socket is removed on agent exit");
}

#[tokio::test]
async fn second_agent_for_same_request_is_refused() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "excl",
        "name: excl\nsteps:\n  - name: wait\n    command: sleep 10\n",
    );

    let (agent, _) = new_agent(&config, &path).await;
    let dag = def::load_file(&path).unwrap();
    let sock_path = sock::run_sock_path(&config, &sock::dag_key(&dag.root), "only-one");

    let handle = tokio::spawn(agent.run(AgentOptions {
        request_id: Some("only-one".into()),
        ..Default::default()
    }));
    for _ in 0..100 {
        if sock_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (second, _) = new_agent(&config, &path).await;
    let err = second
        .run(AgentOptions {
            request_id: Some("only-one".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::AlreadyRunning { .. }));

    sock::post_stop(&sock_path).await.unwrap();
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn retry_walks_only_failed_nodes() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let count_file = home.path().join("a_count");
    let gate_file = home.path().join("gate");
    let path = write_dag(
        &config,
        "retryable",
        &format!(
            "name: retryable\nsteps:\n  - name: a\n    command: echo x >> {count}\n  - name: b\n    command: test -f {gate}\n    depends: [a]\n",
            count = count_file.display(),
            gate = gate_file.display(),
        ),
    );

    let (agent, _) = new_agent(&config, &path).await;
    let first = agent
        .run(AgentOptions {
            request_id: Some("retry-req".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Failed);
    assert_eq!(first.nodes[0].status, NodeStatus::Success);
    assert_eq!(first.nodes[1].status, NodeStatus::Failed);

    // Unblock step b, then retry the same request id.
    std::fs::write(&gate_file, b"").unwrap();
    let (agent, _) = new_agent(&config, &path).await;
    let second = agent
        .run(AgentOptions {
            request_id: Some("retry-req".into()),
            retry: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.nodes[1].status, NodeStatus::Success);

    // Step a ran exactly once across both attempts.
    let runs = std::fs::read_to_string(&count_file).unwrap();
    assert_eq!(runs.lines().count(), 1, "successful node must not re-run");
}

#[tokio::test]
async fn call_step_runs_local_sub_dag_inline() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "parent",
        "name: parent\nsteps:\n  - name: fan\n    call: child\n    params: \"X=7\"\n---\nname: child\nsteps:\n  - name: work\n    command: echo got $X\n    output: GOT\n",
    );

    let (agent, store) = new_agent(&config, &path).await;
    let status = agent.run(AgentOptions::default()).await.unwrap();
    assert_eq!(status.status, RunStatus::Success);

    let fan = &status.nodes[0];
    assert_eq!(fan.status, NodeStatus::Success);
    assert_eq!(fan.sub_runs.len(), 1);
    assert_eq!(status.sub_run_refs.len(), 1);

    // The sub-run is persisted under this run's root.
    let root = RunRef {
        name: "parent".into(),
        request_id: status.request_id.clone(),
    };
    let sub = store
        .find_sub_attempt(&root, &fan.sub_runs[0].request_id)
        .await
        .unwrap();
    assert_eq!(sub.status, RunStatus::Success);
    assert_eq!(sub.root_ref.as_ref().unwrap().request_id, status.request_id);
    assert_eq!(
        sub.nodes[0].output_variables["GOT"],
        serde_json::json!("got 7")
    );
}

#[tokio::test]
async fn parallel_call_persists_every_sub_run() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "fanout",
        "name: fanout\nsteps:\n  - name: fan\n    call: child\n    parallel:\n      items: [\"X=1\", \"X=2\", \"X=3\"]\n      maxConcurrent: 2\n---\nname: child\nsteps:\n  - name: work\n    command: echo $X\n",
    );

    let (agent, store) = new_agent(&config, &path).await;
    let status = agent.run(AgentOptions::default()).await.unwrap();
    assert_eq!(status.status, RunStatus::Success);

    let fan = &status.nodes[0];
    assert_eq!(fan.sub_runs.len(), 3);
    let root = RunRef {
        name: "fanout".into(),
        request_id: status.request_id.clone(),
    };
    for sub_ref in &fan.sub_runs {
        let sub = store
            .find_sub_attempt(&root, &sub_ref.request_id)
            .await
            .unwrap();
        assert_eq!(sub.status, RunStatus::Success);
    }
}

#[tokio::test]
async fn update_status_is_refused_for_the_live_request() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "busy",
        "name: busy\nsteps:\n  - name: wait\n    command: sleep 10\n",
    );

    let (agent, _) = new_agent(&config, &path).await;
    let dag = def::load_file(&path).unwrap();
    let sock_path = sock::run_sock_path(&config, &sock::dag_key(&dag.root), "busy-req");

    let handle = tokio::spawn(agent.run(AgentOptions {
        request_id: Some("busy-req".into()),
        ..Default::default()
    }));
    for _ in 0..100 {
        if sock_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let client = dagrun::client::DagClient::new(config.clone()).await.unwrap();
    let mut override_status = dagrun::status::Status::default();
    override_status.name = "busy".into();
    override_status.request_id = "busy-req".into();
    override_status.set_status(RunStatus::Failed);
    let err = client.update_status(&dag, &override_status).await.unwrap_err();
    assert!(matches!(err, dagrun::errors::ClientError::DagIsRunning));

    sock::post_stop(&sock_path).await.unwrap();
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn run_preconditions_gate_the_whole_run() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "gated",
        "name: gated\npreconditions:\n  - condition: \"`echo no`\"\n    expected: \"yes\"\nsteps:\n  - name: a\n    command: echo never\n",
    );

    let (agent, _) = new_agent(&config, &path).await;
    let status = agent.run(AgentOptions::default()).await.unwrap();
    assert_eq!(status.status, RunStatus::Cancelled);
    assert_eq!(status.nodes[0].status, NodeStatus::NotStarted);
}
