use std::path::Path;

use chrono::Utc;

use dagrun::client::{DagClient, ListOptions};
use dagrun::config::Config;
use dagrun::def;
use dagrun::errors::ClientError;
use dagrun::status::{NodeSnapshot, NodeStatus, RunStatus, Status};
use dagrun::store::HistoryStore;

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

fn write_dag(config: &Config, name: &str, contents: &str) -> std::path::PathBuf {
    std::fs::create_dir_all(&config.dags_dir).unwrap();
    let path = config.dags_dir.join(format!("{name}.yaml"));
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn latest_status_defaults_when_no_history() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "fresh",
        "name: fresh\nsteps:\n  - name: a\n    command: echo hi\n",
    );
    let client = DagClient::new(config).await.unwrap();
    let dag = def::load_file(&path).unwrap();

    let status = client.get_latest_status(&dag).await;
    assert_eq!(status.status, RunStatus::NotStarted);
    assert_eq!(status.nodes.len(), 1);
    assert_eq!(status.nodes[0].status, NodeStatus::NotStarted);
    assert!(status.request_id.is_empty());
}

#[tokio::test]
async fn vanished_running_snapshot_is_demoted() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "crashy",
        "name: crashy\nsteps:\n  - name: a\n    command: echo hi\n",
    );
    let client = DagClient::new(config).await.unwrap();
    let dag = def::load_file(&path).unwrap();

    // Simulate a run whose agent vanished while the record said Running.
    let attempt = client
        .store()
        .open_attempt("crashy", "dead-req", None, Utc::now())
        .await
        .unwrap();
    let mut stale = Status::default();
    stale.name = "crashy".into();
    stale.request_id = "dead-req".into();
    stale.set_status(RunStatus::Running);
    stale.started_at = Some(Utc::now());
    let mut node = NodeSnapshot::default();
    node.set_status(NodeStatus::Running);
    node.started_at = Some(Utc::now());
    stale.nodes.push(node);
    attempt.write(&stale).await.unwrap();
    attempt.close(Utc::now()).await.unwrap();

    // No live socket exists, so the snapshot is normalized to Failed.
    let status = client.get_latest_status(&dag).await;
    assert_eq!(status.status, RunStatus::Failed);
    assert_eq!(status.nodes[0].status, NodeStatus::Failed);

    let by_id = client
        .get_status_by_request_id(&dag, "dead-req")
        .await
        .unwrap();
    assert_eq!(by_id.status, RunStatus::Failed);
}

#[tokio::test]
async fn update_status_persists_an_override() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "fixable",
        "name: fixable\nsteps:\n  - name: a\n    command: echo hi\n",
    );
    let client = DagClient::new(config).await.unwrap();
    let dag = def::load_file(&path).unwrap();

    let attempt = client
        .store()
        .open_attempt("fixable", "req-9", None, Utc::now())
        .await
        .unwrap();
    let mut failed = Status::default();
    failed.name = "fixable".into();
    failed.request_id = "req-9".into();
    failed.set_status(RunStatus::Failed);
    let mut node = NodeSnapshot::default();
    node.set_status(NodeStatus::Failed);
    failed.nodes.push(node);
    attempt.write(&failed).await.unwrap();
    attempt.close(Utc::now()).await.unwrap();

    // Operator override: mark the node Rejected and the run Cancelled.
    let mut patched = failed.clone();
    patched.set_status(RunStatus::Cancelled);
    patched.nodes[0].set_status(NodeStatus::Rejected);
    client.update_status(&dag, &patched).await.unwrap();

    let read = client
        .get_status_by_request_id(&dag, "req-9")
        .await
        .unwrap();
    assert_eq!(read.status, RunStatus::Cancelled);
    assert_eq!(read.nodes[0].status, NodeStatus::Rejected);
}

#[tokio::test]
async fn stop_without_live_run_is_a_noop() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "idle",
        "name: idle\nsteps:\n  - name: a\n    command: echo hi\n",
    );
    let client = DagClient::new(config).await.unwrap();
    let dag = def::load_file(&path).unwrap();
    client.stop_dag(&dag).await.unwrap();
}

#[tokio::test]
async fn listing_includes_broken_definitions() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    write_dag(
        &config,
        "alpha",
        "name: alpha\ntags: [etl, nightly]\nsteps:\n  - name: a\n    command: echo hi\n",
    );
    write_dag(
        &config,
        "beta",
        "name: beta\nsteps:\n  - name: b\n    command: echo hi\n",
    );
    write_dag(&config, "broken", "steps: [:::not yaml\n");
    let client = DagClient::new(config).await.unwrap();

    let listing = client.list_runs(ListOptions::default()).await.unwrap();
    assert_eq!(listing.total, 3);

    let broken = listing
        .entries
        .iter()
        .find(|e| e.name == "broken")
        .expect("broken dag should still be listed");
    assert!(broken.error.is_some());
    assert!(broken.dag.is_none());

    let alpha = listing.entries.iter().find(|e| e.name == "alpha").unwrap();
    assert!(alpha.error.is_none());
    assert_eq!(alpha.latest.status, RunStatus::NotStarted);
}

#[tokio::test]
async fn listing_filters_by_name_and_tag() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    write_dag(
        &config,
        "etl-daily",
        "name: etl-daily\ntags: [etl]\nsteps:\n  - name: a\n    command: echo hi\n",
    );
    write_dag(
        &config,
        "report",
        "name: report\ntags: [reporting]\nsteps:\n  - name: a\n    command: echo hi\n",
    );
    let client = DagClient::new(config).await.unwrap();

    let by_name = client
        .list_runs(ListOptions {
            name_filter: Some("etl".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_name.total, 1);
    assert_eq!(by_name.entries[0].name, "etl-daily");

    let by_tag = client
        .list_runs(ListOptions {
            tag_filter: Some("reporting".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_tag.total, 1);
    assert_eq!(by_tag.entries[0].name, "report");
}

#[tokio::test]
async fn listing_reports_suspension() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    write_dag(
        &config,
        "paused",
        "name: paused\nsteps:\n  - name: a\n    command: echo hi\n",
    );
    let client = DagClient::new(config).await.unwrap();

    client.flags().toggle_suspend("paused", true).await.unwrap();
    let listing = client.list_runs(ListOptions::default()).await.unwrap();
    assert!(listing.entries[0].suspended);

    client
        .flags()
        .toggle_suspend("paused", false)
        .await
        .unwrap();
    let listing = client.list_runs(ListOptions::default()).await.unwrap();
    assert!(!listing.entries[0].suspended);
}

#[tokio::test]
async fn pagination_bounds_the_listing() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    for i in 0..5 {
        write_dag(
            &config,
            &format!("dag-{i}"),
            &format!("name: dag-{i}\nsteps:\n  - name: a\n    command: echo hi\n"),
        );
    }
    let client = DagClient::new(config).await.unwrap();

    let page1 = client
        .list_runs(ListOptions {
            limit: 2,
            page: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page1.total, 5);
    assert_eq!(page1.pages, 3);
    assert_eq!(page1.entries.len(), 2);

    let page3 = client
        .list_runs(ListOptions {
            limit: 2,
            page: 3,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page3.entries.len(), 1);
}

#[tokio::test]
async fn update_status_for_unknown_request_fails() {
    let home = tempfile::tempdir().unwrap();
    let config = test_config(home.path());
    let path = write_dag(
        &config,
        "empty",
        "name: empty\nsteps:\n  - name: a\n    command: echo hi\n",
    );
    let client = DagClient::new(config).await.unwrap();
    let dag = def::load_file(&path).unwrap();

    let mut status = Status::default();
    status.name = "empty".into();
    status.request_id = "never-ran".into();
    let err = client.update_status(&dag, &status).await.unwrap_err();
    assert!(matches!(err, ClientError::Store(_)));
}
