//! The DAG client façade: the public operations UIs and the CLI invoke.
//!
//! The façade holds no run state. Start/restart/retry spawn a detached
//! child of this binary which becomes the agent; stop and status go
//! through the control socket; history goes through the run store.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Config;
use crate::def::{self, DagFile};
use crate::errors::{ClientError, SockError, StoreError};
use crate::flags::FlagStore;
use crate::sock;
use crate::spawn::{escape_params, spawn_detached};
use crate::status::{RunStatus, Status};
use crate::store::{HistoryStore, SqliteStore};

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub params: Option<String>,
    pub quiet: bool,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub limit: usize,
    pub page: usize,
    pub name_filter: Option<String>,
    pub tag_filter: Option<String>,
}

impl Default for ListOptions {
    fn default() -> Self {
        ListOptions {
            limit: 50,
            page: 1,
            name_filter: None,
            tag_filter: None,
        }
    }
}

/// One row of the listing: the DAG, its latest status, its suspension
/// flag, and any definition error (so the UI can show "this DAG is
/// broken" independent of the last run's outcome).
#[derive(Debug)]
pub struct DagEntry {
    pub name: String,
    pub dag: Option<DagFile>,
    pub latest: Status,
    pub suspended: bool,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct DagListing {
    pub entries: Vec<DagEntry>,
    pub total: usize,
    pub pages: usize,
}

pub struct DagClient {
    config: Config,
    store: Arc<SqliteStore>,
    flags: FlagStore,
}

impl DagClient {
    pub async fn new(config: Config) -> Result<DagClient, ClientError> {
        config.ensure_dirs()?;
        let store = Arc::new(SqliteStore::open(&config.history_db).await?);
        let flags = FlagStore::new(&store);
        Ok(DagClient {
            config,
            store,
            flags,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<SqliteStore> {
        self.store.clone()
    }

    pub fn flags(&self) -> &FlagStore {
        &self.flags
    }

    /// Spawn a detached agent for this DAG. The child is authoritative
    /// from here on; this call holds no resources.
    pub fn start_dag(&self, dag: &DagFile, opts: StartOptions) -> Result<u32, ClientError> {
        let mut args = vec!["start".to_string()];
        if let Some(params) = &opts.params {
            args.push("-p".to_string());
            args.push(escape_params(params));
        }
        if opts.quiet {
            args.push("-q".to_string());
        }
        if let Some(request_id) = &opts.request_id {
            args.push("--run-id".to_string());
            args.push(request_id.clone());
        }
        args.push(dag.root.location.to_string_lossy().into_owned());
        let pid = spawn_detached(&args, self.config.work_dir.as_deref())?;
        info!(dag = %dag.root.name, pid, "spawned start agent");
        Ok(pid)
    }

    /// Stop the current run (if any), then spawn a fresh one.
    pub async fn restart_dag(&self, dag: &DagFile, quiet: bool) -> Result<u32, ClientError> {
        self.stop_dag(dag).await?;
        let mut args = vec!["restart".to_string()];
        if quiet {
            args.push("-q".to_string());
        }
        args.push(dag.root.location.to_string_lossy().into_owned());
        let pid = spawn_detached(&args, self.config.work_dir.as_deref())?;
        info!(dag = %dag.root.name, pid, "spawned restart agent");
        Ok(pid)
    }

    /// Spawn an agent that rebuilds from the persisted snapshot.
    pub fn retry_dag(&self, dag: &DagFile, request_id: &str) -> Result<u32, ClientError> {
        let args = vec![
            "retry".to_string(),
            format!("--request-id={request_id}"),
            dag.root.location.to_string_lossy().into_owned(),
        ];
        let pid = spawn_detached(&args, self.config.work_dir.as_deref())?;
        info!(dag = %dag.root.name, %request_id, pid, "spawned retry agent");
        Ok(pid)
    }

    /// Graceful stop via the control socket; a no-op when nothing is live.
    pub async fn stop_dag(&self, dag: &DagFile) -> Result<(), ClientError> {
        let key = sock::dag_key(&dag.root);
        match sock::find_live_sock(&self.config, &key) {
            Some(path) => match sock::post_stop(&path).await {
                Ok(()) | Err(SockError::NotRunning) => Ok(()),
                Err(err) => Err(err.into()),
            },
            None => Ok(()),
        }
    }

    /// Live snapshot from the socket, or the default snapshot when the
    /// DAG is not running.
    pub async fn get_current_status(&self, dag: &DagFile) -> Status {
        match self.live_status(dag).await {
            Some(status) => status,
            None => Status::initial(&dag.root),
        }
    }

    /// Persisted snapshot for a request id. If a live run exists under a
    /// *different* request id, the fetched snapshot's running nodes are
    /// demoted to Failed: the prior run was superseded.
    pub async fn get_status_by_request_id(
        &self,
        dag: &DagFile,
        request_id: &str,
    ) -> Result<Status, ClientError> {
        let mut status = self
            .store
            .find_by_request_id(&dag.root.name, request_id)
            .await?;
        match self.live_status(dag).await {
            Some(live) if live.request_id == request_id => Ok(live),
            Some(_) | None => {
                status.mark_error_if_running();
                Ok(status)
            }
        }
    }

    /// Live status if running, else most recent persisted, else default.
    pub async fn get_latest_status(&self, dag: &DagFile) -> Status {
        if let Some(live) = self.live_status(dag).await {
            return live;
        }
        match self.store.latest(&dag.root.name).await {
            Ok(mut status) => {
                let was_running = status.status == RunStatus::Running;
                status.mark_error_if_running();
                if was_running {
                    // The recorded run's process is gone; persist the
                    // correction so the history stops lying.
                    let _ = self
                        .store
                        .update(&dag.root.name, &status.request_id.clone(), &status)
                        .await;
                }
                status
            }
            Err(StoreError::NoStatusData(_)) => Status::initial(&dag.root),
            Err(err) => {
                debug!(%err, "history lookup failed; returning default status");
                Status::initial(&dag.root)
            }
        }
    }

    /// Last `n` persisted top-level runs, newest first.
    pub async fn get_recent_history(&self, dag: &DagFile, n: usize) -> Vec<Status> {
        self.store
            .recent(&dag.root.name, n)
            .await
            .unwrap_or_default()
    }

    /// Persist an operator-supplied snapshot. Refused while the same
    /// request id is live. A socket timeout propagates (the run may be
    /// alive but wedged); connection-refused means "not running" and the
    /// update proceeds.
    pub async fn update_status(&self, dag: &DagFile, status: &Status) -> Result<(), ClientError> {
        let key = sock::dag_key(&dag.root);
        if let Some(path) = sock::find_live_sock(&self.config, &key) {
            match sock::get_status(&path).await {
                Ok(live) if live.request_id == status.request_id => {
                    return Err(ClientError::DagIsRunning);
                }
                Ok(_) | Err(SockError::NotRunning) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.store
            .update(&dag.root.name, &status.request_id, status)
            .await?;
        Ok(())
    }

    /// Paginated listing over the DAG definition directory.
    pub async fn list_runs(&self, opts: ListOptions) -> Result<DagListing, ClientError> {
        let mut files: Vec<std::path::PathBuf> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.config.dags_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                if matches!(ext, "yaml" | "yml") {
                    files.push(path);
                }
            }
        }
        files.sort();

        let mut entries = Vec::new();
        for path in files {
            let entry = self.list_entry(&path).await;
            if let Some(filter) = &opts.name_filter {
                if !entry.name.contains(filter.as_str()) {
                    continue;
                }
            }
            if let Some(tag) = &opts.tag_filter {
                let tags = entry
                    .dag
                    .as_ref()
                    .map(|d| d.root.tags.clone())
                    .unwrap_or_default();
                if !tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            entries.push(entry);
        }

        let total = entries.len();
        let limit = opts.limit.max(1);
        let pages = total.div_ceil(limit).max(1);
        let page = opts.page.max(1);
        let entries = entries
            .into_iter()
            .skip((page - 1) * limit)
            .take(limit)
            .collect();
        Ok(DagListing {
            entries,
            total,
            pages,
        })
    }

    async fn list_entry(&self, path: &Path) -> DagEntry {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        match def::load_file(path) {
            Ok(dag) => {
                let latest = self.get_latest_status(&dag).await;
                let suspended = self
                    .flags
                    .is_suspended(&dag.root.name)
                    .await
                    .unwrap_or(false);
                DagEntry {
                    name: dag.root.name.clone(),
                    dag: Some(dag),
                    latest,
                    suspended,
                    error: None,
                }
            }
            Err(err) => DagEntry {
                // A broken definition still gets listed, with its error.
                latest: Status::default(),
                suspended: self.flags.is_suspended(&name).await.unwrap_or(false),
                dag: None,
                error: Some(err.to_string()),
                name,
            },
        }
    }

    async fn live_status(&self, dag: &DagFile) -> Option<Status> {
        let key = sock::dag_key(&dag.root);
        let path = sock::find_live_sock(&self.config, &key)?;
        sock::get_status(&path).await.ok()
    }
}
