use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use dagrun::agent::{Agent, AgentOptions};
use dagrun::client::DagClient;
use dagrun::config::Config;
use dagrun::def;
use dagrun::status::{NodeStatus, RunStatus, Status};
use dagrun::store::SqliteStore;

/// CLI entrypoint using `clap` to define subcommands.
#[derive(Parser)]
#[command(name = "dagrun", version, about = "Durable DAG workflow orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a DAG in the foreground (this process becomes the agent)
    Start {
        /// Parameter overrides, e.g. -p "ENV=prod 2024-01-01"
        #[arg(short = 'p', long)]
        params: Option<String>,
        /// Suppress per-step progress output
        #[arg(short = 'q', long)]
        quiet: bool,
        /// Use a caller-chosen request id instead of a generated one
        #[arg(long = "run-id")]
        run_id: Option<String>,
        /// Path to the DAG definition file
        location: PathBuf,
    },
    /// Stop the live run (if any), then execute the DAG afresh
    Restart {
        #[arg(short = 'q', long)]
        quiet: bool,
        location: PathBuf,
    },
    /// Re-run a previous request from its persisted snapshot
    Retry {
        #[arg(long = "request-id")]
        request_id: String,
        location: PathBuf,
    },
    /// Ask the live run to stop gracefully
    Stop { location: PathBuf },
    /// Show the latest status of a DAG
    Status { location: PathBuf },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let quiet = matches!(
        &cli.command,
        Commands::Start { quiet: true, .. } | Commands::Restart { quiet: true, .. }
    );
    init_logging(quiet);

    let config = Config::load();
    let code = match run(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("❌ {err:#}");
            1
        }
    };
    std::process::exit(code);
}

fn init_logging(quiet: bool) {
    // Logs go to stderr so stdout stays parseable by scripts and tests.
    let default_filter = if quiet { "dagrun=warn" } else { "dagrun=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands, config: Config) -> anyhow::Result<i32> {
    config.ensure_dirs()?;
    match command {
        Commands::Start {
            params,
            quiet,
            run_id,
            location,
        } => {
            run_agent(
                &config,
                &location,
                AgentOptions {
                    params: params.as_deref().map(unescape_params),
                    request_id: run_id,
                    ..Default::default()
                },
                quiet,
            )
            .await
        }
        Commands::Restart { quiet, location } => {
            let dag = def::load_file(&location)?;
            let client = DagClient::new(config.clone()).await?;
            client.stop_dag(&dag).await?;
            wait_until_stopped(&client, &dag).await;
            run_agent(&config, &location, AgentOptions::default(), quiet).await
        }
        Commands::Retry {
            request_id,
            location,
        } => {
            run_agent(
                &config,
                &location,
                AgentOptions {
                    request_id: Some(request_id),
                    retry: true,
                    ..Default::default()
                },
                false,
            )
            .await
        }
        Commands::Stop { location } => {
            let dag = def::load_file(&location)?;
            let client = DagClient::new(config).await?;
            client.stop_dag(&dag).await?;
            println!("🛑 Stop requested for '{}'", dag.root.name);
            Ok(0)
        }
        Commands::Status { location } => {
            let dag = def::load_file(&location)?;
            let client = DagClient::new(config).await?;
            let status = client.get_latest_status(&dag).await;
            print_status(&status);
            Ok(0)
        }
    }
}

/// Run this process as the agent for one DAG execution.
async fn run_agent(
    config: &Config,
    location: &Path,
    mut opts: AgentOptions,
    quiet: bool,
) -> anyhow::Result<i32> {
    let dag = def::load_file(location)?;
    let store = Arc::new(SqliteStore::open(&config.history_db).await?);

    // Terminal signals become a graceful cancel of the whole run.
    let cancel = CancellationToken::new();
    opts.cancel = Some(cancel.clone());
    spawn_signal_listener(cancel);

    let agent = Agent::new(config.clone(), dag, store);
    let status = agent.run(opts).await?;

    if !quiet {
        print_status(&status);
    }
    // A failed run is still a clean agent exit: failure is in the record.
    Ok(if status.status == RunStatus::Cancelled {
        130
    } else {
        0
    })
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("termination signal received; cancelling run");
        cancel.cancel();
    });
}

/// Poll until the old agent's socket disappears (bounded).
async fn wait_until_stopped(client: &DagClient, dag: &def::DagFile) {
    for _ in 0..60 {
        let status = client.get_current_status(dag).await;
        if status.status != RunStatus::Running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn unescape_params(raw: &str) -> String {
    raw.replace("\\n", "\n").replace("\\r", "\r")
}

fn print_status(status: &Status) {
    println!(
        "🎯 {} [{}] request-id={}",
        status.name, status.status_text, status.request_id
    );
    for node in &status.nodes {
        let marker = match node.status {
            NodeStatus::Success => "✅",
            NodeStatus::Failed => "❌",
            NodeStatus::Cancelled => "🛑",
            NodeStatus::Skipped => "⏭️",
            NodeStatus::Running => "▶️",
            NodeStatus::PartialSuccess => "🟡",
            NodeStatus::NotStarted | NodeStatus::Rejected => "•",
        };
        let detail = node
            .error
            .as_deref()
            .map(|e| format!(" ({e})"))
            .unwrap_or_default();
        println!("{marker} {} [{}]{detail}", node.step.name, node.status_text);
    }
}
