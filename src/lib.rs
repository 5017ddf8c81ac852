// Module declarations for the dagrun library crate.
pub mod agent; // Run coordinator: binds a DAG to a request id and drives it
pub mod client; // Public façade used by the CLI and external UIs
pub mod config; // Home directory, env vars, path layout
pub mod def; // DAG and step definitions, YAML loading
pub mod errors; // thiserror taxonomy shared across subsystems
pub mod exec; // Executor capability trait + shell executor
pub mod expand; // Variable expansion and condition evaluation
pub mod flags; // Per-DAG suspension flags
pub mod graph; // Execution graph and readiness queries
pub mod node; // Mutable per-node execution state
pub mod runner; // Node runtime: retries, repeats, sub-DAG calls
pub mod scheduler; // Cooperative scheduling loop + lifecycle handlers
pub mod sock; // Per-run control-plane socket
pub mod spawn; // Detached child-process spawning
pub mod status; // Canonical status enums and snapshot codec
pub mod store; // Durable run history

pub use agent::Agent;
pub use client::DagClient;
pub use config::Config;
pub use def::{Dag, DagFile, Step};
pub use status::{NodeStatus, RunRef, RunStatus, Status};
