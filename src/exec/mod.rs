//! Pluggable step executors.
//!
//! An executor is the capability set `{start, wait, signal}`. Selection is
//! a closed dispatch on the step's `executor.type`; new executors extend
//! [`new_executor`] and the match arm set. The engine only ever talks to
//! the trait, so the node runtime is executor-agnostic.

mod shell;

pub use shell::ShellExecutor;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::ExecError;

/// Everything an executor needs to launch one attempt of a step.
pub struct ExecContext {
    /// Expanded command line (run through the shell unless `args` is set).
    pub command: Option<String>,
    /// Expanded argv; when non-empty, `command` is executed directly.
    pub args: Vec<String>,
    /// Expanded inline script body.
    pub script: Option<String>,
    /// Shell override for `command`/`script` execution.
    pub shell: Option<String>,
    /// Working directory.
    pub dir: PathBuf,
    /// Extra environment on top of the inherited process environment.
    pub env: BTreeMap<String, String>,
    /// Capture files, already opened by the node runtime.
    pub stdout: std::fs::File,
    pub stderr: std::fs::File,
    /// Directory for executor scratch files (inline scripts).
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecResult {
    pub exit_code: i32,
}

#[async_trait]
pub trait Executor: Send {
    /// Launch the step. Launch failures are non-retryable.
    async fn start(&mut self, ctx: ExecContext) -> Result<(), ExecError>;

    /// Block until the step finishes and return its exit code.
    async fn wait(&mut self) -> Result<ExecResult, ExecError>;

    /// Deliver a signal to the step (the whole process group on Unix).
    fn signal(&mut self, signal: i32);
}

/// Dispatch on the executor type. The default (empty) type is the shell.
pub fn new_executor(kind: &str) -> Result<Box<dyn Executor>, ExecError> {
    match kind {
        "" | "shell" | "command" => Ok(Box::new(ShellExecutor::new())),
        other => Err(ExecError::UnknownExecutor(other.to_string())),
    }
}

/// Map a signal name or number to its numeric value.
pub fn parse_signal(name: &str) -> Option<i32> {
    if let Ok(n) = name.parse::<i32>() {
        return Some(n);
    }
    let name = name.trim().to_ascii_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    match name {
        "HUP" => Some(1),
        "INT" => Some(2),
        "QUIT" => Some(3),
        "KILL" => Some(9),
        "USR1" => Some(10),
        "USR2" => Some(12),
        "TERM" => Some(15),
        "CONT" => Some(18),
        "STOP" => Some(19),
        _ => None,
    }
}

pub const SIGTERM: i32 = 15;
pub const SIGKILL: i32 = 9;
