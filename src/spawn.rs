//! Detached child-process spawning for start/restart/retry.
//!
//! The client façade never runs a DAG in-process: it re-executes this
//! binary in a new process group so the agent outlives the caller and
//! never receives the caller's terminal signals.

use std::path::Path;
use std::process::{Command, Stdio};

/// Escape parameter strings for command-line transport: raw CR/LF become
/// the literal two-character sequences `\r`/`\n`.
pub fn escape_params(raw: &str) -> String {
    raw.replace('\r', "\\r").replace('\n', "\\n")
}

/// Spawn `dagrun <args…>` detached; returns the child's pid.
pub fn spawn_detached(args: &[String], work_dir: Option<&Path>) -> std::io::Result<u32> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = work_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let mut child = cmd.spawn()?;
    let pid = child.id();
    // Reap in the background so the child never lingers as a zombie while
    // this process stays alive.
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(pid)
}
