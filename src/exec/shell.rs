//! The shell executor: spawns the step as a child process in its own
//! process group so stop signals reach the whole tree.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use super::{ExecContext, ExecResult, Executor};
use crate::errors::ExecError;

pub struct ShellExecutor {
    child: Option<Child>,
    pid: Option<u32>,
}

impl ShellExecutor {
    pub fn new() -> ShellExecutor {
        ShellExecutor {
            child: None,
            pid: None,
        }
    }

    fn resolve_shell(ctx: &ExecContext) -> String {
        ctx.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "sh".to_string())
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        ShellExecutor::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn start(&mut self, ctx: ExecContext) -> Result<(), ExecError> {
        let mut cmd = if let Some(script) = &ctx.script {
            // Inline script: write it out and hand the file to the shell.
            let path = ctx
                .scratch_dir
                .join(format!("script-{}.sh", uuid::Uuid::now_v7()));
            std::fs::write(&path, script).map_err(ExecError::Launch)?;
            let mut c = Command::new(Self::resolve_shell(&ctx));
            c.arg(path);
            c
        } else if let Some(command) = &ctx.command {
            if ctx.args.is_empty() {
                // Bare command string: run through the shell so pipes and
                // redirects behave the way the YAML author expects.
                let mut c = Command::new(Self::resolve_shell(&ctx));
                c.arg("-c").arg(command);
                c
            } else {
                let mut c = Command::new(command);
                c.args(&ctx.args);
                c
            }
        } else {
            return Err(ExecError::Launch(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "step has neither command nor script",
            )));
        };

        cmd.current_dir(&ctx.dir);
        cmd.envs(&ctx.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(ctx.stdout));
        cmd.stderr(Stdio::from(ctx.stderr));
        cmd.kill_on_drop(true);

        // Own process group: group signals reach grandchildren too.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(ExecError::Launch)?;
        self.pid = child.id();
        debug!(pid = ?self.pid, "spawned step process");
        self.child = Some(child);
        Ok(())
    }

    async fn wait(&mut self) -> Result<ExecResult, ExecError> {
        let child = self.child.as_mut().ok_or(ExecError::NotStarted)?;
        let status = child.wait().await.map_err(ExecError::Wait)?;
        Ok(ExecResult {
            exit_code: exit_code_of(status),
        })
    }

    fn signal(&mut self, signal: i32) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            signal_process_group(pid, signal);
            return;
        }
        #[cfg(not(unix))]
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Send a signal to every process in a child's group.
///
/// The only `unsafe` in the crate; sound because `pid` comes from a
/// just-spawned child and negating it addresses its group per kill(2).
#[cfg(unix)]
fn signal_process_group(pid: u32, signal: i32) {
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}
