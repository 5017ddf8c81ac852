//! The in-run socket server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::StatusSource;

/// Cap on the request head; the protocol has no bodies worth reading.
const MAX_REQUEST: usize = 8 * 1024;

pub struct SockServer {
    listener: UnixListener,
    path: PathBuf,
}

impl SockServer {
    /// Bind the listener. Fails with `AddrInUse` when the file exists; the
    /// agent decides whether that means AlreadyRunning or a stale socket.
    pub fn bind(path: &Path) -> std::io::Result<SockServer> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        Ok(SockServer {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve until `shutdown` fires, then unlink the socket file. `stop`
    /// is cancelled when a `POST /stop` arrives (idempotent).
    pub async fn serve(
        self,
        source: Arc<dyn StatusSource>,
        stop: CancellationToken,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let source = source.clone();
                        let stop = stop.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle(stream, source, stop).await {
                                debug!(%err, "control socket connection error");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(%err, "control socket accept failed");
                        break;
                    }
                },
            }
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle(
    mut stream: UnixStream,
    source: Arc<dyn StatusSource>,
    stop: CancellationToken,
) -> std::io::Result<()> {
    let head = read_head(&mut stream).await?;
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();

    let (code, reason, body) = match (method, target) {
        ("GET", "/status") => {
            let status = source.current();
            match serde_json::to_string(&status) {
                Ok(json) => (200, "OK", json),
                Err(err) => (500, "Internal Server Error", err.to_string()),
            }
        }
        ("POST", "/stop") => {
            // Repeated stops after the first are no-ops.
            stop.cancel();
            (200, "OK", String::new())
        }
        _ => (404, "Not Found", String::new()),
    };

    let response = format!(
        "HTTP/1.0 {code} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Read up to the blank line terminating the request head.
async fn read_head(stream: &mut UnixStream) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= MAX_REQUEST {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
