//! Client side of the control-plane protocol.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::warn;

use crate::errors::SockError;
use crate::status::Status;

/// Default round-trip deadline, enforced by the caller.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Fetch the live snapshot from a run's control socket.
pub async fn get_status(path: &Path) -> Result<Status, SockError> {
    let (code, body) = roundtrip(path, "GET", "/status").await?;
    if code != 200 {
        return Err(SockError::BadResponse(code));
    }
    Status::from_json(&body).map_err(|_| SockError::BadRequest)
}

/// Request a graceful stop. Idempotent: repeating it after cancellation
/// has begun is a no-op on the agent side.
pub async fn post_stop(path: &Path) -> Result<(), SockError> {
    let (code, _) = roundtrip(path, "POST", "/stop").await?;
    if code != 200 {
        return Err(SockError::BadResponse(code));
    }
    Ok(())
}

async fn roundtrip(path: &Path, method: &str, target: &str) -> Result<(u16, String), SockError> {
    if !path.exists() {
        return Err(SockError::NotRunning);
    }

    let io = async {
        let mut stream = match UnixStream::connect(path).await {
            Ok(stream) => stream,
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                // Stale socket: nobody is listening. Collect the garbage so
                // the liveness signal stays truthful.
                warn!(path = %path.display(), "garbage-collecting stale control socket");
                let _ = std::fs::remove_file(path);
                return Err(SockError::NotRunning);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SockError::NotRunning);
            }
            Err(err) => return Err(SockError::Io(err)),
        };

        let request =
            format!("{method} {target} HTTP/1.0\r\nHost: dagrun\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    };

    let raw = match tokio::time::timeout(CLIENT_TIMEOUT, io).await {
        Ok(result) => result?,
        Err(_) => return Err(SockError::Timeout),
    };

    parse_response(&raw)
}

fn parse_response(raw: &str) -> Result<(u16, String), SockError> {
    let (head, body) = raw
        .split_once("\r\n\r\n")
        .ok_or(SockError::BadRequest)?;
    let status_line = head.lines().next().ok_or(SockError::BadRequest)?;
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or(SockError::BadRequest)?;
    Ok((code, body.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_http_responses() {
        let raw = "HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        assert_eq!(parse_response(raw).unwrap(), (200, "hi".to_string()));

        let raw = "HTTP/1.0 404 Not Found\r\n\r\n";
        assert_eq!(parse_response(raw).unwrap().0, 404);

        assert!(parse_response("garbage").is_err());
    }

    #[tokio::test]
    async fn missing_socket_reports_not_running() {
        let err = get_status(Path::new("/nonexistent/run.sock"))
            .await
            .unwrap_err();
        assert!(matches!(err, SockError::NotRunning));
    }

    #[tokio::test]
    async fn stale_socket_is_garbage_collected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        // A bound-then-dropped listener leaves a refusing socket file.
        {
            let _listener = tokio::net::UnixListener::bind(&path).unwrap();
        }
        assert!(path.exists());
        let err = post_stop(&path).await.unwrap_err();
        assert!(matches!(err, SockError::NotRunning));
        assert!(!path.exists(), "stale socket file should be removed");
    }
}
