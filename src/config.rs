use std::env;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, Utc};

/// Resolved path layout and environment settings for one dagrun process.
///
/// Everything lives under a single home directory so tests can isolate a
/// whole orchestrator by pointing `DAGRUN_HOME` at a temp dir.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory (`$DAGRUN_HOME`, default `~/.dagrun`).
    pub home: PathBuf,
    /// Where DAG definition files live (`<home>/dags`).
    pub dags_dir: PathBuf,
    /// Root of per-run log directories (`<home>/logs`).
    pub logs_dir: PathBuf,
    /// Where control sockets are created (`<home>/sock`).
    ///
    /// Kept under the home rather than the system temp dir so the 108-byte
    /// socket path cap is predictable and tests never collide.
    pub sock_dir: PathBuf,
    /// SQLite database holding run history and suspension flags.
    pub history_db: PathBuf,
    /// Working directory for spawned agents; defaults to the DAG file's dir.
    pub work_dir: Option<PathBuf>,
    /// Timestamp offset from `DAGRUN_TZ`, used for log-path date stamps.
    pub tz_offset: Option<FixedOffset>,
}

impl Config {
    /// Resolve configuration from the environment.
    pub fn load() -> Self {
        let home = env::var_os("DAGRUN_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".dagrun")
            });

        let tz_offset = env::var("DAGRUN_TZ").ok().and_then(|tz| parse_tz(&tz));

        Config {
            dags_dir: home.join("dags"),
            logs_dir: home.join("logs"),
            sock_dir: home.join("sock"),
            history_db: home.join("history.db"),
            work_dir: env::var_os("DAGRUN_WORK_DIR").map(PathBuf::from),
            tz_offset,
            home,
        }
    }

    /// Create the directory tree if missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home)?;
        std::fs::create_dir_all(&self.dags_dir)?;
        std::fs::create_dir_all(&self.logs_dir)?;
        std::fs::create_dir_all(&self.sock_dir)?;
        Ok(())
    }

    /// Log directory for one run: `<logs>/<dag>/<yyyymmdd>/<request-id>`.
    pub fn run_log_dir(&self, dag_name: &str, request_id: &str) -> PathBuf {
        let now = Utc::now();
        let stamp = match self.tz_offset {
            Some(off) => now.with_timezone(&off).format("%Y%m%d").to_string(),
            None => now.format("%Y%m%d").to_string(),
        };
        self.logs_dir
            .join(sanitize(dag_name))
            .join(stamp)
            .join(request_id)
    }

    /// Default working directory for steps of a DAG at `location`.
    pub fn step_work_dir(&self, location: &Path) -> PathBuf {
        if let Some(dir) = &self.work_dir {
            return dir.clone();
        }
        location
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Replace path-hostile characters in a DAG name.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Parse `DAGRUN_TZ`: "UTC", "+09:00", "-0530", "+07".
fn parse_tz(tz: &str) -> Option<FixedOffset> {
    let tz = tz.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") {
        return None;
    }
    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1i32, &tz[1..]),
        b'-' => (-1i32, &tz[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (
            digits[..2].parse::<i32>().ok()?,
            digits[2..].parse::<i32>().ok()?,
        ),
        _ => return None,
    };
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
