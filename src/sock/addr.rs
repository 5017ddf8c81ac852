//! Socket address derivation.
//!
//! The address is deterministic over (DAG location, request id) so any
//! process can reach a live run, and the DAG-hash prefix makes the live
//! run for a DAG discoverable without knowing its request id.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::def::Dag;

/// Linux caps sun_path at 108 bytes; stay comfortably under it.
const MAX_SOCK_PATH: usize = 100;

/// The stable identity a socket address is derived from: the canonical
/// location plus the DAG name. The name matters because a multi-document
/// file hosts several DAGs at one location, and a sub-run's socket must
/// not shadow its parent's. Never empty — an anonymous in-memory DAG
/// still hashes to something.
pub fn dag_key(dag: &Dag) -> String {
    let loc = dag.location.to_string_lossy();
    if loc.is_empty() {
        dag.name.clone()
    } else {
        format!("{loc}#{}", dag.name)
    }
}

/// `<sockDir>/dagrun-<hash16>-<reqid8>.sock`.
pub fn run_sock_path(config: &Config, key: &str, request_id: &str) -> PathBuf {
    let name = sock_file_name(key, request_id);
    let candidate = config.sock_dir.join(&name);
    if candidate.as_os_str().len() <= MAX_SOCK_PATH {
        return candidate;
    }
    // Home path too deep for sun_path: fall back to the system temp dir.
    std::env::temp_dir().join(name)
}

fn sock_file_name(key: &str, request_id: &str) -> String {
    let short: String = request_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    format!("dagrun-{:016x}-{short}.sock", fnv1a64(key.as_bytes()))
}

/// Find the live socket for a DAG by its hash prefix. Returns the most
/// recently modified match when several exist.
pub fn find_live_sock(config: &Config, key: &str) -> Option<PathBuf> {
    let prefix = format!("dagrun-{:016x}-", fnv1a64(key.as_bytes()));
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for dir in [config.sock_dir.as_path(), std::env::temp_dir().as_path()] {
        scan_dir(dir, &prefix, &mut newest);
    }
    newest.map(|(_, path)| path)
}

fn scan_dir(dir: &Path, prefix: &str, newest: &mut Option<(std::time::SystemTime, PathBuf)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(prefix) || !name.ends_with(".sock") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            *newest = Some((modified, entry.path()));
        }
    }
}

/// FNV-1a: tiny, dependency-free, and stable across processes (the
/// standard hasher is randomly seeded per process, which would break
/// cross-process address derivation).
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
