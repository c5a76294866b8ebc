//! Detached daemon spawn + socket-ready wait (spec §4.11 step 3).

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::DaemonError;

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Spawns the daemon binary as a detached subprocess (stdio redirected to
/// `/dev/null`) against `project_root`. Does not wait for it to exit — the
/// caller polls for the socket with [`wait_for_socket`] instead.
pub fn spawn_detached(daemon_binary: &Path, project_root: &Path) -> crate::Result<()> {
    Command::new(daemon_binary)
        .arg("--project")
        .arg(project_root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(DaemonError::Io)?;
    Ok(())
}

/// Polls for `socket_path` to appear, up to `timeout` (spec's 1s budget).
pub fn wait_for_socket(socket_path: &Path, timeout: Duration) -> crate::Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if socket_path.exists() {
            return Ok(());
        }
        std::thread::sleep(SOCKET_POLL_INTERVAL);
    }
    if socket_path.exists() {
        Ok(())
    } else {
        Err(DaemonError::Unavailable(format!(
            "daemon socket did not appear within {timeout:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_socket_times_out_when_nothing_appears() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let result = wait_for_socket(&socket_path, Duration::from_millis(50));
        assert!(result.is_err());
    }

    #[test]
    fn wait_for_socket_succeeds_once_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("daemon.sock");
        std::fs::write(&socket_path, []).unwrap();
        assert!(wait_for_socket(&socket_path, Duration::from_millis(50)).is_ok());
    }
}
