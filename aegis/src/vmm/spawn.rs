//! Subprocess plumbing shared by both drivers: spawn with captured stdio,
//! SIGTERM → SIGKILL escalation, liveness probes.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use aegis_shared::errors::{AegisError, AegisResult};

use crate::util::is_process_alive;

/// Spawn a supervised process with stdout/stderr appended to a log file.
pub async fn spawn_logged(
    binary: &Path,
    args: &[String],
    log_path: &Path,
) -> AegisResult<Child> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AegisError::Io(format!("create {}: {e}", parent.display())))?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| AegisError::Io(format!("open {}: {e}", log_path.display())))?;
    let log_err = log
        .try_clone()
        .map_err(|e| AegisError::Io(format!("dup log fd: {e}")))?;

    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| AegisError::Backend(format!("spawn {}: {e}", binary.display())))?;

    Ok(child)
}

/// Graceful stop: SIGTERM, poll for exit within `grace`, then SIGKILL.
/// Tolerates processes that are already gone.
pub async fn stop_child(child: &mut Child, grace: Duration) -> AegisResult<()> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return Ok(());
    };

    signal_pid(pid, libc::SIGTERM);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(pid, %status, "process exited after SIGTERM");
            Ok(())
        }
        Ok(Err(e)) => Err(AegisError::Backend(format!("wait on pid {pid}: {e}"))),
        Err(_) => {
            tracing::warn!(pid, grace_secs = grace.as_secs(), "SIGTERM grace expired, sending SIGKILL");
            let _ = child.start_kill();
            child
                .wait()
                .await
                .map_err(|e| AegisError::Backend(format!("wait on pid {pid}: {e}")))?;
            Ok(())
        }
    }
}

/// Stop a process we only know by pid (recovered after a daemon restart).
pub async fn stop_pid(pid: u32, grace: Duration) {
    if !is_process_alive(pid) {
        return;
    }
    signal_pid(pid, libc::SIGTERM);

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tracing::warn!(pid, "SIGTERM grace expired for recovered process, sending SIGKILL");
    signal_pid(pid, libc::SIGKILL);
}

/// Send a signal, ignoring ESRCH (already gone).
pub fn signal_pid(pid: u32, signal: i32) {
    // SAFETY: plain kill(2); an invalid pid only yields an error return.
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_writes_output_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("proc.log");
        let mut child = spawn_logged(
            Path::new("/bin/sh"),
            &["-c".to_string(), "echo booted".to_string()],
            &log,
        )
        .await
        .unwrap();
        child.wait().await.unwrap();

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("booted"));
    }

    #[tokio::test]
    async fn stop_child_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("proc.log");
        // Shell that ignores SIGTERM.
        let mut child = spawn_logged(
            Path::new("/bin/sh"),
            &["-c".to_string(), "trap '' TERM; sleep 60".to_string()],
            &log,
        )
        .await
        .unwrap();
        let pid = child.id().unwrap();

        stop_child(&mut child, Duration::from_millis(300)).await.unwrap();
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn stop_child_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("proc.log");
        let mut child = spawn_logged(
            Path::new("/bin/sh"),
            &["-c".to_string(), "true".to_string()],
            &log,
        )
        .await
        .unwrap();
        child.wait().await.unwrap();
        stop_child(&mut child, Duration::from_millis(100)).await.unwrap();
        stop_child(&mut child, Duration::from_millis(100)).await.unwrap();
    }
}
