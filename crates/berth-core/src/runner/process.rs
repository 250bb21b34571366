//! Child engine process supervision.
//!
//! Lifecycle per child: **Spawning → Probing → Ready → Exiting**.  The
//! supervisor owns the child exclusively: after readiness the `Child` moves
//! into a monitor task, and everyone else interacts through messages
//! (shutdown signal in, exit broadcast out).  No lock is shared with the
//! loader.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::endpoint::Endpoint;
use super::logtail::LogTail;
use crate::engine::SpawnPlan;
use crate::proxy::ProxyClient;

/// Delay between readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Grace period between `SIGINT` and `SIGKILL` on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A spawn attempt that did not produce a Ready runner.
#[derive(Debug, Clone)]
pub struct SpawnError {
    pub message: String,
    /// Last ~1 KiB of the child's stderr.
    pub stderr_tail: String,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SpawnError {}

/// A supervised, Ready engine child.
#[derive(Debug)]
pub struct RunnerProcess {
    endpoint: Endpoint,
    tail: LogTail,
    pid: Option<u32>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

impl RunnerProcess {
    /// Spawn the child described by `plan`, wait for it to become Ready on
    /// `endpoint`, and hand back the supervised handle.
    ///
    /// If the caller drops this future (request cancelled mid-start), the
    /// partially started child is killed via `kill_on_drop`.
    pub async fn spawn(
        plan: &SpawnPlan,
        endpoint: Endpoint,
        scratch: &Path,
        ready_timeout: Duration,
        backend: &'static str,
    ) -> Result<RunnerProcess, SpawnError> {
        tokio::fs::create_dir_all(scratch).await.map_err(|e| SpawnError {
            message: format!("scratch dir {}: {e}", scratch.display()),
            stderr_tail: String::new(),
        })?;

        let mut cmd = Command::new(&plan.program);
        cmd.args(&plan.args)
            .current_dir(scratch)
            // Children get a scrubbed environment: enough to run, nothing
            // inherited from the control plane's own configuration.
            .env_clear()
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in ["PATH", "HOME", "TMPDIR"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| SpawnError {
            message: format!("spawn {}: {e}", plan.program.display()),
            stderr_tail: String::new(),
        })?;
        let pid = child.id();
        info!(backend, pid, endpoint = %endpoint, "engine spawned, probing");

        let tail = LogTail::new();
        if let Some(stderr) = child.stderr.take() {
            tail.capture(stderr, backend);
        }

        // ── Probing ──────────────────────────────────────────────────────────
        let proxy = ProxyClient::new(endpoint.clone());
        let deadline = Instant::now() + ready_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                // Give the stderr task a beat to drain the pipe.
                tokio::time::sleep(Duration::from_millis(50)).await;
                return Err(SpawnError {
                    message: format!("engine exited during startup ({status})"),
                    stderr_tail: tail.contents(),
                });
            }
            match proxy.get("/health").await {
                Ok((status, _)) if status.is_success() => break,
                Ok((status, _)) => debug!(backend, %status, "engine not ready yet"),
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(SpawnError {
                    message: format!(
                        "engine did not become ready within {}",
                        humantime::format_duration(ready_timeout)
                    ),
                    stderr_tail: tail.contents(),
                });
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
        info!(backend, pid, "engine ready");

        // ── Ready: hand the child to the monitor task ────────────────────────
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(false);
        let monitor_endpoint = endpoint.clone();
        tokio::spawn(async move {
            monitor(child, shutdown_rx, backend).await;
            monitor_endpoint.cleanup();
            let _ = exit_tx.send(true);
        });

        Ok(RunnerProcess {
            endpoint,
            tail,
            pid,
            shutdown_tx: Some(shutdown_tx),
            exited: exit_rx,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Last ~1 KiB of the child's stderr, for diagnostics.
    pub fn stderr_tail(&self) -> String {
        self.tail.contents()
    }

    /// Receiver that flips to `true` once the child has exited (for any
    /// reason).  The loader watches this to drain slots whose child died.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exited.clone()
    }

    /// Whether the child has already exited.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Start teardown without waiting for it: `SIGINT`, a bounded grace
    /// period, then `SIGKILL`, driven by the monitor task.  Idempotent.
    /// Completion is observable through [`Self::exit_signal`].
    pub fn trigger_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Tear the child down and wait until the process is reaped and the
    /// endpoint reclaimed.
    pub async fn shutdown(mut self) {
        self.trigger_shutdown();
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }
}

/// Own the child until it exits, honoring at most one shutdown request.
async fn monitor(
    mut child: tokio::process::Child,
    shutdown_rx: oneshot::Receiver<()>,
    backend: &'static str,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => warn!(backend, %status, "engine exited on its own"),
                Err(e) => warn!(backend, error = %e, "engine wait failed"),
            }
        }
        _ = shutdown_rx => {
            interrupt(&child, backend);
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!(backend, %status, "engine stopped"),
                Ok(Err(e)) => warn!(backend, error = %e, "engine wait failed"),
                Err(_) => {
                    warn!(backend, "engine ignored SIGINT; killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

/// Deliver `SIGINT` to the child, falling back to a hard kill where signals
/// are unavailable.
fn interrupt(child: &tokio::process::Child, backend: &'static str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        debug!(backend, pid, "sending SIGINT");
        // SAFETY: pid came from a live child we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
        return;
    }
    #[cfg(not(unix))]
    {
        let _ = backend;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn sh(script: &str) -> SpawnPlan {
        SpawnPlan {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    /// Loopback listener that answers every request with 200 OK, standing in
    /// for a child that became ready.
    async fn ready_listener() -> Endpoint {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });
        Endpoint::Tcp(port)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_before_ready_surfaces_the_stderr_tail() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let plan = sh("echo 'fatal: bad model' >&2; exit 3");
        let err = RunnerProcess::spawn(
            &plan,
            Endpoint::Tcp(1),
            tmp.path(),
            Duration::from_secs(5),
            "gguf",
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("exited during startup"), "{err}");
        assert!(err.stderr_tail.contains("fatal: bad model"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_timeout_kills_the_child() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let plan = sh("sleep 30");
        let err = RunnerProcess::spawn(
            &plan,
            Endpoint::Tcp(1),
            tmp.path(),
            Duration::from_millis(600),
            "gguf",
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("did not become ready"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ready_child_shuts_down_on_sigint() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let endpoint = ready_listener().await;
        let plan = sh("trap 'exit 0' INT; sleep 30 & wait");

        let runner = RunnerProcess::spawn(
            &plan,
            endpoint,
            tmp.path(),
            Duration::from_secs(5),
            "gguf",
        )
        .await
        .expect("spawn");
        assert!(!runner.has_exited());

        tokio::time::timeout(Duration::from_secs(10), runner.shutdown())
            .await
            .expect("shutdown within grace");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn self_exit_flips_the_exit_signal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let endpoint = ready_listener().await;
        let plan = sh("sleep 0.2");

        let runner = RunnerProcess::spawn(
            &plan,
            endpoint,
            tmp.path(),
            Duration::from_secs(5),
            "gguf",
        )
        .await
        .expect("spawn");

        let mut exited = runner.exit_signal();
        tokio::time::timeout(Duration::from_secs(5), exited.wait_for(|v| *v))
            .await
            .expect("exit observed")
            .expect("watch alive");
    }
}
