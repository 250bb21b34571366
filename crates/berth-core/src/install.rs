//! Per-backend one-shot installation gate.
//!
//! Every backend's install runs concurrently at process start and reaches
//! exactly one terminal [`InstallOutcome`], broadcast over a watch channel.
//! [`Installer::await_ready`] is the gate between startup and the first
//! request: it blocks until the backend's install is terminal and maps the
//! outcome onto the error taxonomy.  Install failure never blocks the
//! process; it only fails requests routed at that backend.

use std::collections::HashMap;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::{Backend, BackendKind, BackendSet};
use crate::error::RunnerError;

/// Terminal result of a backend install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// The host platform cannot run this engine.
    PlatformUnsupported(String),
    /// The engine binary or an interpreter it needs is absent.
    MissingDependency(String),
    /// Install was interrupted before reaching a verdict.
    Canceled,
}

/// Snapshot of one backend's install state, for introspection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstallState {
    Installing,
    Installed,
    Unsupported { reason: String },
    Failed { message: String },
    Canceled,
}

/// Drives and gates backend installation.
pub struct Installer {
    gates: HashMap<&'static str, watch::Receiver<Option<InstallOutcome>>>,
}

impl Installer {
    /// Kick off one install task per backend and return the gate.
    pub fn start(backends: &BackendSet) -> Self {
        let mut gates = HashMap::new();
        for backend in backends.iter() {
            let (tx, rx) = watch::channel(None);
            gates.insert(backend.name(), rx);
            let backend = backend.clone();
            tokio::spawn(async move {
                let outcome = install(&backend).await;
                match &outcome {
                    InstallOutcome::Installed => info!(backend = backend.name(), "backend installed"),
                    other => warn!(backend = backend.name(), outcome = ?other, "backend install not usable"),
                }
                // Receivers observe exactly one transition: None -> terminal.
                let _ = tx.send(Some(outcome));
            });
        }
        Self { gates }
    }

    /// An installer that was never started.  `await_ready` always reports
    /// `ServiceUnavailable`.
    pub fn not_started() -> Self {
        Self {
            gates: HashMap::new(),
        }
    }

    /// Block until `backend`'s install is terminal, then map the outcome.
    ///
    /// Returns immediately once terminal.  Cancellation of the surrounding
    /// request future cancels the wait; the install task itself keeps
    /// running.
    pub async fn await_ready(&self, backend: &str) -> Result<(), RunnerError> {
        let Some(gate) = self.gates.get(backend) else {
            return Err(RunnerError::ServiceUnavailable {
                message: format!("installer not started for backend '{backend}'"),
            });
        };
        let mut gate = gate.clone();
        let outcome = gate
            .wait_for(|v| v.is_some())
            .await
            .map(|v| v.clone().expect("guarded by wait_for"))
            .unwrap_or(InstallOutcome::Canceled);

        match outcome {
            InstallOutcome::Installed => Ok(()),
            InstallOutcome::PlatformUnsupported(reason) => Err(RunnerError::PreconditionFailed {
                backend: backend.to_owned(),
                reason,
            }),
            InstallOutcome::MissingDependency(message) => Err(RunnerError::BackendInstallFailed {
                backend: backend.to_owned(),
                message,
            }),
            InstallOutcome::Canceled => Err(RunnerError::ServiceUnavailable {
                message: format!("install of backend '{backend}' was canceled"),
            }),
        }
    }

    /// Non-blocking install state per backend, for `/engines/status`.
    pub fn states(&self) -> HashMap<String, InstallState> {
        self.gates
            .iter()
            .map(|(name, rx)| {
                let state = match rx.borrow().clone() {
                    None => InstallState::Installing,
                    Some(InstallOutcome::Installed) => InstallState::Installed,
                    Some(InstallOutcome::PlatformUnsupported(reason)) => {
                        InstallState::Unsupported { reason }
                    }
                    Some(InstallOutcome::MissingDependency(message)) => {
                        InstallState::Failed { message }
                    }
                    Some(InstallOutcome::Canceled) => InstallState::Canceled,
                };
                ((*name).to_owned(), state)
            })
            .collect()
    }
}

/// Run one backend's install: platform gate first, then binary presence.
async fn install(backend: &Backend) -> InstallOutcome {
    if let Some(reason) = platform_refusal(backend.kind()) {
        return InstallOutcome::PlatformUnsupported(reason);
    }
    match backend.binary() {
        Some(path) => {
            info!(backend = backend.name(), binary = %path.display(), "engine binary resolved");
            InstallOutcome::Installed
        }
        None => InstallOutcome::MissingDependency(format!(
            "engine binary '{}' not found on PATH (set the per-backend binary override)",
            backend.kind().default_binary()
        )),
    }
}

/// Platform support matrix.  `None` means the platform is fine.
fn platform_refusal(kind: BackendKind) -> Option<String> {
    match kind {
        BackendKind::Gguf | BackendKind::Diffusion => None,
        BackendKind::Safetensors => {
            if cfg!(target_os = "linux") {
                None
            } else {
                Some(format!(
                    "safetensors runner requires Linux, host is {}",
                    std::env::consts::OS
                ))
            }
        }
        BackendKind::Mlx => {
            if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
                None
            } else {
                Some(format!(
                    "mlx runner requires Apple silicon, host is {}/{}",
                    std::env::consts::OS,
                    std::env::consts::ARCH
                ))
            }
        }
    }
}
