//! Engine adapters: argv construction per backend.
//!
//! An adapter is a single function from (model handle, endpoint, mode,
//! per-runner config) to an argv vector.  The system-controlled flags
//! (model location, listen address, mode flags, projector) are composed
//! here; user-supplied runtime flags are appended only after passing the
//! allow-list in [`flags`].

pub mod flags;

mod diffusion;
mod gguf;
mod mlx;
mod safetensors;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, BackendKind};
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::runner::Endpoint;
use crate::store::ModelHandle;

/// Inference mode a runner is spawned in.  Part of the runner key: the same
/// model in a different mode is a different runner.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Mode {
    Completion,
    Embedding,
    Reranking,
    ImageGeneration,
}

/// Everything an adapter needs to compose a child argv.
pub struct SpawnSpec<'a> {
    pub backend: &'a Backend,
    pub handle: &'a ModelHandle,
    /// Draft model for speculative decoding, resolved by the scheduler.
    pub draft: Option<&'a ModelHandle>,
    pub mode: Mode,
    pub endpoint: &'a Endpoint,
    pub config: &'a RunnerConfig,
}

/// A fully composed child command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Compose the argv for `spec`, validating user runtime flags.
pub fn plan(spec: &SpawnSpec<'_>) -> Result<SpawnPlan, RunnerError> {
    let kind = spec.backend.kind();
    let program = spec
        .backend
        .binary()
        .ok_or_else(|| RunnerError::BackendInstallFailed {
            backend: spec.backend.name().to_owned(),
            message: "engine binary not resolved".into(),
        })?
        .to_path_buf();

    let mut args = match kind {
        BackendKind::Gguf => gguf::argv(spec)?,
        BackendKind::Safetensors => safetensors::argv(spec)?,
        BackendKind::Mlx => mlx::argv(spec)?,
        BackendKind::Diffusion => diffusion::argv(spec)?,
    };

    let user = flags::validate(kind, &spec.config.runtime_flags)?;
    args.extend(user);

    Ok(SpawnPlan { program, args })
}

/// Refusal for a (backend, mode) pair the engine cannot serve.
fn unsupported_mode(backend: &Backend, mode: Mode) -> RunnerError {
    RunnerError::PreconditionFailed {
        backend: backend.name().to_owned(),
        reason: format!("backend does not support {mode} requests"),
    }
}
