//! Apple-silicon engine adapter.
//!
//! Launched through the Python interpreter: `python3 -m <server> --model …`.
//! Embedding requests are detected by the server itself; reranking is not
//! available in this engine.

use super::{SpawnSpec, unsupported_mode};
use crate::engine::Mode;
use crate::error::RunnerError;
use crate::runner::Endpoint;

/// Python module implementing the server.
const SERVER_MODULE: &str = "mlx_lm.server";

pub(super) fn argv(spec: &SpawnSpec<'_>) -> Result<Vec<String>, RunnerError> {
    let Endpoint::Tcp(port) = spec.endpoint else {
        return Err(RunnerError::internal("mlx runner requires a TCP endpoint"));
    };

    match spec.mode {
        // Embedding is auto-detected by the server, completion is default.
        Mode::Completion | Mode::Embedding => {}
        Mode::Reranking | Mode::ImageGeneration => {
            return Err(unsupported_mode(spec.backend, spec.mode));
        }
    }

    Ok(vec![
        "-m".to_owned(),
        SERVER_MODULE.to_owned(),
        "--model".to_owned(),
        spec.handle.weights_path.display().to_string(),
        "--host".to_owned(),
        "127.0.0.1".to_owned(),
        "--port".to_owned(),
        port.to_string(),
    ])
}
