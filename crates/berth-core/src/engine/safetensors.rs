//! Safetensors engine adapter (Python runner, Linux).
//!
//! The runner takes the model directory as a positional argument to its
//! `serve` subcommand and only speaks loopback TCP.

use super::{SpawnSpec, unsupported_mode};
use crate::engine::Mode;
use crate::error::RunnerError;
use crate::runner::Endpoint;

pub(super) fn argv(spec: &SpawnSpec<'_>) -> Result<Vec<String>, RunnerError> {
    let Endpoint::Tcp(port) = spec.endpoint else {
        return Err(RunnerError::internal(
            "safetensors runner requires a TCP endpoint",
        ));
    };

    let mut args = vec![
        "serve".to_owned(),
        spec.handle.weights_path.display().to_string(),
        "--host".to_owned(),
        "127.0.0.1".to_owned(),
        "--port".to_owned(),
        port.to_string(),
    ];

    if let Some(ctx) = spec.config.context_size.or(spec.handle.hints.context_size) {
        args.push("--max-model-len".to_owned());
        args.push(ctx.to_string());
    }

    match spec.mode {
        Mode::Completion => {}
        Mode::Embedding => {
            args.push("--runner".to_owned());
            args.push("pooling".to_owned());
        }
        // Reranking is served by the same process with no extra flag.
        Mode::Reranking => {}
        Mode::ImageGeneration => return Err(unsupported_mode(spec.backend, spec.mode)),
    }

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_backend, test_handle};
    use super::*;
    use crate::backend::BackendKind;
    use crate::config::RunnerConfig;
    use crate::store::ModelFormat;

    fn spec_args(mode: Mode) -> Result<Vec<String>, RunnerError> {
        let backend = test_backend(BackendKind::Safetensors);
        let handle = test_handle(ModelFormat::Safetensors);
        let ep = Endpoint::Tcp(9000);
        argv(&SpawnSpec {
            backend: &backend,
            handle: &handle,
            draft: None,
            mode,
            endpoint: &ep,
            config: &RunnerConfig::default(),
        })
    }

    #[test]
    fn serve_takes_the_model_directory_positionally() {
        let args = spec_args(Mode::Completion).expect("argv");
        assert_eq!(args[0], "serve");
        assert_eq!(args[1], "/models/ai/test");
        assert!(args.contains(&"--port".to_owned()));
    }

    #[test]
    fn embedding_mode_selects_the_pooling_runner() {
        let args = spec_args(Mode::Embedding).expect("argv");
        let i = args.iter().position(|a| a == "--runner").expect("runner flag");
        assert_eq!(args[i + 1], "pooling");
    }

    #[test]
    fn reranking_needs_no_flag() {
        let args = spec_args(Mode::Reranking).expect("argv");
        assert!(!args.contains(&"--runner".to_owned()));
    }

    #[test]
    fn unix_endpoint_is_rejected() {
        let backend = test_backend(BackendKind::Safetensors);
        let handle = test_handle(ModelFormat::Safetensors);
        let ep = Endpoint::Unix("/tmp/x.sock".into());
        let err = argv(&SpawnSpec {
            backend: &backend,
            handle: &handle,
            draft: None,
            mode: Mode::Completion,
            endpoint: &ep,
            config: &RunnerConfig::default(),
        })
        .unwrap_err();
        assert!(matches!(err, RunnerError::InternalError { .. }));
    }
}
