//! Image-generation engine adapter for DDUF bundles.

use super::{SpawnSpec, unsupported_mode};
use crate::engine::Mode;
use crate::error::RunnerError;
use crate::runner::Endpoint;

/// Python module implementing the server.
const SERVER_MODULE: &str = "diffusion_server";

pub(super) fn argv(spec: &SpawnSpec<'_>) -> Result<Vec<String>, RunnerError> {
    if spec.mode != Mode::ImageGeneration {
        return Err(unsupported_mode(spec.backend, spec.mode));
    }

    let mut args = vec![
        "-m".to_owned(),
        SERVER_MODULE.to_owned(),
        "--model-path".to_owned(),
        spec.handle.weights_path.display().to_string(),
    ];

    match spec.endpoint {
        Endpoint::Unix(path) => {
            args.push("--unix-socket".to_owned());
            args.push(path.display().to_string());
        }
        Endpoint::Tcp(port) => {
            args.push("--host".to_owned());
            args.push("127.0.0.1".to_owned());
            args.push("--port".to_owned());
            args.push(port.to_string());
        }
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
        let backend = test_backend(BackendKind::Diffusion);
        let handle = test_handle(ModelFormat::Dduf);
        let ep = Endpoint::Unix("/tmp/berth/runner-1.sock".into());
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
    fn image_generation_points_at_the_dduf_bundle() {
        let args = spec_args(Mode::ImageGeneration).expect("argv");
        let i = args.iter().position(|a| a == "--model-path").expect("flag");
        assert_eq!(args[i + 1], "/models/ai/test/bundle.dduf");
        assert!(args.contains(&"--unix-socket".to_owned()));
    }

    #[test]
    fn text_modes_are_refused() {
        for mode in [Mode::Completion, Mode::Embedding, Mode::Reranking] {
            let err = spec_args(mode).unwrap_err();
            assert!(matches!(err, RunnerError::PreconditionFailed { .. }));
        }
    }
}
