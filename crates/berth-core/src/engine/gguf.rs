//! GGUF engine adapter (llama.cpp server).

use super::{SpawnSpec, unsupported_mode};
use crate::engine::Mode;
use crate::error::RunnerError;
use crate::runner::Endpoint;

pub(super) fn argv(spec: &SpawnSpec<'_>) -> Result<Vec<String>, RunnerError> {
    let handle = spec.handle;
    let mut args = vec![
        "--model".to_owned(),
        handle.weights_path.display().to_string(),
    ];

    match spec.endpoint {
        Endpoint::Unix(path) => {
            args.push("--host".to_owned());
            args.push(format!("unix://{}", path.display()));
        }
        Endpoint::Tcp(port) => {
            args.push("--host".to_owned());
            args.push("127.0.0.1".to_owned());
            args.push("--port".to_owned());
            args.push(port.to_string());
        }
    }

    if let Some(ctx) = spec.config.context_size.or(handle.hints.context_size) {
        args.push("--ctx-size".to_owned());
        args.push(ctx.to_string());
    }

    args.push("--jinja".to_owned());
    if let Some(template) = &handle.chat_template_path {
        args.push("--chat-template-file".to_owned());
        args.push(template.display().to_string());
    }
    if let Some(mmproj) = &handle.mmproj_path {
        args.push("--mmproj".to_owned());
        args.push(mmproj.display().to_string());
    }

    let draft = spec
        .draft
        .map(|d| d.weights_path.clone())
        .or_else(|| handle.draft_weights_path.clone());
    if let Some(draft) = draft {
        args.push("--model-draft".to_owned());
        args.push(draft.display().to_string());
    }

    match spec.mode {
        Mode::Completion => {}
        Mode::Embedding => args.push("--embeddings".to_owned()),
        Mode::Reranking => {
            args.push("--embeddings".to_owned());
            args.push("--reranking".to_owned());
        }
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

    fn spec_args(mode: Mode, endpoint: &Endpoint) -> Result<Vec<String>, RunnerError> {
        let backend = test_backend(BackendKind::Gguf);
        let handle = test_handle(ModelFormat::Gguf);
        let config = RunnerConfig::default();
        argv(&SpawnSpec {
            backend: &backend,
            handle: &handle,
            draft: None,
            mode,
            endpoint,
            config: &config,
        })
    }

    #[test]
    fn completion_over_unix_socket() {
        let ep = Endpoint::Unix("/tmp/berth/runner-0.sock".into());
        let args = spec_args(Mode::Completion, &ep).expect("argv");
        assert!(args.contains(&"--model".to_owned()));
        assert!(args.contains(&"unix:///tmp/berth/runner-0.sock".to_owned()));
        assert!(!args.contains(&"--embeddings".to_owned()));
    }

    #[test]
    fn embedding_mode_adds_flag() {
        let ep = Endpoint::Tcp(8080);
        let args = spec_args(Mode::Embedding, &ep).expect("argv");
        assert!(args.contains(&"--embeddings".to_owned()));
        assert!(!args.contains(&"--reranking".to_owned()));
    }

    #[test]
    fn reranking_mode_adds_both_flags() {
        let ep = Endpoint::Tcp(8080);
        let args = spec_args(Mode::Reranking, &ep).expect("argv");
        assert!(args.contains(&"--embeddings".to_owned()));
        assert!(args.contains(&"--reranking".to_owned()));
    }

    #[test]
    fn image_generation_is_refused() {
        let ep = Endpoint::Tcp(8080);
        let err = spec_args(Mode::ImageGeneration, &ep).unwrap_err();
        assert!(matches!(err, RunnerError::PreconditionFailed { .. }));
    }

    #[test]
    fn context_size_from_config_beats_model_hint() {
        let backend = test_backend(BackendKind::Gguf);
        let mut handle = test_handle(ModelFormat::Gguf);
        handle.hints.context_size = Some(2048);
        let config = RunnerConfig {
            context_size: Some(8192),
            ..RunnerConfig::default()
        };
        let ep = Endpoint::Tcp(8080);
        let args = argv(&SpawnSpec {
            backend: &backend,
            handle: &handle,
            draft: None,
            mode: Mode::Completion,
            endpoint: &ep,
            config: &config,
        })
        .expect("argv");
        let i = args.iter().position(|a| a == "--ctx-size").expect("ctx flag");
        assert_eq!(args[i + 1], "8192");
    }

    #[test]
    fn draft_model_is_passed_through() {
        let backend = test_backend(BackendKind::Gguf);
        let handle = test_handle(ModelFormat::Gguf);
        let mut draft = test_handle(ModelFormat::Gguf);
        draft.weights_path = "/models/ai/draft/weights.gguf".into();
        let ep = Endpoint::Tcp(8080);
        let args = argv(&SpawnSpec {
            backend: &backend,
            handle: &handle,
            draft: Some(&draft),
            mode: Mode::Completion,
            endpoint: &ep,
            config: &RunnerConfig::default(),
        })
        .expect("argv");
        let i = args.iter().position(|a| a == "--model-draft").expect("draft flag");
        assert_eq!(args[i + 1], "/models/ai/draft/weights.gguf");
    }
}
