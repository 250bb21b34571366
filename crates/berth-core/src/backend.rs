//! The closed set of engine backends.
//!
//! Each backend is an out-of-process server speaking an OpenAI-compatible
//! HTTP dialect for one model family.  The set is a tagged enum rather than
//! an open trait: every capability (`name`, endpoint kind, install check,
//! argv construction, memory estimate) dispatches on [`BackendKind`], so a
//! new engine is one more variant, not a new trait impl scattered over the
//! tree.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::engine::Mode;
use crate::store::{ModelFormat, ModelHandle};

/// Engine family.  `name()` doubles as the URL path segment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    /// llama.cpp server for GGUF models.  The default backend.
    Gguf,
    /// Python safetensors runner (Linux).
    Safetensors,
    /// Apple-silicon runner (macOS/aarch64 only).
    Mlx,
    /// Image-generation runner for DDUF bundles.
    Diffusion,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Gguf,
        BackendKind::Safetensors,
        BackendKind::Mlx,
        BackendKind::Diffusion,
    ];

    /// Lowercase name, usable as a path segment.
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Gguf => "gguf",
            BackendKind::Safetensors => "safetensors",
            BackendKind::Mlx => "mlx",
            BackendKind::Diffusion => "diffusion",
        }
    }

    /// Default executable launched for this backend, resolved on `PATH`
    /// unless overridden per backend.
    pub fn default_binary(&self) -> &'static str {
        match self {
            BackendKind::Gguf => "llama-server",
            BackendKind::Safetensors => "vllm",
            // Python-module engines are launched through the interpreter.
            BackendKind::Mlx | BackendKind::Diffusion => "python3",
        }
    }
}

/// How a backend's children are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// Unix domain socket under the scratch directory.
    Unix,
    /// Loopback TCP port.
    Tcp,
}

/// Immutable backend descriptor.  Created once at process start; install
/// state lives in the [`Installer`].
///
/// [`Installer`]: crate::install::Installer
#[derive(Debug, Clone)]
pub struct Backend {
    kind: BackendKind,
    /// Resolved engine executable, if one was found at construction.
    binary: Option<PathBuf>,
}

impl Backend {
    /// Build a descriptor, resolving the engine binary from the override
    /// path or `PATH`.
    pub fn new(kind: BackendKind, binary_override: Option<PathBuf>) -> Self {
        let binary = match binary_override {
            Some(path) if path.is_file() => Some(path),
            Some(_) | None => resolve_on_path(kind.default_binary()),
        };
        Self { kind, binary }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    /// Whether the backend resolves model references itself instead of
    /// going through the model store.
    pub fn manages_own_models(&self) -> bool {
        matches!(self.kind, BackendKind::Mlx)
    }

    pub fn endpoint_kind(&self) -> EndpointKind {
        match self.kind {
            BackendKind::Gguf | BackendKind::Diffusion => EndpointKind::Unix,
            BackendKind::Safetensors | BackendKind::Mlx => EndpointKind::Tcp,
        }
    }

    /// Model formats this backend can serve.
    pub fn serves_format(&self, format: ModelFormat) -> bool {
        match self.kind {
            BackendKind::Gguf => format == ModelFormat::Gguf,
            BackendKind::Safetensors => format == ModelFormat::Safetensors,
            BackendKind::Mlx => {
                format == ModelFormat::Safetensors || format == ModelFormat::Gguf
            }
            BackendKind::Diffusion => format == ModelFormat::Dduf,
        }
    }

    /// Estimated RAM requirement for serving `handle`, if one can be made.
    ///
    /// GGUF weights are mmapped close to file size; KV cache grows with the
    /// context size.  Safetensors runners copy tensors on load.
    pub fn estimate_memory(&self, handle: &ModelHandle, context_size: Option<u32>) -> Option<u64> {
        let weights = handle.size_bytes;
        match handle.format {
            ModelFormat::Gguf => {
                let ctx = u64::from(context_size.or(handle.hints.context_size).unwrap_or(4096));
                Some(weights + weights / 5 + ctx * 512 * 1024)
            }
            ModelFormat::Safetensors => Some(weights + weights / 10),
            ModelFormat::Dduf => Some(weights),
        }
    }

    /// Bytes the backend's own installation occupies (engine binary; the
    /// model store accounts for weights separately).
    pub fn disk_usage(&self) -> u64 {
        self.binary
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

/// The registry of configured backends.
#[derive(Debug, Clone, Default)]
pub struct BackendSet {
    backends: Vec<Backend>,
}

impl BackendSet {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self { backends }
    }

    /// All four engine kinds with binaries resolved from `PATH`.
    pub fn detect() -> Self {
        Self::new(
            BackendKind::ALL
                .iter()
                .map(|kind| Backend::new(*kind, None))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.name() == name)
    }

    /// The default dispatch target.
    pub fn default_backend(&self) -> Option<&Backend> {
        self.get(BackendKind::Gguf.name())
    }

    /// A registered backend that can serve safetensors models, if any.
    /// Preference order: the dedicated safetensors runner, then mlx.
    pub fn safetensors_capable(&self) -> Option<&Backend> {
        self.get(BackendKind::Safetensors.name())
            .or_else(|| self.get(BackendKind::Mlx.name()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Backend> {
        self.backends.iter()
    }
}

/// Find `name` on `PATH`, returning the first executable hit.
fn resolve_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RuntimeHints;

    fn handle(format: ModelFormat, size_bytes: u64) -> ModelHandle {
        ModelHandle {
            id: "sha256:abc".into(),
            reference: "ai/test".into(),
            format,
            weights_path: PathBuf::from("/tmp/x"),
            chat_template_path: None,
            mmproj_path: None,
            draft_weights_path: None,
            hints: RuntimeHints::default(),
            size_bytes,
        }
    }

    #[test]
    fn names_are_lowercase_path_segments() {
        for kind in BackendKind::ALL {
            let name = kind.name();
            assert!(!name.is_empty());
            assert!(name.chars().all(|c| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn endpoint_kinds_split_by_engine() {
        let set = BackendSet::detect();
        assert_eq!(set.get("gguf").unwrap().endpoint_kind(), EndpointKind::Unix);
        assert_eq!(
            set.get("safetensors").unwrap().endpoint_kind(),
            EndpointKind::Tcp
        );
    }

    #[test]
    fn gguf_estimate_includes_context_term() {
        let b = Backend::new(BackendKind::Gguf, None);
        let small = b
            .estimate_memory(&handle(ModelFormat::Gguf, 1 << 30), Some(2048))
            .expect("estimate");
        let large = b
            .estimate_memory(&handle(ModelFormat::Gguf, 1 << 30), Some(32768))
            .expect("estimate");
        assert!(large > small, "bigger context must raise the estimate");
    }

    #[test]
    fn safetensors_capable_prefers_dedicated_runner() {
        let set = BackendSet::detect();
        assert_eq!(set.safetensors_capable().unwrap().name(), "safetensors");

        let mlx_only = BackendSet::new(vec![Backend::new(BackendKind::Mlx, None)]);
        assert_eq!(mlx_only.safetensors_capable().unwrap().name(), "mlx");

        let gguf_only = BackendSet::new(vec![Backend::new(BackendKind::Gguf, None)]);
        assert!(gguf_only.safetensors_capable().is_none());
    }
}
