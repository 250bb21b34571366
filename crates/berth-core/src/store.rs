//! Model store seam.
//!
//! OCI distribution (pull/push, blob store, manifests) lives outside this
//! crate.  The scheduler only needs the narrow contract below: resolve a
//! reference to a local [`ModelHandle`], enumerate what is on disk, and
//! stream pull progress.  [`DiskModelStore`] is the bundled filesystem
//! implementation; registry-backed stores plug in behind the same trait.

mod disk;

pub use disk::DiskModelStore;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// On-disk format of a model's primary weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModelFormat {
    Gguf,
    Safetensors,
    Dduf,
}

/// Per-model runtime hints, read from the model's `config.json` if present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeHints {
    /// Context-size hint (tokens).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,
    /// Architecture family, e.g. `"llama"`, `"qwen2"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    /// Quantization label, e.g. `"Q4_K_M"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
}

/// A resolved local model.  File paths are stable for the handle's lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct ModelHandle {
    /// Content ID, stable per weights content (`sha256:…`).
    pub id: String,
    /// The reference the caller used, e.g. `ai/smollm2`.
    pub reference: String,
    pub format: ModelFormat,
    /// Primary weights: a file for GGUF/DDUF, the model directory for
    /// safetensors.
    pub weights_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_template_path: Option<PathBuf>,
    /// Multimodal projector weights, if the model ships one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmproj_path: Option<PathBuf>,
    /// Draft-model weights for speculative decoding, if bundled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_weights_path: Option<PathBuf>,
    pub hints: RuntimeHints,
    /// Total size of the model directory in bytes.
    pub size_bytes: u64,
}

impl ModelHandle {
    /// Handle for a model managed by the backend itself: the reference is
    /// passed through verbatim and doubles as the content ID; no local
    /// files are resolved.
    pub fn unresolved(reference: &str) -> Self {
        Self {
            id: reference.to_owned(),
            reference: reference.to_owned(),
            format: ModelFormat::Safetensors,
            weights_path: PathBuf::from(reference),
            chat_template_path: None,
            mmproj_path: None,
            draft_weights_path: None,
            hints: RuntimeHints::default(),
            size_bytes: 0,
        }
    }
}

/// The set of files making up one deployable model, by format.
#[derive(Debug, Clone, Default)]
pub struct ModelBundle {
    pub gguf_path: Option<PathBuf>,
    pub safetensors_dir: Option<PathBuf>,
    pub dduf_path: Option<PathBuf>,
    pub chat_template_path: Option<PathBuf>,
    pub mmproj_path: Option<PathBuf>,
    pub hints: RuntimeHints,
}

/// One entry of the store listing.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub reference: String,
    pub id: String,
    pub format: ModelFormat,
    pub size_bytes: u64,
}

/// A single pull/push progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullProgress {
    /// Event type: `"pulling"`, `"verifying"`, `"success"`, `"error"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<LayerProgress>,
    /// Total bytes across all layers.
    pub total: u64,
    /// Bytes pulled so far across all layers.
    pub pulled: u64,
}

/// Per-layer progress within a [`PullProgress`] event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerProgress {
    pub id: String,
    pub size: u64,
    pub current: u64,
}

/// Stream of pull progress events.
pub type PullStream = Pin<Box<dyn Stream<Item = Result<PullProgress, RunnerError>> + Send>>;

/// Narrow contract the scheduler holds on the model store collaborator.
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Resolve a reference to a local model, or [`RunnerError::ModelNotFound`].
    async fn get_local(&self, reference: &str) -> Result<ModelHandle, RunnerError>;

    /// Resolve a reference to its content ID without building a full handle.
    async fn resolve_id(&self, reference: &str) -> Result<String, RunnerError>;

    /// Resolve the full file bundle for a reference.
    async fn get_bundle(&self, reference: &str) -> Result<ModelBundle, RunnerError>;

    /// Enumerate locally available models.
    async fn list(&self) -> Result<Vec<ModelSummary>, RunnerError>;

    /// Remove a local model.
    async fn delete(&self, reference: &str) -> Result<(), RunnerError>;

    /// Pull a model from its registry, streaming progress events.
    async fn pull(&self, reference: &str) -> Result<PullStream, RunnerError>;

    /// Push a local model to its registry, streaming progress events.
    async fn push(&self, reference: &str) -> Result<PullStream, RunnerError>;

    /// Total bytes the store occupies on disk.
    async fn disk_usage(&self) -> Result<u64, RunnerError>;
}
