//! Filesystem-backed model store.
//!
//! Layout: `<root>/<namespace>/<name>/` is one model directory containing
//! the primary weights plus optional sidecar files:
//!
//! | File | Meaning |
//! |---|---|
//! | `*.gguf` (largest) | GGUF weights |
//! | `*.safetensors` | safetensors shard(s); the directory itself is served |
//! | `*.dduf` | packaged diffusers bundle |
//! | `template.jinja` | chat template override |
//! | `mmproj*.gguf` | multimodal projector |
//! | `draft*.gguf` | speculative-decoding draft weights |
//! | `config.json` | [`RuntimeHints`] |
//!
//! Pulling is the OCI collaborator's job; this store only answers for what
//! is already on disk.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use super::{
    ModelBundle, ModelFormat, ModelHandle, ModelStore, ModelSummary, PullStream, RuntimeHints,
};
use crate::error::RunnerError;
use crate::sanitize::sanitize_for_log;

/// Model store rooted at a local directory (`MODELS_PATH`).
#[derive(Debug, Clone)]
pub struct DiskModelStore {
    root: PathBuf,
}

impl DiskModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a reference like `ai/smollm2` onto its model directory,
    /// refusing path traversal.
    fn model_dir(&self, reference: &str) -> Result<PathBuf, RunnerError> {
        let trimmed = reference.trim().trim_end_matches(":latest");
        if trimmed.is_empty() {
            return Err(RunnerError::invalid("empty model reference"));
        }
        for part in trimmed.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(RunnerError::invalid(format!(
                    "bad model reference: {}",
                    sanitize_for_log(reference)
                )));
            }
        }
        Ok(self.root.join(trimmed))
    }

    fn scan(&self, reference: &str) -> Result<ModelHandle, RunnerError> {
        let dir = self.model_dir(reference)?;
        if !dir.is_dir() {
            return Err(RunnerError::ModelNotFound {
                reference: sanitize_for_log(reference),
            });
        }

        let mut gguf: Option<(PathBuf, u64)> = None;
        let mut has_safetensors = false;
        let mut dduf: Option<PathBuf> = None;
        let mut chat_template = None;
        let mut mmproj = None;
        let mut draft = None;
        let mut hints = RuntimeHints::default();
        let mut size_bytes = 0u64;

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            size_bytes += meta.len();
            let name = entry.file_name().to_string_lossy().to_lowercase();
            match name.as_str() {
                "template.jinja" => chat_template = Some(path),
                "config.json" => {
                    hints = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or_default();
                }
                n if n.starts_with("mmproj") && n.ends_with(".gguf") => mmproj = Some(path),
                n if n.starts_with("draft") && n.ends_with(".gguf") => draft = Some(path),
                n if n.ends_with(".gguf") => {
                    // Largest GGUF wins; sidecars are smaller by construction.
                    if gguf.as_ref().map(|(_, len)| meta.len() > *len).unwrap_or(true) {
                        gguf = Some((path, meta.len()));
                    }
                }
                n if n.ends_with(".safetensors") => has_safetensors = true,
                n if n.ends_with(".dduf") => dduf = Some(path),
                _ => {}
            }
        }

        let (format, weights_path) = if let Some((path, _)) = &gguf {
            (ModelFormat::Gguf, path.clone())
        } else if has_safetensors {
            (ModelFormat::Safetensors, dir.clone())
        } else if let Some(path) = &dduf {
            (ModelFormat::Dduf, path.clone())
        } else {
            return Err(RunnerError::ModelNotFound {
                reference: sanitize_for_log(reference),
            });
        };

        let id = content_id(&weights_path, size_bytes)?;
        debug!(reference = %sanitize_for_log(reference), id = %id, %format, "resolved local model");

        Ok(ModelHandle {
            id,
            reference: reference.to_owned(),
            format,
            weights_path,
            chat_template_path: chat_template,
            mmproj_path: mmproj,
            draft_weights_path: draft,
            hints,
            size_bytes,
        })
    }

    fn scan_all(&self) -> Result<Vec<ModelSummary>, RunnerError> {
        let mut out = Vec::new();
        if !self.root.is_dir() {
            return Ok(out);
        }
        for ns in std::fs::read_dir(&self.root)? {
            let ns = ns?;
            if !ns.file_type()?.is_dir() {
                continue;
            }
            for model in std::fs::read_dir(ns.path())? {
                let model = model?;
                if !model.file_type()?.is_dir() {
                    continue;
                }
                let reference = format!(
                    "{}/{}",
                    ns.file_name().to_string_lossy(),
                    model.file_name().to_string_lossy()
                );
                if let Ok(handle) = self.scan(&reference) {
                    out.push(ModelSummary {
                        reference,
                        id: handle.id,
                        format: handle.format,
                        size_bytes: handle.size_bytes,
                    });
                }
            }
        }
        out.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(out)
    }
}

/// Content ID derived from the primary weights file identity.  Cheap proxy
/// for a manifest digest: path, length and mtime feed a SHA-256.
fn content_id(weights: &Path, dir_size: u64) -> Result<String, RunnerError> {
    let meta = std::fs::metadata(weights)?;
    let mut hasher = Sha256::new();
    hasher.update(weights.to_string_lossy().as_bytes());
    hasher.update(meta.len().to_le_bytes());
    hasher.update(dir_size.to_le_bytes());
    if let Ok(modified) = meta.modified() {
        if let Ok(d) = modified.duration_since(std::time::UNIX_EPOCH) {
            hasher.update(d.as_secs().to_le_bytes());
        }
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(12 + 7);
    for byte in digest.iter().take(6) {
        hex.push_str(&format!("{byte:02x}"));
    }
    Ok(format!("sha256:{hex}"))
}

#[async_trait::async_trait]
impl ModelStore for DiskModelStore {
    async fn get_local(&self, reference: &str) -> Result<ModelHandle, RunnerError> {
        let store = self.clone();
        let reference = reference.to_owned();
        tokio::task::spawn_blocking(move || store.scan(&reference))
            .await
            .map_err(|e| RunnerError::internal(e.to_string()))?
    }

    async fn resolve_id(&self, reference: &str) -> Result<String, RunnerError> {
        Ok(self.get_local(reference).await?.id)
    }

    async fn get_bundle(&self, reference: &str) -> Result<ModelBundle, RunnerError> {
        let handle = self.get_local(reference).await?;
        let mut bundle = ModelBundle {
            chat_template_path: handle.chat_template_path,
            mmproj_path: handle.mmproj_path,
            hints: handle.hints,
            ..ModelBundle::default()
        };
        match handle.format {
            ModelFormat::Gguf => bundle.gguf_path = Some(handle.weights_path),
            ModelFormat::Safetensors => bundle.safetensors_dir = Some(handle.weights_path),
            ModelFormat::Dduf => bundle.dduf_path = Some(handle.weights_path),
        }
        Ok(bundle)
    }

    async fn list(&self) -> Result<Vec<ModelSummary>, RunnerError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.scan_all())
            .await
            .map_err(|e| RunnerError::internal(e.to_string()))?
    }

    async fn delete(&self, reference: &str) -> Result<(), RunnerError> {
        let dir = self.model_dir(reference)?;
        if !dir.is_dir() {
            return Err(RunnerError::ModelNotFound {
                reference: sanitize_for_log(reference),
            });
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn pull(&self, reference: &str) -> Result<PullStream, RunnerError> {
        // Registry pulls belong to the OCI collaborator.  A disk-only store
        // can only answer for models that are already present.
        match self.get_local(reference).await {
            Ok(handle) => {
                let event = super::PullProgress {
                    kind: "success".into(),
                    message: format!("model {} already present", handle.reference),
                    layer: None,
                    total: handle.size_bytes,
                    pulled: handle.size_bytes,
                };
                Ok(Box::pin(futures::stream::once(async move { Ok(event) })))
            }
            Err(e) => Err(e),
        }
    }

    async fn push(&self, reference: &str) -> Result<PullStream, RunnerError> {
        // Ensure the model exists before refusing: callers get NotFound for
        // absent models and a clear refusal otherwise.
        self.get_local(reference).await?;
        Err(RunnerError::invalid(
            "this store has no registry to push to",
        ))
    }

    async fn disk_usage(&self) -> Result<u64, RunnerError> {
        Ok(self.list().await?.iter().map(|m| m.size_bytes).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_model(root: &Path, reference: &str, files: &[(&str, usize)]) {
        let dir = root.join(reference);
        std::fs::create_dir_all(&dir).expect("mkdir model dir");
        for (name, len) in files {
            std::fs::write(dir.join(name), vec![0u8; *len]).expect("write file");
        }
    }

    #[tokio::test]
    async fn resolves_gguf_model() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_model(
            tmp.path(),
            "ai/smollm2",
            &[("weights.gguf", 4096), ("template.jinja", 64)],
        );

        let store = DiskModelStore::new(tmp.path());
        let handle = store.get_local("ai/smollm2").await.expect("resolve");
        assert_eq!(handle.format, ModelFormat::Gguf);
        assert!(handle.weights_path.ends_with("weights.gguf"));
        assert!(handle.chat_template_path.is_some());
        assert!(handle.id.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn largest_gguf_wins_and_sidecars_are_split_out() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_model(
            tmp.path(),
            "ai/llava",
            &[
                ("weights.gguf", 8192),
                ("mmproj-f16.gguf", 1024),
                ("draft-tiny.gguf", 512),
            ],
        );

        let store = DiskModelStore::new(tmp.path());
        let handle = store.get_local("ai/llava").await.expect("resolve");
        assert!(handle.weights_path.ends_with("weights.gguf"));
        assert!(handle.mmproj_path.expect("mmproj").ends_with("mmproj-f16.gguf"));
        assert!(
            handle
                .draft_weights_path
                .expect("draft")
                .ends_with("draft-tiny.gguf")
        );
    }

    #[tokio::test]
    async fn safetensors_model_serves_the_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_model(
            tmp.path(),
            "ai/qwen3",
            &[("model-00001.safetensors", 2048), ("config.json", 2)],
        );

        let store = DiskModelStore::new(tmp.path());
        let handle = store.get_local("ai/qwen3").await.expect("resolve");
        assert_eq!(handle.format, ModelFormat::Safetensors);
        assert!(handle.weights_path.is_dir());
    }

    #[tokio::test]
    async fn missing_model_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DiskModelStore::new(tmp.path());
        let err = store.get_local("ai/absent").await.unwrap_err();
        assert!(matches!(err, RunnerError::ModelNotFound { .. }));
    }

    #[tokio::test]
    async fn traversal_references_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = DiskModelStore::new(tmp.path());
        let err = store.get_local("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, RunnerError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn list_enumerates_namespaced_models() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_model(tmp.path(), "ai/smollm2", &[("weights.gguf", 1024)]);
        write_model(tmp.path(), "ai/qwen3", &[("model.safetensors", 512)]);

        let store = DiskModelStore::new(tmp.path());
        let models = store.list().await.expect("list");
        let refs: Vec<_> = models.iter().map(|m| m.reference.as_str()).collect();
        assert_eq!(refs, vec!["ai/qwen3", "ai/smollm2"]);
    }

    #[tokio::test]
    async fn latest_tag_is_stripped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_model(tmp.path(), "ai/smollm2", &[("weights.gguf", 1024)]);

        let store = DiskModelStore::new(tmp.path());
        let handle = store.get_local("ai/smollm2:latest").await.expect("resolve");
        assert_eq!(handle.format, ModelFormat::Gguf);
    }
}
