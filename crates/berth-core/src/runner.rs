//! Runner supervision: endpoints, child processes, stderr capture.

mod endpoint;
mod logtail;
mod process;

pub use endpoint::Endpoint;
pub use logtail::LogTail;
pub use process::{RunnerProcess, SpawnError};

use std::fmt;

use crate::engine::Mode;

/// Identity of a runnable configuration.  Two requests with identical keys
/// share a runner; the loader maps keys onto slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunnerKey {
    /// Backend name (`"gguf"`, `"safetensors"`, …).
    pub backend: String,
    /// Content ID of the primary model.
    pub model_id: String,
    pub mode: Mode,
    /// Content ID of the speculative-decoding draft model, if any.
    pub draft_model_id: Option<String>,
}

impl RunnerKey {
    pub fn new(backend: impl Into<String>, model_id: impl Into<String>, mode: Mode) -> Self {
        Self {
            backend: backend.into(),
            model_id: model_id.into(),
            mode,
            draft_model_id: None,
        }
    }

    pub fn with_draft(mut self, draft_model_id: impl Into<String>) -> Self {
        self.draft_model_id = Some(draft_model_id.into());
        self
    }
}

impl fmt::Display for RunnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.backend, self.model_id, self.mode)?;
        if let Some(draft) = &self.draft_model_id {
            write!(f, "+{draft}")?;
        }
        Ok(())
    }
}
