//! Loader and per-runner configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Idle-eviction budget for a slot with refcount 0.
///
/// Parsed from a duration string (`"5m"`, `"90s"`, `"1h"`).  `"0"` disables
/// eviction.  Anything below one minute or above 24 hours is rejected at
/// startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimeout(Option<Duration>);

impl IdleTimeout {
    pub const MIN: Duration = Duration::from_secs(60);
    pub const MAX: Duration = Duration::from_secs(24 * 60 * 60);
    pub const DEFAULT: IdleTimeout = IdleTimeout(Some(Duration::from_secs(5 * 60)));

    /// Parse a duration string into a validated timeout.
    pub fn parse(s: &str) -> Result<Self, RunnerError> {
        let s = s.trim();
        if s == "0" {
            return Ok(IdleTimeout(None));
        }
        let d = humantime::parse_duration(s).map_err(|e| {
            RunnerError::invalid(format!("bad idle timeout {s:?}: {e}"))
        })?;
        if d.is_zero() {
            return Ok(IdleTimeout(None));
        }
        if d < Self::MIN || d > Self::MAX {
            return Err(RunnerError::invalid(format!(
                "idle timeout {s:?} out of range [1m, 24h]"
            )));
        }
        Ok(IdleTimeout(Some(d)))
    }

    /// `None` means eviction is disabled.
    pub fn as_duration(&self) -> Option<Duration> {
        self.0
    }

    pub fn never() -> Self {
        IdleTimeout(None)
    }

    #[cfg(test)]
    pub(crate) fn from_duration(d: Duration) -> Self {
        IdleTimeout(Some(d))
    }
}

impl Default for IdleTimeout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Per-runner configuration recorded by `configure` and applied on the next
/// spawn of that runner key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Context size in tokens, overriding the model's hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,
    /// Draft model reference for speculative decoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_model: Option<String>,
    /// User-provided runtime flags, validated against the engine allow-list
    /// before they reach an argv.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtime_flags: Vec<String>,
}

/// Construction-time configuration of the [`Loader`].
///
/// [`Loader`]: crate::loader::Loader
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Number of slots in the pool.
    pub slot_count: usize,
    /// Maximum concurrent in-flight requests per slot; further acquisitions
    /// of the same key wait.
    pub per_slot_concurrency: usize,
    pub idle_timeout: IdleTimeout,
    /// Scratch directory for per-slot Unix sockets and runner working dirs.
    pub scratch_dir: PathBuf,
    /// Cap on the readiness probe after spawning a runner.
    pub ready_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            slot_count: 2,
            per_slot_concurrency: 4,
            idle_timeout: IdleTimeout::default(),
            scratch_dir: std::env::temp_dir().join("berth"),
            ready_timeout: Duration::from_secs(60),
        }
    }
}
