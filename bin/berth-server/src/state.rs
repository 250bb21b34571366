//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use berth_core::Scheduler;
use berth_core::recorder::Recorder;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// The scheduler core: backends, installer, loader, model store.
    pub scheduler: Arc<Scheduler>,
    /// Recent request/response capture ring.
    pub recorder: Arc<Recorder>,
}
