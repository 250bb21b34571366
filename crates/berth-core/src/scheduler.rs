//! The scheduler façade.
//!
//! One object owns the backend registry, the install gate, the slot loader
//! and the model store seam.  `dispatch` is the whole request path:
//! backend selection → install gate → model resolution → format-aware
//! backend reselection → per-runner config lookup → slot acquisition.  The
//! returned [`Ticket`] performs the reverse proxy and keeps the slot
//! reservation alive until the response body has fully streamed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{Request, Response};
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{Backend, BackendKind, BackendSet, EndpointKind};
use crate::config::{LoaderConfig, RunnerConfig};
use crate::engine::{self, Mode, SpawnSpec};
use crate::error::RunnerError;
use crate::install::{InstallState, Installer};
use crate::loader::{Loader, SlotInfo, SlotRunner, SpawnRequest, Spawner};
use crate::memory::{SysinfoMemory, SystemMemory};
use crate::proxy::GuardedBody;
use crate::runner::{Endpoint, RunnerKey, RunnerProcess};
use crate::sanitize::sanitize_for_log;
use crate::store::{ModelFormat, ModelHandle, ModelStore};

/// Builder for [`Scheduler`].  `build` starts the installer and the idle
/// evictor, so it must run inside a Tokio runtime.
pub struct SchedulerBuilder {
    backends: BackendSet,
    store: Arc<dyn ModelStore>,
    loader_config: LoaderConfig,
    memory: Option<Arc<dyn SystemMemory>>,
    spawner: Option<Box<dyn Spawner>>,
}

impl SchedulerBuilder {
    pub fn new(backends: BackendSet, store: Arc<dyn ModelStore>) -> Self {
        Self {
            backends,
            store,
            loader_config: LoaderConfig::default(),
            memory: None,
            spawner: None,
        }
    }

    pub fn loader_config(mut self, config: LoaderConfig) -> Self {
        self.loader_config = config;
        self
    }

    /// Override the memory view used for admission (defaults to sysinfo).
    pub fn memory(mut self, memory: Arc<dyn SystemMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    #[cfg(test)]
    pub(crate) fn spawner(mut self, spawner: Box<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn build(self) -> Arc<Scheduler> {
        let installer = Installer::start(&self.backends);
        let spawner = self.spawner.unwrap_or_else(|| {
            Box::new(EngineSpawner {
                scratch: self.loader_config.scratch_dir.clone(),
                ready_timeout: self.loader_config.ready_timeout,
            })
        });
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(SysinfoMemory::new()) as Arc<dyn SystemMemory>);
        let loader = Loader::new(self.loader_config, spawner, Some(memory));
        Arc::new(Scheduler {
            backends: self.backends,
            installer,
            loader,
            store: self.store,
            configs: Mutex::new(HashMap::new()),
        })
    }
}

/// Install state plus identity, one row of `/engines/status`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub install: InstallState,
    pub default: bool,
    pub endpoint: EndpointKind,
}

/// One row of `/engines/df`.
#[derive(Debug, Clone, Serialize)]
pub struct DiskUsage {
    pub models_bytes: u64,
    pub backends: Vec<BackendDiskUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendDiskUsage {
    pub name: String,
    pub bytes: u64,
}

/// The control plane core.
pub struct Scheduler {
    backends: BackendSet,
    installer: Installer,
    loader: Loader,
    store: Arc<dyn ModelStore>,
    /// Per-runner configs keyed by (backend, model, mode); the draft model
    /// recorded inside the config joins the runner key at dispatch.
    configs: Mutex<HashMap<RunnerKey, RunnerConfig>>,
}

/// A dispatched request: a slot reservation plus the proxy to its runner.
pub struct Ticket {
    reservation: crate::loader::Reservation,
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("reservation", &self.reservation)
            .finish()
    }
}

impl Ticket {
    pub fn key(&self) -> &RunnerKey {
        self.reservation.key()
    }

    /// Reverse-proxy `req` to the reserved slot.  The reservation rides
    /// inside the response body and is released when the body finishes
    /// streaming (or is dropped).
    pub async fn forward<B>(self, req: Request<B>) -> Result<Response<GuardedBody>, RunnerError>
    where
        B: http_body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let proxy = self.reservation.proxy().clone();
        match proxy.forward(req).await {
            Ok(resp) => Ok(resp.map(|body| GuardedBody::new(body, self.reservation))),
            Err(e) => Err(RunnerError::BackendUnavailable {
                backend: self.reservation.key().backend.clone(),
                message: e.to_string(),
                stderr_tail: self.reservation.stderr_tail(),
            }),
        }
    }
}

impl Scheduler {
    /// Resolve everything needed to serve a request and acquire a slot.
    ///
    /// `segment` is the backend path segment if the caller provided one.
    pub async fn dispatch(
        &self,
        segment: Option<&str>,
        model_ref: &str,
        mode: Mode,
    ) -> Result<Ticket, RunnerError> {
        let requested = self.select_backend(segment)?;
        self.installer.await_ready(requested.name()).await?;

        // Resolve the model, then let its format override the caller's
        // backend choice where a capable backend exists.
        let (backend, handle) = if requested.manages_own_models() {
            (requested, ModelHandle::unresolved(model_ref))
        } else {
            let handle = self.store.get_local(model_ref).await?;
            let backend = self.reselect_for_format(requested, &handle).await?;
            (backend, handle)
        };

        // Per-runner configuration recorded by `configure`, applied on the
        // next spawn (an already-Ready runner is not reconfigured).
        let base_key = RunnerKey::new(backend.name(), &handle.id, mode);
        let config = self
            .configs
            .lock()
            .expect("config table poisoned")
            .get(&base_key)
            .cloned()
            .unwrap_or_default();

        let draft = match &config.draft_model {
            Some(reference) => Some(self.store.get_local(reference).await?),
            None => None,
        };
        let key = match &draft {
            Some(d) => base_key.clone().with_draft(&d.id),
            None => base_key,
        };

        let memory_estimate = backend.estimate_memory(&handle, config.context_size);
        let reservation = self
            .loader
            .acquire(
                key,
                SpawnRequest {
                    backend: backend.clone(),
                    handle,
                    draft,
                    mode,
                    config,
                    memory_estimate,
                },
            )
            .await?;
        Ok(Ticket { reservation })
    }

    /// Record a per-runner configuration, applied on the next spawn of the
    /// runner key.  Refused with [`RunnerError::RunnerAlreadyActive`] while
    /// a runner for the same (backend, model, mode) is Ready or Starting.
    pub async fn configure(
        &self,
        segment: Option<&str>,
        model_ref: &str,
        mode: Mode,
        config: RunnerConfig,
    ) -> Result<(), RunnerError> {
        let requested = self.select_backend(segment)?;

        let (backend, model_id) = if requested.manages_own_models() {
            (requested, model_ref.to_owned())
        } else {
            let handle = self.store.get_local(model_ref).await?;
            let backend = self.reselect_for_format(requested, &handle).await?;
            (backend, handle.id)
        };

        engine::flags::validate(backend.kind(), &config.runtime_flags)?;
        if let Some(reference) = &config.draft_model {
            // The draft must exist locally before it can join a spawn.
            self.store.resolve_id(reference).await?;
        }

        if self.loader.is_active_for(backend.name(), &model_id, mode) {
            return Err(RunnerError::RunnerAlreadyActive);
        }

        info!(
            backend = backend.name(),
            model = %sanitize_for_log(model_ref),
            %mode,
            "runner configuration recorded"
        );
        self.configs
            .lock()
            .expect("config table poisoned")
            .insert(RunnerKey::new(backend.name(), model_id, mode), config);
        Ok(())
    }

    /// Request eviction of every slot serving one of `model_refs`.  Unknown
    /// references are skipped.  Returns the number of affected slots.
    pub async fn unload(&self, model_refs: &[String]) -> Result<usize, RunnerError> {
        let mut ids = Vec::with_capacity(model_refs.len());
        for reference in model_refs {
            match self.store.resolve_id(reference).await {
                Ok(id) => ids.push(id),
                // The runner key for backend-managed models is the raw ref.
                Err(RunnerError::ModelNotFound { .. }) => ids.push(reference.clone()),
                Err(e) => return Err(e),
            }
        }
        Ok(self.loader.unload_models(&ids))
    }

    /// Backend install states, one entry per registered backend.
    pub fn status(&self) -> Vec<BackendStatus> {
        let states = self.installer.states();
        self.backends
            .iter()
            .map(|b| BackendStatus {
                name: b.name().to_owned(),
                install: states
                    .get(b.name())
                    .cloned()
                    .unwrap_or(InstallState::Installing),
                default: b.kind() == BackendKind::Gguf,
                endpoint: b.endpoint_kind(),
            })
            .collect()
    }

    /// Snapshot of the slot table.
    pub fn ps(&self) -> Vec<SlotInfo> {
        self.loader.ps()
    }

    /// Disk usage of the model store and each backend installation.
    pub async fn disk_usage(&self) -> Result<DiskUsage, RunnerError> {
        Ok(DiskUsage {
            models_bytes: self.store.disk_usage().await?,
            backends: self
                .backends
                .iter()
                .map(|b| BackendDiskUsage {
                    name: b.name().to_owned(),
                    bytes: b.disk_usage(),
                })
                .collect(),
        })
    }

    /// Scrape `/metrics` from every Ready runner, concatenated under
    /// per-runner banners.  Runners that fail to answer are reported as a
    /// comment line rather than failing the whole scrape.
    pub async fn aggregate_metrics(&self) -> String {
        let mut out = String::new();
        for (key, proxy) in self.loader.ready_proxies() {
            out.push_str(&format!("# runner {key}\n"));
            match proxy.get("/metrics").await {
                Ok((status, body)) if status.is_success() => {
                    out.push_str(&String::from_utf8_lossy(&body));
                }
                Ok((status, _)) => {
                    out.push_str(&format!("# runner {key} returned {status}\n"));
                }
                Err(e) => {
                    out.push_str(&format!("# runner {key} unreachable: {e}\n"));
                }
            }
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }

    /// The model store this scheduler resolves against.
    pub fn store(&self) -> &Arc<dyn ModelStore> {
        &self.store
    }

    /// Whether `name` is a registered backend.
    pub fn has_backend(&self, name: &str) -> bool {
        self.backends.get(name).is_some()
    }

    /// Tear down all runners; used on graceful shutdown.
    pub async fn shutdown(&self) {
        self.loader.shutdown_all().await;
    }

    // ── Internal ─────────────────────────────────────────────────────────────

    fn select_backend(&self, segment: Option<&str>) -> Result<&Backend, RunnerError> {
        match segment {
            Some(name) => self
                .backends
                .get(name)
                .ok_or_else(|| RunnerError::BackendNotFound {
                    name: sanitize_for_log(name),
                }),
            None => self
                .backends
                .default_backend()
                .ok_or_else(|| RunnerError::BackendNotFound {
                    name: BackendKind::Gguf.name().to_owned(),
                }),
        }
    }

    /// Safetensors models override the caller's backend choice when a
    /// capable backend is registered.  The override gates on that backend's
    /// installer before committing.
    async fn reselect_for_format<'a>(
        &'a self,
        requested: &'a Backend,
        handle: &ModelHandle,
    ) -> Result<&'a Backend, RunnerError> {
        if handle.format != ModelFormat::Safetensors
            || requested.serves_format(ModelFormat::Safetensors)
        {
            return Ok(requested);
        }
        match self.backends.safetensors_capable() {
            Some(capable) => {
                warn!(
                    requested = requested.name(),
                    selected = capable.name(),
                    model = %sanitize_for_log(&handle.reference),
                    "model is safetensors; overriding requested backend"
                );
                self.installer.await_ready(capable.name()).await?;
                Ok(capable)
            }
            None => {
                warn!(
                    requested = requested.name(),
                    model = %sanitize_for_log(&handle.reference),
                    "safetensors model but no capable backend registered"
                );
                Ok(requested)
            }
        }
    }
}

/// Production [`Spawner`]: allocates the endpoint, composes the argv via the
/// engine adapter, and supervises the child.
struct EngineSpawner {
    scratch: std::path::PathBuf,
    ready_timeout: Duration,
}

#[async_trait::async_trait]
impl Spawner for EngineSpawner {
    async fn spawn(
        &self,
        key: &RunnerKey,
        slot: usize,
        req: &SpawnRequest,
    ) -> Result<Box<dyn SlotRunner>, RunnerError> {
        let endpoint =
            Endpoint::allocate(req.backend.endpoint_kind(), &self.scratch, slot).await?;
        let plan = engine::plan(&SpawnSpec {
            backend: &req.backend,
            handle: &req.handle,
            draft: req.draft.as_ref(),
            mode: req.mode,
            endpoint: &endpoint,
            config: &req.config,
        })?;
        info!(key = %key, slot, endpoint = %endpoint, "starting engine runner");

        let backend_name = req.backend.kind().name();
        let runner = RunnerProcess::spawn(
            &plan,
            endpoint,
            &self.scratch,
            self.ready_timeout,
            backend_name,
        )
        .await
        .map_err(|e| RunnerError::BackendUnavailable {
            backend: backend_name.to_owned(),
            message: e.message,
            stderr_tail: e.stderr_tail,
        })?;
        Ok(Box::new(runner))
    }
}
