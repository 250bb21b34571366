//! The slot manager.
//!
//! A fixed arena of slots, each able to hold one supervised engine child.
//! The key→slot map stores integer indices; slots never move.  One mutex
//! guards the whole table — hold times are bounded by map operations, and
//! spawns, proxying and child teardown all happen outside the lock.  One
//! [`Notify`] is the loader-wide condition variable: acquisitions that must
//! wait (cold start in progress, pool exhausted, slot at its concurrency
//! cap) queue FIFO on it.
//!
//! Invariants maintained here:
//! - no two non-Empty slots share a runner key;
//! - `refcount == 0` implies `last_used` is set; `refcount > 0` blocks
//!   eviction;
//! - a slot whose child exited is drained and eventually Empty;
//! - releasing a reservation twice is impossible by construction (the
//!   guard consumes itself on drop).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::{LoaderConfig, RunnerConfig};
use crate::engine::Mode;
use crate::error::RunnerError;
use crate::memory::SystemMemory;
use crate::proxy::ProxyClient;
use crate::runner::{RunnerKey, RunnerProcess};
use crate::store::ModelHandle;

const POISONED: &str = "loader state poisoned";

/// Lifecycle of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SlotState {
    Empty,
    Starting,
    Ready,
    Draining,
}

/// A live engine child as the loader sees it.  [`RunnerProcess`] is the
/// production implementation; tests substitute scripted fakes.
pub(crate) trait SlotRunner: Send + Sync {
    fn proxy(&self) -> ProxyClient;
    fn stderr_tail(&self) -> String;
    fn exit_signal(&self) -> watch::Receiver<bool>;
    fn has_exited(&self) -> bool;
    /// Begin teardown; completion is reported through the exit signal.
    fn trigger_shutdown(&mut self);
}

impl SlotRunner for RunnerProcess {
    fn proxy(&self) -> ProxyClient {
        ProxyClient::new(self.endpoint().clone())
    }

    fn stderr_tail(&self) -> String {
        RunnerProcess::stderr_tail(self)
    }

    fn exit_signal(&self) -> watch::Receiver<bool> {
        RunnerProcess::exit_signal(self)
    }

    fn has_exited(&self) -> bool {
        RunnerProcess::has_exited(self)
    }

    fn trigger_shutdown(&mut self) {
        RunnerProcess::trigger_shutdown(self)
    }
}

/// Everything needed to cold-start a runner for a key, resolved upstream by
/// the scheduler.
pub(crate) struct SpawnRequest {
    pub backend: Backend,
    pub handle: ModelHandle,
    pub draft: Option<ModelHandle>,
    pub mode: Mode,
    pub config: RunnerConfig,
    /// Estimated RAM requirement, if the backend can produce one.
    pub memory_estimate: Option<u64>,
}

/// Spawns runners on behalf of the loader.
#[async_trait::async_trait]
pub(crate) trait Spawner: Send + Sync {
    async fn spawn(
        &self,
        key: &RunnerKey,
        slot: usize,
        req: &SpawnRequest,
    ) -> Result<Box<dyn SlotRunner>, RunnerError>;
}

struct Slot {
    state: SlotState,
    key: Option<RunnerKey>,
    /// Reference the model was requested by, for introspection.
    model_ref: Option<String>,
    runner: Option<Box<dyn SlotRunner>>,
    proxy: Option<ProxyClient>,
    refcount: usize,
    /// Set exactly when `refcount` drops to 0; cleared while in use.
    last_used: Option<Instant>,
    memory_estimate: Option<u64>,
    /// Bumped whenever the slot is rebound or emptied, so stale exit
    /// notifications and releases can be detected.
    generation: u64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            state: SlotState::Empty,
            key: None,
            model_ref: None,
            runner: None,
            proxy: None,
            refcount: 0,
            last_used: None,
            memory_estimate: None,
            generation: 0,
        }
    }

    fn idle_evictable(&self) -> bool {
        self.state == SlotState::Ready && self.refcount == 0
    }
}

struct LoaderState {
    slots: Vec<Slot>,
    by_key: HashMap<RunnerKey, usize>,
}

struct LoaderInner {
    state: Mutex<LoaderState>,
    /// Condition variable for acquisitions; waiters queue FIFO.
    slot_freed: Notify,
    /// Wakes the idle evictor when a new eviction candidate appears.
    evictor: Notify,
    config: LoaderConfig,
    spawner: Box<dyn Spawner>,
    memory: Option<Arc<dyn SystemMemory>>,
}

/// Snapshot of one slot for introspection (`/engines/ps`).
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    pub index: usize,
    pub state: SlotState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    pub refcount: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// The slot manager.  Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

/// A live hold on a Ready slot.  While any reservation for a slot exists,
/// the slot cannot be evicted.  Dropping the reservation releases it; there
/// is no way to release twice.
pub struct Reservation {
    inner: Arc<LoaderInner>,
    slot: usize,
    generation: u64,
    proxy: ProxyClient,
    key: RunnerKey,
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .field("key", &self.key)
            .finish()
    }
}

impl Reservation {
    pub fn proxy(&self) -> &ProxyClient {
        &self.proxy
    }

    pub fn key(&self) -> &RunnerKey {
        &self.key
    }

    /// Last ~1 KiB of the slot child's stderr, for `BackendUnavailable`
    /// diagnostics.
    pub fn stderr_tail(&self) -> String {
        let st = self.inner.state.lock().expect(POISONED);
        let slot = &st.slots[self.slot];
        if slot.generation == self.generation {
            slot.runner.as_ref().map(|r| r.stderr_tail()).unwrap_or_default()
        } else {
            String::new()
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        LoaderInner::release(&self.inner, self.slot, self.generation);
    }
}

/// Resets a Starting slot back to Empty unless defused; covers both spawn
/// failure and cancellation mid-spawn.
struct StartReset {
    armed: Option<(Arc<LoaderInner>, usize)>,
}

impl StartReset {
    fn defuse(&mut self) {
        self.armed = None;
    }
}

impl Drop for StartReset {
    fn drop(&mut self) {
        if let Some((inner, index)) = self.armed.take() {
            {
                let mut st = inner.state.lock().expect(POISONED);
                finalize_slot(&mut st, index);
            }
            inner.slot_freed.notify_waiters();
        }
    }
}

impl Loader {
    pub(crate) fn new(
        config: LoaderConfig,
        spawner: Box<dyn Spawner>,
        memory: Option<Arc<dyn SystemMemory>>,
    ) -> Self {
        let slots = (0..config.slot_count.max(1)).map(|_| Slot::empty()).collect();
        let inner = Arc::new(LoaderInner {
            state: Mutex::new(LoaderState {
                slots,
                by_key: HashMap::new(),
            }),
            slot_freed: Notify::new(),
            evictor: Notify::new(),
            config,
            spawner,
            memory,
        });
        if inner.config.idle_timeout.as_duration().is_some() {
            tokio::spawn(evict_loop(Arc::downgrade(&inner)));
        }
        Self { inner }
    }

    /// Acquire a reservation on a Ready slot bound to `key`, cold-starting
    /// a runner if necessary.
    ///
    /// Suspension points: waiting for an in-progress start of the same key,
    /// waiting for pool capacity (possibly after triggering an eviction),
    /// and the spawn itself.  Dropping the returned future at any of them
    /// leaves the table consistent.
    pub(crate) async fn acquire(
        &self,
        key: RunnerKey,
        req: SpawnRequest,
    ) -> Result<Reservation, RunnerError> {
        enum Plan {
            Start(usize),
            Wait,
        }

        loop {
            let mut notified = std::pin::pin!(self.inner.slot_freed.notified());
            let plan = {
                let mut st = self.inner.state.lock().expect(POISONED);
                if let Some(&index) = st.by_key.get(&key) {
                    let cap = self.inner.config.per_slot_concurrency.max(1);
                    let slot = &mut st.slots[index];
                    if slot.state == SlotState::Ready && slot.refcount < cap {
                        slot.refcount += 1;
                        slot.last_used = None;
                        return Ok(Reservation {
                            inner: Arc::clone(&self.inner),
                            slot: index,
                            generation: slot.generation,
                            proxy: slot.proxy.clone().expect("ready slot has a proxy"),
                            key,
                        });
                    }
                    // Starting (someone else is cold-starting this key),
                    // at capacity, or Draining: queue on the condvar.
                    notified.as_mut().enable();
                    Plan::Wait
                } else {
                    match self.plan_cold_start(&mut st, &key, &req)? {
                        Some(index) => Plan::Start(index),
                        None => {
                            notified.as_mut().enable();
                            Plan::Wait
                        }
                    }
                }
            };

            match plan {
                Plan::Start(index) => return self.start_slot(index, key, &req).await,
                Plan::Wait => notified.await,
            }
        }
    }

    /// Decide how to obtain a free slot for a cold start, under the lock.
    /// Returns `Ok(Some(i))` when slot `i` was reserved (now Starting),
    /// `Ok(None)` when the caller must wait (an eviction may have been
    /// triggered), or an error when admission fails outright.
    fn plan_cold_start(
        &self,
        st: &mut LoaderState,
        key: &RunnerKey,
        req: &SpawnRequest,
    ) -> Result<Option<usize>, RunnerError> {
        // ── Admission by memory ──────────────────────────────────────────────
        if let (Some(memory), Some(estimate)) = (self.inner.memory.as_ref(), req.memory_estimate) {
            let available = memory.available_bytes();
            if estimate > available {
                let victims: Vec<usize> = (0..st.slots.len())
                    .filter(|&i| st.slots[i].idle_evictable())
                    .collect();
                if victims.is_empty() {
                    return Err(RunnerError::InsufficientResources {
                        message: format!(
                            "model needs ~{} MiB, {} MiB available and nothing evictable",
                            estimate / (1 << 20),
                            available / (1 << 20),
                        ),
                    });
                }
                let freeable: u64 = victims
                    .iter()
                    .map(|&i| st.slots[i].memory_estimate.unwrap_or(0))
                    .sum();
                let all_known = victims
                    .iter()
                    .all(|&i| st.slots[i].memory_estimate.is_some());
                if all_known && estimate > available + freeable {
                    return Err(RunnerError::InsufficientResources {
                        message: format!(
                            "model needs ~{} MiB; eviction frees at most {} MiB",
                            estimate / (1 << 20),
                            (available + freeable) / (1 << 20),
                        ),
                    });
                }
                let victim = lru_of(st, &victims).expect("victims nonempty");
                info!(slot = victim, "evicting idle runner to free memory");
                drain_slot(st, victim);
                return Ok(None);
            }
        }

        // ── Free slot, or make one ───────────────────────────────────────────
        if let Some(index) = st.slots.iter().position(|s| s.state == SlotState::Empty) {
            let slot = &mut st.slots[index];
            slot.state = SlotState::Starting;
            slot.key = Some(key.clone());
            slot.generation += 1;
            st.by_key.insert(key.clone(), index);
            return Ok(Some(index));
        }
        let victims: Vec<usize> = (0..st.slots.len())
            .filter(|&i| st.slots[i].idle_evictable())
            .collect();
        if let Some(victim) = lru_of(st, &victims) {
            info!(slot = victim, "evicting idle runner to free a slot");
            drain_slot(st, victim);
        }
        // Either the eviction will notify us, or a release/finalize will.
        Ok(None)
    }

    /// Drive the spawn for a slot already marked Starting.
    async fn start_slot(
        &self,
        index: usize,
        key: RunnerKey,
        req: &SpawnRequest,
    ) -> Result<Reservation, RunnerError> {
        let mut reset = StartReset {
            armed: Some((Arc::clone(&self.inner), index)),
        };

        let runner = self.inner.spawner.spawn(&key, index, req).await?;
        let proxy = runner.proxy();
        let mut exit = runner.exit_signal();

        let generation = {
            let mut st = self.inner.state.lock().expect(POISONED);
            let slot = &mut st.slots[index];
            slot.state = SlotState::Ready;
            slot.model_ref = Some(req.handle.reference.clone());
            slot.runner = Some(runner);
            slot.proxy = Some(proxy.clone());
            slot.refcount = 1;
            slot.last_used = None;
            slot.memory_estimate = req.memory_estimate;
            slot.generation
        };
        reset.defuse();
        debug!(slot = index, key = %key, "runner ready");
        // Waiters for the same key can now share the slot.
        self.inner.slot_freed.notify_waiters();

        // The supervisor reports child death via the exit signal; the
        // watcher turns that message into a slot transition.
        let weak = Arc::downgrade(&self.inner);
        let watcher_key = key.clone();
        tokio::spawn(async move {
            if exit.wait_for(|exited| *exited).await.is_ok() {
                if let Some(inner) = weak.upgrade() {
                    warn!(slot = index, key = %watcher_key, "runner exited; draining slot");
                    LoaderInner::on_runner_exit(&inner, index, generation);
                }
            }
        });

        Ok(Reservation {
            inner: Arc::clone(&self.inner),
            slot: index,
            generation,
            proxy,
            key,
        })
    }

    /// Whether any runner for (`backend`, `model_id`, `mode`) — with any
    /// draft model — is currently Ready or Starting.  Used by `configure`
    /// to refuse changes that would race a live runner.
    pub(crate) fn is_active_for(&self, backend: &str, model_id: &str, mode: Mode) -> bool {
        let st = self.inner.state.lock().expect(POISONED);
        st.by_key.iter().any(|(key, &i)| {
            key.backend == backend
                && key.model_id == model_id
                && key.mode == mode
                && matches!(st.slots[i].state, SlotState::Ready | SlotState::Starting)
        })
    }

    /// Request eviction of every slot whose runner references one of
    /// `model_ids` (primary or draft).  Busy slots are marked Draining and
    /// torn down on release.  Returns how many slots were affected.
    pub(crate) fn unload_models(&self, model_ids: &[String]) -> usize {
        let mut affected = 0;
        {
            let mut st = self.inner.state.lock().expect(POISONED);
            for index in 0..st.slots.len() {
                let slot = &st.slots[index];
                let Some(slot_key) = &slot.key else { continue };
                let referenced = model_ids.iter().any(|id| {
                    slot_key.model_id == *id || slot_key.draft_model_id.as_deref() == Some(id)
                });
                if !referenced || slot.state != SlotState::Ready {
                    continue;
                }
                affected += 1;
                if slot.refcount == 0 {
                    drain_slot(&mut st, index);
                } else {
                    st.slots[index].state = SlotState::Draining;
                }
            }
        }
        self.inner.slot_freed.notify_waiters();
        affected
    }

    /// Copied snapshot of the slot table.
    pub fn ps(&self) -> Vec<SlotInfo> {
        let st = self.inner.state.lock().expect(POISONED);
        st.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotInfo {
                index,
                state: slot.state,
                backend: slot.key.as_ref().map(|k| k.backend.clone()),
                model_id: slot.key.as_ref().map(|k| k.model_id.clone()),
                model_ref: slot.model_ref.clone(),
                mode: slot.key.as_ref().map(|k| k.mode),
                refcount: slot.refcount,
                idle_ms: slot
                    .last_used
                    .map(|t| t.elapsed().as_millis() as u64),
                endpoint: slot
                    .proxy
                    .as_ref()
                    .map(|p| p.endpoint().to_string()),
            })
            .collect()
    }

    /// Ready slots and their proxies, for metrics aggregation.
    pub(crate) fn ready_proxies(&self) -> Vec<(RunnerKey, ProxyClient)> {
        let st = self.inner.state.lock().expect(POISONED);
        st.slots
            .iter()
            .filter(|s| s.state == SlotState::Ready)
            .filter_map(|s| Some((s.key.clone()?, s.proxy.clone()?)))
            .collect()
    }

    /// Tear down every runner and wait for the children to exit.  Used on
    /// graceful shutdown.
    pub(crate) async fn shutdown_all(&self) {
        let mut signals = Vec::new();
        {
            let mut st = self.inner.state.lock().expect(POISONED);
            for index in 0..st.slots.len() {
                let slot = &mut st.slots[index];
                if let Some(runner) = slot.runner.as_mut() {
                    slot.state = SlotState::Draining;
                    signals.push(runner.exit_signal());
                    runner.trigger_shutdown();
                }
            }
        }
        for mut signal in signals {
            let _ = signal.wait_for(|exited| *exited).await;
        }
    }
}

impl LoaderInner {
    /// Release one reservation hold on `index`.
    fn release(inner: &Arc<LoaderInner>, index: usize, generation: u64) {
        {
            let mut st = inner.state.lock().expect(POISONED);
            let slot = &mut st.slots[index];
            if slot.generation != generation {
                // The slot was force-recycled (child death path); nothing
                // left to release.
                return;
            }
            debug_assert!(slot.refcount > 0, "release with refcount 0");
            slot.refcount = slot.refcount.saturating_sub(1);
            if slot.refcount == 0 {
                slot.last_used = Some(Instant::now());
                if slot.state == SlotState::Draining {
                    let exited = slot
                        .runner
                        .as_ref()
                        .map(|r| r.has_exited())
                        .unwrap_or(true);
                    if exited {
                        finalize_slot(&mut st, index);
                    } else if let Some(runner) = st.slots[index].runner.as_mut() {
                        runner.trigger_shutdown();
                    }
                } else {
                    inner.evictor.notify_one();
                }
            }
        }
        inner.slot_freed.notify_waiters();
    }

    /// Message from the supervisor: the child for (`index`, `generation`)
    /// has exited.
    fn on_runner_exit(inner: &Arc<LoaderInner>, index: usize, generation: u64) {
        {
            let mut st = inner.state.lock().expect(POISONED);
            let slot = &mut st.slots[index];
            if slot.generation != generation {
                return;
            }
            if slot.refcount == 0 {
                finalize_slot(&mut st, index);
            } else {
                // In-flight requests observe proxy errors; the last release
                // finalizes.
                slot.state = SlotState::Draining;
            }
        }
        inner.slot_freed.notify_waiters();
    }
}

/// Transition a Ready, idle slot to Draining and start teardown.
fn drain_slot(st: &mut LoaderState, index: usize) {
    debug_assert_eq!(st.slots[index].refcount, 0);
    st.slots[index].state = SlotState::Draining;
    let has_runner = st.slots[index].runner.is_some();
    if has_runner {
        if let Some(runner) = st.slots[index].runner.as_mut() {
            runner.trigger_shutdown();
        }
    } else {
        finalize_slot(st, index);
    }
}

/// Return a slot to Empty, unbinding its key.
fn finalize_slot(st: &mut LoaderState, index: usize) {
    let slot = &mut st.slots[index];
    if let Some(key) = slot.key.take() {
        st.by_key.remove(&key);
    }
    let slot = &mut st.slots[index];
    slot.state = SlotState::Empty;
    slot.model_ref = None;
    slot.runner = None;
    slot.proxy = None;
    slot.refcount = 0;
    slot.last_used = None;
    slot.memory_estimate = None;
    slot.generation += 1;
}

/// LRU pick among candidate indices.
fn lru_of(st: &LoaderState, candidates: &[usize]) -> Option<usize> {
    candidates
        .iter()
        .copied()
        .min_by_key(|&i| st.slots[i].last_used.unwrap_or_else(Instant::now))
}

/// Background idle evictor: wakes on the earlier of a signal (a slot just
/// became idle) and the next idle deadline, then drains every slot whose
/// idle budget is spent.
async fn evict_loop(weak: Weak<LoaderInner>) {
    loop {
        let Some(inner) = weak.upgrade() else { return };
        let timeout = match inner.config.idle_timeout.as_duration() {
            Some(t) => t,
            None => return,
        };

        let next_deadline = {
            let mut st = inner.state.lock().expect(POISONED);
            let now = Instant::now();
            let mut due = Vec::new();
            for index in 0..st.slots.len() {
                let slot = &st.slots[index];
                if slot.idle_evictable()
                    && slot
                        .last_used
                        .map(|t| now.duration_since(t) >= timeout)
                        .unwrap_or(false)
                {
                    due.push(index);
                }
            }
            for index in due {
                info!(slot = index, "idle timeout reached; evicting runner");
                drain_slot(&mut st, index);
            }
            st.slots
                .iter()
                .filter(|s| s.idle_evictable())
                .filter_map(|s| s.last_used)
                .map(|t| t + timeout)
                .min()
        };
        inner.slot_freed.notify_waiters();

        // Cap the sleep so this task cannot outlive the loader for long.
        let fallback = Instant::now() + std::time::Duration::from_secs(60);
        let deadline = next_deadline.unwrap_or(fallback).min(fallback);
        tokio::select! {
            _ = inner.evictor.notified() => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }
        drop(inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::config::IdleTimeout;
    use crate::runner::Endpoint;
    use crate::store::{ModelFormat, RuntimeHints};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    // ── Fakes ─────────────────────────────────────────────────────────────────

    struct FakeRunner {
        exit_tx: watch::Sender<bool>,
        exit_rx: watch::Receiver<bool>,
        /// Memory returned to the shared pool on shutdown.
        gives_back: u64,
        pool: Option<Arc<AtomicU64>>,
    }

    impl FakeRunner {
        fn new() -> Self {
            let (exit_tx, exit_rx) = watch::channel(false);
            Self {
                exit_tx,
                exit_rx,
                gives_back: 0,
                pool: None,
            }
        }
    }

    impl SlotRunner for FakeRunner {
        fn proxy(&self) -> ProxyClient {
            ProxyClient::new(Endpoint::Tcp(1))
        }

        fn stderr_tail(&self) -> String {
            "fake stderr".into()
        }

        fn exit_signal(&self) -> watch::Receiver<bool> {
            self.exit_rx.clone()
        }

        fn has_exited(&self) -> bool {
            *self.exit_rx.borrow()
        }

        fn trigger_shutdown(&mut self) {
            if let Some(pool) = &self.pool {
                pool.fetch_add(self.gives_back, Ordering::SeqCst);
            }
            let _ = self.exit_tx.send(true);
        }
    }

    #[derive(Default)]
    struct FakeSpawner {
        spawns: AtomicUsize,
        delay: Option<Duration>,
        fail: bool,
        /// Shared "available memory" pool, debited on spawn.
        pool: Option<Arc<AtomicU64>>,
        /// Handles to exit senders so tests can simulate child death.
        exits: Mutex<Vec<watch::Sender<bool>>>,
    }

    #[async_trait::async_trait]
    impl Spawner for FakeSpawner {
        async fn spawn(
            &self,
            _key: &RunnerKey,
            _slot: usize,
            req: &SpawnRequest,
        ) -> Result<Box<dyn SlotRunner>, RunnerError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(RunnerError::internal("scripted spawn failure"));
            }
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let mut runner = FakeRunner::new();
            if let (Some(pool), Some(estimate)) = (&self.pool, req.memory_estimate) {
                pool.fetch_sub(estimate, Ordering::SeqCst);
                runner.gives_back = estimate;
                runner.pool = Some(Arc::clone(pool));
            }
            self.exits
                .lock()
                .expect("exits poisoned")
                .push(runner.exit_tx.clone());
            Ok(Box::new(runner))
        }
    }

    /// SystemMemory view over the shared pool.
    struct PoolMemory(Arc<AtomicU64>);

    impl SystemMemory for PoolMemory {
        fn available_bytes(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }

        fn total_bytes(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn key(model: &str) -> RunnerKey {
        RunnerKey::new("gguf", model, Mode::Completion)
    }

    fn request(estimate: Option<u64>) -> SpawnRequest {
        SpawnRequest {
            backend: Backend::new(BackendKind::Gguf, None),
            handle: ModelHandle {
                id: "sha256:abc".into(),
                reference: "ai/test".into(),
                format: ModelFormat::Gguf,
                weights_path: "/tmp/w.gguf".into(),
                chat_template_path: None,
                mmproj_path: None,
                draft_weights_path: None,
                hints: RuntimeHints::default(),
                size_bytes: 1,
            },
            draft: None,
            mode: Mode::Completion,
            config: RunnerConfig::default(),
            memory_estimate: estimate,
        }
    }

    fn loader_with(
        slots: usize,
        cap: usize,
        idle: IdleTimeout,
        spawner: Arc<FakeSpawner>,
        memory: Option<Arc<dyn SystemMemory>>,
    ) -> Loader {
        struct Shared(Arc<FakeSpawner>);

        #[async_trait::async_trait]
        impl Spawner for Shared {
            async fn spawn(
                &self,
                key: &RunnerKey,
                slot: usize,
                req: &SpawnRequest,
            ) -> Result<Box<dyn SlotRunner>, RunnerError> {
                self.0.spawn(key, slot, req).await
            }
        }

        Loader::new(
            LoaderConfig {
                slot_count: slots,
                per_slot_concurrency: cap,
                idle_timeout: idle,
                scratch_dir: std::env::temp_dir().join("berth-loader-tests"),
                ready_timeout: Duration::from_secs(1),
            },
            Box::new(Shared(spawner)),
            memory,
        )
    }

    async fn wait_for_state(loader: &Loader, index: usize, state: SlotState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if loader.ps()[index].state == state {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("slot {index} never reached {state}"));
    }

    // ── Acquisition & sharing ─────────────────────────────────────────────────

    #[tokio::test]
    async fn same_key_shares_one_runner() {
        let spawner = Arc::new(FakeSpawner::default());
        let loader = loader_with(2, 4, IdleTimeout::never(), Arc::clone(&spawner), None);

        let r1 = loader.acquire(key("m1"), request(None)).await.expect("r1");
        let r2 = loader.acquire(key("m1"), request(None)).await.expect("r2");
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1, "one cold start");
        assert_eq!(loader.ps()[0].refcount, 2);

        drop(r1);
        drop(r2);
        let info = &loader.ps()[0];
        assert_eq!(info.refcount, 0);
        assert!(info.idle_ms.is_some(), "refcount 0 implies last_used set");
    }

    #[tokio::test]
    async fn different_keys_get_different_slots() {
        let spawner = Arc::new(FakeSpawner::default());
        let loader = loader_with(2, 4, IdleTimeout::never(), Arc::clone(&spawner), None);

        let _r1 = loader.acquire(key("m1"), request(None)).await.expect("r1");
        let _r2 = loader.acquire(key("m2"), request(None)).await.expect("r2");
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 2);

        let ps = loader.ps();
        let keys: Vec<_> = ps.iter().filter_map(|s| s.model_id.clone()).collect();
        assert!(keys.contains(&"m1".to_owned()));
        assert!(keys.contains(&"m2".to_owned()));
    }

    #[tokio::test]
    async fn concurrent_cold_starts_of_same_key_spawn_once() {
        let spawner = Arc::new(FakeSpawner {
            delay: Some(Duration::from_millis(100)),
            ..FakeSpawner::default()
        });
        let loader = loader_with(2, 4, IdleTimeout::never(), Arc::clone(&spawner), None);

        let l1 = loader.clone();
        let l2 = loader.clone();
        let (a, b) = tokio::join!(
            l1.acquire(key("m1"), request(None)),
            l2.acquire(key("m1"), request(None)),
        );
        a.expect("first acquire");
        b.expect("second acquire");
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1, "key uniqueness");
    }

    #[tokio::test]
    async fn per_slot_concurrency_cap_blocks_excess_requests() {
        let spawner = Arc::new(FakeSpawner::default());
        let loader = loader_with(1, 1, IdleTimeout::never(), Arc::clone(&spawner), None);

        let r1 = loader.acquire(key("m1"), request(None)).await.expect("r1");
        let pending = tokio::spawn({
            let loader = loader.clone();
            async move { loader.acquire(key("m1"), request(None)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished(), "second request must wait at cap");

        drop(r1);
        let r2 = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("acquire resumes after release")
            .expect("join")
            .expect("acquire");
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1);
        drop(r2);
    }

    #[tokio::test]
    async fn spawn_failure_unbinds_the_key_and_empties_the_slot() {
        let spawner = Arc::new(FakeSpawner {
            fail: true,
            ..FakeSpawner::default()
        });
        let loader = loader_with(1, 4, IdleTimeout::never(), Arc::clone(&spawner), None);

        let err = loader.acquire(key("m1"), request(None)).await.unwrap_err();
        assert!(matches!(err, RunnerError::InternalError { .. }));
        assert_eq!(loader.ps()[0].state, SlotState::Empty);
        assert!(loader.ps()[0].model_id.is_none(), "key unbound after failure");
    }

    // ── Eviction ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pool_exhaustion_evicts_the_idle_lru_slot() {
        let spawner = Arc::new(FakeSpawner::default());
        let loader = loader_with(1, 4, IdleTimeout::never(), Arc::clone(&spawner), None);

        let r1 = loader.acquire(key("m1"), request(None)).await.expect("r1");
        drop(r1);

        let r2 = tokio::time::timeout(
            Duration::from_secs(5),
            loader.acquire(key("m2"), request(None)),
        )
        .await
        .expect("eviction unblocks the acquire")
        .expect("r2");
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 2);
        assert_eq!(loader.ps()[0].model_id.as_deref(), Some("m2"));
        drop(r2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_slots_are_evicted_after_the_timeout() {
        let spawner = Arc::new(FakeSpawner::default());
        let loader = loader_with(
            2,
            4,
            IdleTimeout::from_duration(Duration::from_secs(60)),
            Arc::clone(&spawner),
            None,
        );

        let r1 = loader.acquire(key("m1"), request(None)).await.expect("r1");
        drop(r1);
        assert_eq!(loader.ps()[0].state, SlotState::Ready);

        // Virtual time: sleeps auto-advance past the 60 s idle budget.
        tokio::time::sleep(Duration::from_secs(70)).await;
        wait_for_state(&loader, 0, SlotState::Empty).await;
        assert!(loader.ps()[0].model_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn held_reservations_block_idle_eviction() {
        let spawner = Arc::new(FakeSpawner::default());
        let loader = loader_with(
            1,
            4,
            IdleTimeout::from_duration(Duration::from_secs(60)),
            Arc::clone(&spawner),
            None,
        );

        let r1 = loader.acquire(key("m1"), request(None)).await.expect("r1");
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(loader.ps()[0].state, SlotState::Ready, "in-use slot survives");
        drop(r1);
    }

    #[tokio::test]
    async fn unload_drains_idle_slots_immediately() {
        let spawner = Arc::new(FakeSpawner::default());
        let loader = loader_with(2, 4, IdleTimeout::never(), Arc::clone(&spawner), None);

        let r1 = loader.acquire(key("m1"), request(None)).await.expect("r1");
        drop(r1);
        let affected = loader.unload_models(&["m1".to_owned()]);
        assert_eq!(affected, 1);
        wait_for_state(&loader, 0, SlotState::Empty).await;
    }

    #[tokio::test]
    async fn unload_of_a_busy_slot_drains_on_release() {
        let spawner = Arc::new(FakeSpawner::default());
        let loader = loader_with(2, 4, IdleTimeout::never(), Arc::clone(&spawner), None);

        let r1 = loader.acquire(key("m1"), request(None)).await.expect("r1");
        let affected = loader.unload_models(&["m1".to_owned()]);
        assert_eq!(affected, 1);
        assert_eq!(loader.ps()[0].state, SlotState::Draining);

        drop(r1);
        wait_for_state(&loader, 0, SlotState::Empty).await;
    }

    #[tokio::test]
    async fn child_death_drains_an_idle_slot() {
        let spawner = Arc::new(FakeSpawner::default());
        let loader = loader_with(2, 4, IdleTimeout::never(), Arc::clone(&spawner), None);

        let r1 = loader.acquire(key("m1"), request(None)).await.expect("r1");
        drop(r1);

        // Simulate the child dying on its own.
        let exit = spawner.exits.lock().expect("exits")[0].clone();
        let _ = exit.send(true);

        wait_for_state(&loader, 0, SlotState::Empty).await;
        // A fresh acquire cold-starts again.
        let _r2 = loader.acquire(key("m1"), request(None)).await.expect("r2");
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 2);
    }

    // ── Admission by memory ───────────────────────────────────────────────────

    #[tokio::test]
    async fn admission_fails_when_nothing_is_evictable() {
        let pool = Arc::new(AtomicU64::new(1000));
        let spawner = Arc::new(FakeSpawner {
            pool: Some(Arc::clone(&pool)),
            ..FakeSpawner::default()
        });
        let loader = loader_with(
            2,
            4,
            IdleTimeout::never(),
            Arc::clone(&spawner),
            Some(Arc::new(PoolMemory(Arc::clone(&pool)))),
        );

        let err = loader
            .acquire(key("m1"), request(Some(5000)))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::InsufficientResources { .. }));
    }

    #[tokio::test]
    async fn admission_evicts_an_idle_slot_to_make_room() {
        let pool = Arc::new(AtomicU64::new(1000));
        let spawner = Arc::new(FakeSpawner {
            pool: Some(Arc::clone(&pool)),
            ..FakeSpawner::default()
        });
        let loader = loader_with(
            2,
            4,
            IdleTimeout::never(),
            Arc::clone(&spawner),
            Some(Arc::new(PoolMemory(Arc::clone(&pool)))),
        );

        // First model takes 600 of 1000.
        let r1 = loader.acquire(key("m1"), request(Some(600))).await.expect("r1");
        drop(r1);
        assert_eq!(pool.load(Ordering::SeqCst), 400);

        // Second model needs 600; evicting m1 frees enough.
        let r2 = tokio::time::timeout(
            Duration::from_secs(5),
            loader.acquire(key("m2"), request(Some(600))),
        )
        .await
        .expect("admission eviction unblocks")
        .expect("r2");
        assert_eq!(loader.ps().iter().filter(|s| s.state == SlotState::Ready).count(), 1);
        drop(r2);
    }

    #[tokio::test]
    async fn admission_fails_fast_when_eviction_cannot_free_enough() {
        let pool = Arc::new(AtomicU64::new(1000));
        let spawner = Arc::new(FakeSpawner {
            pool: Some(Arc::clone(&pool)),
            ..FakeSpawner::default()
        });
        let loader = loader_with(
            2,
            4,
            IdleTimeout::never(),
            Arc::clone(&spawner),
            Some(Arc::new(PoolMemory(Arc::clone(&pool)))),
        );

        let r1 = loader.acquire(key("m1"), request(Some(600))).await.expect("r1");
        drop(r1);

        let err = loader
            .acquire(key("m2"), request(Some(5000)))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::InsufficientResources { .. }));
        // The idle slot was not pointlessly evicted.
        assert_eq!(loader.ps()[0].state, SlotState::Ready);
    }
}
