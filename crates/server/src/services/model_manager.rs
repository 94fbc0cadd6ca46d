//! Multi-model lifecycle manager.
//!
//! Owns every resident runtime and is the only code that loads or unloads
//! one. Each model key maps to a slot with a small state machine
//! (Loading → Ready → Unloading → gone):
//!
//! - Per-key linearisation: all transitions and refcount increments happen
//!   under the key's `DashMap` shard lock, which is never held across an
//!   engine call. Distinct models load and unload in parallel.
//! - Single-flight loads: the first `acquire` of a vacant key installs a
//!   `LoadFlight`; later callers join it and share its outcome.
//! - Leases: `acquire` returns a [`ModelLease`] that counts as one reference
//!   until dropped. Models with references are never unloaded.
//! - Optional capacity limit with LRU eviction of idle models.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use llama_runtime::{Engine, Runtime};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::registry::{ModelDescriptor, ModelRegistry, model_key};

//  Errors

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("The model '{0}' does not exist")]
    ModelNotFound(String),

    #[error("Failed to load model '{model}': {reason}")]
    LoadFailure { model: String, reason: String },

    #[error("Model '{0}' has requests in flight")]
    ModelBusy(String),

    #[error("Resident model limit ({limit}) reached and every resident model is busy")]
    CapacityExceeded { limit: usize },

    #[error("Failed to unload model '{model}': {reason}")]
    UnloadFailure { model: String, reason: String },

    #[error("{0}")]
    Internal(String),
}

//  Types

/// Status of a model slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Loading,
    Ready,
    Unloading,
}

/// Configuration for the model manager.
#[derive(Debug, Clone)]
pub struct ModelManagerConfig {
    /// Maximum number of simultaneously resident models (`None` or 0 = unlimited).
    pub max_resident: Option<usize>,
    /// Upper bound on a single engine load.
    pub load_timeout: Duration,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            max_resident: None,
            load_timeout: Duration::from_secs(120),
        }
    }
}

/// A loaded model instance plus its bookkeeping.
pub struct ResidentModel {
    descriptor: Arc<ModelDescriptor>,
    runtime: Arc<dyn Runtime>,
    refs: AtomicUsize,
    /// Millis since `epoch` of the last acquire/release.
    last_access: AtomicU64,
    epoch: Instant,
}

impl ResidentModel {
    fn new(
        descriptor: Arc<ModelDescriptor>,
        runtime: Arc<dyn Runtime>,
        refs: usize,
        epoch: Instant,
    ) -> Self {
        let model = Self {
            descriptor,
            runtime,
            refs: AtomicUsize::new(refs),
            last_access: AtomicU64::new(0),
            epoch,
        };
        model.touch();
        model
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    pub fn runtime(&self) -> Arc<dyn Runtime> {
        self.runtime.clone()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Time since the last acquire or release.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_access.load(Ordering::SeqCst);
        Duration::from_millis(self.now_millis().saturating_sub(last))
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch(&self) {
        self.last_access.store(self.now_millis(), Ordering::SeqCst);
    }

    fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    fn release(&self) {
        let prev = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if prev.is_err() {
            error!(model = %self.name(), "Release without a matching acquire");
        }
        self.touch();
    }
}

impl fmt::Debug for ResidentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResidentModel")
            .field("name", &self.descriptor.name)
            .field("refs", &self.ref_count())
            .field("idle_for", &self.idle_for())
            .finish()
    }
}

/// One reference to a resident model. Dropping it releases the reference.
#[derive(Debug)]
pub struct ModelLease {
    model: Arc<ResidentModel>,
}

impl ModelLease {
    fn new(model: Arc<ResidentModel>) -> Self {
        Self { model }
    }

    pub fn name(&self) -> &str {
        self.model.name()
    }

    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        self.model.descriptor()
    }

    pub fn runtime(&self) -> Arc<dyn Runtime> {
        self.model.runtime()
    }

    pub fn ref_count(&self) -> usize {
        self.model.ref_count()
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.model.release();
    }
}

/// Snapshot of one slot, for listings and health output.
#[derive(Debug, Clone, Serialize)]
pub struct ResidentInfo {
    pub id: String,
    pub name: String,
    pub path: String,
    pub status: ModelStatus,
    pub ref_count: usize,
    pub busy: bool,
    pub idle_secs: f64,
}

/// What to unload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnloadTarget {
    All,
    Model(String),
}

impl UnloadTarget {
    /// `"all"` (any case) selects every resident model.
    pub fn parse(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("all") {
            Self::All
        } else {
            Self::Model(name.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnloadSummary {
    pub unloaded: Vec<String>,
    pub busy: Vec<String>,
    pub failed: Vec<String>,
}

/// Lifecycle event published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelEvent {
    pub kind: ModelEventKind,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelEventKind {
    Loaded,
    LoadFailed,
    Unloaded,
    Evicted,
    UnloadFailed,
}

impl ModelEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loaded => "model.loaded",
            Self::LoadFailed => "model.load_failed",
            Self::Unloaded => "model.unloaded",
            Self::Evicted => "model.evicted",
            Self::UnloadFailed => "model.unload_failed",
        }
    }
}

//  Internal state

type LoadOutcome = Result<Arc<ResidentModel>, ManagerError>;

/// An in-progress load that later callers attach to.
struct LoadFlight {
    descriptor: Arc<ModelDescriptor>,
    /// Callers waiting on this load, the initiator included. Only changed
    /// under the key's shard lock.
    joiners: AtomicUsize,
    outcome: watch::Sender<Option<LoadOutcome>>,
}

enum Slot {
    Loading(Arc<LoadFlight>),
    Ready(Arc<ResidentModel>),
    Unloading {
        model: Arc<ResidentModel>,
        done: watch::Receiver<bool>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnloadReason {
    Explicit,
    Idle,
    Capacity,
}

impl UnloadReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Idle => "idle_timeout",
            Self::Capacity => "capacity",
        }
    }
}

enum UnloadOutcome {
    Unloaded(String),
    NotResident,
    NotIdle,
    Busy(String),
    Failed { model: String, reason: String },
}

enum Attach {
    Hit(ModelLease),
    Join(JoinTicket),
    WaitUnload(watch::Receiver<bool>),
    Vacant,
}

enum Eviction {
    Victim(String),
    Draining(watch::Receiver<bool>),
    Nothing,
}

struct Inner {
    engine: Arc<dyn Engine>,
    registry: Arc<ModelRegistry>,
    slots: DashMap<String, Slot>,
    /// Capacity held by Ready and Unloading slots plus loads that have
    /// reserved; bounded by `max_resident`.
    occupied: AtomicUsize,
    config: ModelManagerConfig,
    epoch: Instant,
    events: broadcast::Sender<ModelEvent>,
}

//  ModelManager

#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<Inner>,
}

impl ModelManager {
    pub fn new(
        engine: Arc<dyn Engine>,
        registry: Arc<ModelRegistry>,
        config: ModelManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                engine,
                registry,
                slots: DashMap::new(),
                occupied: AtomicUsize::new(0),
                config,
                epoch: Instant::now(),
                events,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    pub fn engine_name(&self) -> &str {
        self.inner.engine.name()
    }

    pub fn max_resident(&self) -> Option<usize> {
        self.inner.config.max_resident.filter(|&n| n > 0)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.inner.events.subscribe()
    }

    //  Acquire / release

    /// Get a lease on `name` (or the default model), loading it if needed.
    pub async fn acquire(&self, name: Option<&str>) -> Result<ModelLease, ManagerError> {
        let requested = match name {
            Some(n) => n.to_string(),
            None => self
                .inner
                .registry
                .default_model()
                .ok_or_else(|| ManagerError::ModelNotFound("(default)".into()))?,
        };
        let key = model_key(&requested);

        loop {
            match self.try_attach(&key) {
                Attach::Hit(lease) => return Ok(lease),
                Attach::Join(ticket) => return ticket.wait().await,
                Attach::WaitUnload(mut done) => {
                    debug!(key, "Waiting for unload to finish before reloading");
                    let _ = done.wait_for(|finished| *finished).await;
                    continue;
                }
                Attach::Vacant => {}
            }

            // Only vacant keys consult the registry: a resident model stays
            // usable after a reload dropped its descriptor.
            let descriptor = self
                .inner
                .registry
                .resolve(&key)
                .ok_or_else(|| ManagerError::ModelNotFound(requested.clone()))?;

            // The Loading marker goes in before any capacity wait, so callers
            // racing on the same key join this flight instead of competing
            // for a slot.
            let ticket = match self.inner.slots.entry(key.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    let (outcome, _) = watch::channel(None);
                    let flight = Arc::new(LoadFlight {
                        descriptor: descriptor.clone(),
                        joiners: AtomicUsize::new(1),
                        outcome,
                    });
                    vacant.insert(Slot::Loading(flight.clone()));
                    JoinTicket::new(self.clone(), key.clone(), flight)
                }
            };

            self.spawn_load(key.clone(), ticket.flight.clone());
            return ticket.wait().await;
        }
    }

    /// Give a lease back. Same as dropping it.
    pub fn release(&self, lease: ModelLease) {
        drop(lease);
    }

    fn try_attach(&self, key: &str) -> Attach {
        let Some(slot) = self.inner.slots.get(key) else {
            return Attach::Vacant;
        };
        match slot.value() {
            Slot::Ready(model) => {
                model.retain();
                debug!(model = %model.name(), refs = model.ref_count(), "Model already loaded");
                Attach::Hit(ModelLease::new(model.clone()))
            }
            Slot::Loading(flight) => {
                flight.joiners.fetch_add(1, Ordering::SeqCst);
                debug!(key, "Joining in-flight load");
                Attach::Join(JoinTicket::new(self.clone(), key.to_string(), flight.clone()))
            }
            Slot::Unloading { done, .. } => Attach::WaitUnload(done.clone()),
        }
    }

    //  Loading

    fn spawn_load(&self, key: String, flight: Arc<LoadFlight>) {
        let manager = self.clone();
        // Detached: a waiter going away must not cancel a load others joined.
        tokio::spawn(async move {
            let reservation = match manager.reserve_capacity().await {
                Ok(reservation) => reservation,
                Err(e) => {
                    manager.commit_load(&key, &flight, Err(e));
                    return;
                }
            };
            let result = manager.run_load(&flight.descriptor).await;
            if manager.commit_load(&key, &flight, result) {
                reservation.commit();
            }
        });
    }

    async fn run_load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn Runtime>, ManagerError> {
        let engine = self.inner.engine.clone();
        let path = descriptor.path.clone();
        let params = descriptor.params.clone();
        let timeout = self.inner.config.load_timeout;
        let started = std::time::Instant::now();

        info!(model = %descriptor.name, path = %path.display(), "Loading model");
        let mut task = tokio::task::spawn_blocking(move || engine.load(&path, &params));

        let fail = |reason: String| ManagerError::LoadFailure {
            model: descriptor.name.clone(),
            reason,
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(runtime))) => {
                info!(
                    model = %descriptor.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Engine load finished"
                );
                Ok(runtime)
            }
            Ok(Ok(Err(e))) => Err(fail(e.to_string())),
            Ok(Err(join)) => Err(fail(format!("engine load panicked: {join}"))),
            Err(_) => {
                // The blocking load cannot be interrupted; reclaim whatever it
                // eventually produces.
                let engine = self.inner.engine.clone();
                let name = descriptor.name.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(runtime)) = task.await {
                        warn!(model = %name, "Load completed after timeout; unloading");
                        let _ = tokio::task::spawn_blocking(move || engine.unload(runtime)).await;
                    }
                });
                Err(fail(format!("load timed out after {}s", timeout.as_secs_f64())))
            }
        }
    }

    fn commit_load(
        &self,
        key: &str,
        flight: &Arc<LoadFlight>,
        result: Result<Arc<dyn Runtime>, ManagerError>,
    ) -> bool {
        let Entry::Occupied(mut slot) = self.inner.slots.entry(key.to_string()) else {
            error!(key, "Load finished but its slot vanished");
            flight.outcome.send_replace(Some(Err(ManagerError::Internal(format!(
                "slot for '{key}' vanished during load"
            )))));
            return false;
        };
        if !matches!(slot.get(), Slot::Loading(f) if Arc::ptr_eq(f, flight)) {
            error!(key, "Load finished but its slot was replaced");
            flight.outcome.send_replace(Some(Err(ManagerError::Internal(format!(
                "slot for '{key}' was replaced during load"
            )))));
            return false;
        }

        let name = flight.descriptor.name.clone();
        match result {
            Ok(runtime) => {
                let refs = flight.joiners.load(Ordering::SeqCst);
                let model = Arc::new(ResidentModel::new(
                    flight.descriptor.clone(),
                    runtime,
                    refs,
                    self.inner.epoch,
                ));
                flight.outcome.send_replace(Some(Ok(model.clone())));
                slot.insert(Slot::Ready(model));
                drop(slot);
                info!(model = %name, refs, "Model loaded and ready");
                self.emit(ModelEventKind::Loaded, name, None);
                true
            }
            Err(e) => {
                flight.outcome.send_replace(Some(Err(e.clone())));
                slot.remove();
                error!(model = %name, error = %e, "Model load failed");
                self.emit(ModelEventKind::LoadFailed, name, Some(e.to_string()));
                false
            }
        }
    }

    //  Capacity

    async fn reserve_capacity(&self) -> Result<Reservation, ManagerError> {
        let Some(limit) = self.max_resident() else {
            self.inner.occupied.fetch_add(1, Ordering::SeqCst);
            return Ok(Reservation::new(self.clone()));
        };

        loop {
            let reserved = self
                .inner
                .occupied
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < limit).then_some(n + 1)
                })
                .is_ok();
            if reserved {
                return Ok(Reservation::new(self.clone()));
            }

            match self.eviction_candidate() {
                Eviction::Victim(key) => {
                    info!(key, limit, "Evicting LRU model to make room");
                    // Whatever the outcome, re-check occupancy.
                    let _ = self.unload_key(&key, UnloadReason::Capacity, None).await;
                }
                Eviction::Draining(mut done) => {
                    let _ = done.wait_for(|finished| *finished).await;
                }
                Eviction::Nothing => {
                    warn!(limit, "Cannot load: all resident models have active references");
                    return Err(ManagerError::CapacityExceeded { limit });
                }
            }
        }
    }

    /// Least-recently-used Ready model with no references, else a slot that
    /// is already on its way out.
    fn eviction_candidate(&self) -> Eviction {
        let mut victim: Option<(String, Duration)> = None;
        let mut draining = None;
        for entry in self.inner.slots.iter() {
            match entry.value() {
                Slot::Ready(model) if model.ref_count() == 0 => {
                    let idle = model.idle_for();
                    if victim.as_ref().is_none_or(|(_, best)| idle > *best) {
                        victim = Some((entry.key().clone(), idle));
                    }
                }
                Slot::Unloading { done, .. } => draining = Some(done.clone()),
                _ => {}
            }
        }
        match (victim, draining) {
            (Some((key, _)), _) => Eviction::Victim(key),
            (None, Some(done)) => Eviction::Draining(done),
            (None, None) => Eviction::Nothing,
        }
    }

    //  Unloading

    /// Explicitly unload one model or all of them.
    ///
    /// A single name is all-or-nothing: busy → `ModelBusy`, engine failure →
    /// `UnloadFailure`, not resident → empty summary. `All` is best-effort and
    /// reports busy and failed models in the summary instead of failing.
    pub async fn explicit_unload(&self, target: UnloadTarget) -> Result<UnloadSummary, ManagerError> {
        let mut summary = UnloadSummary::default();
        match target {
            UnloadTarget::Model(name) => {
                match self
                    .unload_key(&model_key(&name), UnloadReason::Explicit, None)
                    .await
                {
                    UnloadOutcome::Unloaded(model) => summary.unloaded.push(model),
                    UnloadOutcome::NotResident | UnloadOutcome::NotIdle => {
                        debug!(model = %name, "Model is not loaded");
                    }
                    UnloadOutcome::Busy(model) => return Err(ManagerError::ModelBusy(model)),
                    UnloadOutcome::Failed { model, reason } => {
                        return Err(ManagerError::UnloadFailure { model, reason });
                    }
                }
            }
            UnloadTarget::All => {
                let keys: Vec<String> = self.inner.slots.iter().map(|e| e.key().clone()).collect();
                for key in keys {
                    match self.unload_key(&key, UnloadReason::Explicit, None).await {
                        UnloadOutcome::Unloaded(model) => summary.unloaded.push(model),
                        UnloadOutcome::Busy(model) => summary.busy.push(model),
                        UnloadOutcome::Failed { model, .. } => summary.failed.push(model),
                        UnloadOutcome::NotResident | UnloadOutcome::NotIdle => {}
                    }
                }
                info!(
                    unloaded = summary.unloaded.len(),
                    busy = summary.busy.len(),
                    failed = summary.failed.len(),
                    "Unload all complete"
                );
            }
        }
        Ok(summary)
    }

    /// Evict every unreferenced model idle for at least `idle_timeout`.
    ///
    /// Returns the names of evicted models. Busy models are skipped no matter
    /// how old their timestamp is.
    pub async fn sweep(&self, idle_timeout: Duration) -> Vec<String> {
        let candidates: Vec<String> = self
            .inner
            .slots
            .iter()
            .filter_map(|e| match e.value() {
                Slot::Ready(m) if m.ref_count() == 0 && m.idle_for() >= idle_timeout => {
                    Some(e.key().clone())
                }
                _ => None,
            })
            .collect();

        let mut evicted = Vec::new();
        for key in candidates {
            match self
                .unload_key(&key, UnloadReason::Idle, Some(idle_timeout))
                .await
            {
                UnloadOutcome::Unloaded(model) => evicted.push(model),
                UnloadOutcome::Failed { .. } => {}
                UnloadOutcome::Busy(_) | UnloadOutcome::NotIdle | UnloadOutcome::NotResident => {
                    debug!(key, "Skipping eviction; model was used meanwhile");
                }
            }
        }
        evicted
    }

    /// The one unload path. Checks refs (and optionally idle age) under the
    /// shard lock, flips the slot to Unloading, then calls the engine.
    async fn unload_key(
        &self,
        key: &str,
        reason: UnloadReason,
        min_idle: Option<Duration>,
    ) -> UnloadOutcome {
        let (model, done) = {
            let Entry::Occupied(mut slot) = self.inner.slots.entry(key.to_string()) else {
                return UnloadOutcome::NotResident;
            };
            let model = match slot.get() {
                Slot::Ready(model) => model.clone(),
                Slot::Loading(flight) => {
                    return UnloadOutcome::Busy(flight.descriptor.name.clone());
                }
                Slot::Unloading { .. } => return UnloadOutcome::NotResident,
            };
            if model.ref_count() > 0 {
                warn!(model = %model.name(), refs = model.ref_count(), "Cannot unload: model is busy");
                return UnloadOutcome::Busy(model.name().to_string());
            }
            if let Some(min) = min_idle
                && model.idle_for() < min
            {
                return UnloadOutcome::NotIdle;
            }
            let (done_tx, done_rx) = watch::channel(false);
            slot.insert(Slot::Unloading {
                model: model.clone(),
                done: done_rx,
            });
            (model, done_tx)
        };

        let name = model.name().to_string();
        let idle_secs = model.idle_for().as_secs_f64();
        let engine = self.inner.engine.clone();
        let finisher = UnloadFinisher {
            manager: self.clone(),
            key: key.to_string(),
            done,
        };
        let runtime = model.runtime();
        drop(model);

        let result = tokio::task::spawn_blocking(move || {
            let _finisher = finisher;
            engine.unload(runtime)
        })
        .await;

        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(join) => Some(format!("engine unload panicked: {join}")),
        };

        match failure {
            None => {
                let kind = match reason {
                    UnloadReason::Explicit => ModelEventKind::Unloaded,
                    UnloadReason::Idle | UnloadReason::Capacity => ModelEventKind::Evicted,
                };
                info!(model = %name, reason = reason.as_str(), idle_secs, "Model unloaded");
                self.emit(kind, name.clone(), Some(reason.as_str().to_string()));
                UnloadOutcome::Unloaded(name)
            }
            Some(reason) => {
                error!(model = %name, error = %reason, "Model unload failed; handle discarded");
                self.emit(ModelEventKind::UnloadFailed, name.clone(), Some(reason.clone()));
                UnloadOutcome::Failed {
                    model: name,
                    reason,
                }
            }
        }
    }

    //  Queries

    /// Every slot with its status, reference count and idle age.
    pub fn list_resident(&self) -> Vec<ResidentInfo> {
        let mut out: Vec<ResidentInfo> = self
            .inner
            .slots
            .iter()
            .map(|entry| {
                let (descriptor, status, refs, idle) = match entry.value() {
                    Slot::Loading(flight) => (
                        flight.descriptor.clone(),
                        ModelStatus::Loading,
                        flight.joiners.load(Ordering::SeqCst),
                        Duration::ZERO,
                    ),
                    Slot::Ready(m) => (
                        m.descriptor().clone(),
                        ModelStatus::Ready,
                        m.ref_count(),
                        m.idle_for(),
                    ),
                    Slot::Unloading { model, .. } => (
                        model.descriptor().clone(),
                        ModelStatus::Unloading,
                        0,
                        model.idle_for(),
                    ),
                };
                ResidentInfo {
                    id: entry.key().clone(),
                    name: descriptor.name.clone(),
                    path: descriptor.path.display().to_string(),
                    status,
                    ref_count: refs,
                    busy: refs > 0,
                    idle_secs: idle.as_secs_f64(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Keys of Ready models.
    pub fn resident_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .slots
            .iter()
            .filter(|e| matches!(e.value(), Slot::Ready(_)))
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_resident(&self, name: &str) -> bool {
        self.inner
            .slots
            .get(&model_key(name))
            .is_some_and(|s| matches!(s.value(), Slot::Ready(_)))
    }

    /// Reference count of a Ready model (`None` if not resident).
    pub fn ref_count(&self, name: &str) -> Option<usize> {
        self.inner
            .slots
            .get(&model_key(name))
            .and_then(|s| match s.value() {
                Slot::Ready(m) => Some(m.ref_count()),
                _ => None,
            })
    }

    fn emit(&self, kind: ModelEventKind, model: String, detail: Option<String>) {
        // No subscribers is fine.
        let _ = self.inner.events.send(ModelEvent {
            kind,
            model,
            detail,
        });
    }
}

//  Guards

/// A caller's stake in a `LoadFlight`. If the caller goes away before the
/// outcome arrives, the reference it was promised is handed back.
struct JoinTicket {
    manager: ModelManager,
    key: String,
    flight: Arc<LoadFlight>,
    rx: watch::Receiver<Option<LoadOutcome>>,
    settled: bool,
}

impl JoinTicket {
    fn new(manager: ModelManager, key: String, flight: Arc<LoadFlight>) -> Self {
        let rx = flight.outcome.subscribe();
        Self {
            manager,
            key,
            flight,
            rx,
            settled: false,
        }
    }

    async fn wait(mut self) -> Result<ModelLease, ManagerError> {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        self.settled = true;
        match outcome {
            Some(Ok(model)) => Ok(ModelLease::new(model)),
            Some(Err(e)) => Err(e),
            None => Err(ManagerError::Internal(format!(
                "load of '{}' was abandoned",
                self.key
            ))),
        }
    }
}

impl Drop for JoinTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(slot) = self.manager.inner.slots.get(&self.key)
            && let Slot::Loading(flight) = slot.value()
            && Arc::ptr_eq(flight, &self.flight)
        {
            // Still loading: the commit (which needs the write lock) has not
            // counted us yet.
            flight.joiners.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        // Already committed with our reference included.
        if let Some(Ok(model)) = &*self.flight.outcome.borrow() {
            model.release();
        }
    }
}

/// Capacity held for a load that has not committed its model yet.
struct Reservation {
    manager: ModelManager,
    committed: bool,
}

impl Reservation {
    fn new(manager: ModelManager) -> Self {
        Self {
            manager,
            committed: false,
        }
    }

    /// Hand the reservation over to the installed slot.
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.manager.inner.occupied.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Runs on the blocking thread after the engine unload, panics included:
/// removes the Unloading slot and wakes anyone waiting to reload the key.
struct UnloadFinisher {
    manager: ModelManager,
    key: String,
    done: watch::Sender<bool>,
}

impl Drop for UnloadFinisher {
    fn drop(&mut self) {
        let removed = self
            .manager
            .inner
            .slots
            .remove_if(&self.key, |_, slot| matches!(slot, Slot::Unloading { .. }));
        if removed.is_some() {
            self.manager.inner.occupied.fetch_sub(1, Ordering::SeqCst);
        }
        self.done.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use futures_util::future::join_all;

    use super::*;
    use crate::services::test_support::{MockEngine, fixture};

    fn config() -> ModelManagerConfig {
        ModelManagerConfig::default()
    }

    #[tokio::test]
    async fn acquire_twice_loads_once_and_sweep_evicts() {
        let fx = fixture(&["A.gguf", "B.gguf"], MockEngine::default(), config());
        let m = &fx.manager;

        let first = m.acquire(Some("A")).await.unwrap();
        let second = m.acquire(Some("a.gguf")).await.unwrap();
        assert_eq!(fx.engine.loads(), 1);
        assert_eq!(m.ref_count("A"), Some(2));
        assert_eq!(first.name(), "A");

        m.release(first);
        drop(second);
        assert_eq!(m.ref_count("A"), Some(0));

        let evicted = m.sweep(Duration::ZERO).await;
        assert_eq!(evicted, vec!["A".to_string()]);
        assert_eq!(fx.engine.unloads(), 1);
        assert!(!m.is_resident("A"));
        assert!(m.list_resident().is_empty());
    }

    #[tokio::test]
    async fn unknown_model_is_not_found_and_leaves_state_untouched() {
        let fx = fixture(&["A.gguf", "B.gguf"], MockEngine::default(), config());

        let err = fx.manager.acquire(Some("C")).await.unwrap_err();
        assert_eq!(err, ManagerError::ModelNotFound("C".into()));
        assert!(fx.manager.list_resident().is_empty());
        assert_eq!(fx.engine.loads(), 0);
    }

    #[tokio::test]
    async fn default_model_is_used_when_no_name_given() {
        let fx = fixture(&["b.gguf", "a.gguf"], MockEngine::default(), config());
        let lease = fx.manager.acquire(None).await.unwrap();
        assert_eq!(lease.name(), "a");
    }

    #[tokio::test]
    async fn no_default_model_in_empty_registry() {
        let fx = fixture(&[], MockEngine::default(), config());
        let err = fx.manager.acquire(None).await.unwrap_err();
        assert!(matches!(err, ManagerError::ModelNotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_share_a_single_load() {
        let fx = fixture(
            &["A.gguf"],
            MockEngine::with_load_delay(Duration::from_millis(100)),
            config(),
        );

        let leases = join_all((0..8).map(|_| {
            let m = fx.manager.clone();
            tokio::spawn(async move { m.acquire(Some("A")).await })
        }))
        .await;

        let leases: Vec<ModelLease> = leases
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        assert_eq!(fx.engine.loads(), 1);
        assert_eq!(fx.manager.ref_count("A"), Some(8));

        drop(leases);
        assert_eq!(fx.manager.ref_count("A"), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn load_failure_is_shared_and_retryable() {
        let engine = MockEngine::with_load_delay(Duration::from_millis(50));
        engine.fail_loads.store(true, Ordering::SeqCst);
        let fx = fixture(&["A.gguf"], engine, config());

        let results = join_all((0..4).map(|_| {
            let m = fx.manager.clone();
            tokio::spawn(async move { m.acquire(Some("A")).await })
        }))
        .await;

        for r in results {
            let err = r.unwrap().unwrap_err();
            assert!(matches!(err, ManagerError::LoadFailure { ref model, .. } if model == "A"));
        }
        assert_eq!(fx.engine.loads(), 1);
        assert!(fx.manager.list_resident().is_empty());

        fx.engine.fail_loads.store(false, Ordering::SeqCst);
        let lease = fx.manager.acquire(Some("A")).await.unwrap();
        assert_eq!(lease.ref_count(), 1);
        assert_eq!(fx.engine.loads(), 2);
    }

    #[tokio::test]
    async fn hung_load_times_out_and_is_reclaimed() {
        let fx = fixture(
            &["A.gguf"],
            MockEngine::with_load_delay(Duration::from_millis(300)),
            ModelManagerConfig {
                load_timeout: Duration::from_millis(50),
                ..config()
            },
        );

        let err = fx.manager.acquire(Some("A")).await.unwrap_err();
        match err {
            ManagerError::LoadFailure { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!fx.manager.is_resident("A"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.engine.unloads(), 1);
    }

    #[tokio::test]
    async fn sweep_skips_referenced_models() {
        let fx = fixture(&["A.gguf"], MockEngine::default(), config());

        let lease = fx.manager.acquire(Some("A")).await.unwrap();
        assert!(fx.manager.sweep(Duration::ZERO).await.is_empty());
        assert!(fx.manager.is_resident("A"));

        drop(lease);
        assert_eq!(fx.manager.sweep(Duration::ZERO).await, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn sweep_keeps_recently_used_models() {
        let fx = fixture(&["A.gguf"], MockEngine::default(), config());

        drop(fx.manager.acquire(Some("A")).await.unwrap());
        assert!(fx.manager.sweep(Duration::from_secs(3600)).await.is_empty());
        assert!(fx.manager.is_resident("A"));
    }

    #[tokio::test]
    async fn sweep_covers_every_eligible_model() {
        let fx = fixture(&["A.gguf", "B.gguf", "C.gguf"], MockEngine::default(), config());

        drop(fx.manager.acquire(Some("A")).await.unwrap());
        drop(fx.manager.acquire(Some("B")).await.unwrap());
        let _busy = fx.manager.acquire(Some("C")).await.unwrap();

        let mut evicted = fx.manager.sweep(Duration::ZERO).await;
        evicted.sort();
        assert_eq!(evicted, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(fx.manager.resident_names(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn unload_all_skips_busy_models() {
        let fx = fixture(&["A.gguf", "B.gguf"], MockEngine::default(), config());

        let _busy = fx.manager.acquire(Some("A")).await.unwrap();
        drop(fx.manager.acquire(Some("B")).await.unwrap());

        let summary = fx.manager.explicit_unload(UnloadTarget::All).await.unwrap();
        assert_eq!(summary.unloaded, vec!["B".to_string()]);
        assert_eq!(summary.busy, vec!["A".to_string()]);
        assert!(summary.failed.is_empty());
        assert!(fx.manager.is_resident("A"));
        assert!(!fx.manager.is_resident("B"));
    }

    #[tokio::test]
    async fn unload_of_busy_model_is_rejected() {
        let fx = fixture(&["A.gguf"], MockEngine::default(), config());

        let lease = fx.manager.acquire(Some("A")).await.unwrap();
        let err = fx
            .manager
            .explicit_unload(UnloadTarget::Model("a".into()))
            .await
            .unwrap_err();
        assert_eq!(err, ManagerError::ModelBusy("A".into()));
        assert_eq!(lease.ref_count(), 1);
        assert_eq!(fx.engine.unloads(), 0);
    }

    #[tokio::test]
    async fn unload_is_idempotent() {
        let fx = fixture(&["A.gguf"], MockEngine::default(), config());

        drop(fx.manager.acquire(Some("A")).await.unwrap());
        let first = fx
            .manager
            .explicit_unload(UnloadTarget::Model("A".into()))
            .await
            .unwrap();
        assert_eq!(first.unloaded, vec!["A".to_string()]);

        let second = fx
            .manager
            .explicit_unload(UnloadTarget::Model("A".into()))
            .await
            .unwrap();
        assert_eq!(second, UnloadSummary::default());

        let unknown = fx
            .manager
            .explicit_unload(UnloadTarget::Model("nope".into()))
            .await
            .unwrap();
        assert_eq!(unknown, UnloadSummary::default());
        assert_eq!(fx.engine.unloads(), 1);
    }

    #[tokio::test]
    async fn failed_unload_still_removes_the_model() {
        let fx = fixture(&["A.gguf"], MockEngine::default(), config());
        fx.engine.fail_unloads.store(true, Ordering::SeqCst);

        drop(fx.manager.acquire(Some("A")).await.unwrap());
        let err = fx
            .manager
            .explicit_unload(UnloadTarget::Model("A".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::UnloadFailure { .. }));
        assert!(!fx.manager.is_resident("A"));

        fx.engine.fail_unloads.store(false, Ordering::SeqCst);
        drop(fx.manager.acquire(Some("A")).await.unwrap());
        assert_eq!(fx.engine.loads(), 2);
    }

    #[tokio::test]
    async fn resident_model_survives_registry_reload() {
        let fx = fixture(&["A.gguf", "B.gguf"], MockEngine::default(), config());

        drop(fx.manager.acquire(Some("A")).await.unwrap());
        std::fs::remove_file(fx.dir.path().join("A.gguf")).unwrap();
        fx.registry.reload().unwrap();
        assert!(fx.registry.resolve("A").is_none());

        let lease = fx.manager.acquire(Some("A")).await.unwrap();
        assert_eq!(fx.engine.loads(), 1);
        drop(lease);

        fx.manager
            .explicit_unload(UnloadTarget::Model("A".into()))
            .await
            .unwrap();
        let err = fx.manager.acquire(Some("A")).await.unwrap_err();
        assert_eq!(err, ManagerError::ModelNotFound("A".into()));
    }

    #[tokio::test]
    async fn capacity_limit_evicts_idle_but_never_busy_models() {
        let fx = fixture(
            &["A.gguf", "B.gguf"],
            MockEngine::default(),
            ModelManagerConfig {
                max_resident: Some(1),
                ..config()
            },
        );

        let a = fx.manager.acquire(Some("A")).await.unwrap();
        let err = fx.manager.acquire(Some("B")).await.unwrap_err();
        assert_eq!(err, ManagerError::CapacityExceeded { limit: 1 });
        assert!(fx.manager.is_resident("A"));

        drop(a);
        let b = fx.manager.acquire(Some("B")).await.unwrap();
        assert_eq!(b.name(), "B");
        assert!(!fx.manager.is_resident("A"));
        assert_eq!(fx.engine.unloads(), 1);
    }

    #[tokio::test]
    async fn capacity_eviction_picks_least_recently_used() {
        let fx = fixture(
            &["A.gguf", "B.gguf", "C.gguf"],
            MockEngine::default(),
            ModelManagerConfig {
                max_resident: Some(2),
                ..config()
            },
        );

        drop(fx.manager.acquire(Some("A")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(fx.manager.acquire(Some("B")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(fx.manager.acquire(Some("C")).await.unwrap());
        assert_eq!(
            fx.manager.resident_names(),
            vec!["b".to_string(), "c".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_joiner_gives_back_its_reference() {
        let fx = fixture(
            &["A.gguf"],
            MockEngine::with_load_delay(Duration::from_millis(200)),
            config(),
        );

        let m = fx.manager.clone();
        let leader = tokio::spawn(async move { m.acquire(Some("A")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let joiner = tokio::time::timeout(Duration::from_millis(50), fx.manager.acquire(Some("A"))).await;
        assert!(joiner.is_err());

        let lease = leader.await.unwrap().unwrap();
        assert_eq!(lease.ref_count(), 1);
        assert_eq!(fx.engine.loads(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_join_one_load_at_capacity() {
        let fx = fixture(
            &["A.gguf", "B.gguf"],
            MockEngine::with_load_delay(Duration::from_millis(20)),
            ModelManagerConfig {
                max_resident: Some(1),
                ..config()
            },
        );
        drop(fx.manager.acquire(Some("A")).await.unwrap());

        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let tasks = (0..16).map(|_| {
            let m = fx.manager.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                m.acquire(Some("B")).await
            })
        });
        let leases: Vec<ModelLease> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(fx.engine.loads(), 2);
        assert_eq!(fx.engine.unloads(), 1);
        assert_eq!(fx.manager.ref_count("B"), Some(16));
        assert!(!fx.manager.is_resident("A"));
        drop(leases);
        assert_eq!(fx.manager.ref_count("B"), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acquire_during_unload_waits_then_reloads() {
        let engine = MockEngine {
            unload_delay: Duration::from_millis(200),
            ..MockEngine::default()
        };
        let fx = fixture(&["A.gguf"], engine, config());
        drop(fx.manager.acquire(Some("A")).await.unwrap());

        let m = fx.manager.clone();
        let unload =
            tokio::spawn(async move { m.explicit_unload(UnloadTarget::Model("A".into())).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.manager.list_resident()[0].status, ModelStatus::Unloading);

        let lease = fx.manager.acquire(Some("A")).await.unwrap();
        assert_eq!(fx.engine.unloads(), 1);
        assert_eq!(fx.engine.loads(), 2);
        assert_eq!(lease.ref_count(), 1);
        assert!(fx.manager.is_resident("A"));

        let summary = unload.await.unwrap().unwrap();
        assert_eq!(summary.unloaded, vec!["A".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aborted_leader_leaves_load_running_for_joiners() {
        let fx = fixture(
            &["A.gguf"],
            MockEngine::with_load_delay(Duration::from_millis(200)),
            config(),
        );

        let m = fx.manager.clone();
        let leader = tokio::spawn(async move { m.acquire(Some("A")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let m = fx.manager.clone();
        let joiner = tokio::spawn(async move { m.acquire(Some("A")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        let lease = joiner.await.unwrap().unwrap();
        assert_eq!(lease.ref_count(), 1);
        assert_eq!(fx.engine.loads(), 1);
        drop(lease);
        assert_eq!(fx.manager.ref_count("A"), Some(0));
    }

    #[tokio::test]
    async fn list_resident_reports_refs_and_busy() {
        let fx = fixture(&["A.gguf", "B.gguf"], MockEngine::default(), config());

        let _a = fx.manager.acquire(Some("A")).await.unwrap();
        drop(fx.manager.acquire(Some("B")).await.unwrap());

        let list = fx.manager.list_resident();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "a");
        assert_eq!(list[0].status, ModelStatus::Ready);
        assert_eq!(list[0].ref_count, 1);
        assert!(list[0].busy);
        assert_eq!(list[1].name, "B");
        assert!(!list[1].busy);
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let fx = fixture(&["A.gguf"], MockEngine::default(), config());
        let mut events = fx.manager.subscribe();

        drop(fx.manager.acquire(Some("A")).await.unwrap());
        fx.manager.sweep(Duration::ZERO).await;

        let loaded = events.recv().await.unwrap();
        assert_eq!(loaded.kind, ModelEventKind::Loaded);
        assert_eq!(loaded.model, "A");
        let evicted = events.recv().await.unwrap();
        assert_eq!(evicted.kind, ModelEventKind::Evicted);
        assert_eq!(evicted.detail.as_deref(), Some("idle_timeout"));
    }

    #[test]
    fn unload_target_parses_all() {
        assert_eq!(UnloadTarget::parse("ALL"), UnloadTarget::All);
        assert_eq!(UnloadTarget::parse("qwen"), UnloadTarget::Model("qwen".into()));
    }
}
