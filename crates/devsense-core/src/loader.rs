//! On-demand capability module loading
//!
//! The loader builds modules from a [`ModuleRegistry`] the first time they
//! are requested:
//! - Concurrent requests for the same name share one construction
//! - Unknown names fail immediately and are never retried
//! - Construction failures are retried with a configurable backoff
//! - Per-module loading statistics survive unload
//!
//! Lifecycle notifications are published on [`ModuleLoader::events`].

use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::event::EventChannel;
use crate::module::CapabilityModule;
use crate::registry::{ModuleFactory, ModuleRegistry};

/// Shortest load time recorded in statistics
const MIN_RECORDED_LOAD_TIME: Duration = Duration::from_millis(1);

#[derive(Error, Debug, Clone)]
pub enum LoadError {
    #[error("Unknown module: {name}")]
    UnknownModule { name: String },
    #[error("Failed to load module {name} after {attempts} attempts: {last_error}")]
    Exhausted {
        name: String,
        attempts: u32,
        last_error: String,
    },
    #[error("Module {name} produced unexpected data: {source}")]
    InvalidData {
        name: String,
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("Module loader is shut down, cannot load {name}")]
    ShutDown { name: String },
}

impl LoadError {
    /// Name of the module the failed request was for
    pub fn module_name(&self) -> &str {
        match self {
            Self::UnknownModule { name }
            | Self::Exhausted { name, .. }
            | Self::InvalidData { name, .. }
            | Self::ShutDown { name } => name,
        }
    }
}

/// Delay curve between construction attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Attempt k waits k * base
    #[default]
    Linear,
    /// Attempt k waits 2^(k-1) * base
    Exponential,
}

/// Retry settings for module construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff unit in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff: Backoff::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    // CI runners get short delays to keep suites fast
    if std::env::var_os("CI").is_some() {
        10
    } else {
        1000
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_retries,
            base_delay_ms: whole_millis(base_delay),
            backoff,
        }
    }

    /// Total construction attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        let factor = match self.backoff {
            Backoff::Linear => attempt.max(1),
            Backoff::Exponential => 1u32
                .checked_shl(attempt.saturating_sub(1))
                .unwrap_or(u32::MAX),
        };
        base.saturating_mul(factor)
    }
}

/// Loading history for one module name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadingStats {
    pub load_count: u64,
    pub total_load_time: Duration,
    pub average_load_time: Duration,
    pub last_load_time: Option<Duration>,
    /// Failed construction attempts, including unknown-name requests
    pub error_count: u64,
    pub last_loaded_at: Option<DateTime<Utc>>,
}

impl LoadingStats {
    fn record_success(&mut self, elapsed: Duration) {
        let elapsed = elapsed.max(MIN_RECORDED_LOAD_TIME);
        self.load_count += 1;
        self.total_load_time += elapsed;
        self.average_load_time =
            self.total_load_time / u32::try_from(self.load_count).unwrap_or(u32::MAX);
        self.last_load_time = Some(elapsed);
        self.last_loaded_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderEventKind {
    ModuleLoaded,
    ModuleFailed,
    ModuleUnloaded,
}

impl LoaderEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModuleLoaded => "moduleLoaded",
            Self::ModuleFailed => "moduleFailed",
            Self::ModuleUnloaded => "moduleUnloaded",
        }
    }
}

impl fmt::Display for LoaderEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum LoaderEvent {
    ModuleLoaded { name: String, duration: Duration },
    ModuleFailed { name: String, error: LoadError },
    ModuleUnloaded { name: String },
}

impl LoaderEvent {
    pub fn kind(&self) -> LoaderEventKind {
        match self {
            Self::ModuleLoaded { .. } => LoaderEventKind::ModuleLoaded,
            Self::ModuleFailed { .. } => LoaderEventKind::ModuleFailed,
            Self::ModuleUnloaded { .. } => LoaderEventKind::ModuleUnloaded,
        }
    }
}

type LoadResult = Result<Arc<dyn CapabilityModule>, LoadError>;
type PendingLoad = Shared<BoxFuture<'static, LoadResult>>;

/// Registered modules and in-flight constructions, guarded together so a
/// name is never observed missing from both while moving between them
#[derive(Default)]
struct Slots {
    loaded: HashMap<String, Arc<dyn CapabilityModule>>,
    in_flight: HashMap<String, PendingLoad>,
    closed: bool,
}

struct LoaderShared {
    registry: ModuleRegistry,
    policy: RetryPolicy,
    slots: Mutex<Slots>,
    stats: Mutex<HashMap<String, LoadingStats>>,
    events: EventChannel<LoaderEventKind, LoaderEvent>,
}

/// Capability module loader
///
/// Cloning yields another handle to the same loader.
#[derive(Clone)]
pub struct ModuleLoader {
    shared: Arc<LoaderShared>,
}

impl ModuleLoader {
    pub fn new(registry: ModuleRegistry, policy: RetryPolicy) -> Self {
        Self {
            shared: Arc::new(LoaderShared {
                registry,
                policy,
                slots: Mutex::new(Slots::default()),
                stats: Mutex::new(HashMap::new()),
                events: EventChannel::new(),
            }),
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.shared.registry
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }

    /// Lifecycle notifications: loaded, failed, unloaded
    pub fn events(&self) -> &EventChannel<LoaderEventKind, LoaderEvent> {
        &self.shared.events
    }

    /// Load `name` and deserialize its data snapshot into `T`
    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> Result<T, LoadError> {
        let module = self.load_module_instance(name).await?;
        serde_json::from_value(module.data()).map_err(|e| LoadError::InvalidData {
            name: name.to_string(),
            source: Arc::new(e),
        })
    }

    /// Load `name` and return the module itself
    pub async fn load_module_instance(
        &self,
        name: &str,
    ) -> Result<Arc<dyn CapabilityModule>, LoadError> {
        let pending = {
            let mut slots = self.shared.slots.lock();
            if slots.closed {
                return Err(LoadError::ShutDown {
                    name: name.to_string(),
                });
            }
            if let Some(module) = slots.loaded.get(name) {
                return Ok(Arc::clone(module));
            }
            match slots.in_flight.get(name) {
                Some(pending) => {
                    debug!(module = name, "Joining in-flight module load");
                    pending.clone()
                }
                None => {
                    let pending = Arc::clone(&self.shared)
                        .construct(name.to_string())
                        .boxed()
                        .shared();
                    slots.in_flight.insert(name.to_string(), pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Destroy and deregister `name`. Returns false if it was not loaded.
    pub async fn unload(&self, name: &str) -> bool {
        let module = self.shared.slots.lock().loaded.remove(name);
        let Some(module) = module else {
            return false;
        };

        if let Err(e) = module.destroy().await {
            warn!(module = name, error = %e, "Module destroy failed, removed anyway");
        }
        info!(module = name, "Module unloaded");

        self.shared.events.emit(
            &LoaderEventKind::ModuleUnloaded,
            &LoaderEvent::ModuleUnloaded {
                name: name.to_string(),
            },
        );
        true
    }

    /// Unload every registered module concurrently. Returns how many were unloaded.
    pub async fn unload_all(&self) -> usize {
        let names = self.loaded_modules();
        let results = join_all(names.iter().map(|name| self.unload(name))).await;
        results.into_iter().filter(|unloaded| *unloaded).count()
    }

    /// Refuse new loads, wait for in-flight constructions, then unload
    /// everything. Modules whose construction finishes during shutdown are
    /// destroyed without being registered. Returns how many registered
    /// modules were unloaded.
    pub async fn shutdown(&self) -> usize {
        let pending: Vec<PendingLoad> = {
            let mut slots = self.shared.slots.lock();
            slots.closed = true;
            slots.in_flight.values().cloned().collect()
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "Waiting for in-flight module loads");
            join_all(pending).await;
        }
        self.unload_all().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.slots.lock().closed
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.shared.slots.lock().loaded.contains_key(name)
    }

    /// Whether a construction for `name` is currently running
    pub fn is_loading(&self, name: &str) -> bool {
        self.shared.slots.lock().in_flight.contains_key(name)
    }

    pub fn get_module(&self, name: &str) -> Option<Arc<dyn CapabilityModule>> {
        self.shared.slots.lock().loaded.get(name).cloned()
    }

    /// Names of registered modules, sorted
    pub fn loaded_modules(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.slots.lock().loaded.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn loading_stats(&self, name: &str) -> Option<LoadingStats> {
        self.shared.stats.lock().get(name).cloned()
    }

    pub fn all_loading_stats(&self) -> HashMap<String, LoadingStats> {
        self.shared.stats.lock().clone()
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("registry", &self.shared.registry)
            .field("policy", &self.shared.policy)
            .field("loaded", &self.loaded_modules())
            .finish()
    }
}

impl LoaderShared {
    /// Body of the shared construction future. Clears the in-flight record
    /// before any awaiting caller sees the result.
    async fn construct(self: Arc<Self>, name: String) -> LoadResult {
        let started = Instant::now();
        let outcome = self.construct_with_retry(&name).await;
        let elapsed = started.elapsed();

        let outcome = match outcome {
            Ok(module) => self.register(&name, module).await,
            Err(e) => {
                self.slots.lock().in_flight.remove(&name);
                Err(e)
            }
        };

        match &outcome {
            Ok(_) => {
                self.stats
                    .lock()
                    .entry(name.clone())
                    .or_default()
                    .record_success(elapsed);
                info!(module = %name, elapsed_ms = whole_millis(elapsed), "Module loaded");
                self.events.emit(
                    &LoaderEventKind::ModuleLoaded,
                    &LoaderEvent::ModuleLoaded {
                        name,
                        duration: elapsed,
                    },
                );
            }
            Err(error) => {
                self.events.emit(
                    &LoaderEventKind::ModuleFailed,
                    &LoaderEvent::ModuleFailed {
                        name,
                        error: error.clone(),
                    },
                );
            }
        }
        outcome
    }

    /// Move a built module from in-flight to loaded. A module finishing after
    /// shutdown is destroyed instead of registered.
    async fn register(&self, name: &str, module: Arc<dyn CapabilityModule>) -> LoadResult {
        let registered = {
            let mut slots = self.slots.lock();
            slots.in_flight.remove(name);
            if !slots.closed {
                slots.loaded.insert(name.to_string(), Arc::clone(&module));
            }
            !slots.closed
        };
        if registered {
            return Ok(module);
        }

        if let Err(e) = module.destroy().await {
            warn!(module = name, error = %e, "Module destroy after shutdown failed");
        }
        debug!(module = name, "Discarded module built after shutdown");
        Err(LoadError::ShutDown {
            name: name.to_string(),
        })
    }

    async fn construct_with_retry(&self, name: &str) -> LoadResult {
        let Some(factory) = self.registry.get(name) else {
            self.record_error(name);
            warn!(module = name, "Unknown module requested");
            return Err(LoadError::UnknownModule {
                name: name.to_string(),
            });
        };

        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match build(&factory).await {
                Ok(module) => return Ok(module),
                Err(e) => e,
            };
            self.record_error(name);

            if attempt >= max_attempts {
                warn!(module = name, attempts = attempt, error = %err, "Module load failed");
                return Err(LoadError::Exhausted {
                    name: name.to_string(),
                    attempts: attempt,
                    last_error: format!("{:#}", err),
                });
            }

            let delay = self.policy.delay_for(attempt);
            debug!(
                module = name,
                attempt,
                delay_ms = whole_millis(delay),
                error = %err,
                "Module construction failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn record_error(&self, name: &str) {
        self.stats
            .lock()
            .entry(name.to_string())
            .or_default()
            .error_count += 1;
    }
}

/// Milliseconds in `duration`, saturating at `u64::MAX`
fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// One construction attempt: factory call followed by `init`
async fn build(factory: &ModuleFactory) -> anyhow::Result<Arc<dyn CapabilityModule>> {
    let module = factory().await?;
    if let Err(e) = module.init().await {
        if let Err(cleanup) = module.destroy().await {
            debug!(module = module.name(), error = %cleanup, "Cleanup after failed init also failed");
        }
        return Err(e);
    }
    Ok(module)
}
