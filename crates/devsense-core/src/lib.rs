//! Devsense Core - Capability module loading and device detection
//!
//! This crate provides the runtime pieces behind Devsense:
//! - A typed event channel with per-listener failure isolation
//! - A bounded TTL cache with LRU eviction
//! - The capability module contract and a factory registry
//! - A module loader with request coalescing and retry-with-backoff
//! - A detector that turns host environment readings into device snapshots

pub mod cache;
pub mod detector;
pub mod event;
pub mod loader;
pub mod module;
pub mod modules;
pub mod registry;

pub use cache::{CacheConfig, CacheStats, TtlCache};
pub use detector::{
    Breakpoints, DetectorEvent, DetectorEventKind, DetectorOptions, DeviceDetector, DeviceInfo,
    DeviceType, EnvironmentSignal, HostEnvironment, Orientation, StaticEnvironment,
    UserAgentInfo, Viewport,
};
pub use event::{EventChannel, ListenerId, Subscription};
pub use loader::{
    Backoff, LoadError, LoaderEvent, LoaderEventKind, LoadingStats, ModuleLoader, RetryPolicy,
};
pub use module::{CapabilityModule, ModuleState};
pub use registry::{ModuleFactory, ModuleRegistry};
