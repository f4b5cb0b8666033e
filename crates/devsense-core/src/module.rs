//! Capability module contract
//!
//! A capability module exposes one piece of host data behind a uniform
//! lifecycle. The loader owns registered modules; callers only read
//! snapshots through [`CapabilityModule::data`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lifecycle of a single module instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// Constructed but `init` not yet called
    #[default]
    Unconstructed,
    /// `init` in progress
    Initializing,
    /// `init` completed, `data` is meaningful
    Ready,
    /// `destroy` has run
    Destroyed,
}

#[async_trait]
pub trait CapabilityModule: Send + Sync {
    /// Stable identifier, matches the registry key the module was built from
    fn name(&self) -> &str;

    /// One-time setup. Called exactly once per instance by the loader.
    async fn init(&self) -> anyhow::Result<()>;

    /// Release everything `init` acquired. Must tolerate a partially failed `init`.
    async fn destroy(&self) -> anyhow::Result<()>;

    /// Current state snapshot. Never blocks and has no side effects.
    fn data(&self) -> serde_json::Value;
}
