//! Platform capability: operating system, architecture and CPU count

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::module::{CapabilityModule, ModuleState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformData {
    pub os: String,
    pub arch: String,
    pub family: String,
    pub cpus: usize,
}

impl PlatformData {
    fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

pub struct PlatformModule {
    state: RwLock<ModuleState>,
    data: RwLock<Option<PlatformData>>,
}

impl PlatformModule {
    pub const NAME: &'static str = "platform";

    pub fn new() -> Self {
        Self {
            state: RwLock::new(ModuleState::Unconstructed),
            data: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ModuleState {
        *self.state.read()
    }
}

impl Default for PlatformModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityModule for PlatformModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn init(&self) -> anyhow::Result<()> {
        *self.data.write() = Some(PlatformData::current());
        *self.state.write() = ModuleState::Ready;
        Ok(())
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        *self.data.write() = None;
        *self.state.write() = ModuleState::Destroyed;
        Ok(())
    }

    fn data(&self) -> serde_json::Value {
        serde_json::to_value(&*self.data.read()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_populates_data() {
        let module = PlatformModule::new();
        assert!(module.data().is_null());

        module.init().await.unwrap();
        assert_eq!(module.state(), ModuleState::Ready);

        let data: PlatformData = serde_json::from_value(module.data()).unwrap();
        assert_eq!(data.os, std::env::consts::OS);
        assert!(data.cpus >= 1);
    }
}
