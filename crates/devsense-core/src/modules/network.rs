//! Network capability: host interfaces and reachability

use async_trait::async_trait;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::module::{CapabilityModule, ModuleState};

/// One host network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub addresses: Vec<String>,
}

/// Snapshot exposed by [`NetworkModule`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkData {
    /// True when any interface carries a non-loopback address
    pub online: bool,
    pub interfaces: Vec<InterfaceInfo>,
}

pub struct NetworkModule {
    state: RwLock<ModuleState>,
    data: RwLock<NetworkData>,
}

impl NetworkModule {
    pub const NAME: &'static str = "network";

    pub fn new() -> Self {
        Self {
            state: RwLock::new(ModuleState::Unconstructed),
            data: RwLock::new(NetworkData::default()),
        }
    }

    pub fn state(&self) -> ModuleState {
        *self.state.read()
    }
}

impl Default for NetworkModule {
    fn default() -> Self {
        Self::new()
    }
}

fn probe_interfaces() -> anyhow::Result<NetworkData> {
    let mut online = false;
    let interfaces = NetworkInterface::show()?
        .into_iter()
        .map(|iface| {
            let addresses = iface
                .addr
                .iter()
                .map(|addr| {
                    let ip = addr.ip();
                    if !ip.is_loopback() {
                        online = true;
                    }
                    ip.to_string()
                })
                .collect();
            InterfaceInfo {
                name: iface.name,
                addresses,
            }
        })
        .collect();

    Ok(NetworkData { online, interfaces })
}

#[async_trait]
impl CapabilityModule for NetworkModule {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn init(&self) -> anyhow::Result<()> {
        *self.state.write() = ModuleState::Initializing;
        let data = tokio::task::spawn_blocking(probe_interfaces).await??;
        debug!(
            interfaces = data.interfaces.len(),
            online = data.online,
            "Network interfaces probed"
        );
        *self.data.write() = data;
        *self.state.write() = ModuleState::Ready;
        Ok(())
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        *self.data.write() = NetworkData::default();
        *self.state.write() = ModuleState::Destroyed;
        Ok(())
    }

    fn data(&self) -> serde_json::Value {
        serde_json::to_value(&*self.data.read()).unwrap_or_default()
    }
}
