//! Host capability modules shipped with Devsense

pub mod network;
pub mod platform;

pub use network::{InterfaceInfo, NetworkData, NetworkModule};
pub use platform::{PlatformData, PlatformModule};
