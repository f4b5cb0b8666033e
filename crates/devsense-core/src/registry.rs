//! Name-to-factory registry for capability modules

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::module::CapabilityModule;
use crate::modules::{NetworkModule, PlatformModule};

/// Async constructor for one module kind
pub type ModuleFactory =
    Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Arc<dyn CapabilityModule>>> + Send + Sync>;

/// Closed set of module kinds the loader can construct
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the host modules shipped in this crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(NetworkModule::NAME, || async { Ok(NetworkModule::new()) });
        registry.register(PlatformModule::NAME, || async { Ok(PlatformModule::new()) });
        registry
    }

    /// Register (or replace) the factory for `name`
    pub fn register<F, Fut, M>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<M>> + Send + 'static,
        M: CapabilityModule + 'static,
    {
        let factory: ModuleFactory = Arc::new(move || {
            factory()
                .map(|built| built.map(|module| Arc::new(module) as Arc<dyn CapabilityModule>))
                .boxed()
        });
        self.factories.insert(name.into(), factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<ModuleFactory> {
        self.factories.get(name).cloned()
    }

    /// Registered module names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}
