//! Device detector
//!
//! Combines host environment readings into a [`DeviceInfo`] snapshot and
//! publishes changes between snapshots:
//! - `deviceChange` when the device class changes (full snapshot)
//! - `orientationChange` when the orientation changes
//! - `resize` when the viewport size changes
//!
//! Host resize and orientation signals are debounced before triggering a
//! refresh. The detector also owns a [`ModuleLoader`] for capability modules.

pub mod environment;
pub mod options;
pub mod snapshot;
pub mod user_agent;

pub use environment::{EnvironmentSignal, HostEnvironment, StaticEnvironment, Viewport};
pub use options::{Breakpoints, DetectorOptions};
pub use snapshot::{DeviceInfo, DeviceType, Orientation};
pub use user_agent::UserAgentInfo;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheConfig, TtlCache};
use crate::event::EventChannel;
use crate::loader::{LoadError, ModuleLoader, RetryPolicy};
use crate::registry::ModuleRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorEventKind {
    DeviceChange,
    OrientationChange,
    Resize,
}

impl DetectorEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceChange => "deviceChange",
            Self::OrientationChange => "orientationChange",
            Self::Resize => "resize",
        }
    }
}

impl fmt::Display for DetectorEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    DeviceChange(DeviceInfo),
    OrientationChange(Orientation),
    Resize { width: u32, height: u32 },
}

impl DetectorEvent {
    pub fn kind(&self) -> DetectorEventKind {
        match self {
            Self::DeviceChange(_) => DetectorEventKind::DeviceChange,
            Self::OrientationChange(_) => DetectorEventKind::OrientationChange,
            Self::Resize { .. } => DetectorEventKind::Resize,
        }
    }
}

struct DetectorInner {
    env: Arc<dyn HostEnvironment>,
    loader: ModuleLoader,
    cache: Arc<TtlCache<String, UserAgentInfo>>,
    options: DetectorOptions,
    current: RwLock<DeviceInfo>,
    events: EventChannel<DetectorEventKind, DetectorEvent>,
    destroyed: AtomicBool,
}

impl DetectorInner {
    fn detect(&self) -> DeviceInfo {
        read_host(self.env.as_ref(), &self.cache, &self.options.breakpoints)
    }

    fn refresh(&self) -> DeviceInfo {
        if self.destroyed.load(Ordering::SeqCst) {
            return self.current.read().clone();
        }

        let (previous, next) = {
            let mut current = self.current.write();
            let next = self.detect();
            (std::mem::replace(&mut *current, next.clone()), next)
        };

        if previous.device_type != next.device_type {
            info!(from = %previous.device_type, to = %next.device_type, "Device type changed");
            self.events.emit(
                &DetectorEventKind::DeviceChange,
                &DetectorEvent::DeviceChange(next.clone()),
            );
        }
        if previous.orientation != next.orientation {
            debug!(orientation = %next.orientation, "Orientation changed");
            self.events.emit(
                &DetectorEventKind::OrientationChange,
                &DetectorEvent::OrientationChange(next.orientation),
            );
        }
        if previous.size_differs(&next) {
            debug!(width = next.width, height = next.height, "Viewport resized");
            self.events.emit(
                &DetectorEventKind::Resize,
                &DetectorEvent::Resize {
                    width: next.width,
                    height: next.height,
                },
            );
        }
        next
    }

    fn accepts(&self, signal: EnvironmentSignal) -> bool {
        match signal {
            EnvironmentSignal::Resize => self.options.enable_resize,
            EnvironmentSignal::OrientationChange => self.options.enable_orientation,
        }
    }
}

fn read_host(
    env: &dyn HostEnvironment,
    cache: &TtlCache<String, UserAgentInfo>,
    breakpoints: &Breakpoints,
) -> DeviceInfo {
    let user_agent = env.user_agent();
    let parsed = UserAgentInfo::parse_cached(cache, &user_agent);
    DeviceInfo::from_readings(
        env.viewport(),
        env.orientation(),
        user_agent,
        &parsed,
        env.max_touch_points(),
        breakpoints,
    )
}

/// Device detector over an injected host environment
pub struct DeviceDetector {
    inner: Arc<DetectorInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceDetector {
    /// Create a detector with its own loader and user-agent cache
    pub fn new(
        env: Arc<dyn HostEnvironment>,
        registry: ModuleRegistry,
        options: DetectorOptions,
    ) -> Self {
        let loader = ModuleLoader::new(registry, RetryPolicy::default());
        let cache = Arc::new(TtlCache::from_config(&CacheConfig::default()));
        Self::with_parts(env, loader, cache, options)
    }

    /// Create a detector from explicit parts. The cache may be shared with
    /// other detectors and outlives this one. The loader is shut down by
    /// [`DeviceDetector::destroy`].
    pub fn with_parts(
        env: Arc<dyn HostEnvironment>,
        loader: ModuleLoader,
        cache: Arc<TtlCache<String, UserAgentInfo>>,
        options: DetectorOptions,
    ) -> Self {
        let signals = options.listens().then(|| env.subscribe());

        let initial = read_host(env.as_ref(), &cache, &options.breakpoints);
        let inner = Arc::new(DetectorInner {
            env,
            loader,
            cache,
            options,
            current: RwLock::new(initial),
            events: EventChannel::new(),
            destroyed: AtomicBool::new(false),
        });

        let listener = signals.and_then(|signals| match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(listen(Arc::downgrade(&inner), signals))),
            Err(_) => {
                warn!("No tokio runtime, host signals will not trigger refresh");
                None
            }
        });

        let detector = Self {
            inner,
            listener: Mutex::new(listener),
        };
        info!(
            device_type = %detector.device_type(),
            orientation = %detector.orientation(),
            "Device detector started"
        );
        detector
    }

    /// Current snapshot
    pub fn device_info(&self) -> DeviceInfo {
        self.inner.current.read().clone()
    }

    pub fn device_type(&self) -> DeviceType {
        self.inner.current.read().device_type
    }

    pub fn orientation(&self) -> Orientation {
        self.inner.current.read().orientation
    }

    pub fn is_mobile(&self) -> bool {
        self.device_type() == DeviceType::Mobile
    }

    pub fn is_tablet(&self) -> bool {
        self.device_type() == DeviceType::Tablet
    }

    pub fn is_desktop(&self) -> bool {
        self.device_type() == DeviceType::Desktop
    }

    pub fn is_touch_device(&self) -> bool {
        self.inner.current.read().is_touch
    }

    /// Re-read the host, emit change events, and return the new snapshot
    pub fn refresh(&self) -> DeviceInfo {
        self.inner.refresh()
    }

    /// Load a capability module and return its data as `T`
    pub async fn load_module<T: DeserializeOwned>(&self, name: &str) -> Result<T, LoadError> {
        if self.is_destroyed() {
            return Err(LoadError::ShutDown {
                name: name.to_string(),
            });
        }
        self.inner.loader.load(name).await
    }

    pub async fn unload_module(&self, name: &str) -> bool {
        self.inner.loader.unload(name).await
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.inner.loader
    }

    /// Change notifications: `deviceChange`, `orientationChange`, `resize`
    pub fn events(&self) -> &EventChannel<DetectorEventKind, DetectorEvent> {
        &self.inner.events
    }

    pub fn cache(&self) -> &Arc<TtlCache<String, UserAgentInfo>> {
        &self.inner.cache
    }

    pub fn options(&self) -> &DetectorOptions {
        &self.inner.options
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Stop listening to the host, wait for module loads still running,
    /// unload every module and drop all subscriptions. Later calls do nothing.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            handle.abort();
        }

        let unloaded = self.inner.loader.shutdown().await;
        self.inner.events.remove_all_listeners(None);
        info!(unloaded, "Device detector destroyed");
    }
}

impl Drop for DeviceDetector {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for DeviceDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDetector")
            .field("current", &*self.inner.current.read())
            .field("options", &self.inner.options)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Wait for the next signal the detector cares about. False once the host
/// channel is closed.
async fn next_accepted(
    inner: &Weak<DetectorInner>,
    signals: &mut broadcast::Receiver<EnvironmentSignal>,
) -> bool {
    loop {
        match signals.recv().await {
            Ok(signal) => {
                let Some(inner) = inner.upgrade() else {
                    return false;
                };
                if inner.accepts(signal) {
                    return true;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Host signals lagged, treating as change");
                return true;
            }
            Err(RecvError::Closed) => return false,
        }
    }
}

/// Trailing-edge debounce of host signals into `refresh` calls
async fn listen(inner: Weak<DetectorInner>, mut signals: broadcast::Receiver<EnvironmentSignal>) {
    let delay = match inner.upgrade() {
        Some(inner) => inner.options.debounce_delay(),
        None => return,
    };

    while next_accepted(&inner, &mut signals).await {
        let mut open = true;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => break,
                accepted = next_accepted(&inner, &mut signals) => {
                    if !accepted {
                        open = false;
                        break;
                    }
                }
            }
        }

        match inner.upgrade() {
            Some(inner) => {
                inner.refresh();
            }
            None => return,
        }
        if !open {
            return;
        }
    }
    debug!("Host signal listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::CapabilityModule;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    const DESKTOP_UA: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

    fn quiet_options() -> DetectorOptions {
        DetectorOptions {
            enable_resize: false,
            enable_orientation: false,
            ..Default::default()
        }
    }

    fn setup(
        width: u32,
        height: u32,
        options: DetectorOptions,
    ) -> (Arc<StaticEnvironment>, DeviceDetector) {
        let env = Arc::new(StaticEnvironment::new(Viewport::new(width, height), DESKTOP_UA));
        let detector = DeviceDetector::new(env.clone(), ModuleRegistry::builtin(), options);
        (env, detector)
    }

    /// Module that takes 100ms to build and counts `destroy` calls
    struct SlowModule {
        destroyed: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CapabilityModule for SlowModule {
        fn name(&self) -> &str {
            "slow"
        }

        async fn init(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn destroy(&self) -> anyhow::Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn data(&self) -> serde_json::Value {
            serde_json::json!({ "ready": true })
        }
    }

    fn slow_registry(destroyed: Arc<AtomicU32>) -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register("slow", move || {
            let destroyed = destroyed.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(SlowModule { destroyed })
            }
        });
        registry
    }

    fn record(detector: &DeviceDetector) -> Arc<Mutex<Vec<DetectorEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            DetectorEventKind::DeviceChange,
            DetectorEventKind::OrientationChange,
            DetectorEventKind::Resize,
        ] {
            let seen = seen.clone();
            detector.events().on(kind, move |event: &DetectorEvent| {
                seen.lock().push(event.clone());
                Ok(())
            });
        }
        seen
    }

    #[test]
    fn test_initial_snapshot() {
        let (_env, detector) = setup(1280, 800, quiet_options());

        let info = detector.device_info();
        assert_eq!(info.device_type, DeviceType::Desktop);
        assert_eq!(info.orientation, Orientation::Landscape);
        assert_eq!((info.width, info.height), (1280, 800));
        assert_eq!(info.os.as_deref(), Some("Linux"));
        assert!(detector.is_desktop());
        assert!(!detector.is_mobile());
        assert!(!detector.is_tablet());
        assert!(!detector.is_touch_device());
    }

    #[test]
    fn test_orientation_only_change() {
        let (env, detector) = setup(1280, 800, quiet_options());
        env.set_orientation(Some(Orientation::Landscape));
        detector.refresh();
        let seen = record(&detector);

        env.set_orientation(Some(Orientation::Portrait));
        detector.refresh();

        assert_eq!(
            *seen.lock(),
            vec![DetectorEvent::OrientationChange(Orientation::Portrait)]
        );
    }

    #[test]
    fn test_type_and_size_change_fire_together() {
        let (env, detector) = setup(1280, 800, quiet_options());
        env.set_orientation(Some(Orientation::Landscape));
        detector.refresh();
        let seen = record(&detector);

        env.set_viewport(Viewport::new(900, 800));
        let info = detector.refresh();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], DetectorEvent::DeviceChange(info.clone()));
        assert_eq!(
            seen[1],
            DetectorEvent::Resize {
                width: 900,
                height: 800
            }
        );
        assert!(detector.is_tablet());
    }

    #[test]
    fn test_unchanged_refresh_is_silent() {
        let (_env, detector) = setup(1280, 800, quiet_options());
        let seen = record(&detector);

        detector.refresh();
        detector.refresh();

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_user_agent_parsing_is_cached() {
        let (_env, detector) = setup(1280, 800, quiet_options());

        detector.refresh();
        detector.refresh();

        let stats = detector.cache().stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn test_shared_cache_outlives_detector() {
        let env = Arc::new(StaticEnvironment::new(Viewport::new(800, 600), DESKTOP_UA));
        let cache = Arc::new(TtlCache::new(16, Duration::from_secs(60)));
        let loader = ModuleLoader::new(ModuleRegistry::new(), RetryPolicy::default());

        let detector = DeviceDetector::with_parts(env.clone(), loader, cache.clone(), quiet_options());
        drop(detector);

        assert!(cache.contains(&DESKTOP_UA.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_burst_is_debounced() {
        let (env, detector) = setup(1280, 800, DetectorOptions::default());
        let seen = record(&detector);

        env.resize(1200, 800);
        env.resize(1100, 800);
        env.resize(1000, 800);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;

        let seen = seen.lock();
        let resizes: Vec<_> = seen
            .iter()
            .filter(|e| e.kind() == DetectorEventKind::Resize)
            .collect();
        assert_eq!(
            resizes,
            vec![&DetectorEvent::Resize {
                width: 1000,
                height: 800
            }]
        );
        assert!(detector.is_tablet());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_signals_are_ignored() {
        let options = DetectorOptions {
            enable_resize: false,
            ..Default::default()
        };
        let (env, detector) = setup(1280, 800, options);
        let seen = record(&detector);

        env.resize(500, 800);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(seen.lock().is_empty());

        env.rotate(Orientation::Portrait);
        tokio::time::sleep(Duration::from_secs(1)).await;

        // The orientation refresh also picks up the earlier size change
        let kinds: Vec<_> = seen.lock().iter().map(DetectorEvent::kind).collect();
        assert!(kinds.contains(&DetectorEventKind::OrientationChange));
        assert!(kinds.contains(&DetectorEventKind::Resize));
    }

    #[tokio::test]
    async fn test_load_and_unload_module() {
        let (_env, detector) = setup(1280, 800, quiet_options());

        let data: serde_json::Value = detector.load_module("platform").await.unwrap();
        assert_eq!(data["os"], std::env::consts::OS);
        assert!(detector.loader().is_loaded("platform"));

        assert!(detector.unload_module("platform").await);
        assert!(!detector.unload_module("platform").await);

        let err = detector.load_module::<serde_json::Value>("bogus").await.unwrap_err();
        assert!(matches!(err, LoadError::UnknownModule { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_idempotent() {
        let (env, detector) = setup(1280, 800, DetectorOptions::default());
        detector.load_module::<serde_json::Value>("platform").await.unwrap();
        let seen = record(&detector);

        detector.destroy().await;
        detector.destroy().await;

        assert!(detector.is_destroyed());
        assert!(detector.loader().loaded_modules().is_empty());
        assert!(detector.events().event_names().is_empty());

        env.resize(400, 800);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = detector.device_info();
        assert_eq!(detector.refresh(), before);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_concurrent_refreshes_report_change_once() {
        let (env, detector) = setup(1280, 800, quiet_options());
        let seen = record(&detector);

        env.set_viewport(Viewport::new(1280, 700));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    detector.refresh();
                });
            }
        });

        assert_eq!(
            *seen.lock(),
            vec![DetectorEvent::Resize {
                width: 1280,
                height: 700
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_waits_for_in_flight_load() {
        let destroyed = Arc::new(AtomicU32::new(0));
        let env = Arc::new(StaticEnvironment::new(Viewport::new(1280, 800), DESKTOP_UA));
        let detector = DeviceDetector::new(env, slow_registry(destroyed.clone()), quiet_options());

        let (loaded, ()) = tokio::join!(
            detector.load_module::<serde_json::Value>("slow"),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert!(detector.loader().is_loading("slow"));
                detector.destroy().await;
            }
        );

        assert!(matches!(loaded, Err(LoadError::ShutDown { .. })));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(detector.loader().loaded_modules().is_empty());
        assert!(!detector.loader().is_loading("slow"));

        let again = detector.load_module::<serde_json::Value>("slow").await;
        assert!(matches!(again, Err(LoadError::ShutDown { .. })));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
