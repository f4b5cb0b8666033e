//! Host environment accessor
//!
//! The detector never reads the host directly. Everything it needs comes
//! through [`HostEnvironment`], so tests and the CLI can drive it with a
//! [`StaticEnvironment`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::snapshot::Orientation;

/// Signal channel capacity. Bursts beyond this surface as a lagged receiver,
/// which the detector treats as a change.
pub const SIGNAL_CAPACITY: usize = 32;

/// Visible area of the host display
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub pixel_ratio: f64,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixel_ratio: 1.0,
        }
    }
}

/// Change notifications raised by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvironmentSignal {
    Resize,
    OrientationChange,
}

pub trait HostEnvironment: Send + Sync {
    fn viewport(&self) -> Viewport;

    /// Orientation reported by the host. None means derive it from the viewport.
    fn orientation(&self) -> Option<Orientation> {
        None
    }

    fn user_agent(&self) -> String;

    fn max_touch_points(&self) -> u32 {
        0
    }

    /// Receive resize and orientation-change signals
    fn subscribe(&self) -> broadcast::Receiver<EnvironmentSignal>;
}

#[derive(Debug, Clone)]
struct StaticState {
    viewport: Viewport,
    orientation: Option<Orientation>,
    user_agent: String,
    max_touch_points: u32,
}

/// In-memory host whose readings are set explicitly
///
/// `set_*` methods change readings silently; `resize` and `rotate` also
/// raise the matching signal.
pub struct StaticEnvironment {
    state: RwLock<StaticState>,
    signals: broadcast::Sender<EnvironmentSignal>,
}

impl StaticEnvironment {
    pub fn new(viewport: Viewport, user_agent: impl Into<String>) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            state: RwLock::new(StaticState {
                viewport,
                orientation: None,
                user_agent: user_agent.into(),
                max_touch_points: 0,
            }),
            signals,
        }
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        self.state.write().viewport = viewport;
    }

    pub fn set_orientation(&self, orientation: Option<Orientation>) {
        self.state.write().orientation = orientation;
    }

    pub fn set_user_agent(&self, user_agent: impl Into<String>) {
        self.state.write().user_agent = user_agent.into();
    }

    pub fn set_max_touch_points(&self, points: u32) {
        self.state.write().max_touch_points = points;
    }

    /// Raise a signal. Returns how many subscribers received it.
    pub fn notify(&self, signal: EnvironmentSignal) -> usize {
        self.signals.send(signal).unwrap_or(0)
    }

    /// Change the viewport size and raise `Resize`
    pub fn resize(&self, width: u32, height: u32) {
        {
            let mut state = self.state.write();
            state.viewport.width = width;
            state.viewport.height = height;
        }
        self.notify(EnvironmentSignal::Resize);
    }

    /// Report a new orientation and raise `OrientationChange`
    pub fn rotate(&self, orientation: Orientation) {
        self.state.write().orientation = Some(orientation);
        self.notify(EnvironmentSignal::OrientationChange);
    }
}

impl HostEnvironment for StaticEnvironment {
    fn viewport(&self) -> Viewport {
        self.state.read().viewport
    }

    fn orientation(&self) -> Option<Orientation> {
        self.state.read().orientation
    }

    fn user_agent(&self) -> String {
        self.state.read().user_agent.clone()
    }

    fn max_touch_points(&self) -> u32 {
        self.state.read().max_touch_points
    }

    fn subscribe(&self) -> broadcast::Receiver<EnvironmentSignal> {
        self.signals.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resize_updates_and_signals() {
        let env = StaticEnvironment::new(Viewport::new(800, 600), "test-agent");
        let mut rx = env.subscribe();

        env.resize(1024, 768);

        assert_eq!(env.viewport(), Viewport::new(1024, 768));
        assert_eq!(rx.recv().await.unwrap(), EnvironmentSignal::Resize);
    }

    #[test]
    fn test_setters_are_silent() {
        let env = StaticEnvironment::new(Viewport::new(800, 600), "a");
        let mut rx = env.subscribe();

        env.set_viewport(Viewport::new(10, 20));
        env.set_user_agent("b");
        env.set_max_touch_points(5);

        assert!(rx.try_recv().is_err());
        assert_eq!(env.user_agent(), "b");
        assert_eq!(env.max_touch_points(), 5);
        assert_eq!(env.orientation(), None);
    }

    #[test]
    fn test_notify_without_subscribers() {
        let env = StaticEnvironment::new(Viewport::new(800, 600), "a");
        assert_eq!(env.notify(EnvironmentSignal::Resize), 0);
    }
}
