//! Device snapshot types and classification

use serde::{Deserialize, Serialize};
use std::fmt;

use super::environment::Viewport;
use super::options::Breakpoints;
use super::user_agent::UserAgentInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceType {
    /// Classify from user-agent hints first, then from viewport width
    pub fn classify(width: u32, user_agent: &UserAgentInfo, breakpoints: &Breakpoints) -> Self {
        if user_agent.tablet {
            Self::Tablet
        } else if user_agent.mobile {
            Self::Mobile
        } else if width < breakpoints.mobile {
            Self::Mobile
        } else if width < breakpoints.tablet {
            Self::Tablet
        } else {
            Self::Desktop
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mobile => write!(f, "mobile"),
            Self::Tablet => write!(f, "tablet"),
            Self::Desktop => write!(f, "desktop"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl Orientation {
    pub fn from_viewport(viewport: &Viewport) -> Self {
        if viewport.height > viewport.width {
            Self::Portrait
        } else {
            Self::Landscape
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Portrait => write!(f, "portrait"),
            Self::Landscape => write!(f, "landscape"),
        }
    }
}

/// Point-in-time description of the host device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_type: DeviceType,
    pub orientation: Orientation,
    pub width: u32,
    pub height: u32,
    pub pixel_ratio: f64,
    pub is_touch: bool,
    pub os: Option<String>,
    pub browser: Option<String>,
    pub user_agent: String,
}

impl DeviceInfo {
    /// Assemble a snapshot from raw host readings
    pub fn from_readings(
        viewport: Viewport,
        reported_orientation: Option<Orientation>,
        user_agent: String,
        parsed: &UserAgentInfo,
        max_touch_points: u32,
        breakpoints: &Breakpoints,
    ) -> Self {
        Self {
            device_type: DeviceType::classify(viewport.width, parsed, breakpoints),
            orientation: reported_orientation.unwrap_or_else(|| Orientation::from_viewport(&viewport)),
            width: viewport.width,
            height: viewport.height,
            pixel_ratio: viewport.pixel_ratio,
            is_touch: max_touch_points > 0 || parsed.mobile || parsed.tablet,
            os: parsed.os.clone(),
            browser: parsed.browser.clone(),
            user_agent,
        }
    }

    pub fn size_differs(&self, other: &DeviceInfo) -> bool {
        self.width != other.width || self.height != other.height
    }
}
