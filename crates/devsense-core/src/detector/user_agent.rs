//! Lightweight user-agent classification
//!
//! Only the hints the detector needs: form factor, OS and browser family.

use serde::{Deserialize, Serialize};

use crate::cache::TtlCache;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgentInfo {
    pub os: Option<String>,
    pub browser: Option<String>,
    pub mobile: bool,
    pub tablet: bool,
}

const TABLET_MARKERS: &[&str] = &["ipad", "tablet", "kindle", "silk/", "playbook"];
const MOBILE_MARKERS: &[&str] = &[
    "mobi",
    "iphone",
    "ipod",
    "android",
    "blackberry",
    "iemobile",
    "opera mini",
    "windows phone",
];

/// (marker, OS name), first match wins
const OS_MARKERS: &[(&str, &str)] = &[
    ("windows phone", "Windows Phone"),
    ("windows", "Windows"),
    ("iphone", "iOS"),
    ("ipad", "iOS"),
    ("ipod", "iOS"),
    ("android", "Android"),
    ("cros ", "Chrome OS"),
    ("mac os x", "macOS"),
    ("macintosh", "macOS"),
    ("linux", "Linux"),
];

/// (marker, browser name), first match wins
const BROWSER_MARKERS: &[(&str, &str)] = &[
    ("edg/", "Edge"),
    ("opr/", "Opera"),
    ("opera", "Opera"),
    ("firefox/", "Firefox"),
    ("fxios/", "Firefox"),
    ("crios/", "Chrome"),
    ("chrome/", "Chrome"),
    ("safari/", "Safari"),
    ("trident/", "Internet Explorer"),
    ("msie", "Internet Explorer"),
];

impl UserAgentInfo {
    pub fn parse(user_agent: &str) -> Self {
        let ua = user_agent.to_lowercase();
        let has = |marker: &&str| ua.contains(*marker);

        // Android tablets omit "mobile"
        let tablet = TABLET_MARKERS.iter().any(has)
            || (ua.contains("android") && !ua.contains("mobile"));
        let mobile = !tablet && MOBILE_MARKERS.iter().any(has);

        let lookup = |table: &[(&str, &str)]| {
            table
                .iter()
                .find(|(marker, _)| ua.contains(marker))
                .map(|(_, name)| name.to_string())
        };

        Self {
            os: lookup(OS_MARKERS),
            browser: lookup(BROWSER_MARKERS),
            mobile,
            tablet,
        }
    }

    /// Parse through `cache`, keyed by the full user-agent string
    pub fn parse_cached(cache: &TtlCache<String, UserAgentInfo>, user_agent: &str) -> Self {
        let key = user_agent.to_string();
        if let Some(info) = cache.get(&key) {
            return info;
        }
        let info = Self::parse(user_agent);
        cache.set(key, info.clone());
        info
    }
}
