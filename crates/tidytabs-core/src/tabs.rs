//! Browser tab data model
//!
//! Snapshot types returned by the tab host, plus the small value types the
//! planner and executor exchange.
//!
//! ## JSON Model Design
//!
//! Host snapshots vary between browser vendors and versions. We design for
//! robustness:
//! - All non-ID fields are optional with sane defaults
//! - Unknown fields are ignored via `#[serde(flatten)]` with `Value`
//! - Domain extraction falls back to [`FALLBACK_DOMAIN`] rather than failing

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Domain bucket for tabs whose URL is absent or has no parseable host
pub const FALLBACK_DOMAIN: &str = "other";

/// URL prefixes for browser-internal pages that must never be touched
pub const INTERNAL_URL_PREFIXES: [&str; 6] = [
    "chrome://",
    "chrome-extension://",
    "devtools://",
    "edge://",
    "moz-extension://",
    "about:",
];

/// Move index meaning "append after the last tab in the window"
pub const APPEND_INDEX: i32 = -1;

/// Unique tab identifier assigned by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique tab group identifier assigned by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique window identifier assigned by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Window type as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    /// Regular browser window with a tab strip
    #[default]
    Normal,
    /// Detached popup window
    Popup,
    /// Installed web app window
    App,
    /// Developer tools window
    Devtools,
}

/// A top-level browser window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Window {
    /// Unique window ID (required)
    pub id: WindowId,
    /// Whether this window currently has focus
    #[serde(default)]
    pub focused: bool,
    /// Window type; only `normal` windows participate in reconciliation
    #[serde(default)]
    pub kind: WindowKind,
    /// Any additional fields we don't recognize
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Window {
    #[must_use]
    pub fn new(id: WindowId) -> Self {
        Self {
            id,
            focused: false,
            kind: WindowKind::Normal,
            extra: HashMap::new(),
        }
    }
}

/// A single browser tab as reported by the host
///
/// This struct is designed to tolerate unknown fields and missing optional
/// fields. Snapshots go stale the moment a mutation lands, so holders should
/// re-fetch rather than trust `index` or `group` across mutating calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tab {
    /// Unique tab ID (required)
    pub id: TabId,
    /// Window containing this tab (required)
    pub window: WindowId,
    /// Position within the window's tab strip
    #[serde(default)]
    pub index: u32,

    // --- Content ---
    /// Committed URL, absent while a tab is still loading
    #[serde(default)]
    pub url: Option<String>,
    /// Page title (from the document or the host)
    #[serde(default)]
    pub title: Option<String>,

    // --- Grouping ---
    /// Group this tab belongs to, if any
    #[serde(default)]
    pub group: Option<GroupId>,

    // --- Unknown fields (for forward compatibility) ---
    /// Any additional fields we don't recognize
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Tab {
    #[must_use]
    pub fn new(id: TabId, window: WindowId, index: u32) -> Self {
        Self {
            id,
            window,
            index,
            url: None,
            title: None,
            group: None,
            extra: HashMap::new(),
        }
    }

    /// Set the URL
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the title
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the group membership
    #[must_use]
    pub fn with_group(mut self, group: GroupId) -> Self {
        self.group = Some(group);
        self
    }

    /// Lowercased hostname of the tab's URL, or [`FALLBACK_DOMAIN`]
    #[must_use]
    pub fn domain(&self) -> String {
        domain_of(self.url.as_deref())
    }

    /// Whether this tab shows a browser-internal page
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.url.as_deref().is_some_and(is_internal_url)
    }

    /// URL as a sort key; tabs without a URL sort first
    #[must_use]
    pub fn url_key(&self) -> &str {
        self.url.as_deref().unwrap_or("")
    }
}

/// Destination for a tab move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveTarget {
    /// Destination window, or None to stay in the current window
    #[serde(default)]
    pub window: Option<WindowId>,
    /// Destination index, where [`APPEND_INDEX`] appends after the last tab
    pub index: i32,
}

impl MoveTarget {
    /// Move within the current window to the given index
    #[must_use]
    pub fn at(index: u32) -> Self {
        Self {
            window: None,
            index: i32::try_from(index).unwrap_or(i32::MAX),
        }
    }

    /// Append at the end of the given window
    #[must_use]
    pub fn append_to(window: WindowId) -> Self {
        Self {
            window: Some(window),
            index: APPEND_INDEX,
        }
    }
}

/// Visual attributes applied to a tab group
///
/// Fields set to `None` are left unchanged by the host, mirroring the
/// partial-update semantics of browser group APIs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAppearance {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub collapsed: Option<bool>,
    #[serde(default)]
    pub color: Option<GroupColor>,
}

impl GroupAppearance {
    /// Standard appearance for a reconciled group: the display name as title,
    /// expanded, with a color derived deterministically from the title.
    #[must_use]
    pub fn labeled(title: impl Into<String>) -> Self {
        let title = title.into();
        let color = GroupColor::for_title(&title);
        Self {
            title: Some(title),
            collapsed: Some(false),
            color: Some(color),
        }
    }
}

/// Tab group colors supported across browser vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupColor {
    #[default]
    Grey,
    Blue,
    Red,
    Yellow,
    Green,
    Pink,
    Purple,
    Cyan,
    Orange,
}

impl GroupColor {
    /// Full palette in a fixed order
    pub const PALETTE: [Self; 9] = [
        Self::Grey,
        Self::Blue,
        Self::Red,
        Self::Yellow,
        Self::Green,
        Self::Pink,
        Self::Purple,
        Self::Cyan,
        Self::Orange,
    ];

    /// Pick a color for a group title, stable across runs and sessions.
    ///
    /// `DefaultHasher::new()` hashes with fixed keys, so equal titles always
    /// map to the same palette entry.
    #[must_use]
    pub fn for_title(title: &str) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        title.hash(&mut hasher);
        let index = usize::try_from(hasher.finish() % Self::PALETTE.len() as u64).unwrap_or(0);
        Self::PALETTE[index]
    }
}

impl fmt::Display for GroupColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Grey => "grey",
            Self::Blue => "blue",
            Self::Red => "red",
            Self::Yellow => "yellow",
            Self::Green => "green",
            Self::Pink => "pink",
            Self::Purple => "purple",
            Self::Cyan => "cyan",
            Self::Orange => "orange",
        };
        write!(f, "{name}")
    }
}

/// Lowercased hostname of a URL, or [`FALLBACK_DOMAIN`] when the URL is
/// absent, unparseable, or has no host (e.g. `about:blank`, `file://` paths).
///
/// Never fails: every tab lands in exactly one domain bucket.
#[must_use]
pub fn domain_of(url: Option<&str>) -> String {
    url.and_then(|raw| Url::parse(raw.trim()).ok())
        .and_then(|parsed| parsed.host_str().map(str::to_owned))
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| FALLBACK_DOMAIN.to_owned())
}

/// Whether a URL points at a browser-internal page
#[must_use]
pub fn is_internal_url(url: &str) -> bool {
    let url = url.trim();
    INTERNAL_URL_PREFIXES
        .iter()
        .any(|prefix| url.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_parses_with_unknown_fields() {
        let json = r#"{
            "id": 42,
            "window": 1,
            "index": 3,
            "url": "https://example.com/page",
            "group": 7,
            "audible": true,
            "favIconUrl": "https://example.com/favicon.ico"
        }"#;

        let tab: Tab = serde_json::from_str(json).unwrap();
        assert_eq!(tab.id, TabId(42));
        assert_eq!(tab.window, WindowId(1));
        assert_eq!(tab.index, 3);
        assert_eq!(tab.group, Some(GroupId(7)));
        assert_eq!(tab.url.as_deref(), Some("https://example.com/page"));
        assert!(tab.extra.contains_key("audible"));
        assert!(tab.extra.contains_key("favIconUrl"));
    }

    #[test]
    fn tab_parses_with_minimal_fields() {
        let json = r#"{"id": 1, "window": 2}"#;
        let tab: Tab = serde_json::from_str(json).unwrap();
        assert_eq!(tab.index, 0);
        assert!(tab.url.is_none());
        assert!(tab.group.is_none());
        assert_eq!(tab.domain(), FALLBACK_DOMAIN);
    }

    #[test]
    fn domain_extraction_lowercases_hosts() {
        assert_eq!(
            domain_of(Some("https://News.YCombinator.com/item?id=1")),
            "news.ycombinator.com"
        );
    }

    #[test]
    fn domain_extraction_falls_back_to_other() {
        assert_eq!(domain_of(None), FALLBACK_DOMAIN);
        assert_eq!(domain_of(Some("")), FALLBACK_DOMAIN);
        assert_eq!(domain_of(Some("about:blank")), FALLBACK_DOMAIN);
        assert_eq!(domain_of(Some("file:///home/user/doc.pdf")), FALLBACK_DOMAIN);
        assert_eq!(domain_of(Some("not a url at all")), FALLBACK_DOMAIN);
        assert_eq!(domain_of(Some("data:text/plain,hello")), FALLBACK_DOMAIN);
    }

    #[test]
    fn domain_extraction_keeps_port_out_of_domain() {
        assert_eq!(domain_of(Some("http://localhost:8080/dev")), "localhost");
        assert_eq!(
            domain_of(Some("https://user@intranet.corp:8443/wiki")),
            "intranet.corp"
        );
    }

    #[test]
    fn internal_urls_detected_by_prefix() {
        assert!(is_internal_url("chrome://settings"));
        assert!(is_internal_url("about:blank"));
        assert!(is_internal_url("moz-extension://abc123/popup.html"));
        assert!(is_internal_url("devtools://devtools/bundled/inspector.html"));
        assert!(!is_internal_url("https://example.com"));
        assert!(!is_internal_url("http://aboutblank.example.com"));
    }

    #[test]
    fn group_color_is_deterministic_for_title() {
        let first = GroupColor::for_title("Shopping");
        let second = GroupColor::for_title("Shopping");
        assert_eq!(first, second);
        assert!(GroupColor::PALETTE.contains(&first));
    }

    #[test]
    fn move_target_constructors() {
        let at = MoveTarget::at(4);
        assert_eq!(at.index, 4);
        assert!(at.window.is_none());

        let append = MoveTarget::append_to(WindowId(9));
        assert_eq!(append.index, APPEND_INDEX);
        assert_eq!(append.window, Some(WindowId(9)));
    }

    #[test]
    fn window_kind_parses_lowercase() {
        let window: Window = serde_json::from_str(r#"{"id": 5, "kind": "popup"}"#).unwrap();
        assert_eq!(window.kind, WindowKind::Popup);
        assert!(!window.focused);

        let bare: Window = serde_json::from_str(r#"{"id": 6}"#).unwrap();
        assert_eq!(bare.kind, WindowKind::Normal);
    }

    #[test]
    fn ids_serialize_transparently() {
        let tab = Tab::new(TabId(3), WindowId(1), 0).with_url("https://example.com");
        let value = serde_json::to_value(&tab).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["window"], 1);
    }
}
