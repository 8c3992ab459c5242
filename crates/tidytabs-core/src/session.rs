//! In-memory tab host backed by a serializable session.
//!
//! [`SessionHost`] implements [`TabHost`] over a [`SessionState`] document:
//! windows holding tabs in strip order, plus the visual groups layered on
//! top. The CLI loads a session from JSON, reconciles it, and writes it
//! back; the test suite drives the same host directly.
//!
//! Beyond plain state, the host records every call for assertions:
//! - [`CallCounters`] counts calls per operation
//! - an action log captures each mutation in order
//! - [`FaultRule`]s inject failures at chosen operations and call positions
//! - an optional fixed latency simulates a slow host
//!
//! Mutation semantics mirror a real browser bridge: closing or ungrouping an
//! unknown tab id is a no-op, extending a dead group id fails structurally,
//! and a group vanishes the moment its last member leaves.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HostError, HostResult, Result};
use crate::host::TabHost;
use crate::tabs::{
    APPEND_INDEX, GroupAppearance, GroupColor, GroupId, MoveTarget, Tab, TabId, Window, WindowId,
    WindowKind,
};

const POISONED: &str = "session state lock poisoned";

// ============================================================================
// Session Documents
// ============================================================================

/// One tab inside a session document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTab {
    pub id: TabId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub group: Option<GroupId>,
}

impl SessionTab {
    #[must_use]
    pub fn new(id: TabId) -> Self {
        Self {
            id,
            url: None,
            title: None,
            group: None,
        }
    }

    /// Set the URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Place the tab in a group.
    #[must_use]
    pub fn in_group(mut self, group: GroupId) -> Self {
        self.group = Some(group);
        self
    }
}

/// One window inside a session document. Tab order is strip order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub id: WindowId,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub kind: WindowKind,
    #[serde(default)]
    pub tabs: Vec<SessionTab>,
}

impl SessionWindow {
    #[must_use]
    pub fn new(id: WindowId) -> Self {
        Self {
            id,
            focused: false,
            kind: WindowKind::Normal,
            tabs: Vec::new(),
        }
    }

    /// Mark the window focused.
    #[must_use]
    pub fn focused(mut self) -> Self {
        self.focused = true;
        self
    }

    /// Set the window kind.
    #[must_use]
    pub fn with_kind(mut self, kind: WindowKind) -> Self {
        self.kind = kind;
        self
    }

    /// Append a tab at the end of the strip.
    #[must_use]
    pub fn with_tab(mut self, tab: SessionTab) -> Self {
        self.tabs.push(tab);
        self
    }
}

/// One visual group inside a session document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGroup {
    pub id: GroupId,
    pub window: WindowId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub collapsed: bool,
    #[serde(default)]
    pub color: Option<GroupColor>,
}

impl SessionGroup {
    #[must_use]
    pub fn new(id: GroupId, window: WindowId) -> Self {
        Self {
            id,
            window,
            title: None,
            collapsed: false,
            color: None,
        }
    }

    /// Set the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Full browser session: windows with tabs, and the groups over them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub windows: Vec<SessionWindow>,
    #[serde(default)]
    pub groups: Vec<SessionGroup>,
}

impl SessionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a window.
    #[must_use]
    pub fn with_window(mut self, window: SessionWindow) -> Self {
        self.windows.push(window);
        self
    }

    /// Register a group.
    #[must_use]
    pub fn with_group(mut self, group: SessionGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Load a session from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write the session to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Total tabs across all windows.
    #[must_use]
    pub fn tab_count(&self) -> usize {
        self.windows.iter().map(|window| window.tabs.len()).sum()
    }

    /// Find a tab anywhere in the session.
    #[must_use]
    pub fn find_tab(&self, id: TabId) -> Option<&SessionTab> {
        self.windows
            .iter()
            .flat_map(|window| window.tabs.iter())
            .find(|tab| tab.id == id)
    }

    /// Group titles in registration order.
    #[must_use]
    pub fn group_titles(&self) -> Vec<String> {
        self.groups
            .iter()
            .filter_map(|group| group.title.clone())
            .collect()
    }
}

// ============================================================================
// Call Accounting
// ============================================================================

/// Host operations, used for counters and fault targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOp {
    ListTabs,
    ListWindows,
    ActiveWindow,
    CloseTabs,
    MoveTabs,
    AddToGroup,
    SetAppearance,
    RemoveFromGroup,
}

impl std::fmt::Display for HostOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ListTabs => "list_tabs",
            Self::ListWindows => "list_windows",
            Self::ActiveWindow => "active_window",
            Self::CloseTabs => "close_tabs",
            Self::MoveTabs => "move_tabs",
            Self::AddToGroup => "add_to_group",
            Self::SetAppearance => "set_appearance",
            Self::RemoveFromGroup => "remove_from_group",
        };
        write!(f, "{name}")
    }
}

/// Per-operation call counters.
#[derive(Debug, Default)]
pub struct CallCounters {
    list_tabs: AtomicU64,
    list_windows: AtomicU64,
    active_window: AtomicU64,
    close_tabs: AtomicU64,
    move_tabs: AtomicU64,
    add_to_group: AtomicU64,
    set_appearance: AtomicU64,
    remove_from_group: AtomicU64,
}

impl CallCounters {
    fn record(&self, op: HostOp) {
        self.cell(op).fetch_add(1, Ordering::SeqCst);
    }

    fn cell(&self, op: HostOp) -> &AtomicU64 {
        match op {
            HostOp::ListTabs => &self.list_tabs,
            HostOp::ListWindows => &self.list_windows,
            HostOp::ActiveWindow => &self.active_window,
            HostOp::CloseTabs => &self.close_tabs,
            HostOp::MoveTabs => &self.move_tabs,
            HostOp::AddToGroup => &self.add_to_group,
            HostOp::SetAppearance => &self.set_appearance,
            HostOp::RemoveFromGroup => &self.remove_from_group,
        }
    }

    /// Point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            list_tabs: self.list_tabs.load(Ordering::SeqCst),
            list_windows: self.list_windows.load(Ordering::SeqCst),
            active_window: self.active_window.load(Ordering::SeqCst),
            close_tabs: self.close_tabs.load(Ordering::SeqCst),
            move_tabs: self.move_tabs.load(Ordering::SeqCst),
            add_to_group: self.add_to_group.load(Ordering::SeqCst),
            set_appearance: self.set_appearance.load(Ordering::SeqCst),
            remove_from_group: self.remove_from_group.load(Ordering::SeqCst),
        }
    }
}

/// Frozen copy of [`CallCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub list_tabs: u64,
    pub list_windows: u64,
    pub active_window: u64,
    pub close_tabs: u64,
    pub move_tabs: u64,
    pub add_to_group: u64,
    pub set_appearance: u64,
    pub remove_from_group: u64,
}

impl CallSnapshot {
    /// Calls against the query surface.
    #[must_use]
    pub fn fetch_calls(&self) -> u64 {
        self.list_tabs + self.list_windows + self.active_window
    }

    /// Calls against the mutation surface.
    #[must_use]
    pub fn mutation_calls(&self) -> u64 {
        self.close_tabs
            + self.move_tabs
            + self.add_to_group
            + self.set_appearance
            + self.remove_from_group
    }
}

/// One mutation the host applied, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedAction {
    Closed(Vec<TabId>),
    Moved {
        tabs: Vec<TabId>,
        target: MoveTarget,
    },
    Grouped {
        group: GroupId,
        tabs: Vec<TabId>,
    },
    Labeled {
        group: GroupId,
        title: Option<String>,
    },
    Ungrouped(Vec<TabId>),
}

// ============================================================================
// Fault Injection
// ============================================================================

/// What kind of failure a fault injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A failure the retry layer is expected to absorb.
    Transient,
    /// A failure retrying cannot repair, mapped to an operation-appropriate
    /// not-found error.
    Structural,
}

/// A queued failure for one operation.
///
/// The first `skip` matching calls pass through untouched, then the next
/// `remaining` matching calls fail. Spent rules are removed.
#[derive(Debug, Clone)]
pub struct FaultRule {
    pub op: HostOp,
    pub kind: FaultKind,
    pub skip: u64,
    pub remaining: u32,
}

impl FaultRule {
    /// Fail the next matching call once.
    #[must_use]
    pub fn next(op: HostOp, kind: FaultKind) -> Self {
        Self::times(op, kind, 1)
    }

    /// Fail the next `count` matching calls.
    #[must_use]
    pub fn times(op: HostOp, kind: FaultKind, count: u32) -> Self {
        Self {
            op,
            kind,
            skip: 0,
            remaining: count,
        }
    }

    /// Fail only the nth matching call (1-based).
    #[must_use]
    pub fn nth(op: HostOp, kind: FaultKind, position: u64) -> Self {
        Self {
            op,
            kind,
            skip: position.saturating_sub(1),
            remaining: 1,
        }
    }
}

fn injected_error(op: HostOp, kind: FaultKind) -> HostError {
    match kind {
        FaultKind::Transient => HostError::CallFailed(format!("injected fault on {op}")),
        FaultKind::Structural => match op {
            HostOp::AddToGroup | HostOp::SetAppearance => HostError::GroupNotFound(GroupId(0)),
            HostOp::ActiveWindow => HostError::NoActiveWindow,
            HostOp::ListWindows => HostError::WindowNotFound(WindowId(0)),
            _ => HostError::TabNotFound(TabId(0)),
        },
    }
}

// ============================================================================
// Session Host
// ============================================================================

/// [`TabHost`] implementation over an in-memory [`SessionState`].
pub struct SessionHost {
    state: Mutex<SessionState>,
    counters: CallCounters,
    actions: Mutex<Vec<AppliedAction>>,
    faults: Mutex<Vec<FaultRule>>,
    latency: Mutex<Duration>,
    next_group_id: AtomicU64,
}

impl SessionHost {
    #[must_use]
    pub fn new(state: SessionState) -> Self {
        let next_group_id = state
            .groups
            .iter()
            .map(|group| group.id.0)
            .max()
            .unwrap_or(0)
            + 1;
        Self {
            state: Mutex::new(state),
            counters: CallCounters::default(),
            actions: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
            next_group_id: AtomicU64::new(next_group_id),
        }
    }

    /// Copy of the current session.
    #[must_use]
    pub fn state_snapshot(&self) -> SessionState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Point-in-time copy of the call counters.
    #[must_use]
    pub fn counters(&self) -> CallSnapshot {
        self.counters.snapshot()
    }

    /// Copy of the mutation log.
    #[must_use]
    pub fn actions(&self) -> Vec<AppliedAction> {
        self.actions
            .lock()
            .map(|actions| actions.clone())
            .unwrap_or_default()
    }

    /// Drain and return the mutation log.
    pub fn drain_actions(&self) -> Vec<AppliedAction> {
        self.actions
            .lock()
            .map(|mut actions| std::mem::take(&mut *actions))
            .unwrap_or_default()
    }

    /// Queue a fault against a future call.
    pub fn queue_fault(&self, rule: FaultRule) {
        if rule.remaining == 0 {
            return;
        }
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(rule);
        }
    }

    /// Add a fixed delay to every host call.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    fn record_action(&self, action: AppliedAction) {
        if let Ok(mut actions) = self.actions.lock() {
            actions.push(action);
        }
    }

    fn take_fault(&self, op: HostOp) -> Option<HostError> {
        let mut faults = self.faults.lock().ok()?;
        let position = faults.iter().position(|rule| rule.op == op)?;
        let rule = &mut faults[position];

        if rule.skip > 0 {
            rule.skip -= 1;
            return None;
        }

        rule.remaining = rule.remaining.saturating_sub(1);
        let kind = rule.kind;
        if rule.remaining == 0 {
            faults.remove(position);
        }
        Some(injected_error(op, kind))
    }

    async fn enter(&self, op: HostOp) -> HostResult<()> {
        self.counters.record(op);

        let latency = self.latency.lock().map(|slot| *slot).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(err) = self.take_fault(op) {
            debug!(%op, %err, "firing injected host fault");
            return Err(err);
        }
        Ok(())
    }

    fn fresh_group_id(&self) -> GroupId {
        GroupId(self.next_group_id.fetch_add(1, Ordering::SeqCst))
    }
}

fn locate(state: &SessionState, id: TabId) -> Option<(usize, usize)> {
    for (window_index, window) in state.windows.iter().enumerate() {
        if let Some(position) = window.tabs.iter().position(|tab| tab.id == id) {
            return Some((window_index, position));
        }
    }
    None
}

fn set_group(state: &mut SessionState, id: TabId, group: Option<GroupId>) {
    if let Some((window_index, position)) = locate(state, id) {
        state.windows[window_index].tabs[position].group = group;
    }
}

fn prune_empty_groups(state: &mut SessionState) {
    let used: HashSet<GroupId> = state
        .windows
        .iter()
        .flat_map(|window| window.tabs.iter())
        .filter_map(|tab| tab.group)
        .collect();
    state.groups.retain(|group| used.contains(&group.id));
}

fn host_window(window: &SessionWindow) -> Window {
    let mut out = Window::new(window.id);
    out.focused = window.focused;
    out.kind = window.kind;
    out
}

#[async_trait]
impl TabHost for SessionHost {
    async fn list_all_tabs(&self) -> HostResult<Vec<Tab>> {
        self.enter(HostOp::ListTabs).await?;
        let Ok(state) = self.state.lock() else {
            return Err(HostError::Unavailable(POISONED.into()));
        };

        let mut out = Vec::with_capacity(state.tab_count());
        for window in &state.windows {
            for (position, tab) in window.tabs.iter().enumerate() {
                let mut snapshot = Tab::new(tab.id, window.id, position as u32);
                snapshot.url = tab.url.clone();
                snapshot.title = tab.title.clone();
                snapshot.group = tab.group;
                out.push(snapshot);
            }
        }
        Ok(out)
    }

    async fn list_windows(&self) -> HostResult<Vec<Window>> {
        self.enter(HostOp::ListWindows).await?;
        let Ok(state) = self.state.lock() else {
            return Err(HostError::Unavailable(POISONED.into()));
        };
        Ok(state.windows.iter().map(host_window).collect())
    }

    async fn active_window(&self) -> HostResult<Window> {
        self.enter(HostOp::ActiveWindow).await?;
        let Ok(state) = self.state.lock() else {
            return Err(HostError::Unavailable(POISONED.into()));
        };

        state
            .windows
            .iter()
            .find(|window| window.focused && window.kind == WindowKind::Normal)
            .or_else(|| {
                state
                    .windows
                    .iter()
                    .find(|window| window.kind == WindowKind::Normal)
            })
            .map(host_window)
            .ok_or(HostError::NoActiveWindow)
    }

    async fn close_tabs(&self, ids: &[TabId]) -> HostResult<()> {
        self.enter(HostOp::CloseTabs).await?;
        let Ok(mut state) = self.state.lock() else {
            return Err(HostError::Unavailable(POISONED.into()));
        };

        let requested: HashSet<TabId> = ids.iter().copied().collect();
        let mut closed = Vec::new();
        for window in &mut state.windows {
            window.tabs.retain(|tab| {
                if requested.contains(&tab.id) {
                    closed.push(tab.id);
                    false
                } else {
                    true
                }
            });
        }
        prune_empty_groups(&mut state);
        drop(state);

        if !closed.is_empty() {
            self.record_action(AppliedAction::Closed(closed));
        }
        Ok(())
    }

    async fn move_tabs(&self, ids: &[TabId], target: MoveTarget) -> HostResult<()> {
        self.enter(HostOp::MoveTabs).await?;
        let Ok(mut state) = self.state.lock() else {
            return Err(HostError::Unavailable(POISONED.into()));
        };

        let mut moved = Vec::new();
        for (offset, id) in ids.iter().enumerate() {
            let Some((source_index, position)) = locate(&state, *id) else {
                continue;
            };

            // Resolve the destination first; a failed move must not drop
            // the tab from its strip.
            let dest_index = match target.window {
                Some(window_id) => {
                    match state.windows.iter().position(|window| window.id == window_id) {
                        Some(index) => index,
                        None => return Err(HostError::WindowNotFound(window_id)),
                    }
                }
                None => source_index,
            };

            let tab = state.windows[source_index].tabs.remove(position);
            let strip = &mut state.windows[dest_index].tabs;
            if target.index == APPEND_INDEX {
                strip.push(tab);
            } else {
                let base = usize::try_from(target.index).unwrap_or(0);
                let at = (base + offset).min(strip.len());
                strip.insert(at, tab);
            }
            moved.push(*id);
        }
        drop(state);

        if !moved.is_empty() {
            self.record_action(AppliedAction::Moved {
                tabs: moved,
                target,
            });
        }
        Ok(())
    }

    async fn add_tabs_to_group(
        &self,
        group: Option<GroupId>,
        ids: &[TabId],
    ) -> HostResult<GroupId> {
        self.enter(HostOp::AddToGroup).await?;
        let Ok(mut state) = self.state.lock() else {
            return Err(HostError::Unavailable(POISONED.into()));
        };

        let resolved: Vec<TabId> = ids
            .iter()
            .copied()
            .filter(|id| locate(&state, *id).is_some())
            .collect();

        let group_id = match group {
            Some(existing) => {
                if !state.groups.iter().any(|candidate| candidate.id == existing) {
                    return Err(HostError::GroupNotFound(existing));
                }
                existing
            }
            None => {
                let Some(first) = resolved.first().copied() else {
                    let missing = ids.first().copied().unwrap_or(TabId(0));
                    return Err(HostError::TabNotFound(missing));
                };
                let Some((window_index, _)) = locate(&state, first) else {
                    return Err(HostError::TabNotFound(first));
                };
                let window = state.windows[window_index].id;
                let id = self.fresh_group_id();
                state.groups.push(SessionGroup::new(id, window));
                id
            }
        };

        for id in &resolved {
            set_group(&mut state, *id, Some(group_id));
        }
        prune_empty_groups(&mut state);
        drop(state);

        self.record_action(AppliedAction::Grouped {
            group: group_id,
            tabs: resolved,
        });
        Ok(group_id)
    }

    async fn set_group_appearance(
        &self,
        group: GroupId,
        appearance: &GroupAppearance,
    ) -> HostResult<()> {
        self.enter(HostOp::SetAppearance).await?;
        let Ok(mut state) = self.state.lock() else {
            return Err(HostError::Unavailable(POISONED.into()));
        };

        let Some(target) = state.groups.iter_mut().find(|candidate| candidate.id == group) else {
            return Err(HostError::GroupNotFound(group));
        };
        if let Some(title) = &appearance.title {
            target.title = Some(title.clone());
        }
        if let Some(collapsed) = appearance.collapsed {
            target.collapsed = collapsed;
        }
        if let Some(color) = appearance.color {
            target.color = Some(color);
        }
        drop(state);

        self.record_action(AppliedAction::Labeled {
            group,
            title: appearance.title.clone(),
        });
        Ok(())
    }

    async fn remove_from_group(&self, ids: &[TabId]) -> HostResult<()> {
        self.enter(HostOp::RemoveFromGroup).await?;
        let Ok(mut state) = self.state.lock() else {
            return Err(HostError::Unavailable(POISONED.into()));
        };

        let mut ungrouped = Vec::new();
        for id in ids {
            if let Some((window_index, position)) = locate(&state, *id) {
                if state.windows[window_index].tabs[position].group.is_some() {
                    state.windows[window_index].tabs[position].group = None;
                    ungrouped.push(*id);
                }
            }
        }
        prune_empty_groups(&mut state);
        drop(state);

        if !ungrouped.is_empty() {
            self.record_action(AppliedAction::Ungrouped(ungrouped));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
