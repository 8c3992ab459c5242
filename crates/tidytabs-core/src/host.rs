//! Host surfaces the engine drives
//!
//! [`TabHost`] is the narrow asynchronous interface to whatever owns the
//! real tabs: a browser bridge in production, the in-memory session host in
//! tests and the CLI. Calls are slow and fallible; every mutating call must
//! be idempotent when re-invoked with the same arguments, because the retry
//! layer will do exactly that.

use std::sync::atomic::{AtomicIsize, Ordering};

use async_trait::async_trait;

use crate::error::HostResult;
use crate::tabs::{GroupAppearance, GroupId, MoveTarget, Tab, TabId, Window};

/// Asynchronous tab host surface
#[async_trait]
pub trait TabHost: Send + Sync {
    /// All tabs across all windows, in tab-strip order per window.
    async fn list_all_tabs(&self) -> HostResult<Vec<Tab>>;

    /// All top-level windows.
    async fn list_windows(&self) -> HostResult<Vec<Window>>;

    /// The focused window.
    async fn active_window(&self) -> HostResult<Window>;

    /// Close the given tabs. Ids that no longer exist are ignored.
    async fn close_tabs(&self, ids: &[TabId]) -> HostResult<()>;

    /// Move tabs to `target`, preserving the order of `ids` at the
    /// destination. An index of [`crate::tabs::APPEND_INDEX`] appends.
    async fn move_tabs(&self, ids: &[TabId], target: MoveTarget) -> HostResult<()>;

    /// Add tabs to a group. With `group = None` a new group is created in
    /// the tabs' window. Returns the group id the tabs ended up in.
    ///
    /// Fails with [`crate::error::HostError::GroupNotFound`] when asked to
    /// extend a group id that no longer exists.
    async fn add_tabs_to_group(&self, group: Option<GroupId>, ids: &[TabId])
    -> HostResult<GroupId>;

    /// Update a group's visual attributes. `None` fields are left unchanged.
    async fn set_group_appearance(
        &self,
        group: GroupId,
        appearance: &GroupAppearance,
    ) -> HostResult<()>;

    /// Remove tabs from whatever group they are in. Ungrouped ids are
    /// ignored.
    async fn remove_from_group(&self, ids: &[TabId]) -> HostResult<()>;
}

/// Duplicate-count indicator surface (a toolbar badge in production)
pub trait Indicator: Send + Sync {
    /// Show a non-zero duplicate count.
    fn set_count(&self, count: usize);

    /// Hide the indicator.
    fn clear(&self);
}

/// Indicator that discards every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIndicator;

impl Indicator for NullIndicator {
    fn set_count(&self, _count: usize) {}

    fn clear(&self) {}
}

/// Indicator that remembers the last value it was shown
///
/// Stores the count in an atomic with `-1` meaning cleared, so readers never
/// block writers.
#[derive(Debug)]
pub struct MemoryIndicator {
    value: AtomicIsize,
}

impl MemoryIndicator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            value: AtomicIsize::new(-1),
        }
    }

    /// Last shown count, or `None` when cleared.
    #[must_use]
    pub fn value(&self) -> Option<usize> {
        let raw = self.value.load(Ordering::SeqCst);
        usize::try_from(raw).ok()
    }
}

impl Default for MemoryIndicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Indicator for MemoryIndicator {
    fn set_count(&self, count: usize) {
        let clamped = isize::try_from(count).unwrap_or(isize::MAX);
        self.value.store(clamped, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.value.store(-1, Ordering::SeqCst);
    }
}
