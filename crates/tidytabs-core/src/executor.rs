//! Execution adapter: every host side effect lives here.
//!
//! [`TabExecutor`] wraps a [`TabHost`] and applies what the planner decided:
//! closing duplicates, enforcing auto-delete rules, merging windows,
//! realizing [`GroupState`]s, and executing a [`GroupPlan`]. All host calls
//! go through the retry layer; bulk mutations are chunked and paced.
//!
//! The adapter makes no grouping decisions of its own. It does own the
//! recovery mechanics: a dead group id falls back to creating a fresh group,
//! and a failed plan step triggers a best-effort rollback before the error
//! surfaces.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, HostResult, PlanError, PlanStage, Result};
use crate::host::TabHost;
use crate::plan::{GroupPlan, GroupState, MIN_GROUP_SIZE};
use crate::planner::{DomainPartition, TabCache};
use crate::retry::{BatchConfig, RetryPolicy, run_batched, with_retry};
use crate::rules::RuleSet;
use crate::tabs::{GroupAppearance, GroupId, MoveTarget, Tab, TabId, WindowKind};

/// Retry and batching knobs for the execution adapter.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    pub batch: BatchConfig,
}

/// Applies planning decisions against a tab host.
pub struct TabExecutor {
    host: Arc<dyn TabHost>,
    config: ExecutorConfig,
}

impl TabExecutor {
    #[must_use]
    pub fn new(host: Arc<dyn TabHost>) -> Self {
        Self::with_config(host, ExecutorConfig::default())
    }

    #[must_use]
    pub fn with_config(host: Arc<dyn TabHost>, config: ExecutorConfig) -> Self {
        Self { host, config }
    }

    // ------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------

    /// Fetch every tab that participates in reconciliation.
    ///
    /// Tabs in non-normal windows (popups, installed apps, devtools) and
    /// tabs showing browser-internal pages are excluded. When the host
    /// cannot be read even after retries, the run degrades to an empty tab
    /// list instead of failing; a run over nothing is a no-op.
    pub async fn fetch_processable_tabs(&self) -> Vec<Tab> {
        let windows = match with_retry(&self.config.retry, "list_windows", || {
            self.host.list_windows()
        })
        .await
        {
            Ok(windows) => windows,
            Err(err) => {
                warn!(%err, "window fetch failed, continuing with no tabs");
                return Vec::new();
            }
        };

        let tabs = match with_retry(&self.config.retry, "list_all_tabs", || {
            self.host.list_all_tabs()
        })
        .await
        {
            Ok(tabs) => tabs,
            Err(err) => {
                warn!(%err, "tab fetch failed, continuing with no tabs");
                return Vec::new();
            }
        };

        let normal: HashSet<_> = windows
            .iter()
            .filter(|window| window.kind == WindowKind::Normal)
            .map(|window| window.id)
            .collect();

        let total = tabs.len();
        let processable: Vec<Tab> = tabs
            .into_iter()
            .filter(|tab| normal.contains(&tab.window) && !tab.is_internal())
            .collect();
        debug!(
            total,
            processable = processable.len(),
            "fetched processable tabs"
        );
        processable
    }

    // ------------------------------------------------------------------
    // Cleanup phases
    // ------------------------------------------------------------------

    /// Close all but the first tab per URL.
    ///
    /// Returns the surviving tabs and the number closed. Tabs without a URL
    /// always survive.
    pub async fn deduplicate_by_url(&self, tabs: Vec<Tab>) -> Result<(Vec<Tab>, usize)> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut survivors = Vec::with_capacity(tabs.len());
        let mut doomed = Vec::new();

        for tab in tabs {
            let Some(url) = tab.url.clone() else {
                survivors.push(tab);
                continue;
            };
            if seen.insert((tab.domain(), url)) {
                survivors.push(tab);
            } else {
                doomed.push(tab.id);
            }
        }

        if !doomed.is_empty() {
            info!(count = doomed.len(), "closing duplicate tabs");
            self.close_batched("close_duplicates", &doomed).await?;
        }
        Ok((survivors, doomed.len()))
    }

    /// Close tabs whose domain carries an auto-delete rule.
    ///
    /// Returns the surviving tabs and the number closed.
    pub async fn apply_auto_delete(
        &self,
        tabs: Vec<Tab>,
        rules: &RuleSet,
    ) -> Result<(Vec<Tab>, usize)> {
        let (doomed, survivors): (Vec<Tab>, Vec<Tab>) = tabs
            .into_iter()
            .partition(|tab| rules.auto_deletes(&tab.domain()));

        let ids: Vec<TabId> = doomed.iter().map(|tab| tab.id).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "closing auto-delete tabs");
            self.close_batched("auto_delete", &ids).await?;
        }
        Ok((survivors, ids.len()))
    }

    /// Move every tab outside the active window into it, appended at the
    /// end. A no-op unless more than one normal window is open.
    ///
    /// Returns the number of tabs moved.
    pub async fn merge_windows_to_active(&self, tabs: &[Tab]) -> Result<usize> {
        let windows = with_retry(&self.config.retry, "list_windows", || {
            self.host.list_windows()
        })
        .await?;
        let normal = windows
            .iter()
            .filter(|window| window.kind == WindowKind::Normal)
            .count();
        if normal <= 1 {
            return Ok(0);
        }

        let active = with_retry(&self.config.retry, "active_window", || {
            self.host.active_window()
        })
        .await?;
        let outside: Vec<TabId> = tabs
            .iter()
            .filter(|tab| tab.window != active.id)
            .map(|tab| tab.id)
            .collect();
        if outside.is_empty() {
            return Ok(0);
        }

        info!(
            count = outside.len(),
            window = %active.id,
            "merging windows into the active window"
        );
        let target = MoveTarget::append_to(active.id);
        run_batched(
            &self.config.retry,
            &self.config.batch,
            "merge_windows",
            &outside,
            |chunk| async move { self.host.move_tabs(&chunk, target).await },
        )
        .await?;
        Ok(outside.len())
    }

    // ------------------------------------------------------------------
    // Group state application
    // ------------------------------------------------------------------

    /// Bring one group state into existence on the host.
    ///
    /// Returns the group id the members ended up in, or `None` for an
    /// undersized state (whose grouped members are ungrouped instead).
    ///
    /// When every member already sits in the state's current group, the
    /// call returns without touching the host at all; repeated runs over an
    /// unchanged strip must not generate traffic.
    ///
    /// A current group the host no longer knows falls back to creating a
    /// fresh group over the same members.
    pub async fn apply_group_state(
        &self,
        state: &GroupState,
        cache: &TabCache,
    ) -> Result<Option<GroupId>> {
        if state.member_count() < MIN_GROUP_SIZE {
            let grouped: Vec<TabId> = state
                .members
                .iter()
                .filter(|id| cache.get(id).is_some_and(|tab| tab.group.is_some()))
                .copied()
                .collect();
            if !grouped.is_empty() {
                debug!(
                    title = %state.title,
                    count = grouped.len(),
                    "ungrouping undersized state"
                );
                self.ungroup_batched("ungroup_undersized", &grouped).await?;
            }
            return Ok(None);
        }

        if let Some(group) = state.current_group {
            let converged = state
                .members
                .iter()
                .all(|id| cache.get(id).is_some_and(|tab| tab.group == Some(group)));
            if converged {
                debug!(title = %state.title, %group, "group already converged");
                return Ok(Some(group));
            }
        }

        let group = match state.current_group {
            None => self.create_group(state).await?,
            Some(existing) => {
                // Members sitting in some other group leave it first, so
                // extending `existing` cannot silently merge two groups.
                let foreign: Vec<TabId> = state
                    .members
                    .iter()
                    .filter(|id| {
                        cache
                            .get(id)
                            .and_then(|tab| tab.group)
                            .is_some_and(|current| current != existing)
                    })
                    .copied()
                    .collect();
                if !foreign.is_empty() {
                    debug!(
                        title = %state.title,
                        count = foreign.len(),
                        "stripping members out of foreign groups"
                    );
                    self.ungroup_batched("ungroup_foreign", &foreign).await?;
                }

                match with_retry(&self.config.retry, "add_to_group", || {
                    self.host.add_tabs_to_group(Some(existing), &state.members)
                })
                .await
                {
                    Ok(group) => group,
                    Err(err) => {
                        warn!(
                            title = %state.title,
                            group = %existing,
                            %err,
                            "existing group rejected members, creating a fresh group"
                        );
                        self.create_group(state).await?
                    }
                }
            }
        };

        let appearance = GroupAppearance::labeled(state.title.clone());
        with_retry(&self.config.retry, "set_group_appearance", || {
            self.host.set_group_appearance(group, &appearance)
        })
        .await?;

        Ok(Some(group))
    }

    async fn create_group(&self, state: &GroupState) -> Result<GroupId> {
        let group = with_retry(&self.config.retry, "create_group", || {
            self.host.add_tabs_to_group(None, &state.members)
        })
        .await?;
        debug!(title = %state.title, %group, "created fresh group");
        Ok(group)
    }

    /// Ungroup single leftover tabs that previous runs grouped.
    ///
    /// A partition holding exactly one tab earns no group; when that tab is
    /// still grouped from an earlier run and the current plan does not claim
    /// it, the stale membership is removed here.
    ///
    /// Returns the number of tabs ungrouped.
    pub async fn cleanup_orphaned_singles(
        &self,
        partitions: &[DomainPartition],
        planned: &HashSet<TabId>,
        cache: &TabCache,
    ) -> Result<usize> {
        let mut orphaned = Vec::new();
        for partition in partitions {
            if partition.len() != 1 {
                continue;
            }
            let tab = &partition.tabs[0];
            if planned.contains(&tab.id) {
                continue;
            }
            if cache
                .get(&tab.id)
                .is_some_and(|fresh| fresh.group.is_some())
            {
                orphaned.push(tab.id);
            }
        }

        if orphaned.is_empty() {
            return Ok(0);
        }

        info!(count = orphaned.len(), "ungrouping orphaned single tabs");
        self.ungroup_batched("cleanup_singles", &orphaned).await?;
        Ok(orphaned.len())
    }

    // ------------------------------------------------------------------
    // Plan execution
    // ------------------------------------------------------------------

    /// Execute a full layout plan: ungroup, then moves, then groups.
    ///
    /// A pre-plan snapshot is captured first. Any failed step aborts the
    /// remaining steps, runs the advisory rollback against that snapshot,
    /// and surfaces the failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] for an internally inconsistent plan and
    /// [`Error::Plan`] when a step fails after retries.
    pub async fn execute_group_plan(&self, plan: &GroupPlan) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        if let Err(err) = plan.validate() {
            return Err(Error::Runtime(format!("refusing inconsistent plan: {err}")));
        }

        info!(
            fingerprint = %plan.fingerprint(),
            instructions = plan.instruction_count(),
            "executing group plan"
        );

        let snapshot = match with_retry(&self.config.retry, "plan_snapshot", || {
            self.host.list_all_tabs()
        })
        .await
        {
            Ok(tabs) => tabs,
            Err(source) => {
                return Err(PlanError::StepFailed {
                    stage: PlanStage::Snapshot,
                    source,
                }
                .into());
            }
        };

        if let Err(err) = self.run_plan_steps(plan).await {
            warn!(stage = %err.stage(), "plan step failed, attempting rollback");
            self.rollback(&snapshot).await;
            return Err(err.into());
        }

        debug!("group plan completed");
        Ok(())
    }

    async fn run_plan_steps(&self, plan: &GroupPlan) -> std::result::Result<(), PlanError> {
        if let Err(source) = self.ungroup_batched("plan_ungroup", &plan.ungroup).await {
            return Err(PlanError::StepFailed {
                stage: PlanStage::Ungroup,
                source,
            });
        }

        for instruction in &plan.moves {
            let target = MoveTarget::at(instruction.index);
            let moved = with_retry(&self.config.retry, "plan_move", || {
                self.host.move_tabs(&instruction.tabs, target)
            })
            .await;
            if let Err(source) = moved {
                return Err(PlanError::StepFailed {
                    stage: PlanStage::Move,
                    source,
                });
            }
        }

        for instruction in &plan.groups {
            let created = with_retry(&self.config.retry, "plan_group", || {
                self.host.add_tabs_to_group(None, &instruction.tabs)
            })
            .await;
            let group = match created {
                Ok(group) => group,
                Err(source) => {
                    return Err(PlanError::StepFailed {
                        stage: PlanStage::Group,
                        source,
                    });
                }
            };

            let appearance = GroupAppearance::labeled(instruction.title.clone());
            let labeled = with_retry(&self.config.retry, "plan_label", || {
                self.host.set_group_appearance(group, &appearance)
            })
            .await;
            if let Err(source) = labeled {
                return Err(PlanError::StepFailed {
                    stage: PlanStage::Group,
                    source,
                });
            }
        }

        Ok(())
    }

    /// Advisory rollback after a failed plan.
    ///
    /// Compares the pre-plan snapshot with live state and re-asserts the
    /// ungrouped status of tabs the aborted plan stranded outside their old
    /// groups. The host offers no transactions, so this reduces half-grouped
    /// leftovers without guaranteeing restoration. Failures are logged and
    /// swallowed.
    async fn rollback(&self, snapshot: &[Tab]) {
        let live = match with_retry(&self.config.retry, "rollback_fetch", || {
            self.host.list_all_tabs()
        })
        .await
        {
            Ok(tabs) => tabs,
            Err(err) => {
                warn!(%err, "rollback skipped, live state unavailable");
                return;
            }
        };

        let was_grouped: HashSet<TabId> = snapshot
            .iter()
            .filter(|tab| tab.group.is_some())
            .map(|tab| tab.id)
            .collect();
        let stranded: Vec<TabId> = live
            .iter()
            .filter(|tab| tab.group.is_none() && was_grouped.contains(&tab.id))
            .map(|tab| tab.id)
            .collect();

        if stranded.is_empty() {
            debug!("rollback found no stranded tabs");
            return;
        }

        warn!(
            count = stranded.len(),
            "rollback re-ungrouping tabs stranded outside their old groups"
        );
        if let Err(err) = self.ungroup_batched("rollback_ungroup", &stranded).await {
            warn!(%err, "rollback incomplete");
        }
    }

    // ------------------------------------------------------------------
    // Batched primitives
    // ------------------------------------------------------------------

    async fn close_batched(&self, label: &str, ids: &[TabId]) -> HostResult<()> {
        run_batched(
            &self.config.retry,
            &self.config.batch,
            label,
            ids,
            |chunk| async move { self.host.close_tabs(&chunk).await },
        )
        .await
    }

    async fn ungroup_batched(&self, label: &str, ids: &[TabId]) -> HostResult<()> {
        run_batched(
            &self.config.retry,
            &self.config.batch,
            label,
            ids,
            |chunk| async move { self.host.remove_from_group(&chunk).await },
        )
        .await
    }
}

/// Drop tabs whose domain carries a skip rule.
#[must_use]
pub fn filter_by_skip_rule(tabs: Vec<Tab>, rules: &RuleSet) -> Vec<Tab> {
    let before = tabs.len();
    let kept: Vec<Tab> = tabs
        .into_iter()
        .filter(|tab| !rules.skips(&tab.domain()))
        .collect();
    if kept.len() < before {
        debug!(skipped = before - kept.len(), "dropped tabs with skip rules");
    }
    kept
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::tab_cache;
    use crate::rules::DomainRule;
    use crate::session::{
        AppliedAction, FaultKind, FaultRule, HostOp, SessionGroup, SessionHost, SessionState,
        SessionTab, SessionWindow,
    };
    use crate::tabs::{TabId, WindowId};
    use std::time::Duration;

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                max_attempts: 3,
            },
            batch: BatchConfig {
                size: 10,
                pace: Duration::ZERO,
            },
        }
    }

    fn executor(host: &Arc<SessionHost>) -> TabExecutor {
        TabExecutor::with_config(Arc::clone(host) as Arc<dyn TabHost>, fast_config())
    }

    fn tab(id: u64, url: &str) -> SessionTab {
        SessionTab::new(TabId(id)).with_url(url)
    }

    #[tokio::test]
    async fn fetch_excludes_app_windows_and_internal_pages() {
        let state = SessionState::new()
            .with_window(
                SessionWindow::new(WindowId(1))
                    .focused()
                    .with_tab(tab(1, "https://example.com/a"))
                    .with_tab(tab(2, "chrome://settings")),
            )
            .with_window(
                SessionWindow::new(WindowId(2))
                    .with_kind(crate::tabs::WindowKind::App)
                    .with_tab(tab(3, "https://app.example.com/")),
            );
        let host = Arc::new(SessionHost::new(state));

        let tabs = executor(&host).fetch_processable_tabs().await;
        assert_eq!(tabs.len(), 1);
        assert_eq!(tabs[0].id, TabId(1));
    }

    #[tokio::test]
    async fn fetch_fails_open_to_empty() {
        let host = Arc::new(SessionHost::new(SessionState::new().with_window(
            SessionWindow::new(WindowId(1)).with_tab(tab(1, "https://example.com/")),
        )));
        host.queue_fault(FaultRule::times(HostOp::ListWindows, FaultKind::Transient, 3));

        let tabs = executor(&host).fetch_processable_tabs().await;
        assert!(tabs.is_empty());
        assert_eq!(host.counters().list_windows, 3, "retries were spent");
    }

    #[tokio::test]
    async fn dedup_keeps_first_occurrence_per_url() {
        let state = SessionState::new().with_window(
            SessionWindow::new(WindowId(1))
                .focused()
                .with_tab(tab(1, "https://example.com/page"))
                .with_tab(tab(2, "https://example.com/other"))
                .with_tab(tab(3, "https://example.com/page"))
                .with_tab(tab(4, "https://example.com/page"))
                .with_tab(SessionTab::new(TabId(5))),
        );
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);

        let tabs = executor.fetch_processable_tabs().await;
        let (survivors, closed) = executor.deduplicate_by_url(tabs).await.unwrap();

        assert_eq!(closed, 2);
        let ids: Vec<TabId> = survivors.iter().map(|tab| tab.id).collect();
        assert_eq!(ids, vec![TabId(1), TabId(2), TabId(5)]);
        assert_eq!(host.state_snapshot().tab_count(), 3);
    }

    #[tokio::test]
    async fn auto_delete_closes_only_matching_domains() {
        let state = SessionState::new().with_window(
            SessionWindow::new(WindowId(1))
                .focused()
                .with_tab(tab(1, "https://tracker.example/pixel"))
                .with_tab(tab(2, "https://news.example/story")),
        );
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);
        let rules =
            RuleSet::compile(&[DomainRule::for_domain("tracker.example").with_auto_delete(true)]);

        let tabs = executor.fetch_processable_tabs().await;
        let (survivors, deleted) = executor.apply_auto_delete(tabs, &rules).await.unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].id, TabId(2));
        assert!(host.state_snapshot().find_tab(TabId(1)).is_none());
    }

    #[tokio::test]
    async fn skip_rule_filters_without_host_calls() {
        let rules =
            RuleSet::compile(&[DomainRule::for_domain("example.com").with_skip_process(true)]);
        let tabs = vec![
            Tab::new(TabId(1), WindowId(1), 0).with_url("https://example.com/a"),
            Tab::new(TabId(2), WindowId(1), 1).with_url("https://docs.rs/tokio"),
        ];

        let kept = filter_by_skip_rule(tabs, &rules);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, TabId(2));
    }

    #[tokio::test]
    async fn merge_is_a_noop_with_one_window() {
        let state = SessionState::new().with_window(
            SessionWindow::new(WindowId(1))
                .focused()
                .with_tab(tab(1, "https://example.com/a")),
        );
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);

        let tabs = executor.fetch_processable_tabs().await;
        let moved = executor.merge_windows_to_active(&tabs).await.unwrap();

        assert_eq!(moved, 0);
        assert_eq!(host.counters().mutation_calls(), 0);
    }

    #[tokio::test]
    async fn merge_appends_outside_tabs_to_the_focused_window() {
        let state = SessionState::new()
            .with_window(
                SessionWindow::new(WindowId(1))
                    .focused()
                    .with_tab(tab(1, "https://example.com/a")),
            )
            .with_window(
                SessionWindow::new(WindowId(2))
                    .with_tab(tab(2, "https://docs.rs/tokio"))
                    .with_tab(tab(3, "https://docs.rs/serde")),
            );
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);

        let tabs = executor.fetch_processable_tabs().await;
        let moved = executor.merge_windows_to_active(&tabs).await.unwrap();

        assert_eq!(moved, 2);
        let after = host.state_snapshot();
        assert_eq!(after.windows[0].tabs.len(), 3);
        assert!(after.windows[1].tabs.is_empty());
    }

    #[tokio::test]
    async fn group_state_creates_and_labels_a_fresh_group() {
        let state = SessionState::new().with_window(
            SessionWindow::new(WindowId(1))
                .focused()
                .with_tab(tab(1, "https://example.com/a"))
                .with_tab(tab(2, "https://example.com/b")),
        );
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);

        let tabs = executor.fetch_processable_tabs().await;
        let cache = tab_cache(&tabs);
        let group_state = GroupState::new("example.com", vec![TabId(1), TabId(2)]);

        let group = executor
            .apply_group_state(&group_state, &cache)
            .await
            .unwrap();

        let after = host.state_snapshot();
        assert_eq!(after.groups.len(), 1);
        assert_eq!(after.groups[0].id, group.unwrap());
        assert_eq!(after.groups[0].title.as_deref(), Some("example.com"));
        assert!(after.groups[0].color.is_some());
        assert!(!after.groups[0].collapsed);
    }

    #[tokio::test]
    async fn converged_group_state_issues_zero_calls() {
        let state = SessionState::new()
            .with_window(
                SessionWindow::new(WindowId(1))
                    .focused()
                    .with_tab(tab(1, "https://example.com/a").in_group(GroupId(9)))
                    .with_tab(tab(2, "https://example.com/b").in_group(GroupId(9))),
            )
            .with_group(SessionGroup::new(GroupId(9), WindowId(1)).with_title("example.com"));
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);

        let tabs = executor.fetch_processable_tabs().await;
        let cache = tab_cache(&tabs);
        let group_state =
            GroupState::new("example.com", vec![TabId(1), TabId(2)]).with_current_group(GroupId(9));

        let before = host.counters().mutation_calls();
        let group = executor
            .apply_group_state(&group_state, &cache)
            .await
            .unwrap();

        assert_eq!(group, Some(GroupId(9)));
        assert_eq!(host.counters().mutation_calls(), before);
    }

    #[tokio::test]
    async fn dead_current_group_falls_back_to_a_fresh_group() {
        // Tabs still claim group 55, but the host lost that group.
        let state = SessionState::new().with_window(
            SessionWindow::new(WindowId(1))
                .focused()
                .with_tab(tab(1, "https://example.com/a").in_group(GroupId(55)))
                .with_tab(tab(2, "https://example.com/b")),
        );
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);

        let tabs = executor.fetch_processable_tabs().await;
        let cache = tab_cache(&tabs);
        let group_state = GroupState::new("example.com", vec![TabId(1), TabId(2)])
            .with_current_group(GroupId(55));

        let group = executor
            .apply_group_state(&group_state, &cache)
            .await
            .unwrap()
            .unwrap();

        assert_ne!(group, GroupId(55));
        let after = host.state_snapshot();
        assert_eq!(after.groups.len(), 1);
        assert_eq!(after.groups[0].title.as_deref(), Some("example.com"));
        assert_eq!(after.find_tab(TabId(1)).unwrap().group, Some(group));
        assert_eq!(after.find_tab(TabId(2)).unwrap().group, Some(group));
    }

    #[tokio::test]
    async fn foreign_members_are_stripped_before_joining() {
        let state = SessionState::new()
            .with_window(
                SessionWindow::new(WindowId(1))
                    .focused()
                    .with_tab(tab(1, "https://example.com/a").in_group(GroupId(9)))
                    .with_tab(tab(2, "https://example.com/b").in_group(GroupId(4))),
            )
            .with_group(SessionGroup::new(GroupId(9), WindowId(1)))
            .with_group(SessionGroup::new(GroupId(4), WindowId(1)).with_title("stale"));
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);

        let tabs = executor.fetch_processable_tabs().await;
        let cache = tab_cache(&tabs);
        let group_state =
            GroupState::new("example.com", vec![TabId(1), TabId(2)]).with_current_group(GroupId(9));

        executor
            .apply_group_state(&group_state, &cache)
            .await
            .unwrap();

        let after = host.state_snapshot();
        assert_eq!(after.find_tab(TabId(2)).unwrap().group, Some(GroupId(9)));
        assert!(
            !after.groups.iter().any(|group| group.id == GroupId(4)),
            "emptied foreign group is gone"
        );
        assert!(
            host.actions()
                .contains(&AppliedAction::Ungrouped(vec![TabId(2)])),
            "foreign member left its group first"
        );
    }

    #[tokio::test]
    async fn undersized_state_ungroups_grouped_members() {
        let state = SessionState::new()
            .with_window(SessionWindow::new(WindowId(1)).focused().with_tab(
                tab(1, "https://example.com/a").in_group(GroupId(9)),
            ))
            .with_group(SessionGroup::new(GroupId(9), WindowId(1)));
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);

        let tabs = executor.fetch_processable_tabs().await;
        let cache = tab_cache(&tabs);
        let group_state = GroupState::new("example.com", vec![TabId(1)]);

        let group = executor
            .apply_group_state(&group_state, &cache)
            .await
            .unwrap();

        assert!(group.is_none());
        let after = host.state_snapshot();
        assert!(after.find_tab(TabId(1)).unwrap().group.is_none());
        assert!(after.groups.is_empty());
    }

    #[tokio::test]
    async fn orphaned_single_is_ungrouped() {
        let state = SessionState::new()
            .with_window(
                SessionWindow::new(WindowId(1))
                    .focused()
                    .with_tab(tab(1, "https://lonely.com/only").in_group(GroupId(9)))
                    .with_tab(tab(2, "https://example.com/a"))
                    .with_tab(tab(3, "https://example.com/b")),
            )
            .with_group(SessionGroup::new(GroupId(9), WindowId(1)));
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);

        let tabs = executor.fetch_processable_tabs().await;
        let cache = tab_cache(&tabs);
        let partitions = crate::planner::partition_by_group_key(&tabs, &RuleSet::default());
        let planned: HashSet<TabId> = [TabId(2), TabId(3)].into_iter().collect();

        let ungrouped = executor
            .cleanup_orphaned_singles(&partitions, &planned, &cache)
            .await
            .unwrap();

        assert_eq!(ungrouped, 1);
        assert!(
            host.state_snapshot()
                .find_tab(TabId(1))
                .unwrap()
                .group
                .is_none()
        );
    }

    #[tokio::test]
    async fn plan_executes_stages_in_order() {
        let state = SessionState::new().with_window(
            SessionWindow::new(WindowId(1))
                .focused()
                .with_tab(tab(1, "https://zeta.com/a"))
                .with_tab(tab(2, "https://zeta.com/b"))
                .with_tab(tab(3, "https://alpha.com/a"))
                .with_tab(tab(4, "https://alpha.com/b")),
        );
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);

        let states = [
            GroupState::new("alpha.com", vec![TabId(3), TabId(4)]),
            GroupState::new("zeta.com", vec![TabId(1), TabId(2)]),
        ];
        let plan = GroupPlan::build(&states);
        executor.execute_group_plan(&plan).await.unwrap();

        let after = host.state_snapshot();
        let order: Vec<TabId> = after.windows[0].tabs.iter().map(|tab| tab.id).collect();
        assert_eq!(order, vec![TabId(3), TabId(4), TabId(1), TabId(2)]);
        assert_eq!(after.group_titles(), vec!["alpha.com", "zeta.com"]);

        // Snapshot fetch happens before any mutation; moves precede groups.
        let actions = host.actions();
        let first_move = actions
            .iter()
            .position(|action| matches!(action, AppliedAction::Moved { .. }));
        let first_group = actions
            .iter()
            .position(|action| matches!(action, AppliedAction::Grouped { .. }));
        assert!(first_move.unwrap() < first_group.unwrap());
    }

    #[tokio::test]
    async fn failed_plan_step_rolls_back_and_surfaces() {
        let state = SessionState::new()
            .with_window(
                SessionWindow::new(WindowId(1))
                    .focused()
                    .with_tab(tab(1, "https://example.com/a").in_group(GroupId(9)))
                    .with_tab(tab(2, "https://example.com/b").in_group(GroupId(9))),
            )
            .with_group(SessionGroup::new(GroupId(9), WindowId(1)).with_title("example.com"));
        let host = Arc::new(SessionHost::new(state));
        let executor = executor(&host);

        // Every move attempt fails, exhausting the 3 retry attempts.
        host.queue_fault(FaultRule::times(HostOp::MoveTabs, FaultKind::Transient, 3));

        let states = [GroupState::new("example.com", vec![TabId(1), TabId(2)])
            .with_current_group(GroupId(9))];
        let plan = GroupPlan::build(&states);
        let err = executor.execute_group_plan(&plan).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Plan(PlanError::StepFailed {
                stage: PlanStage::Move,
                ..
            })
        ));

        // The ungroup stage landed before the failure; rollback issued a
        // second ungroup call for the stranded tabs.
        assert_eq!(host.counters().remove_from_group, 2);
        assert!(
            host.actions()
                .iter()
                .any(|action| matches!(action, AppliedAction::Ungrouped(_)))
        );
        let after = host.state_snapshot();
        assert!(after.find_tab(TabId(1)).unwrap().group.is_none());
    }

    #[tokio::test]
    async fn inconsistent_plans_are_refused() {
        let host = Arc::new(SessionHost::new(SessionState::new()));
        let executor = executor(&host);

        let mut plan = GroupPlan::build(&[GroupState::new(
            "example.com",
            vec![TabId(1), TabId(2)],
        )]);
        plan.ungroup.clear();

        let err = executor.execute_group_plan(&plan).await.unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
        assert_eq!(host.counters().mutation_calls(), 0);
    }
}
