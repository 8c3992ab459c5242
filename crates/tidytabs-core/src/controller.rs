//! Orchestration controller.
//!
//! [`Controller`] owns the single-flight reconciliation run: it reads
//! settings, sequences the cleanup phases, runs the grouping pass per scope,
//! and keeps the duplicate-count indicator fresh. One run at a time; the
//! Idle/Running flag is the only concurrency control, and it is cleared on
//! every exit path so a failed run never wedges the next trigger.
//!
//! Construction doubles as the composition root: hand it the host, the
//! settings store, and the indicator once at startup, then wire host events
//! through [`Controller::attach`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{DEFAULT_DEBOUNCE_MS, Debouncer, EventBus, TabEvent};
use crate::executor::{ExecutorConfig, TabExecutor, filter_by_skip_rule};
use crate::host::{Indicator, TabHost};
use crate::plan::GroupPlan;
use crate::planner::{
    build_group_states, calculate_reposition_needs, count_duplicates, partition_by_group_key,
    tab_cache, tab_index_map,
};
use crate::rules::RuleSet;
use crate::settings::SettingsStore;
use crate::tabs::{Tab, TabId, WindowId};

/// Controller knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Retry and batching configuration handed to the executor.
    pub executor: ExecutorConfig,
    /// Quiet window for coalescing indicator refreshes.
    pub debounce_window: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            debounce_window: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        }
    }
}

/// What a trigger call produced.
#[derive(Debug)]
pub enum RunOutcome {
    /// The run executed to completion, possibly as a no-op.
    Completed(RunReport),
    /// Another run held the flag; this trigger was dropped.
    AlreadyRunning,
}

/// Summary of one reconciliation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: u64,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub tabs_seen: usize,
    pub tabs_processable: usize,
    pub merged_tabs: usize,
    pub duplicates_closed: usize,
    pub auto_deleted: usize,
    pub partitions: usize,
    pub states_applied: usize,
    pub state_failures: usize,
    pub singles_ungrouped: usize,
    pub plans_executed: usize,
    pub duplicate_count: usize,
}

/// Clears the running flag on every exit path, error or not.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Single-flight reconciliation driver.
pub struct Controller {
    executor: TabExecutor,
    settings: Arc<dyn SettingsStore>,
    indicator: Arc<dyn Indicator>,
    running: AtomicBool,
    run_seq: AtomicU64,
    config: ControllerConfig,
}

impl Controller {
    #[must_use]
    pub fn new(
        host: Arc<dyn TabHost>,
        settings: Arc<dyn SettingsStore>,
        indicator: Arc<dyn Indicator>,
    ) -> Self {
        Self::with_config(host, settings, indicator, ControllerConfig::default())
    }

    #[must_use]
    pub fn with_config(
        host: Arc<dyn TabHost>,
        settings: Arc<dyn SettingsStore>,
        indicator: Arc<dyn Indicator>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            executor: TabExecutor::with_config(host, config.executor.clone()),
            settings,
            indicator,
            running: AtomicBool::new(false),
            run_seq: AtomicU64::new(0),
            config,
        }
    }

    /// Whether a run currently holds the flag.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the full reconciliation pipeline once.
    ///
    /// Returns [`RunOutcome::AlreadyRunning`] without touching the host when
    /// a run is already in flight. Pipeline failures are logged here and
    /// propagated; the running flag is cleared either way.
    pub async fn execute(&self) -> Result<RunOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("run already in flight, dropping trigger");
            return Ok(RunOutcome::AlreadyRunning);
        }
        let _guard = FlagGuard(&self.running);

        let run_id = self.run_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at_ms = epoch_ms();
        let started = std::time::Instant::now();
        info!(run_id, "reconciliation run started");

        match self.run_pipeline().await {
            Ok(mut report) => {
                report.run_id = run_id;
                report.started_at_ms = started_at_ms;
                report.finished_at_ms = epoch_ms();
                info!(
                    run_id,
                    tabs = report.tabs_processable,
                    duplicates_closed = report.duplicates_closed,
                    states_applied = report.states_applied,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "reconciliation run finished"
                );
                Ok(RunOutcome::Completed(report))
            }
            Err(err) => {
                warn!(run_id, %err, "reconciliation run failed");
                Err(err)
            }
        }
    }

    async fn run_pipeline(&self) -> Result<RunReport> {
        let mut report = RunReport::default();

        let settings = self.settings.state().await?;
        let rules = RuleSet::compile(&settings.rules);
        let by_window = settings.grouping.by_window;

        let fetched = self.executor.fetch_processable_tabs().await;
        report.tabs_seen = fetched.len();
        let mut tabs = filter_by_skip_rule(fetched, &rules);
        report.tabs_processable = tabs.len();

        if !by_window {
            report.merged_tabs = self.executor.merge_windows_to_active(&tabs).await?;
            if report.merged_tabs > 0 {
                // Window ids and indices changed under us; restart from a
                // fresh snapshot.
                tabs = filter_by_skip_rule(self.executor.fetch_processable_tabs().await, &rules);
            }
        }

        let (tabs, duplicates_closed) = self.executor.deduplicate_by_url(tabs).await?;
        report.duplicates_closed = duplicates_closed;

        let (tabs, auto_deleted) = self.executor.apply_auto_delete(tabs, &rules).await?;
        report.auto_deleted = auto_deleted;

        if by_window {
            let mut windows: Vec<WindowId> = Vec::new();
            for tab in &tabs {
                if !windows.contains(&tab.window) {
                    windows.push(tab.window);
                }
            }
            for window in windows {
                let scoped: Vec<Tab> = tabs
                    .iter()
                    .filter(|tab| tab.window == window)
                    .cloned()
                    .collect();
                self.process_grouping(&scoped, &rules, Some(window), &mut report)
                    .await?;
            }
        } else {
            self.process_grouping(&tabs, &rules, None, &mut report)
                .await?;
        }

        report.duplicate_count = self.refresh_indicator().await?;
        Ok(report)
    }

    /// One grouping pass over a set of surviving tabs.
    ///
    /// Group states are applied independently; a failing state is logged
    /// and its siblings continue. The layout plan at the end only runs when
    /// at least one state sits at the wrong index.
    async fn process_grouping(
        &self,
        survivors: &[Tab],
        rules: &RuleSet,
        scope: Option<WindowId>,
        report: &mut RunReport,
    ) -> Result<()> {
        let partitions = partition_by_group_key(survivors, rules);
        report.partitions += partitions.len();
        if partitions.is_empty() {
            return Ok(());
        }

        // Earlier phases closed and moved tabs; revalidate against a fresh
        // snapshot.
        let cache = tab_cache(&self.scoped_tabs(scope).await);
        let states = build_group_states(&partitions, &cache);

        let mut planned: HashSet<TabId> = HashSet::new();
        for state in &states {
            planned.extend(state.members.iter().copied());
        }

        for state in &states {
            match self.executor.apply_group_state(state, &cache).await {
                Ok(_) => report.states_applied += 1,
                Err(err) => {
                    report.state_failures += 1;
                    warn!(
                        window = ?scope,
                        title = %state.title,
                        %err,
                        "group state failed, continuing with siblings"
                    );
                }
            }
        }

        match self
            .executor
            .cleanup_orphaned_singles(&partitions, &planned, &cache)
            .await
        {
            Ok(count) => report.singles_ungrouped += count,
            Err(err) => {
                warn!(window = ?scope, %err, "singles cleanup failed, continuing");
            }
        }

        // Grouping just rearranged the strip; reposition math needs live
        // indices.
        let live = self.scoped_tabs(scope).await;
        let annotated = calculate_reposition_needs(states, &tab_index_map(&live));

        if annotated.iter().any(|state| state.needs_reposition) {
            let plan = GroupPlan::build(&annotated);
            self.executor.execute_group_plan(&plan).await?;
            report.plans_executed += 1;
        } else {
            debug!(window = ?scope, "layout already correct, skipping plan");
        }

        Ok(())
    }

    async fn scoped_tabs(&self, scope: Option<WindowId>) -> Vec<Tab> {
        let tabs = self.executor.fetch_processable_tabs().await;
        match scope {
            Some(window) => tabs.into_iter().filter(|tab| tab.window == window).collect(),
            None => tabs,
        }
    }

    /// Recount duplicates over the live non-excluded tabs and update the
    /// indicator.
    ///
    /// Runs standalone on debounced lifecycle events; read-only against the
    /// host, so it may interleave with a reconciliation run.
    pub async fn refresh_indicator(&self) -> Result<usize> {
        let settings = self.settings.state().await?;
        let rules = RuleSet::compile(&settings.rules);
        let tabs = filter_by_skip_rule(self.executor.fetch_processable_tabs().await, &rules);

        let count = count_duplicates(&tabs);
        if count > 0 {
            self.indicator.set_count(count);
        } else {
            self.indicator.clear();
        }
        debug!(count, "indicator refreshed");
        Ok(count)
    }

    /// Subscribe to a bus and react to its events until it closes.
    ///
    /// Lifecycle events poke the debounced indicator refresh; an explicit
    /// run request spawns [`Controller::execute`]. The returned handle joins
    /// when the bus is dropped.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        let controller = Arc::clone(self);

        let refresher = Arc::clone(self);
        let (debouncer, _worker) = Debouncer::spawn(self.config.debounce_window, move || {
            let controller = Arc::clone(&refresher);
            async move {
                if let Err(err) = controller.refresh_indicator().await {
                    warn!(%err, "indicator refresh failed");
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TabEvent::RunRequested) => {
                        let runner = Arc::clone(&controller);
                        tokio::spawn(async move {
                            if let Err(err) = runner.execute().await {
                                warn!(%err, "triggered run failed");
                            }
                        });
                    }
                    Ok(event) if event.is_lifecycle() => debouncer.poke(),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event subscriber lagged, refreshing indicator");
                        debouncer.poke();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("event loop ended");
        })
    }
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
