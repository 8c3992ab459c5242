//! Pure planning for tab reconciliation.
//!
//! Deterministic, I/O-free decisions over tab snapshots:
//! - Partition tabs by group key (rule override or domain)
//! - Count duplicate URLs for the indicator
//! - Revalidate partition members against a fresh snapshot
//! - Build [`GroupState`]s and decide which groups need repositioning
//!
//! The executor applies whatever this module decides; nothing here awaits a
//! host call or observes live browser state beyond the caches passed in.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::plan::{GroupState, MIN_GROUP_SIZE};
use crate::rules::RuleSet;
use crate::tabs::{Tab, TabId};

/// Fresh tab snapshot keyed by id.
///
/// Planning decisions taken from an older snapshot are revalidated against
/// one of these, so tabs that navigated or closed mid-run fall out instead
/// of being grouped under a stale domain.
pub type TabCache = HashMap<TabId, Tab>;

/// Build a [`TabCache`] from a fetched tab list.
#[must_use]
pub fn tab_cache(tabs: &[Tab]) -> TabCache {
    tabs.iter().map(|tab| (tab.id, tab.clone())).collect()
}

/// Map each tab id to its current strip index.
#[must_use]
pub fn tab_index_map(tabs: &[Tab]) -> HashMap<TabId, u32> {
    tabs.iter().map(|tab| (tab.id, tab.index)).collect()
}

// ============================================================================
// Partitioning
// ============================================================================

/// One clustering bucket: a group key with its member tabs and the distinct
/// domains folded into it.
#[derive(Debug, Clone)]
pub struct DomainPartition {
    /// Clustering key, which doubles as the group display name
    pub key: String,
    /// Member tabs in input order
    pub tabs: Vec<Tab>,
    /// Every domain that mapped to this key
    pub domains: BTreeSet<String>,
}

impl DomainPartition {
    fn new(key: String) -> Self {
        Self {
            key,
            tabs: Vec::new(),
            domains: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }
}

/// Fold tabs into partitions keyed by group key.
///
/// Key order follows first encounter in the input, and members keep their
/// input order within a partition, so repeated runs over an unchanged strip
/// partition identically. A rule's group label can pull several domains into
/// one partition; `domains` records which ones.
#[must_use]
pub fn partition_by_group_key(tabs: &[Tab], rules: &RuleSet) -> Vec<DomainPartition> {
    let mut partitions: Vec<DomainPartition> = Vec::new();
    let mut slot_by_key: HashMap<String, usize> = HashMap::new();

    for tab in tabs {
        let domain = tab.domain();
        let key = rules.group_key(&domain);
        let slot = match slot_by_key.get(&key) {
            Some(&slot) => slot,
            None => {
                slot_by_key.insert(key.clone(), partitions.len());
                partitions.push(DomainPartition::new(key));
                partitions.len() - 1
            }
        };
        partitions[slot].tabs.push(tab.clone());
        partitions[slot].domains.insert(domain);
    }

    partitions
}

/// Count tabs whose URL was already seen on the same domain.
///
/// Feeds the duplicate-count indicator only; dedup itself happens in the
/// executor. Tabs without a URL never count as duplicates of each other.
#[must_use]
pub fn count_duplicates(tabs: &[Tab]) -> usize {
    let mut seen: HashSet<(String, &str)> = HashSet::new();
    let mut duplicates = 0;

    for tab in tabs {
        let Some(url) = tab.url.as_deref() else {
            continue;
        };
        if !seen.insert((tab.domain(), url)) {
            duplicates += 1;
        }
    }

    duplicates
}

// ============================================================================
// Revalidation
// ============================================================================

/// Re-resolve tabs against a fresh cache, keeping only those whose current
/// domain still belongs to the partition.
///
/// Returns the cache's copy of each survivor rather than the stale input tab,
/// so downstream planning sees live `group` and `index` fields. Tabs missing
/// from the cache (closed mid-run) are dropped.
#[must_use]
pub fn filter_valid_members(
    tabs: &[Tab],
    allowed_domains: &BTreeSet<String>,
    cache: &TabCache,
) -> Vec<Tab> {
    tabs.iter()
        .filter_map(|tab| cache.get(&tab.id))
        .filter(|fresh| allowed_domains.contains(&fresh.domain()))
        .cloned()
        .collect()
}

// ============================================================================
// Group States
// ============================================================================

/// Build one [`GroupState`] per qualifying partition.
///
/// A partition qualifies with at least [`MIN_GROUP_SIZE`] members surviving
/// revalidation. Survivors are sorted ascending by URL, and the first grouped
/// survivor donates its group id as the state's current group. Reposition
/// flags stay `false` here; [`calculate_reposition_needs`] fills them in
/// against live indices.
#[must_use]
pub fn build_group_states(partitions: &[DomainPartition], cache: &TabCache) -> Vec<GroupState> {
    let mut states = Vec::new();

    for partition in partitions {
        if partition.len() < MIN_GROUP_SIZE {
            continue;
        }

        let mut members = filter_valid_members(&partition.tabs, &partition.domains, cache);
        if members.len() < MIN_GROUP_SIZE {
            debug!(
                key = %partition.key,
                raw = partition.len(),
                valid = members.len(),
                "partition dropped below minimum size after revalidation"
            );
            continue;
        }

        members.sort_by(|a, b| a.url_key().cmp(b.url_key()));
        let current_group = members.iter().find_map(|member| member.group);

        let mut state = GroupState::new(
            partition.key.clone(),
            members.iter().map(|member| member.id).collect(),
        );
        if let Some(group) = current_group {
            state = state.with_current_group(group);
        }
        states.push(state);
    }

    states
}

// ============================================================================
// Repositioning
// ============================================================================

/// Sort states by title and flag those whose members start at the wrong
/// strip index.
///
/// The target layout packs group blocks at the front of the strip in title
/// order, so each state's expected start index is the member count of every
/// state before it. A state's current start is the minimum live index among
/// its members; members absent from the index map are ignored, and a state
/// with no resolvable member is assumed to be in place.
#[must_use]
pub fn calculate_reposition_needs(
    mut states: Vec<GroupState>,
    indices: &HashMap<TabId, u32>,
) -> Vec<GroupState> {
    states.sort_by(|a, b| a.title.cmp(&b.title));

    let mut expected = 0u32;
    for state in &mut states {
        let current = state
            .members
            .iter()
            .filter_map(|id| indices.get(id))
            .min()
            .copied()
            .unwrap_or(expected);
        state.needs_reposition = current != expected;
        if state.needs_reposition {
            debug!(
                title = %state.title,
                current,
                expected,
                "group block starts at the wrong index"
            );
        }
        expected += state.members.len() as u32;
    }

    states
}

// ============================================================================
// Tests
// ============================================================================
