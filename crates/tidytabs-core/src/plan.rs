//! Group layout plan types.
//!
//! This module provides the types the planner hands to the executor:
//! - [`GroupState`]: the desired end state for one labeled group of tabs
//! - [`GroupPlan`]: the ordered instruction batch that realizes a set of
//!   states whose on-screen layout is wrong
//!
//! # Canonical Serialization
//!
//! Plans hash to a stable fingerprint (`sha256:` prefixed) so an execution
//! can be correlated across log lines. The fingerprint covers instruction
//! content only, with stable field ordering.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::tabs::{GroupId, TabId};

/// Current schema version for group plans.
pub const PLAN_SCHEMA_VERSION: u32 = 1;

/// Minimum members a partition needs before it earns a real group.
pub const MIN_GROUP_SIZE: usize = 2;

// ============================================================================
// Group State
// ============================================================================

/// Desired end state for one group of tabs.
///
/// `members` is sorted by URL ascending and every id has been revalidated
/// against a fresh tab snapshot by the time a state exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    /// Display name; doubles as the group title
    pub title: String,

    /// Member tab ids, sorted by URL ascending
    pub members: Vec<TabId>,

    /// Group the members currently sit in, if any
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_group: Option<GroupId>,

    /// Whether the group block starts at the wrong strip index
    #[serde(default)]
    pub needs_reposition: bool,
}

impl GroupState {
    /// Create a state with no known current group.
    #[must_use]
    pub fn new(title: impl Into<String>, members: Vec<TabId>) -> Self {
        Self {
            title: title.into(),
            members,
            current_group: None,
            needs_reposition: false,
        }
    }

    /// Set the current group.
    #[must_use]
    pub fn with_current_group(mut self, group: GroupId) -> Self {
        self.current_group = Some(group);
        self
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

// ============================================================================
// Plan Instructions
// ============================================================================

/// Move a block of tabs to a strip index, preserving their order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveInstruction {
    pub tabs: Vec<TabId>,
    pub index: u32,
}

/// Create a fresh group over a block of tabs and label it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInstruction {
    pub tabs: Vec<TabId>,
    pub title: String,
}

/// Full layout rebuild for a set of group states.
///
/// Execution order is fixed: ungroup everything first so the strip is flat,
/// then the moves in plan order, then the group creations. Mixing the phases
/// would make every move index wrong.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupPlan {
    /// Every member of every state, ungrouped up front
    pub ungroup: Vec<TabId>,

    /// One move per state, at accumulated start indices
    pub moves: Vec<MoveInstruction>,

    /// Group creations, only for states of at least [`MIN_GROUP_SIZE`]
    pub groups: Vec<GroupInstruction>,
}

impl GroupPlan {
    /// Build a plan from states already ordered by title.
    ///
    /// Target indices accumulate across all states, so undersized states
    /// still reserve their slots; they just never get a group instruction.
    #[must_use]
    pub fn build(states: &[GroupState]) -> Self {
        let mut plan = Self::default();
        let mut next_index = 0u32;

        for state in states {
            if state.members.is_empty() {
                continue;
            }

            plan.ungroup.extend(state.members.iter().copied());
            plan.moves.push(MoveInstruction {
                tabs: state.members.clone(),
                index: next_index,
            });
            if state.members.len() >= MIN_GROUP_SIZE {
                plan.groups.push(GroupInstruction {
                    tabs: state.members.clone(),
                    title: state.title.clone(),
                });
            }
            next_index += state.members.len() as u32;
        }

        plan
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ungroup.is_empty() && self.moves.is_empty() && self.groups.is_empty()
    }

    /// Number of host instructions this plan will issue.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        usize::from(!self.ungroup.is_empty()) + self.moves.len() + self.groups.len()
    }

    /// Compute the canonical fingerprint for this plan.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_string().as_bytes());
        let hash = hex::encode(hasher.finalize());
        format!("sha256:{}", &hash[..32])
    }

    /// Generate the canonical string representation for hashing.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        let mut parts = Vec::new();

        parts.push(format!("v={PLAN_SCHEMA_VERSION}"));
        parts.push(format!("ungroup=[{}]", ids_csv(&self.ungroup)));

        for (i, instruction) in self.moves.iter().enumerate() {
            parts.push(format!(
                "move[{}]=[{}]@{}",
                i,
                ids_csv(&instruction.tabs),
                instruction.index
            ));
        }

        for (i, instruction) in self.groups.iter().enumerate() {
            parts.push(format!(
                "group[{}]={}:[{}]",
                i,
                instruction.title,
                ids_csv(&instruction.tabs)
            ));
        }

        parts.join("|")
    }

    /// Validate the plan for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A moved or grouped tab is missing from the ungroup list
    /// - A tab appears in more than one move instruction
    /// - A group instruction has fewer than [`MIN_GROUP_SIZE`] tabs
    pub fn validate(&self) -> Result<(), PlanConsistencyError> {
        let ungrouped: std::collections::HashSet<TabId> = self.ungroup.iter().copied().collect();

        let mut moved = std::collections::HashSet::new();
        for instruction in &self.moves {
            for tab in &instruction.tabs {
                if !ungrouped.contains(tab) {
                    return Err(PlanConsistencyError::UngroupMissingTab(*tab));
                }
                if !moved.insert(*tab) {
                    return Err(PlanConsistencyError::DuplicateMove(*tab));
                }
            }
        }

        for instruction in &self.groups {
            if instruction.tabs.len() < MIN_GROUP_SIZE {
                return Err(PlanConsistencyError::UndersizedGroup {
                    title: instruction.title.clone(),
                    members: instruction.tabs.len(),
                });
            }
            for tab in &instruction.tabs {
                if !ungrouped.contains(tab) {
                    return Err(PlanConsistencyError::UngroupMissingTab(*tab));
                }
            }
        }

        Ok(())
    }
}

fn ids_csv(ids: &[TabId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Validation Errors
// ============================================================================

/// Errors that can occur during plan validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanConsistencyError {
    /// A moved or grouped tab is not covered by the ungroup list
    UngroupMissingTab(TabId),

    /// A tab appears in more than one move instruction
    DuplicateMove(TabId),

    /// A group instruction carries too few tabs
    UndersizedGroup { title: String, members: usize },
}

impl fmt::Display for PlanConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UngroupMissingTab(tab) => {
                write!(f, "Tab {tab} is moved or grouped but never ungrouped")
            }
            Self::DuplicateMove(tab) => {
                write!(f, "Tab {tab} appears in more than one move instruction")
            }
            Self::UndersizedGroup { title, members } => {
                write!(
                    f,
                    "Group {title:?} has {members} member(s), need at least {MIN_GROUP_SIZE}"
                )
            }
        }
    }
}

impl std::error::Error for PlanConsistencyError {}

// ============================================================================
// Tests
// ============================================================================
