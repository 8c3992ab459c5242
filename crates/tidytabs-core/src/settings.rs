//! Settings model and store
//!
//! Handles loading and validation of tidytabs.toml settings files and
//! exposes them to the engine behind the [`SettingsStore`] trait.
//!
//! # Forward Compatibility
//!
//! All sections use `#[serde(default)]` to allow missing fields.
//! Unknown fields are ignored to support forward compatibility.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tracing::debug;

use crate::Result;
use crate::error::SettingsError;
use crate::rules::DomainRule;

/// Complete settings state as stored in tidytabs.toml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsState {
    /// Per-domain rules
    pub rules: Vec<DomainRule>,

    /// Grouping behavior
    pub grouping: GroupingConfig,
}

/// Grouping behavior settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    /// Group tabs per window instead of merging every window into the
    /// focused one first
    pub by_window: bool,
}

impl SettingsState {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|err| match err {
            SettingsError::ParseFailed { reason, .. } => SettingsError::ParseFailed {
                path: path.display().to_string(),
                reason,
            }
            .into(),
            other => other.into(),
        })
    }

    /// Load settings from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "settings file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Parse settings from a TOML string.
    pub fn from_toml(content: &str) -> std::result::Result<Self, SettingsError> {
        toml::from_str(content).map_err(|err| SettingsError::ParseFailed {
            path: "<inline>".to_string(),
            reason: err.to_string(),
        })
    }

    /// Serialize settings to a TOML string.
    pub fn to_toml(&self) -> std::result::Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(|err| SettingsError::Store(err.to_string()))
    }
}

/// Partial settings update; `None` fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub rules: Option<Vec<DomainRule>>,
    pub grouping: Option<GroupingConfig>,
}

/// Read and update surface for settings
///
/// `subscribe` hands out a revision watch; the revision bumps on every
/// applied patch so listeners can reload without polling the full state.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Current settings state.
    async fn state(&self) -> Result<SettingsState>;

    /// Apply a partial update.
    async fn apply(&self, patch: SettingsPatch) -> Result<()>;

    /// Revision watch; the value increments on each applied patch.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// In-memory settings store
pub struct MemorySettingsStore {
    state: RwLock<SettingsState>,
    revision: watch::Sender<u64>,
}

impl MemorySettingsStore {
    #[must_use]
    pub fn new(state: SettingsState) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: RwLock::new(state),
            revision,
        }
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new(SettingsState::default())
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn state(&self) -> Result<SettingsState> {
        Ok(self.state.read().await.clone())
    }

    async fn apply(&self, patch: SettingsPatch) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(rules) = patch.rules {
            state.rules = rules;
        }
        if let Some(grouping) = patch.grouping {
            state.grouping = grouping;
        }
        drop(state);

        self.revision.send_modify(|revision| *revision += 1);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
