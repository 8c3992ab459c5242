//! Error types for tidytabs-core

use thiserror::Error;

use crate::tabs::{GroupId, TabId, WindowId};

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for calls against the tab host surface
pub type HostResult<T> = std::result::Result<T, HostError>;

/// Main error type for tidytabs-core
#[derive(Error, Debug)]
pub enum Error {
    /// Tab host errors
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// Rule definition errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Settings errors
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Plan execution errors
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (channel failures, task join failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Errors reported by the tab host surface.
///
/// Transient variants describe conditions that tend to clear on their own
/// (a busy or briefly unresponsive host); structural variants describe state
/// that retrying cannot repair, such as a group id that no longer exists.
#[derive(Error, Debug)]
pub enum HostError {
    /// Host is not reachable at all
    #[error("Tab host unavailable: {0}")]
    Unavailable(String),

    /// A call did not complete in time
    #[error("Host call timed out after {0} ms")]
    Timeout(u64),

    /// A call reached the host but failed
    #[error("Host call failed: {0}")]
    CallFailed(String),

    /// Referenced tab does not exist
    #[error("Tab not found: {0}")]
    TabNotFound(TabId),

    /// Referenced group does not exist
    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),

    /// Referenced window does not exist
    #[error("Window not found: {0}")]
    WindowNotFound(WindowId),

    /// No window is focused or eligible to receive merged tabs
    #[error("No active window")]
    NoActiveWindow,
}

impl HostError {
    /// Whether a retry with the same arguments has a chance of succeeding.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::CallFailed(_)
        )
    }
}

/// Rule definition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// Rule has an empty domain after trimming
    #[error("Rule domain is empty")]
    EmptyDomain,

    /// Rule domain contains characters that can never match a hostname
    #[error("Invalid rule domain {domain:?}: {reason}")]
    InvalidDomain { domain: String, reason: String },
}

/// Settings errors
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Settings file could not be read
    #[error("Failed to read settings file {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Settings file could not be parsed
    #[error("Failed to parse settings file {path}: {reason}")]
    ParseFailed { path: String, reason: String },

    /// Settings store rejected an update
    #[error("Settings store error: {0}")]
    Store(String),
}

/// Stage of group plan execution, used to report where a plan failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStage {
    Snapshot,
    Ungroup,
    Move,
    Group,
}

impl std::fmt::Display for PlanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Snapshot => "snapshot",
            Self::Ungroup => "ungroup",
            Self::Move => "move",
            Self::Group => "group",
        };
        write!(f, "{label}")
    }
}

/// Plan execution errors
#[derive(Error, Debug)]
pub enum PlanError {
    /// A plan step failed after retries were exhausted
    #[error("Plan aborted at {stage} step: {source}")]
    StepFailed {
        stage: PlanStage,
        #[source]
        source: HostError,
    },
}

impl PlanError {
    /// Stage at which the plan stopped.
    #[must_use]
    pub fn stage(&self) -> PlanStage {
        match self {
            Self::StepFailed { stage, .. } => *stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_covers_all_host_variants() {
        let transient = [
            HostError::Unavailable("socket gone".to_string()),
            HostError::Timeout(2_000),
            HostError::CallFailed("busy".to_string()),
        ];
        for err in transient {
            assert!(err.is_transient(), "expected transient: {err}");
        }

        let structural = [
            HostError::TabNotFound(TabId(7)),
            HostError::GroupNotFound(GroupId(55)),
            HostError::WindowNotFound(WindowId(3)),
            HostError::NoActiveWindow,
        ];
        for err in structural {
            assert!(!err.is_transient(), "expected structural: {err}");
        }
    }

    #[test]
    fn plan_error_reports_stage() {
        let err = PlanError::StepFailed {
            stage: PlanStage::Move,
            source: HostError::Timeout(500),
        };
        assert_eq!(err.stage(), PlanStage::Move);
        assert!(err.to_string().contains("move"));
    }

    #[test]
    fn host_error_converts_into_crate_error() {
        let err: Error = HostError::NoActiveWindow.into();
        assert!(matches!(err, Error::Host(HostError::NoActiveWindow)));
    }
}
