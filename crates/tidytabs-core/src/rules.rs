//! Per-domain reconciliation rules
//!
//! A rule attaches behavior to one lowercased domain: skip its tabs entirely,
//! close them on sight, or override the label their group clusters under.
//! Rules arrive from settings as loosely validated user input, so compilation
//! into a [`RuleSet`] drops anything malformed rather than failing the run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RuleError;

/// User-defined rule for a single domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainRule {
    /// Domain this rule applies to, matched case-insensitively
    pub domain: String,
    /// Exclude this domain's tabs from dedup and grouping
    pub skip_process: bool,
    /// Close this domain's tabs during cleanup
    pub auto_delete: bool,
    /// Group label override; empty or missing keeps the domain name
    pub group_name: Option<String>,
}

impl DomainRule {
    #[must_use]
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Set the skip flag
    #[must_use]
    pub fn with_skip_process(mut self, skip: bool) -> Self {
        self.skip_process = skip;
        self
    }

    /// Set the auto-delete flag
    #[must_use]
    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// Set the group label override
    #[must_use]
    pub fn with_group_name(mut self, name: impl Into<String>) -> Self {
        self.group_name = Some(name.into());
        self
    }

    /// Validate and canonicalize the rule.
    ///
    /// The domain is trimmed and lowercased so lookups line up with
    /// [`crate::tabs::domain_of`] output. A `group_name` that trims to empty
    /// is treated as absent, not as an empty label.
    pub fn normalized(&self) -> Result<Self, RuleError> {
        let domain = self.domain.trim().to_ascii_lowercase();
        if domain.is_empty() {
            return Err(RuleError::EmptyDomain);
        }
        if domain.contains(char::is_whitespace) {
            return Err(RuleError::InvalidDomain {
                domain,
                reason: "contains whitespace".to_string(),
            });
        }
        if domain.contains("://") {
            return Err(RuleError::InvalidDomain {
                domain,
                reason: "looks like a URL, expected a bare hostname".to_string(),
            });
        }

        let group_name = self
            .group_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned);

        Ok(Self {
            domain,
            skip_process: self.skip_process,
            auto_delete: self.auto_delete,
            group_name,
        })
    }
}

/// Compiled rule lookup keyed by normalized domain
///
/// Later definitions win when the same domain appears twice.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    by_domain: HashMap<String, DomainRule>,
}

impl RuleSet {
    /// Compile raw rules, dropping invalid ones with a warning.
    #[must_use]
    pub fn compile(rules: &[DomainRule]) -> Self {
        let mut by_domain = HashMap::new();
        for rule in rules {
            match rule.normalized() {
                Ok(normalized) => {
                    let domain = normalized.domain.clone();
                    if by_domain.insert(domain, normalized).is_some() {
                        debug!(
                            domain = %rule.domain,
                            "duplicate rule domain, keeping the later definition"
                        );
                    }
                }
                Err(err) => {
                    warn!(domain = %rule.domain, %err, "dropping invalid rule");
                }
            }
        }
        Self { by_domain }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_domain.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }

    /// Rule for a normalized domain, if one exists.
    #[must_use]
    pub fn rule_for(&self, domain: &str) -> Option<&DomainRule> {
        self.by_domain.get(domain)
    }

    /// Whether tabs on this domain are excluded from reconciliation.
    #[must_use]
    pub fn skips(&self, domain: &str) -> bool {
        self.rule_for(domain).is_some_and(|rule| rule.skip_process)
    }

    /// Whether tabs on this domain are closed during cleanup.
    #[must_use]
    pub fn auto_deletes(&self, domain: &str) -> bool {
        self.rule_for(domain).is_some_and(|rule| rule.auto_delete)
    }

    /// Display name tabs on this domain cluster under: the rule's group label
    /// when set, otherwise the domain itself.
    #[must_use]
    pub fn group_key(&self, domain: &str) -> String {
        self.rule_for(domain)
            .and_then(|rule| rule.group_name.clone())
            .unwrap_or_else(|| domain.to_owned())
    }
}
