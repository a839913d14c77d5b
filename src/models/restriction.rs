use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque platform token for a single application. Only ever compared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationToken(String);

/// Opaque platform token for an application category. Only ever compared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryToken(String);

impl ApplicationToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl CategoryToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for CategoryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The applications and categories the user wants blocked.
///
/// Stored as one record in the shared store and always replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictionSet {
    #[serde(rename = "apps")]
    pub applications: BTreeSet<ApplicationToken>,
    pub categories: BTreeSet<CategoryToken>,
}

impl RestrictionSet {
    pub fn new(
        applications: impl IntoIterator<Item = ApplicationToken>,
        categories: impl IntoIterator<Item = CategoryToken>,
    ) -> Self {
        Self {
            applications: applications.into_iter().collect(),
            categories: categories.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty() && self.categories.is_empty()
    }
}

/// Whether the user has ever made a selection, derived from the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionState {
    /// No record has ever been written (or it is unreadable).
    NeverPicked,
    /// The user confirmed an empty selection.
    Empty,
    Picked,
}

impl SelectionState {
    pub fn has_picked(self) -> bool {
        !matches!(self, SelectionState::NeverPicked)
    }
}

/// What the shield should look like right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "restrictions")]
pub enum EnforcementState {
    Shielded(RestrictionSet),
    Unshielded,
}

/// Derive the enforcement state from the stored set and the persisted unlock end.
///
/// An unlock window is active while `now < end`. An empty set never shields.
pub fn enforcement_state(
    set: &RestrictionSet,
    unlock_ends_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> EnforcementState {
    let window_active = unlock_ends_at.map(|end| now < end).unwrap_or(false);
    if window_active || set.is_empty() {
        EnforcementState::Unshielded
    } else {
        EnforcementState::Shielded(set.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> RestrictionSet {
        RestrictionSet::new(
            [ApplicationToken::new("app.a"), ApplicationToken::new("app.b")],
            [CategoryToken::new("social")],
        )
    }

    #[test]
    fn serializes_with_stored_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["apps"][0], "app.a");
        assert_eq!(json["categories"][0], "social");
    }

    #[test]
    fn duplicate_tokens_collapse() {
        let set = RestrictionSet::new(
            [ApplicationToken::new("x"), ApplicationToken::new("x")],
            [],
        );
        assert_eq!(set.applications.len(), 1);
        assert!(!set.is_empty());
    }

    #[test]
    fn active_window_unshields() {
        let now = Utc::now();
        let state = enforcement_state(&sample(), Some(now + Duration::minutes(3)), now);
        assert_eq!(state, EnforcementState::Unshielded);
    }

    #[test]
    fn elapsed_or_missing_window_shields() {
        let now = Utc::now();
        assert_eq!(
            enforcement_state(&sample(), Some(now - Duration::seconds(1)), now),
            EnforcementState::Shielded(sample())
        );
        assert_eq!(
            enforcement_state(&sample(), None, now),
            EnforcementState::Shielded(sample())
        );
    }

    #[test]
    fn empty_set_is_never_shielded() {
        let now = Utc::now();
        assert_eq!(
            enforcement_state(&RestrictionSet::empty(), None, now),
            EnforcementState::Unshielded
        );
    }
}
