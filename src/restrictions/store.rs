use std::collections::BTreeSet;

use anyhow::Result;
use log::{info, warn};

use crate::db::Database;
use crate::models::{ApplicationToken, CategoryToken, RestrictionSet, SelectionState};

/// Shared key of the serialized restriction set.
pub const RESTRICTION_SET_KEY: &str = "ScreenTimeTokenStorage";

/// The persisted restriction set, readable from any process.
///
/// Reads fail open: a missing or undecodable record is an empty set.
#[derive(Clone)]
pub struct RestrictionStore {
    db: Database,
}

impl RestrictionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Replace the stored set wholesale.
    pub async fn save(
        &self,
        applications: BTreeSet<ApplicationToken>,
        categories: BTreeSet<CategoryToken>,
    ) -> Result<RestrictionSet> {
        let set = RestrictionSet {
            applications,
            categories,
        };
        self.save_set(&set).await?;
        Ok(set)
    }

    pub async fn save_set(&self, set: &RestrictionSet) -> Result<()> {
        let encoded = serde_json::to_string(set)?;
        self.db.set_default(RESTRICTION_SET_KEY, encoded).await?;
        info!(
            "Saved restriction set: {} apps, {} categories",
            set.applications.len(),
            set.categories.len()
        );
        Ok(())
    }

    pub async fn load(&self) -> RestrictionSet {
        self.load_record().await.unwrap_or_default()
    }

    pub async fn selection_state(&self) -> SelectionState {
        match self.load_record().await {
            None => SelectionState::NeverPicked,
            Some(set) if set.is_empty() => SelectionState::Empty,
            Some(_) => SelectionState::Picked,
        }
    }

    async fn load_record(&self) -> Option<RestrictionSet> {
        let raw = match self.db.get_default(RESTRICTION_SET_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!("Failed to read restriction set, treating as empty: {err:#}");
                return None;
            }
        };

        match serde_json::from_str::<RestrictionSet>(&raw) {
            Ok(set) => Some(set),
            Err(err) => {
                warn!("Stored restriction set is unreadable, treating as empty: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RestrictionStore {
        RestrictionStore::new(Database::in_memory().unwrap())
    }

    #[tokio::test]
    async fn never_written_store_loads_empty() {
        let store = store();
        assert!(store.load().await.is_empty());
        assert_eq!(store.selection_state().await, SelectionState::NeverPicked);
    }

    #[tokio::test]
    async fn save_replaces_previous_set() {
        let store = store();
        store
            .save(
                [ApplicationToken::new("a"), ApplicationToken::new("b")].into(),
                [CategoryToken::new("social")].into(),
            )
            .await
            .unwrap();
        store
            .save([ApplicationToken::new("c")].into(), BTreeSet::new())
            .await
            .unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded, RestrictionSet::new([ApplicationToken::new("c")], []));
        assert_eq!(store.selection_state().await, SelectionState::Picked);
    }

    #[tokio::test]
    async fn empty_selection_is_remembered() {
        let store = store();
        store.save(BTreeSet::new(), BTreeSet::new()).await.unwrap();
        assert_eq!(store.selection_state().await, SelectionState::Empty);
        assert!(store.selection_state().await.has_picked());
    }

    #[tokio::test]
    async fn corrupt_record_fails_open() {
        let db = Database::in_memory().unwrap();
        db.set_default(RESTRICTION_SET_KEY, "{not json".into())
            .await
            .unwrap();
        let store = RestrictionStore::new(db);
        assert!(store.load().await.is_empty());
        assert_eq!(store.selection_state().await, SelectionState::NeverPicked);
    }
}
