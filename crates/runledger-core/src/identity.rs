//! Suite identity cache and deleted-testcase tracking.

use std::collections::{HashMap, HashSet};

use crate::event::EntityId;

/// Maps `(run, suite name)` to the suite id already created in the sink, so
/// re-entering a suite by name within a run reuses its row.
#[derive(Debug, Clone, Default)]
pub struct SuiteIdentityCache {
    entries: HashMap<(EntityId, String), EntityId>,
}

impl SuiteIdentityCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, run_id: EntityId, name: &str) -> Option<EntityId> {
        self.entries.get(&(run_id, name.to_string())).copied()
    }

    pub fn insert(&mut self, run_id: EntityId, name: &str, suite_id: EntityId) {
        self.entries.insert((run_id, name.to_string()), suite_id);
    }

    /// Move `suite_id` to a new name within `run_id`.
    pub fn rename(&mut self, run_id: EntityId, suite_id: EntityId, new_name: &str) {
        self.entries
            .retain(|(run, _), id| !(*run == run_id && *id == suite_id));
        self.insert(run_id, new_name, suite_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Testcases removed from the report. Writes targeting them are dropped.
#[derive(Debug, Clone, Default)]
pub struct DeletedTestcases {
    ids: HashSet<EntityId>,
}

impl DeletedTestcases {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the id was not already marked.
    pub fn insert(&mut self, testcase_id: EntityId) -> bool {
        self.ids.insert(testcase_id)
    }

    #[must_use]
    pub fn contains(&self, testcase_id: EntityId) -> bool {
        self.ids.contains(&testcase_id)
    }

    /// True when `testcase_id` is absent or deleted.
    #[must_use]
    pub fn excludes(&self, testcase_id: Option<EntityId>) -> bool {
        testcase_id.is_none_or(|id| self.contains(id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_names_are_scoped_by_run() {
        let mut cache = SuiteIdentityCache::new();
        cache.insert(1, "Login", 10);
        cache.insert(2, "Login", 20);
        assert_eq!(cache.get(1, "Login"), Some(10));
        assert_eq!(cache.get(2, "Login"), Some(20));
        assert_eq!(cache.get(3, "Login"), None);
    }

    #[test]
    fn rename_rekeys_entry() {
        let mut cache = SuiteIdentityCache::new();
        cache.insert(1, "Login", 10);
        cache.insert(1, "Checkout", 11);
        cache.rename(1, 10, "LoginV2");
        assert_eq!(cache.get(1, "Login"), None);
        assert_eq!(cache.get(1, "LoginV2"), Some(10));
        assert_eq!(cache.get(1, "Checkout"), Some(11));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn clear_empties_cache() {
        let mut cache = SuiteIdentityCache::new();
        cache.insert(1, "Login", 10);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn deleted_testcases() {
        let mut deleted = DeletedTestcases::new();
        assert!(deleted.insert(4));
        assert!(!deleted.insert(4));
        assert!(deleted.contains(4));
        assert!(deleted.excludes(Some(4)));
        assert!(deleted.excludes(None));
        assert!(!deleted.excludes(Some(5)));
        assert_eq!(deleted.len(), 1);
    }
}
