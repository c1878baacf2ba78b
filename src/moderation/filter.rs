use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::error::Result;
use crate::storage::store::PhraseStore;

/// In-memory mirror of the persisted filtered-phrase set, consulted on
/// every query and every ingest. Mutations write through to persistence
/// first, then update the mirror under the exclusive lock; the caller
/// invalidates affected suggestion-cache entries afterwards.
pub struct ModerationFilter {
    store: Arc<dyn PhraseStore>,
    mirror: RwLock<HashSet<String>>,
}

impl ModerationFilter {
    /// Loads the mirror from persistence at boot.
    pub fn load(store: Arc<dyn PhraseStore>) -> Result<Self> {
        let mirror = store.list_filtered()?.into_iter().collect();
        Ok(ModerationFilter {
            store,
            mirror: RwLock::new(mirror),
        })
    }

    pub fn is_filtered(&self, phrase: &str) -> bool {
        self.mirror.read().contains(phrase)
    }

    pub fn add(&self, phrase: &str, reason: &str) -> Result<()> {
        let mut mirror = self.mirror.write();
        self.store.add_filtered(phrase, reason)?;
        mirror.insert(phrase.to_string());
        Ok(())
    }

    pub fn remove(&self, phrase: &str) -> Result<()> {
        let mut mirror = self.mirror.write();
        self.store.remove_filtered(phrase)?;
        mirror.remove(phrase);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.mirror.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    #[test]
    fn loads_persisted_set_at_boot() {
        let store = Arc::new(MemoryStore::new());
        store.add_filtered("badword", "abuse").unwrap();

        let filter = ModerationFilter::load(store).unwrap();
        assert!(filter.is_filtered("badword"));
        assert!(!filter.is_filtered("goodword"));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn add_and_remove_write_through() {
        let store = Arc::new(MemoryStore::new());
        let filter = ModerationFilter::load(store.clone()).unwrap();

        filter.add("badword", "spam").unwrap();
        assert!(filter.is_filtered("badword"));
        assert_eq!(store.list_filtered().unwrap(), vec!["badword".to_string()]);

        filter.remove("badword").unwrap();
        assert!(!filter.is_filtered("badword"));
        assert!(store.list_filtered().unwrap().is_empty());
    }

    #[test]
    fn failed_persistence_leaves_mirror_untouched() {
        let store = Arc::new(MemoryStore::new());
        let filter = ModerationFilter::load(store).unwrap();

        // removing an unfiltered phrase fails in the store
        assert!(filter.remove("never-added").is_err());
        assert!(filter.is_empty());
    }
}
