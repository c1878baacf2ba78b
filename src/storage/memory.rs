use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use crate::core::error::{Error, Result};
use crate::core::types::PhraseRecord;
use crate::storage::store::{PhrasePage, PhraseStore};

/// Reference `PhraseStore`: a phrase-keyed map under a single lock, so every
/// batch is trivially transactional. Used by tests and single-process
/// embeddings without durability needs.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    phrases: BTreeMap<String, PhraseRecord>,
    reasons: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Seeds a corpus directly, bypassing ingestion. Test helper.
    pub fn seed(&self, records: impl IntoIterator<Item = PhraseRecord>) {
        let mut inner = self.inner.lock();
        for r in records {
            inner.phrases.insert(r.phrase.clone(), r);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PhraseStore for MemoryStore {
    fn load_page(&self, cursor: Option<&str>, batch: usize) -> Result<PhrasePage> {
        let inner = self.inner.lock();
        let range = match cursor {
            Some(c) => inner
                .phrases
                .range::<str, _>((Bound::Excluded(c), Bound::Unbounded)),
            None => inner.phrases.range::<str, _>(..),
        };
        let records: Vec<PhraseRecord> = range
            .filter(|(_, r)| !r.filtered)
            .take(batch)
            .map(|(_, r)| r.clone())
            .collect();
        let next_cursor = if records.len() == batch {
            records.last().map(|r| r.phrase.clone())
        } else {
            None
        };
        Ok(PhrasePage {
            records,
            next_cursor,
        })
    }

    fn upsert_batch(&self, deltas: &[(String, u64)], now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        for (phrase, delta) in deltas {
            let record = inner
                .phrases
                .entry(phrase.clone())
                .or_insert_with(|| PhraseRecord::new(phrase.clone(), 0, now));
            record.count += delta;
            record.last_updated = now;
        }
        Ok(())
    }

    fn get(&self, phrase: &str) -> Result<Option<PhraseRecord>> {
        Ok(self.inner.lock().phrases.get(phrase).cloned())
    }

    fn add_filtered(&self, phrase: &str, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let now = Utc::now();
        let record = inner
            .phrases
            .entry(phrase.to_string())
            .or_insert_with(|| PhraseRecord::new(phrase.to_string(), 0, now));
        record.filtered = true;
        inner.reasons.insert(phrase.to_string(), reason.to_string());
        Ok(())
    }

    fn remove_filtered(&self, phrase: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        match inner.phrases.get_mut(phrase) {
            Some(record) if record.filtered => {
                record.filtered = false;
                inner.reasons.remove(phrase);
                Ok(())
            }
            _ => Err(Error::not_found(format!("{:?} is not filtered", phrase))),
        }
    }

    fn list_filtered(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .phrases
            .values()
            .filter(|r| r.filtered)
            .map(|r| r.phrase.clone())
            .collect())
    }

    fn phrase_count(&self) -> Result<usize> {
        Ok(self.inner.lock().phrases.len())
    }
}
