use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::core::error::{Error, Result};
use crate::core::types::PhraseRecord;
use crate::storage::store::{PhrasePage, PhraseStore};

const SNAPSHOT_FILE: &str = "phrases.snap";
const LOG_FILE: &str = "phrases.log";

/// Embedded `PhraseStore`: an LZ4-compressed snapshot plus an append-only
/// record log, each record framed as length + CRC32 + bincode payload. The
/// log is replayed over the snapshot at open and folded back in by
/// `compact`. A flush batch is one log record, so recovery is all-or-nothing
/// per batch.
pub struct FileStore {
    dir: PathBuf,
    inner: Mutex<FileInner>,
}

struct FileInner {
    phrases: BTreeMap<String, PhraseRecord>,
    reasons: HashMap<String, String>,
    log: File,
    log_records: usize,
}

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Upserts {
        deltas: Vec<(String, u64)>,
        timestamp: DateTime<Utc>,
    },
    Filter {
        phrase: String,
        reason: String,
    },
    Unfilter {
        phrase: String,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    records: Vec<PhraseRecord>,
    reasons: Vec<(String, String)>,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut phrases = BTreeMap::new();
        let mut reasons = HashMap::new();

        let snap_path = dir.join(SNAPSHOT_FILE);
        if snap_path.exists() {
            let snapshot = read_snapshot(&snap_path)?;
            for r in snapshot.records {
                phrases.insert(r.phrase.clone(), r);
            }
            reasons.extend(snapshot.reasons);
        }

        let log_path = dir.join(LOG_FILE);
        let (replayed, valid_len) = replay_log(&log_path, &mut phrases, &mut reasons)?;
        if log_path.exists() {
            let file = OpenOptions::new().write(true).open(&log_path)?;
            // Drop any torn tail so later appends start on a record boundary.
            file.set_len(valid_len)?;
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let store = FileStore {
            dir,
            inner: Mutex::new(FileInner {
                phrases,
                reasons,
                log,
                log_records: replayed,
            }),
        };
        if replayed > 0 {
            store.compact()?;
        }
        Ok(store)
    }

    /// Folds the log into a fresh snapshot (temp file + atomic rename) and
    /// truncates the log.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let snapshot = Snapshot {
            records: inner.phrases.values().cloned().collect(),
            reasons: inner.reasons.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };

        let payload = bincode::serialize(&snapshot)?;
        let compressed = lz4_flex::compress_prepend_size(&payload);
        let mut out = Vec::with_capacity(compressed.len() + 4);
        out.extend_from_slice(&crc32fast::hash(&compressed).to_le_bytes());
        out.extend_from_slice(&compressed);

        let tmp = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        fs::write(&tmp, &out)?;
        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;

        let log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.dir.join(LOG_FILE))?;
        drop(log);
        inner.log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))?;
        inner.log_records = 0;
        Ok(())
    }

    pub fn log_records(&self) -> usize {
        self.inner.lock().log_records
    }

    fn append(inner: &mut FileInner, record: &LogRecord) -> Result<()> {
        let payload = bincode::serialize(record)?;
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        inner
            .log
            .write_all(&frame)
            .and_then(|_| inner.log.sync_data())
            .map_err(|e| Error::persistence(format!("log append failed: {}", e)))?;
        inner.log_records += 1;
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let bytes = fs::read(path)?;
    if bytes.len() < 4 {
        return Err(Error::new(
            crate::core::error::ErrorKind::Parse,
            format!("snapshot {:?} is truncated", path),
        ));
    }
    let stored_crc = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let compressed = &bytes[4..];
    if crc32fast::hash(compressed) != stored_crc {
        return Err(Error::new(
            crate::core::error::ErrorKind::Parse,
            format!("snapshot {:?} fails checksum", path),
        ));
    }
    let payload = lz4_flex::decompress_size_prepended(compressed).map_err(|e| {
        Error::new(
            crate::core::error::ErrorKind::Parse,
            format!("snapshot decompression failed: {}", e),
        )
    })?;
    Ok(bincode::deserialize(&payload)?)
}

/// Replays framed records until the file ends or a frame fails its length or
/// checksum check. Returns the record count and the byte offset of the last
/// valid frame; everything past it is a torn tail.
fn replay_log(
    path: &Path,
    phrases: &mut BTreeMap<String, PhraseRecord>,
    reasons: &mut HashMap<String, String>,
) -> Result<(usize, u64)> {
    if !path.exists() {
        return Ok((0, 0));
    }
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let mut offset = 0usize;
    let mut replayed = 0usize;
    while offset + 8 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap());
        let start = offset + 8;
        if start + len > bytes.len() {
            break;
        }
        let payload = &bytes[start..start + len];
        if crc32fast::hash(payload) != crc {
            break;
        }
        let record: LogRecord = match bincode::deserialize(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, offset, "skipping undecodable log record");
                offset = start + len;
                continue;
            }
        };
        apply_record(record, phrases, reasons);
        replayed += 1;
        offset = start + len;
    }
    if offset < bytes.len() {
        warn!(
            discarded = bytes.len() - offset,
            "discarding torn tail of phrase log"
        );
    }
    Ok((replayed, offset as u64))
}

fn apply_record(
    record: LogRecord,
    phrases: &mut BTreeMap<String, PhraseRecord>,
    reasons: &mut HashMap<String, String>,
) {
    match record {
        LogRecord::Upserts { deltas, timestamp } => {
            for (phrase, delta) in deltas {
                let record = phrases
                    .entry(phrase.clone())
                    .or_insert_with(|| PhraseRecord::new(phrase, 0, timestamp));
                record.count += delta;
                record.last_updated = timestamp;
            }
        }
        LogRecord::Filter { phrase, reason } => {
            let now = Utc::now();
            let record = phrases
                .entry(phrase.clone())
                .or_insert_with(|| PhraseRecord::new(phrase.clone(), 0, now));
            record.filtered = true;
            reasons.insert(phrase, reason);
        }
        LogRecord::Unfilter { phrase } => {
            if let Some(record) = phrases.get_mut(&phrase) {
                record.filtered = false;
            }
            reasons.remove(&phrase);
        }
    }
}

impl PhraseStore for FileStore {
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
        FileStore::append(
            &mut inner,
            &LogRecord::Upserts {
                deltas: deltas.to_vec(),
                timestamp: now,
            },
        )?;
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
        FileStore::append(
            &mut inner,
            &LogRecord::Filter {
                phrase: phrase.to_string(),
                reason: reason.to_string(),
            },
        )?;
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
        match inner.phrases.get(phrase) {
            Some(record) if record.filtered => {}
            _ => return Err(Error::not_found(format!("{:?} is not filtered", phrase))),
        }
        FileStore::append(
            &mut inner,
            &LogRecord::Unfilter {
                phrase: phrase.to_string(),
            },
        )?;
        let inner = &mut *inner;
        if let Some(record) = inner.phrases.get_mut(phrase) {
            record.filtered = false;
        }
        inner.reasons.remove(phrase);
        Ok(())
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
