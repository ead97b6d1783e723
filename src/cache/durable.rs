use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::Ms;
use crate::wal::Wal;

use super::keys::KeyPattern;

/// Serialized form of one cache entry as the durable tier stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierEntry {
    pub key: String,
    pub payload: Vec<u8>,
    pub expires_at: Ms,
    pub saved_at: Ms,
    pub metadata: Option<Vec<(String, String)>>,
}

impl TierEntry {
    /// Bytes the entry is charged against the tier's ceiling.
    pub fn weight(&self) -> u64 {
        let meta: usize = self
            .metadata
            .iter()
            .flatten()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        (self.key.len() + self.payload.len() + meta + 16) as u64
    }
}

#[derive(Debug, Error)]
pub enum TierError {
    #[error("entry of {size} bytes exceeds tier capacity of {capacity} bytes")]
    TooLarge { size: u64, capacity: u64 },
    #[error("durable tier I/O: {0}")]
    Io(#[from] io::Error),
}

/// Second cache tier, consulted on an in-process miss.
pub trait DurableTier: Send {
    fn load(&mut self, key: &str) -> Option<TierEntry>;

    /// Store an entry, evicting oldest-saved entries first if the ceiling is hit.
    fn store(&mut self, entry: TierEntry) -> Result<(), TierError>;

    fn remove_matching(&mut self, pattern: &KeyPattern) -> usize;

    /// Drop entries that expired before `cutoff`.
    fn purge_before(&mut self, cutoff: Ms) -> usize;

    fn bytes_used(&self) -> u64;
}

#[derive(Debug, Serialize, Deserialize)]
enum TierRecord {
    Put(TierEntry),
    Remove(String),
}

/// Log-structured file tier: every put and removal is appended to a framed
/// log, the live set is kept in an in-memory index, and the log is rewritten
/// once dead records outnumber live ones.
pub struct FileTier {
    log: Wal<TierRecord>,
    index: HashMap<String, TierEntry>,
    capacity: u64,
    used: u64,
}

impl FileTier {
    pub fn open(path: &Path, capacity: u64) -> io::Result<Self> {
        let mut index: HashMap<String, TierEntry> = HashMap::new();
        for record in Wal::<TierRecord>::replay(path)? {
            match record {
                TierRecord::Put(entry) => {
                    index.insert(entry.key.clone(), entry);
                }
                TierRecord::Remove(key) => {
                    index.remove(&key);
                }
            }
        }
        let used = index.values().map(TierEntry::weight).sum();
        info!("durable cache tier {}: {} entries, {used} bytes", path.display(), index.len());

        let mut tier = Self {
            log: Wal::open(path)?,
            index,
            capacity,
            used,
        };
        // A ceiling lowered between runs applies on open.
        while tier.used > tier.capacity && tier.evict_oldest()? {}
        Ok(tier)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn remove_key(&mut self, key: &str) -> io::Result<bool> {
        let Some(old) = self.index.remove(key) else {
            return Ok(false);
        };
        self.used -= old.weight();
        self.log.append_buffered(&TierRecord::Remove(key.to_string()))?;
        Ok(true)
    }

    fn evict_oldest(&mut self) -> io::Result<bool> {
        let Some(oldest) = self
            .index
            .values()
            .min_by_key(|e| (e.saved_at, e.key.clone()))
            .map(|e| e.key.clone())
        else {
            return Ok(false);
        };
        debug!("durable cache tier evicting {oldest}");
        metrics::counter!(crate::observability::CACHE_EVICTIONS_TOTAL).increment(1);
        self.remove_key(&oldest)
    }

    fn maybe_compact(&mut self) -> io::Result<()> {
        let live = self.index.len() as u64;
        if self.log.appends_since_compact() <= live * 2 + 64 {
            return Ok(());
        }
        let mut records: Vec<TierRecord> = self.index.values().cloned().map(TierRecord::Put).collect();
        records.sort_by_key(|r| match r {
            TierRecord::Put(e) => e.saved_at,
            TierRecord::Remove(_) => 0,
        });
        let bytes = self.log.compact(&records)?;
        debug!("durable cache tier compacted to {} entries ({bytes} bytes)", records.len());
        Ok(())
    }
}

impl DurableTier for FileTier {
    fn load(&mut self, key: &str) -> Option<TierEntry> {
        self.index.get(key).cloned()
    }

    fn store(&mut self, entry: TierEntry) -> Result<(), TierError> {
        let size = entry.weight();
        if size > self.capacity {
            return Err(TierError::TooLarge {
                size,
                capacity: self.capacity,
            });
        }
        self.remove_key(&entry.key)?;
        while self.used + size > self.capacity {
            if !self.evict_oldest()? {
                break;
            }
        }
        self.log.append_buffered(&TierRecord::Put(entry.clone()))?;
        self.log.flush()?;
        self.used += size;
        self.index.insert(entry.key.clone(), entry);
        self.maybe_compact()?;
        Ok(())
    }

    fn remove_matching(&mut self, pattern: &KeyPattern) -> usize {
        let keys: Vec<String> = self.index.keys().filter(|k| pattern.matches(k)).cloned().collect();
        let mut removed = 0;
        for key in keys {
            match self.remove_key(&key) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    // The index is already updated; the record is re-removed on the next rewrite.
                    tracing::warn!("durable cache tier failed to log removal of {key}: {e}");
                    removed += 1;
                }
            }
        }
        if let Err(e) = self.log.flush() {
            tracing::warn!("durable cache tier flush failed: {e}");
        }
        removed
    }

    fn purge_before(&mut self, cutoff: Ms) -> usize {
        let keys: Vec<String> = self
            .index
            .values()
            .filter(|e| e.expires_at < cutoff)
            .map(|e| e.key.clone())
            .collect();
        let count = keys.len();
        for key in keys {
            if let Err(e) = self.remove_key(&key) {
                tracing::warn!("durable cache tier failed to log removal of {key}: {e}");
            }
        }
        let _ = self.log.flush();
        if let Err(e) = self.maybe_compact() {
            tracing::warn!("durable cache tier compaction failed: {e}");
        }
        count
    }

    fn bytes_used(&self) -> u64 {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_tier_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_tier");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn entry(key: &str, payload_len: usize, saved_at: Ms) -> TierEntry {
        TierEntry {
            key: key.to_string(),
            payload: vec![7; payload_len],
            expires_at: saved_at + 1_000,
            saved_at,
            metadata: None,
        }
    }

    #[test]
    fn entries_survive_reopen() {
        let path = test_tier_path("reopen.tier");
        {
            let mut tier = FileTier::open(&path, 10_000).unwrap();
            tier.store(entry("lessons:a", 10, 1)).unwrap();
            tier.store(entry("lessons:b", 10, 2)).unwrap();
            tier.remove_matching(&KeyPattern::parse("lessons:a"));
        }
        let mut tier = FileTier::open(&path, 10_000).unwrap();
        assert!(tier.load("lessons:a").is_none());
        assert_eq!(tier.load("lessons:b").unwrap().saved_at, 2);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn oldest_saved_entries_are_evicted_first() {
        let path = test_tier_path("evict.tier");
        let one = entry("k1", 100, 1).weight();
        let mut tier = FileTier::open(&path, one * 2).unwrap();
        tier.store(entry("k1", 100, 1)).unwrap();
        tier.store(entry("k2", 100, 2)).unwrap();
        tier.store(entry("k3", 100, 3)).unwrap();

        assert!(tier.load("k1").is_none());
        assert!(tier.load("k2").is_some());
        assert!(tier.load("k3").is_some());
        assert!(tier.bytes_used() <= one * 2);
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let path = test_tier_path("oversized.tier");
        let mut tier = FileTier::open(&path, 64).unwrap();
        let result = tier.store(entry("big", 1_000, 1));
        assert!(matches!(result, Err(TierError::TooLarge { .. })));
        assert!(tier.is_empty());
    }

    #[test]
    fn overwrite_replaces_accounting() {
        let path = test_tier_path("overwrite.tier");
        let mut tier = FileTier::open(&path, 10_000).unwrap();
        tier.store(entry("k", 100, 1)).unwrap();
        tier.store(entry("k", 10, 2)).unwrap();
        assert_eq!(tier.bytes_used(), entry("k", 10, 2).weight());
    }

    #[test]
    fn prefix_removal_and_purge() {
        let path = test_tier_path("prefix.tier");
        let mut tier = FileTier::open(&path, 10_000).unwrap();
        tier.store(entry("slots:week:2024-W12:x", 1, 1)).unwrap();
        tier.store(entry("slots:all:y", 1, 1)).unwrap();
        tier.store(entry("lessons:z", 1, 5_000)).unwrap();

        assert_eq!(tier.remove_matching(&KeyPattern::parse("slots:*")), 2);
        assert_eq!(tier.purge_before(10_000), 1);
        assert!(tier.is_empty());
        assert_eq!(tier.bytes_used(), 0);
    }

    #[test]
    fn log_is_rewritten_after_churn() {
        let path = test_tier_path("churn.tier");
        {
            let mut tier = FileTier::open(&path, 1_000_000).unwrap();
            for i in 0..200 {
                tier.store(entry("same", 16, i)).unwrap();
            }
        }
        let records: Vec<TierRecord> = Wal::replay(&path).unwrap();
        assert!(records.len() < 200);
        let mut tier = FileTier::open(&path, 1_000_000).unwrap();
        assert_eq!(tier.load("same").unwrap().saved_at, 199);
    }
}
