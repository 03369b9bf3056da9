//! # Forwarding Watermark
//!
//! The watermark is the timestamp of the last sample that was confirmed
//! delivered (or deliberately skipped) for the dataset. It is the *only*
//! mutable state of the forwarder and it only ever moves forward.
//!
//! Durability is delegated to a [`WatermarkStore`]. `advance` persists first
//! and moves the in-memory value second, so a failed write never leaves the
//! two out of step.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::core::errors::{StoreError, WatermarkError};

/// Durable (or not) backing of watermark values, keyed by dataset id.
pub trait WatermarkStore {
    /// Returns the stored value for `dataset_id`, if any.
    fn load(&self, dataset_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
    /// Stores `ts` for `dataset_id`. Must be durable when it returns `Ok`.
    fn persist(&mut self, dataset_id: &str, ts: DateTime<Utc>) -> Result<(), StoreError>;
}

/// # Watermark Seed
///
/// Where forwarding starts when the store holds no value for the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkSeed {
    /// Only samples recorded after startup are forwarded.
    Now,
    /// Everything the historian returns from the Unix epoch on.
    StartOfHistory,
    /// A fixed configured instant.
    At(DateTime<Utc>),
}

impl WatermarkSeed {
    /// Resolves the seed against the current clock.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            WatermarkSeed::Now => now,
            WatermarkSeed::StartOfHistory => DateTime::<Utc>::UNIX_EPOCH,
            WatermarkSeed::At(ts) => *ts,
        }
    }
}

impl FromStr for WatermarkSeed {
    type Err = String;

    /// Accepts `now`, `start` (or `start-of-history`) and RFC 3339 instants.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "now" => Ok(WatermarkSeed::Now),
            "start" | "start-of-history" => Ok(WatermarkSeed::StartOfHistory),
            _ => DateTime::parse_from_rfc3339(s.trim())
                .map(|ts| WatermarkSeed::At(ts.with_timezone(&Utc)))
                .map_err(|e| format!("invalid watermark seed '{}': {}", s, e)),
        }
    }
}

/// # Watermark
///
/// Last confirmed-forwarded timestamp of one dataset.
#[derive(Debug)]
pub struct Watermark<S: WatermarkStore> {
    dataset_id: String,
    last_forwarded: DateTime<Utc>,
    store: S,
}

impl<S: WatermarkStore> Watermark<S> {
    /// Loads the watermark of `dataset_id` from `store`. On first run the
    /// seed is resolved and written to the store so that a restart before the
    /// first delivery resumes from the same point.
    pub fn open(dataset_id: &str, mut store: S, seed: WatermarkSeed) -> Result<Self, StoreError> {
        let last_forwarded = match store.load(dataset_id)? {
            Some(ts) => {
                log::info!("Resuming dataset {} from watermark {}", dataset_id, ts);
                ts
            }
            None => {
                let ts = seed.resolve(Utc::now());
                log::info!("No watermark stored for dataset {}, seeding at {}", dataset_id, ts);
                store.persist(dataset_id, ts)?;
                ts
            }
        };

        Ok(Self {
            dataset_id: dataset_id.to_string(),
            last_forwarded,
            store,
        })
    }

    /// Last confirmed-forwarded timestamp (or the seed).
    pub fn get(&self) -> DateTime<Utc> {
        self.last_forwarded
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    /// Moves the watermark to `new_ts`.
    ///
    /// # Errors
    /// - `InvariantViolation` if `new_ts` is not strictly after the current value.
    /// - `Store` if the new value could not be persisted; the watermark is unchanged.
    pub fn advance(&mut self, new_ts: DateTime<Utc>) -> Result<(), WatermarkError> {
        if new_ts <= self.last_forwarded {
            return Err(WatermarkError::InvariantViolation {
                current: self.last_forwarded,
                attempted: new_ts,
            });
        }

        self.store.persist(&self.dataset_id, new_ts)?;
        self.last_forwarded = new_ts;
        Ok(())
    }

    /// Gives the store back, e.g. to reopen it after a simulated restart.
    pub fn into_store(self) -> S {
        self.store
    }
}

/// # File Watermark Store
///
/// Keeps every dataset's watermark in one small JSON document. Each write
/// goes to a temporary sibling, is fsynced, then atomically renamed over the
/// previous file.
#[derive(Debug)]
pub struct FileWatermarkStore {
    path: PathBuf,
    entries: BTreeMap<String, DateTime<Utc>>,
}

impl FileWatermarkStore {
    /// Opens (or prepares to create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?
            }
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            BTreeMap::new()
        };

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomically(&self) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(&self.entries)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp_path)?;
        file.write_all(&body)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        // Make the rename itself durable.
        #[cfg(unix)]
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)?.sync_all()?;
        }

        Ok(())
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn load(&self, dataset_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.entries.get(dataset_id).copied())
    }

    fn persist(&mut self, dataset_id: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
        let previous = self.entries.insert(dataset_id.to_string(), ts);
        if let Err(e) = self.write_atomically() {
            // Keep the cache equal to what is on disk.
            match previous {
                Some(prev) => self.entries.insert(dataset_id.to_string(), prev),
                None => self.entries.remove(dataset_id),
            };
            return Err(e);
        }
        Ok(())
    }
}

/// # Memory Watermark Store
///
/// Non-durable store. Clones share the same map, which lets a test "restart"
/// the forwarder against the values a previous instance left behind.
#[derive(Debug, Clone, Default)]
pub struct MemoryWatermarkStore {
    entries: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn load(&self, dataset_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))?;
        Ok(entries.get(dataset_id).copied())
    }

    fn persist(&mut self, dataset_id: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".to_string()))?;
        entries.insert(dataset_id.to_string(), ts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_seed_parsing() {
        assert_eq!("now".parse::<WatermarkSeed>().unwrap(), WatermarkSeed::Now);
        assert_eq!("START".parse::<WatermarkSeed>().unwrap(), WatermarkSeed::StartOfHistory);
        assert_eq!(
            "2024-01-01T00:00:00+02:00".parse::<WatermarkSeed>().unwrap(),
            WatermarkSeed::At(Utc.with_ymd_and_hms(2023, 12, 31, 22, 0, 0).unwrap())
        );
        assert!("yesterday".parse::<WatermarkSeed>().is_err());
    }

    #[test]
    fn test_open_seeds_and_persists() {
        let store = MemoryWatermarkStore::new();
        let wm = Watermark::open("ds", store.clone(), WatermarkSeed::At(t(0))).unwrap();
        assert_eq!(wm.get(), t(0));
        assert_eq!(store.load("ds").unwrap(), Some(t(0)));
    }

    #[test]
    fn test_open_prefers_stored_value_over_seed() {
        let mut store = MemoryWatermarkStore::new();
        store.persist("ds", t(42)).unwrap();
        let wm = Watermark::open("ds", store, WatermarkSeed::StartOfHistory).unwrap();
        assert_eq!(wm.get(), t(42));
    }

    #[test]
    fn test_advance_rejects_equal_and_older() {
        let mut wm = Watermark::open("ds", MemoryWatermarkStore::new(), WatermarkSeed::At(t(10))).unwrap();
        assert!(matches!(wm.advance(t(10)), Err(WatermarkError::InvariantViolation { .. })));
        assert!(matches!(wm.advance(t(5)), Err(WatermarkError::InvariantViolation { .. })));
        assert_eq!(wm.get(), t(10));
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let mut wm = Watermark::open("ds", MemoryWatermarkStore::new(), WatermarkSeed::At(t(0))).unwrap();
        let attempts = [3, 1, 7, 7, 2, 9, 15, 11, 15, 20];
        let mut previous = wm.get();
        for secs in attempts {
            let _ = wm.advance(t(secs));
            assert!(wm.get() >= previous);
            previous = wm.get();
        }
        assert_eq!(wm.get(), t(20));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("watermark.json");

        let store = FileWatermarkStore::open(&path).unwrap();
        let mut wm = Watermark::open("Plant.Area", store, WatermarkSeed::At(t(0))).unwrap();
        wm.advance(t(30)).unwrap();
        wm.advance(t(31) + Duration::milliseconds(250)).unwrap();
        drop(wm);

        let reopened = FileWatermarkStore::open(&path).unwrap();
        assert_eq!(reopened.load("Plant.Area").unwrap(), Some(t(31) + Duration::milliseconds(250)));
        assert_eq!(reopened.load("Other").unwrap(), None);
        assert!(!dir.path().join("state").join("watermark.json.tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watermark.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(FileWatermarkStore::open(&path), Err(StoreError::Corrupt(_))));
    }
}
