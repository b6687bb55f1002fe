//! Cycle ledger persistence with file locking.
//!
//! All cycle instances live in one JSON document. Every operation holds a
//! sidecar lock file for its whole read-modify-write, so concurrent loggers
//! for the same substance are serialized and the loser of a race sees a
//! [`Error::StorageConflict`]. Lock acquisition gives up after the ledger's
//! timeout with [`Error::StorageTimeout`].

use crate::repository::{check_new_cycle, close_cycle, sort_cycles, CycleStore};
use crate::{CycleInstance, CycleStatus, Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use uuid::Uuid;

const LEDGER_VERSION: u32 = 1;
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Default time to wait for the ledger lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// On-disk ledger document
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LedgerDocument {
    pub version: u32,
    #[serde(default)]
    pub cycles: Vec<CycleInstance>,
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            cycles: Vec::new(),
        }
    }
}

impl LedgerDocument {
    /// Load a ledger document.
    ///
    /// A missing file is an empty ledger. A corrupted file is an error:
    /// starting over would reuse cycle numbers.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No ledger at {:?}, starting empty", path);
            return Ok(Self::default());
        }

        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        let doc: LedgerDocument = serde_json::from_str(&contents).map_err(|e| {
            tracing::warn!("Cycle ledger {:?} is corrupted: {}", path, e);
            Error::Json(e)
        })?;
        Ok(doc)
    }

    /// Atomically write the document by:
    /// 1. Writing to a temp file
    /// 2. Syncing to disk
    /// 3. Renaming over the original
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "ledger path missing parent")
        })?;
        std::fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string(self)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;

        temp.persist(path).map_err(|e| Error::Io(e.error))?;
        tracing::debug!("Saved cycle ledger to {:?}", path);
        Ok(())
    }
}

/// Take an fs2 lock on `file`, polling until `timeout` elapses
pub(crate) fn lock_with_timeout(
    file: &File,
    exclusive: bool,
    timeout: Duration,
    what: &str,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let attempt = if exclusive {
            FileExt::try_lock_exclusive(file)
        } else {
            FileExt::try_lock_shared(file)
        };
        match attempt {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                if Instant::now() >= deadline {
                    return Err(Error::StorageTimeout(format!(
                        "{} still locked after {:?}",
                        what, timeout
                    )));
                }
                std::thread::sleep(LOCK_POLL);
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// File-backed cycle store
#[derive(Clone, Debug)]
pub struct CycleLedger {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl CycleLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Override how long operations wait for the ledger lock
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn acquire(&self, exclusive: bool) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;

        let what = format!("cycle ledger {:?}", self.path);
        lock_with_timeout(&file, exclusive, self.lock_timeout, &what)?;
        Ok(file)
    }

    fn read<T>(&self, f: impl FnOnce(&LedgerDocument) -> T) -> Result<T> {
        let lock = self.acquire(false)?;
        let result = LedgerDocument::load(&self.path).map(|doc| f(&doc));
        FileExt::unlock(&lock)?;
        result
    }

    /// Load, modify and save under the exclusive lock. Nothing is written if
    /// `f` fails.
    fn update<T>(&self, f: impl FnOnce(&mut LedgerDocument) -> Result<T>) -> Result<T> {
        let lock = self.acquire(true)?;
        let result = LedgerDocument::load(&self.path).and_then(|mut doc| {
            let value = f(&mut doc)?;
            doc.save(&self.path)?;
            Ok(value)
        });
        FileExt::unlock(&lock)?;
        result
    }
}

impl CycleStore for CycleLedger {
    fn active_cycle(&self, substance_id: &str) -> Result<Option<CycleInstance>> {
        self.read(|doc| {
            doc.cycles
                .iter()
                .find(|c| c.substance_id == substance_id && c.status == CycleStatus::Active)
                .cloned()
        })
    }

    fn last_cycle(&self, substance_id: &str) -> Result<Option<CycleInstance>> {
        self.read(|doc| {
            doc.cycles
                .iter()
                .filter(|c| c.substance_id == substance_id)
                .max_by_key(|c| c.cycle_number)
                .cloned()
        })
    }

    fn list_cycles(&self, substance_id: Option<&str>) -> Result<Vec<CycleInstance>> {
        let mut cycles = self.read(|doc| {
            doc.cycles
                .iter()
                .filter(|c| substance_id.map_or(true, |s| c.substance_id == s))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        sort_cycles(&mut cycles);
        Ok(cycles)
    }

    fn create_cycle(&self, cycle: &CycleInstance) -> Result<()> {
        self.create_cycles(std::slice::from_ref(cycle))
    }

    fn create_cycles(&self, cycles: &[CycleInstance]) -> Result<()> {
        self.update(|doc| {
            for cycle in cycles {
                check_new_cycle(&doc.cycles, cycle)?;
                doc.cycles.push(cycle.clone());
            }
            Ok(())
        })?;
        for cycle in cycles {
            tracing::info!(
                "Created cycle #{} for {} ({:?})",
                cycle.cycle_number,
                cycle.substance_id,
                cycle.status
            );
        }
        Ok(())
    }

    fn complete_cycle(&self, cycle_id: Uuid, end_ts: DateTime<Utc>) -> Result<CycleInstance> {
        self.update(|doc| close_cycle(&mut doc.cycles, cycle_id, CycleStatus::Completed, end_ts))
    }

    fn abandon_cycle(&self, cycle_id: Uuid, end_ts: DateTime<Utc>) -> Result<CycleInstance> {
        self.update(|doc| close_cycle(&mut doc.cycles, cycle_id, CycleStatus::Abandoned, end_ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycles::next_cycle;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_create_and_reload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("cycles.json");

        let ledger = CycleLedger::new(&path);
        let cycle = next_cycle("bpc", None, ts(1), Uuid::new_v4());
        ledger.create_cycle(&cycle).unwrap();

        let reopened = CycleLedger::new(&path);
        assert_eq!(reopened.active_cycle("bpc").unwrap(), Some(cycle.clone()));
        assert_eq!(reopened.last_cycle("bpc").unwrap().unwrap().cycle_number, 1);

        let closed = reopened.complete_cycle(cycle.id, ts(3)).unwrap();
        assert_eq!(closed.end_ts, Some(ts(3)));
        assert!(ledger.active_cycle("bpc").unwrap().is_none());
    }

    #[test]
    fn test_load_nonexistent_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = CycleLedger::new(temp_dir.path().join("none.json"));
        assert!(ledger.list_cycles(None).unwrap().is_empty());
        assert!(ledger.last_cycle("bpc").unwrap().is_none());
    }

    #[test]
    fn test_conflict_leaves_ledger_unchanged() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = CycleLedger::new(temp_dir.path().join("cycles.json"));
        let first = next_cycle("bpc", None, ts(1), Uuid::new_v4());
        ledger.create_cycle(&first).unwrap();

        let racer = next_cycle("bpc", None, ts(2), Uuid::new_v4());
        assert!(matches!(
            ledger.create_cycle(&racer),
            Err(Error::StorageConflict(_))
        ));
        assert_eq!(ledger.list_cycles(Some("bpc")).unwrap(), vec![first]);
    }

    #[test]
    fn test_batch_create_is_all_or_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = CycleLedger::new(temp_dir.path().join("cycles.json"));

        let one = next_cycle("bpc", None, ts(1), Uuid::new_v4());
        let dup = next_cycle("bpc", None, ts(2), Uuid::new_v4());
        assert!(ledger.create_cycles(&[one, dup]).is_err());
        assert!(ledger.list_cycles(None).unwrap().is_empty());
    }

    #[test]
    fn test_lock_timeout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = CycleLedger::new(temp_dir.path().join("cycles.json"))
            .with_lock_timeout(Duration::from_millis(50));

        let holder = File::create(temp_dir.path().join("cycles.lock")).unwrap();
        holder.lock_exclusive().unwrap();

        let cycle = next_cycle("bpc", None, ts(1), Uuid::new_v4());
        assert!(matches!(
            ledger.create_cycle(&cycle),
            Err(Error::StorageTimeout(_))
        ));

        holder.unlock().unwrap();
        ledger.create_cycle(&cycle).unwrap();
    }

    #[test]
    fn test_corrupted_ledger_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("cycles.json");
        std::fs::write(&path, "{ invalid json }").unwrap();

        let ledger = CycleLedger::new(&path);
        assert!(matches!(ledger.list_cycles(None), Err(Error::Json(_))));

        let cycle = next_cycle("bpc", None, ts(1), Uuid::new_v4());
        assert!(ledger.create_cycle(&cycle).is_err());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{ invalid json }"
        );
    }

    #[test]
    fn test_atomic_save() {
        let temp_dir = tempfile::tempdir().unwrap();
        let ledger = CycleLedger::new(temp_dir.path().join("cycles.json"));
        ledger
            .create_cycle(&next_cycle("bpc", None, ts(1), Uuid::new_v4()))
            .unwrap();

        // Only the ledger and its lock file remain
        let mut names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["cycles.json", "cycles.lock"]);
    }
}
