use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use stevedore_protocol::{TransferId, TransferState};
use tracing::{debug, warn};

use crate::{StateStore, StatusFilter, StoreError, filter_sorted};

/// Transfer records kept in one JSON document keyed by transfer id.
///
/// Records are cached in memory and the whole document is rewritten on
/// every mutation: written to a sibling temp file, synced, then renamed over
/// the original, so a crash leaves either the old or the new document.
pub struct JsonFileStore {
    path: PathBuf,
    records: RwLock<BTreeMap<TransferId, TransferState>>,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Opens the store at `path`, loading existing records from disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = load_records(&path)?;
        Ok(Self {
            path,
            records: RwLock::new(records),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `mutate` to a copy of the cached map, persists it, and only
    /// then publishes it. A failed write leaves the cache untouched.
    ///
    /// The write lock is held across mutation and persist so concurrent
    /// writers to different ids never publish each other's stale snapshot.
    fn mutate(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<TransferId, TransferState>),
    ) -> Result<(), StoreError> {
        let _writer = self.write_lock.lock().unwrap();
        let mut next = self.records.read().unwrap().clone();
        mutate(&mut next);
        let json = serde_json::to_vec_pretty(&next)?;
        self.persist(&json)?;
        *self.records.write().unwrap() = next;
        Ok(())
    }

    /// Atomically replaces the document on disk.
    fn persist(&self, json: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(json)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path);

        debug!(bytes = json.len(), path = %self.path.display(), "persisted transfer records");
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn save(&self, state: &TransferState) -> Result<(), StoreError> {
        self.mutate(|map| {
            map.insert(state.id.clone(), state.clone());
        })
    }

    fn get(&self, id: &TransferId) -> Result<Option<TransferState>, StoreError> {
        Ok(self.records.read().unwrap().get(id).cloned())
    }

    fn delete(&self, id: &TransferId) -> Result<(), StoreError> {
        if !self.records.read().unwrap().contains_key(id) {
            return Ok(());
        }
        self.mutate(|map| {
            map.remove(id);
        })
    }

    fn list(
        &self,
        status: &StatusFilter,
        tag: Option<&str>,
    ) -> Result<Vec<TransferState>, StoreError> {
        let map = self.records.read().unwrap();
        Ok(filter_sorted(map.values(), status, tag))
    }
}

/// Loads records from a JSON file on disk.
fn load_records(path: &Path) -> Result<BTreeMap<TransferId, TransferState>, StoreError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = std::fs::read(path)?;
    if data.is_empty() {
        return Ok(BTreeMap::new());
    }
    let records: BTreeMap<TransferId, TransferState> = serde_json::from_slice(&data)?;

    for (id, state) in &records {
        if *id != state.id {
            return Err(StoreError::Corrupt {
                id: id.clone(),
                reason: format!("record keyed under a different id ({})", state.id),
            });
        }
        if let Err(e) = state.validate() {
            return Err(StoreError::Corrupt {
                id: id.clone(),
                reason: e.to_string(),
            });
        }
    }

    debug!("loaded {} transfer record(s) from {:?}", records.len(), path);
    Ok(records)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = std::fs::File::open(parent)
        && let Err(e) = dir.sync_all()
    {
        warn!(error = %e, "failed to sync state directory");
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

/// Returns the default state file path.
pub fn default_state_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("stevedore").join("transfers.json"))
}

/// Returns the platform-specific config directory.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stevedore_protocol::{Direction, TransferStatus};

    fn test_store() -> (tempfile::TempDir, JsonFileStore) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state").join("transfers.json");
        let store = JsonFileStore::open(path).unwrap();
        (tmp, store)
    }

    fn record(id: &str, status: TransferStatus, tag: Option<&str>) -> TransferState {
        let mut s = TransferState::new(id.into(), Direction::Download, format!("{id}.bin"));
        s.status = status;
        s.tag = tag.map(str::to_string);
        s
    }

    #[test]
    fn new_store_empty() {
        let (_tmp, store) = test_store();
        assert!(store.list(&StatusFilter::Any, None).unwrap().is_empty());
        assert!(store.get(&"t1".into()).unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[test]
    fn save_and_get() {
        let (_tmp, store) = test_store();
        let rec = record("t1", TransferStatus::Pending, None);
        store.save(&rec).unwrap();
        assert_eq!(store.get(&"t1".into()).unwrap().unwrap(), rec);
        assert!(store.path().exists());
    }

    #[test]
    fn failed_save_is_not_visible() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let path = blocker.join("state").join("transfers.json");
        let store = JsonFileStore::open(&path).unwrap();

        assert!(store.save(&record("a", TransferStatus::Pending, None)).is_err());
        assert!(store.get(&"a".into()).unwrap().is_none());
        assert!(store.list(&StatusFilter::Any, None).unwrap().is_empty());

        // Once writes work again, the rejected record does not ride along.
        std::fs::remove_file(&blocker).unwrap();
        store.save(&record("b", TransferStatus::Pending, None)).unwrap();
        let reopened = JsonFileStore::open(&path).unwrap();
        assert!(reopened.get(&"a".into()).unwrap().is_none());
        assert!(reopened.get(&"b".into()).unwrap().is_some());
    }

    #[test]
    fn delete_record() {
        let (_tmp, store) = test_store();
        store.save(&record("t1", TransferStatus::Pending, None)).unwrap();
        store.delete(&"t1".into()).unwrap();
        assert!(store.get(&"t1".into()).unwrap().is_none());
        // Unknown ids are fine.
        store.delete(&"nope".into()).unwrap();
    }

    #[test]
    fn persist_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transfers.json");

        {
            let store = JsonFileStore::open(path.clone()).unwrap();
            store.save(&record("a", TransferStatus::InProgress, Some("x"))).unwrap();
            store.save(&record("b", TransferStatus::Completed, None)).unwrap();
        }

        let reopened = JsonFileStore::open(path).unwrap();
        let a = reopened.get(&"a".into()).unwrap().unwrap();
        assert_eq!(a.status, TransferStatus::InProgress);
        assert_eq!(a.tag.as_deref(), Some("x"));
        assert_eq!(reopened.list(&StatusFilter::Any, None).unwrap().len(), 2);
    }

    #[test]
    fn overwrite_is_last_write_wins() {
        let (_tmp, store) = test_store();
        store.save(&record("t1", TransferStatus::Pending, None)).unwrap();
        store.save(&record("t1", TransferStatus::Paused, None)).unwrap();
        assert_eq!(
            store.get(&"t1".into()).unwrap().unwrap().status,
            TransferStatus::Paused
        );
    }

    #[test]
    fn list_filters_status_and_tag() {
        let (_tmp, store) = test_store();
        store.save(&record("a", TransferStatus::Pending, Some("nightly"))).unwrap();
        store.save(&record("b", TransferStatus::Paused, Some("adhoc"))).unwrap();
        store.save(&record("c", TransferStatus::Completed, Some("nightly"))).unwrap();

        let active = store.list(&StatusFilter::Active, None).unwrap();
        assert_eq!(active.len(), 2);

        let nightly_active = store.list(&StatusFilter::Active, Some("nightly")).unwrap();
        assert_eq!(nightly_active.len(), 1);
        assert_eq!(nightly_active[0].id.as_str(), "a");

        let done = store
            .list(&StatusFilter::Only(vec![TransferStatus::Completed]), None)
            .unwrap();
        assert_eq!(done.len(), 1);
    }

    #[test]
    fn concurrent_writes_to_distinct_ids() {
        let (_tmp, store) = test_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let s = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..10 {
                        let mut rec = record(&format!("t{i}"), TransferStatus::InProgress, None);
                        rec.bytes_transferred = 0;
                        rec.resource_name = format!("file-{j}");
                        s.save(&rec).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let reopened = JsonFileStore::open(store.path().to_path_buf()).unwrap();
        let all = reopened.list(&StatusFilter::Any, None).unwrap();
        assert_eq!(all.len(), 8);
        assert!(all.iter().all(|r| r.resource_name == "file-9"));
    }

    #[test]
    fn corrupt_document_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transfers.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(JsonFileStore::open(path), Err(StoreError::Json(_))));
    }

    #[test]
    fn mismatched_key_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("transfers.json");
        let rec = record("real", TransferStatus::Pending, None);
        let mut map = BTreeMap::new();
        map.insert(TransferId::from("other"), rec);
        std::fs::write(&path, serde_json::to_vec(&map).unwrap()).unwrap();

        assert!(matches!(
            JsonFileStore::open(path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let records = load_records(&tmp.path().join("missing.json")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn default_path_ends_with_state_file() {
        if let Some(path) = default_state_path() {
            assert!(path.ends_with("stevedore/transfers.json"));
        }
    }
}
