//! Durable record of the active transaction id
//!
//! A single JSON object, `{"current_transaction_id": <int> | null}`, rewritten
//! on every StartTransaction/StopTransaction and read back when a meter report
//! arrives without a known transaction (e.g. after a restart).

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default record location, relative to the working directory
pub const DEFAULT_PERSIST_PATH: &str = "persist.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TransactionRecord {
    current_transaction_id: Option<i64>,
}

/// File-backed transaction id store
#[derive(Debug, Clone)]
pub struct TransactionStore {
    path: PathBuf,
}

impl TransactionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the record with `transaction_id`.
    ///
    /// Written to a sibling temp file, synced, then renamed over the record.
    pub fn persist(&self, transaction_id: Option<i64>) -> io::Result<()> {
        let record = TransactionRecord {
            current_transaction_id: transaction_id,
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!("Persisted transaction id {:?} to {:?}", transaction_id, self.path);
        Ok(())
    }

    /// Read the record. Missing, unreadable or corrupt records yield `None`.
    pub fn load(&self) -> Option<i64> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Cannot read transaction record {:?}: {}", self.path, e);
                return None;
            }
        };

        match serde_json::from_slice::<TransactionRecord>(&data) {
            Ok(record) => record.current_transaction_id,
            Err(e) => {
                warn!("Corrupt transaction record {:?}: {}", self.path, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_persist_then_load() -> io::Result<()> {
        let dir = tempdir()?;
        let store = TransactionStore::new(dir.path().join("persist.json"));

        store.persist(Some(7))?;
        assert_eq!(store.load(), Some(7));

        store.persist(Some(1_700_000_123))?;
        assert_eq!(store.load(), Some(1_700_000_123));
        Ok(())
    }

    #[test]
    fn test_record_layout() -> io::Result<()> {
        let dir = tempdir()?;
        let store = TransactionStore::new(dir.path().join("persist.json"));

        store.persist(None)?;
        let text = fs::read_to_string(store.path())?;
        assert_eq!(text, r#"{"current_transaction_id":null}"#);
        assert_eq!(store.load(), None);
        Ok(())
    }

    #[test]
    fn test_missing_record_is_none() {
        let dir = tempdir().unwrap();
        let store = TransactionStore::new(dir.path().join("absent.json"));
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_corrupt_record_is_none() -> io::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("persist.json");
        fs::write(&path, b"{not json")?;
        assert_eq!(TransactionStore::new(&path).load(), None);

        fs::write(&path, br#"{"current_transaction_id": "abc"}"#)?;
        assert_eq!(TransactionStore::new(&path).load(), None);
        Ok(())
    }

    #[test]
    fn test_creates_parent_directory() -> io::Result<()> {
        let dir = tempdir()?;
        let store = TransactionStore::new(dir.path().join("state").join("persist.json"));
        store.persist(Some(3))?;
        assert_eq!(store.load(), Some(3));
        Ok(())
    }
}
