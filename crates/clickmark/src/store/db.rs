use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::kv::{KeyValueStorage, StorageError};

const KV: TableDefinition<&str, &str> = TableDefinition::new("kv");

/// File-backed key-value storage on a single redb table.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("open redb database: {}", path.display()))?;

        // Ensure the table exists so read transactions never see TableDoesNotExist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(KV)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    #[cfg(test)]
    fn keys(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KV)?;
        let mut keys = Vec::new();
        for item in table.iter()? {
            let (k, _v) = item?;
            keys.push(k.value().to_owned());
        }
        Ok(keys)
    }
}

impl KeyValueStorage for RedbStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let read_txn = self.db.begin_read().map_err(StorageError::backend)?;
        let table = read_txn.open_table(KV).map_err(StorageError::backend)?;
        let value = table
            .get(key)
            .map_err(StorageError::backend)?
            .map(|guard| guard.value().to_owned());
        Ok(value)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut table = write_txn.open_table(KV).map_err(StorageError::backend)?;
            table.insert(key, value).map_err(StorageError::backend)?;
        }
        write_txn.commit().map_err(StorageError::backend)?;
        debug!(key, bytes = value.len(), "stored item");
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write().map_err(StorageError::backend)?;
        {
            let mut table = write_txn.open_table(KV).map_err(StorageError::backend)?;
            table.remove(key).map_err(StorageError::backend)?;
        }
        write_txn.commit().map_err(StorageError::backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_storage() -> (RedbStorage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(&dir.path().join("test.db")).unwrap();
        (storage, dir)
    }

    #[test]
    fn set_get_remove() {
        let (s, _dir) = make_storage();
        assert!(s.get_item("K").unwrap().is_none());
        s.set_item("K", "v1").unwrap();
        s.set_item("K", "v2").unwrap();
        assert_eq!(s.get_item("K").unwrap().as_deref(), Some("v2"));
        assert_eq!(s.keys().unwrap(), vec!["K".to_string()]);
        s.remove_item("K").unwrap();
        assert!(s.get_item("K").unwrap().is_none());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");
        {
            let s = RedbStorage::open(&path).unwrap();
            s.set_item("_act_", r#"{"gclid":[]}"#).unwrap();
        }
        let s = RedbStorage::open(&path).unwrap();
        assert_eq!(s.get_item("_act_").unwrap().as_deref(), Some(r#"{"gclid":[]}"#));
    }
}
