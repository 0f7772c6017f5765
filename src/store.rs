//! Key-value storage for tasks and task events. The manager and every worker
//! hold independent stores; each store is the authoritative record for its
//! owning process.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to open store: {0}")]
    Open(String),
    #[error("store transaction failed: {0}")]
    Backend(String),
    #[error("error encoding stored entity: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Which store implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreKind {
    Memory,
    Persistent,
}

/// String-keyed storage for one entity class.
pub trait Store<T>: Send + Sync {
    fn put(&mut self, key: &str, value: T) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Option<T>, StoreError>;
    fn list(&self) -> Result<Vec<T>, StoreError>;
    fn count(&self) -> Result<usize, StoreError>;
}

/// In-memory store over a plain map.
#[derive(Debug, Default)]
pub struct MemoryStore<T> {
    entries: HashMap<String, T>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> MemoryStore<T> {
        MemoryStore {
            entries: HashMap::new(),
        }
    }
}

impl<T: Clone + Send + Sync> Store<T> for MemoryStore<T> {
    fn put(&mut self, key: &str, value: T) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<T>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn list(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.entries.values().cloned().collect())
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.entries.len())
    }
}

/// File-backed store: one redb database file per bucket, JSON-encoded values,
/// file mode 0600.
pub struct PersistentStore<T> {
    db: Database,
    bucket: &'static str,
    path: PathBuf,
    _entity: PhantomData<T>,
}

impl<T> PersistentStore<T> {
    pub fn new(path: impl AsRef<Path>, bucket: &'static str) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(|e| StoreError::Open(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| StoreError::Open(e.to_string()))?;
        }
        let store = PersistentStore {
            db,
            bucket,
            path,
            _entity: PhantomData,
        };
        // Creates the bucket table so later reads never race its existence.
        let txn = store
            .db
            .begin_write()
            .map_err(|e| StoreError::Open(e.to_string()))?;
        txn.open_table(store.table())
            .map_err(|e| StoreError::Open(e.to_string()))?;
        txn.commit().map_err(|e| StoreError::Open(e.to_string()))?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn table(&self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        TableDefinition::new(self.bucket)
    }
}

impl<T> Store<T> for PersistentStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn put(&mut self, key: &str, value: T) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(&value)?;
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        {
            let mut table = txn
                .open_table(self.table())
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            table
                .insert(key, encoded.as_slice())
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        txn.commit().map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn get(&self, key: &str) -> Result<Option<T>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let table = txn
            .open_table(self.table())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match table
            .get(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<T>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let table = txn
            .open_table(self.table())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut entries = Vec::new();
        for item in table
            .iter()
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            let (_, value) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            entries.push(serde_json::from_slice(value.value())?);
        }
        Ok(entries)
    }

    fn count(&self) -> Result<usize, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let table = txn
            .open_table(self.table())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let len = table
            .len()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(len as usize)
    }
}
