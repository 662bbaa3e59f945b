// ========================================================================================
//                       Kit ID to processed-kit location store
// ========================================================================================

use crate::types::KitRecord;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Kit store I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Kit store file '{}' is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persists where each uploaded kit was processed and which chip produced it.
///
/// `lookup` returns `None` for unknown IDs; callers decide whether that is an error.
pub trait KitStore: Send + Sync {
    fn insert(&self, id: &str, record: KitRecord) -> Result<(), StoreError>;
    fn lookup(&self, id: &str) -> Option<KitRecord>;
    fn delete(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryKitStore {
    records: RwLock<HashMap<String, KitRecord>>,
}

impl MemoryKitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KitStore for MemoryKitStore {
    fn insert(&self, id: &str, record: KitRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(id.to_string(), record);
        Ok(())
    }

    fn lookup(&self, id: &str) -> Option<KitRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(id).cloned()
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.remove(id);
        Ok(())
    }
}

/// A store backed by one JSON file, rewritten through a temporary file and a rename on
/// every change so readers never see a half-written file.
#[derive(Debug)]
pub struct JsonKitStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, KitRecord>>,
}

impl JsonKitStore {
    /// Opens the store at `path`, starting empty if the file does not exist yet.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let records = match fs::read_to_string(path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        })
    }

    fn persist(&self, records: &BTreeMap<String, KitRecord>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(records).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl KitStore for JsonKitStore {
    fn insert(&self, id: &str, record: KitRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(id.to_string(), record);
        self.persist(&records)
    }

    fn lookup(&self, id: &str) -> Option<KitRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(id).cloned()
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.remove(id).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }
}
