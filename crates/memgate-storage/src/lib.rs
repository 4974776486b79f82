use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use memgate_core::{ConfigError, RegistryDocument};
use parking_lot::Mutex;
use thiserror::Error;

/// Durable home of the registry document. Saves always write the whole
/// catalog; there is no incremental patching.
pub trait CatalogStore: Send + Sync {
    fn load(&self) -> Result<RegistryDocument, StorageError>;
    fn save(&self, doc: &RegistryDocument) -> Result<(), StorageError>;
    fn describe(&self) -> String;
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("registry document not found at {0}")]
    NotFound(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// JSON file on local disk.
#[derive(Debug, Clone)]
pub struct JsonFileCatalogStore {
    path: PathBuf,
}

impl JsonFileCatalogStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Writes `doc` to `path`, creating parent directories, and returns a
    /// store bound to it.
    pub fn create(path: impl AsRef<Path>, doc: &RegistryDocument) -> Result<Self, StorageError> {
        let store = Self::new(path);
        store.save(doc)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CatalogStore for JsonFileCatalogStore {
    fn load(&self) -> Result<RegistryDocument, StorageError> {
        if !self.path.exists() {
            return Err(StorageError::NotFound(self.path.clone()));
        }
        let bytes = fs::read(&self.path)?;
        Ok(RegistryDocument::from_slice(&bytes)?)
    }

    fn save(&self, doc: &RegistryDocument) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = doc.to_vec_pretty()?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Process-local store, for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    doc: Mutex<RegistryDocument>,
    saves: AtomicUsize,
}

impl InMemoryCatalogStore {
    pub fn new(doc: RegistryDocument) -> Self {
        Self {
            doc: Mutex::new(doc),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> RegistryDocument {
        self.doc.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

impl CatalogStore for InMemoryCatalogStore {
    fn load(&self) -> Result<RegistryDocument, StorageError> {
        let doc = self.doc.lock().clone();
        doc.validate()?;
        Ok(doc)
    }

    fn save(&self, doc: &RegistryDocument) -> Result<(), StorageError> {
        *self.doc.lock() = doc.clone();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}
