use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use snafu::ResultExt;

use crate::error::{CreateStoreDirectorySnafu, ReadBlobSnafu, StoreResult, WriteBlobSnafu};

/// Key/value blob persistence seam. Implementations only need whole-value
/// get/set; all structure lives above this trait.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
}

/// Blob store backed by one file per key inside a directory.
pub struct FileBlobStore {
    directory: PathBuf,
}

impl FileBlobStore {
    pub fn new(directory: impl Into<PathBuf>) -> StoreResult<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).context(CreateStoreDirectorySnafu {
            stage: "file-store-new",
            path: directory.display().to_string(),
        })?;
        Ok(Self { directory })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are internal constants, not user input; a flat join is enough.
        self.directory.join(format!("{key}.json"))
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error).context(ReadBlobSnafu {
                stage: "file-store-get",
                key: key.to_string(),
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        std::fs::write(self.path_for(key), value).context(WriteBlobSnafu {
            stage: "file-store-set",
            key: key.to_string(),
        })
    }
}

/// In-memory blob store for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
