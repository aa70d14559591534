pub mod blob;
pub mod error;
pub mod types;

use snafu::ResultExt;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use error::{StoreError, StoreResult};
pub use types::{ImageRecord, MessageRecord, PartRecord, RoleRecord, ThreadRecord};

/// Blob key the full thread list lives under.
pub const CHAT_HISTORY_KEY: &str = "chat_history";

/// Loads all persisted threads. A missing or malformed blob degrades to an
/// empty list so a corrupt store never blocks startup; the malformed case is
/// logged and the blob is overwritten on the next save.
pub fn load_threads(store: &dyn BlobStore) -> StoreResult<Vec<ThreadRecord>> {
    let Some(raw) = store.get(CHAT_HISTORY_KEY)? else {
        return Ok(Vec::new());
    };

    match serde_json::from_str(&raw) {
        Ok(threads) => Ok(threads),
        Err(error) => {
            tracing::warn!(
                key = CHAT_HISTORY_KEY,
                error = %error,
                "thread blob is malformed; starting from an empty list"
            );
            Ok(Vec::new())
        }
    }
}

/// Persists the full thread list under [`CHAT_HISTORY_KEY`].
pub fn save_threads(store: &dyn BlobStore, threads: &[ThreadRecord]) -> StoreResult<()> {
    let raw = serde_json::to_string(threads).context(error::SerializeThreadsSnafu {
        stage: "save-threads",
    })?;
    store.set(CHAT_HISTORY_KEY, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_thread(id: u64) -> ThreadRecord {
        ThreadRecord {
            id,
            title: "New chat".to_string(),
            system_instruction: String::new(),
            history: vec![MessageRecord {
                role: RoleRecord::User,
                parts: vec![PartRecord::Text("hi".to_string())],
            }],
        }
    }

    #[test]
    fn missing_blob_loads_as_empty() {
        let store = MemoryBlobStore::new();
        assert!(load_threads(&store).expect("load").is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = MemoryBlobStore::new();
        let threads = vec![sample_thread(1), sample_thread(2)];
        save_threads(&store, &threads).expect("save");
        assert_eq!(load_threads(&store).expect("load"), threads);
    }

    #[test]
    fn malformed_blob_degrades_to_empty() {
        let store = MemoryBlobStore::new();
        store.set(CHAT_HISTORY_KEY, "{not json").expect("set");
        assert!(load_threads(&store).expect("load").is_empty());

        store
            .set(CHAT_HISTORY_KEY, r#"{"id": 1}"#)
            .expect("wrong shape");
        assert!(load_threads(&store).expect("load").is_empty());
    }

    #[test]
    fn file_backed_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileBlobStore::new(dir.path()).expect("store");
        let threads = vec![sample_thread(42)];
        save_threads(&store, &threads).expect("save");
        assert_eq!(load_threads(&store).expect("load"), threads);
    }
}
