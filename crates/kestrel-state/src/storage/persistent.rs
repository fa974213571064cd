use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use kestrel_core::serialize;
use tracing::debug;

use super::{Overlay, Storage};
use crate::error::StateError;

/// Storage persisted as one bincode snapshot, rewritten atomically on commit
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    overlay: Overlay,
}

impl FileStorage {
    /// Open `path`, loading the previous snapshot if there is one
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StateError> {
        let path = path.into();
        let committed: BTreeMap<Vec<u8>, Vec<u8>> = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serialize::from_bytes(&bytes)
                .map_err(|e| StateError::Serialization(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StateError::Storage(e.to_string())),
        };
        debug!(path = %path.display(), keys = committed.len(), "Opened storage snapshot");

        Ok(FileStorage {
            path,
            overlay: Overlay::from_committed(committed),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_snapshot(&self) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::Storage(e.to_string()))?;
        }
        let bytes = serialize::to_bytes(self.overlay.committed())
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &bytes).map_err(|e| StateError::Storage(e.to_string()))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| StateError::Storage(e.to_string()))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.overlay.get(key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.overlay.put(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.overlay.delete(key);
    }

    fn commit(&mut self) -> Result<(), StateError> {
        if self.overlay.apply_pending() {
            self.write_snapshot()?;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.overlay.discard_pending();
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.overlay.scan_prefix(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("kestrel-storage-{}-{}", std::process::id(), name))
            .join("chain.db")
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let path = temp_path("reopen");
        let _ = fs::remove_file(&path);

        let mut storage = FileStorage::open(&path).unwrap();
        storage.put(b"head", b"7");
        storage.put(b"scratch", b"x");
        storage.commit().unwrap();
        storage.put(b"uncommitted", b"y");

        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(reopened.get(b"head"), Some(b"7".to_vec()));
        assert_eq!(reopened.get(b"uncommitted"), None);
        assert_eq!(reopened.path(), path.as_path());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_file_opens_empty() {
        let path = temp_path("missing");
        let _ = fs::remove_dir_all(path.parent().unwrap());
        let storage = FileStorage::open(&path).unwrap();
        assert!(storage.scan_prefix(b"").is_empty());
        assert!(!path.exists());
    }
}
