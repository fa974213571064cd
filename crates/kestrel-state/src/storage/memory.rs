use super::{Overlay, Storage};
use crate::error::StateError;

/// Volatile storage for tests and throwaway nodes
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    overlay: Overlay,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Number of committed keys
    pub fn len(&self) -> usize {
        self.overlay.committed().len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlay.committed().is_empty()
    }
}

impl Storage for MemoryStorage {
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
        self.overlay.apply_pending();
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

    #[test]
    fn test_pending_visible_until_rollback() {
        let mut storage = MemoryStorage::new();
        storage.put(b"blk:1", b"one");
        assert_eq!(storage.get(b"blk:1"), Some(b"one".to_vec()));
        assert!(storage.is_empty());

        storage.rollback();
        assert!(!storage.exists(b"blk:1"));
    }

    #[test]
    fn test_delete_shadows_committed() {
        let mut storage = MemoryStorage::new();
        storage.put(b"head", b"1");
        storage.commit().unwrap();

        storage.delete(b"head");
        assert_eq!(storage.get(b"head"), None);
        storage.rollback();
        assert_eq!(storage.get(b"head"), Some(b"1".to_vec()));

        storage.delete(b"head");
        storage.commit().unwrap();
        assert!(storage.is_empty());
    }

    #[test]
    fn test_scan_prefix_merges_pending() {
        let mut storage = MemoryStorage::new();
        storage.put(b"vals:0", b"a");
        storage.put(b"vals:5", b"b");
        storage.put(b"blk:0", b"g");
        storage.commit().unwrap();

        storage.put(b"vals:3", b"c");
        storage.delete(b"vals:5");

        let keys: Vec<_> = storage
            .scan_prefix(b"vals:")
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"vals:0".to_vec(), b"vals:3".to_vec()]);
        assert_eq!(storage.len(), 3);
    }
}
