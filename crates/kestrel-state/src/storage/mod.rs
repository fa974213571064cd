pub mod memory;
pub mod persistent;

use std::collections::BTreeMap;

use crate::error::StateError;

/// Key-value persistence with an uncommitted write batch
pub trait Storage: Send + Sync {
    /// Read through the pending batch
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn put(&mut self, key: &[u8], value: &[u8]);

    fn delete(&mut self, key: &[u8]);

    /// Make the pending batch durable
    fn commit(&mut self) -> Result<(), StateError>;

    /// Drop the pending batch
    fn rollback(&mut self);

    /// Entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;

    fn exists(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
}

/// Committed map plus pending writes; `None` marks a pending delete
#[derive(Debug, Clone, Default)]
pub(crate) struct Overlay {
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Overlay {
    pub(crate) fn from_committed(committed: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        Overlay {
            committed,
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn committed(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.committed
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.pending.get(key) {
            Some(pending) => pending.clone(),
            None => self.committed.get(key).cloned(),
        }
    }

    pub(crate) fn put(&mut self, key: &[u8], value: &[u8]) {
        self.pending.insert(key.to_vec(), Some(value.to_vec()));
    }

    pub(crate) fn delete(&mut self, key: &[u8]) {
        self.pending.insert(key.to_vec(), None);
    }

    /// Fold pending writes into the committed map; returns whether anything changed
    pub(crate) fn apply_pending(&mut self) -> bool {
        let pending = std::mem::take(&mut self.pending);
        let changed = !pending.is_empty();
        for (key, value) in pending {
            match value {
                Some(value) => {
                    self.committed.insert(key, value);
                }
                None => {
                    self.committed.remove(&key);
                }
            }
        }
        changed
    }

    pub(crate) fn discard_pending(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<&[u8], Option<&Vec<u8>>> = self
            .committed
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.as_slice(), Some(value)))
            .collect();
        for (key, value) in self
            .pending
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            merged.insert(key.as_slice(), value.as_ref());
        }
        merged
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key.to_vec(), v.clone())))
            .collect()
    }
}

pub use memory::MemoryStorage;
pub use persistent::FileStorage;
