//! Process-local key-value store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::{KvOp, KvStore, aggregate};
use crate::NsError;

#[derive(Debug, Default)]
struct Tables {
    records: BTreeMap<String, Vec<u8>>,
    hashes: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

/// [`KvStore`] held in two `BTreeMap`s behind one lock.
///
/// Useful for embedding and as a test double: [`set_read_only`](Self::set_read_only)
/// makes every write fail so batch error aggregation can be observed.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    tables: RwLock<Tables>,
    read_only: AtomicBool,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) every write.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of stored hashes.
    pub fn num_hashes(&self) -> usize {
        self.tables.read().hashes.len()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, NsError> {
        Ok(self.tables.read().records.get(key).cloned())
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, NsError> {
        Ok(self
            .tables
            .read()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    fn hget_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, NsError> {
        Ok(self
            .tables
            .read()
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn count_prefix(&self, prefix: &str) -> Result<u64, NsError> {
        let tables = self.tables.read();
        let count = tables
            .records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .count();
        Ok(count as u64)
    }

    fn apply(&self, batch: &[KvOp]) -> Result<(), NsError> {
        if self.read_only.load(Ordering::SeqCst) {
            let failures = batch
                .iter()
                .map(|op| format!("{}: store is read-only", op.key()))
                .collect();
            return aggregate("apply", failures);
        }

        let mut tables = self.tables.write();
        for op in batch {
            match op {
                KvOp::Set { key, value } => {
                    tables.records.insert(key.clone(), value.clone());
                }
                KvOp::Delete { key } => {
                    tables.records.remove(key);
                }
                KvOp::HSet { key, field, value } => {
                    tables
                        .hashes
                        .entry(key.clone())
                        .or_default()
                        .insert(field.clone(), value.clone());
                }
                KvOp::HDel { key, field } => {
                    if let Some(hash) = tables.hashes.get_mut(key) {
                        hash.remove(field);
                        if hash.is_empty() {
                            tables.hashes.remove(key);
                        }
                    }
                }
                KvOp::HClear { key } => {
                    tables.hashes.remove(key);
                }
            }
        }
        Ok(())
    }
}
