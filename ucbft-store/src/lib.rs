//! Persistent Store capability (spec.md §2 C1, §6, §9 "Polymorphic
//! networks & stores"): durable keyed blobs. The core composes with any
//! backend satisfying this trait; the concrete engine (rocksdb, sled, ...)
//! is out of scope (spec.md §1) beyond the reference implementations
//! below.

pub mod codec;
pub mod keys;
#[cfg(feature = "rocks")]
pub mod rocks;

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// A write batch applied atomically by `PersistentStore::write_batch`
/// (spec.md §7 "Persistence errors": a finalize's block write and a
/// commit's delete-index update must land together or not at all).
#[derive(Default)]
pub struct WriteBatch {
    pub puts: Vec<(Vec<u8>, Vec<u8>)>,
    pub deletes: Vec<Vec<u8>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.puts.push((key, value));
        self
    }

    pub fn delete(&mut self, key: Vec<u8>) -> &mut Self {
        self.deletes.push(key);
        self
    }
}

/// Capability record `{read, write, iterate, start_tx}` (Design Notes
/// §9). Implementors must be `Send + Sync`: the proof-indexer background
/// task and the replication server read through the same handle
/// concurrently with the main loop's writes.
pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Iterate all entries whose key starts with `prefix`, in key order.
    fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply a batch atomically ("start_tx" in Design Notes §9 terms).
    fn write_batch(&self, batch: WriteBatch) -> Result<()>;
}

/// Reference in-memory implementation, used by tests and by the
/// block-tree/safety-module test doubles throughout this workspace.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for InMemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .inner
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut guard = self.inner.write();
        for (k, v) in batch.puts {
            guard.insert(k, v);
        }
        for k in batch.deletes {
            guard.remove(&k);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_values() {
        let store = InMemoryStore::new();
        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn iterates_prefix_in_order() {
        let store = InMemoryStore::new();
        store.put(&keys::block_key(1), b"one").unwrap();
        store.put(&keys::block_key(2), b"two").unwrap();
        store.put(b"other", b"x").unwrap();
        let got = store.iterate_prefix(b"block/").unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].1, b"one");
        assert_eq!(got[1].1, b"two");
    }

    #[test]
    fn write_batch_is_atomic_in_memory() {
        let store = InMemoryStore::new();
        store.put(b"x", b"old").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"x".to_vec(), b"new".to_vec());
        batch.delete(b"y".to_vec());
        store.write_batch(batch).unwrap();
        assert_eq!(store.get(b"x").unwrap(), Some(b"new".to_vec()));
    }
}
