//! `rocksdb`-backed reference implementation of `PersistentStore`, used by
//! the runnable shard-node/root-node binaries (out of scope here — this is
//! the reference collaborator, matching the teacher's own default choice
//! of `rocksdb` for on-disk storage).

use crate::{PersistentStore, WriteBatch};
use anyhow::{Context, Result};
use rocksdb::{IteratorMode, Options, DB};
use std::path::Path;
use tracing::info;

pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref()).context("opening rocksdb store")?;
        info!(path = %path.as_ref().display(), "opened rocksdb store");
        Ok(RocksStore { db })
    }
}

impl PersistentStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(key)?;
        Ok(())
    }

    fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let iter = self.db.iterator(IteratorMode::From(
            prefix,
            rocksdb::Direction::Forward,
        ));
        for item in iter {
            let (k, v) = item?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut wb = rocksdb::WriteBatch::default();
        for (k, v) in batch.puts {
            wb.put(k, v);
        }
        for k in batch.deletes {
            wb.delete(k);
        }
        self.db.write(wb)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn write_batch_applies_puts_and_deletes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.put(b"stale", b"1").unwrap();
        let mut batch = WriteBatch::default();
        batch.put(b"fresh".to_vec(), b"2".to_vec());
        batch.delete(b"stale".to_vec());
        store.write_batch(batch).unwrap();
        assert_eq!(store.get(b"fresh").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"stale").unwrap(), None);
    }

    #[test]
    fn iterate_prefix_stops_at_prefix_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.put(b"shard/a", b"1").unwrap();
        store.put(b"shard/b", b"2").unwrap();
        store.put(b"shardzzz", b"3").unwrap();
        let found = store.iterate_prefix(b"shard/").unwrap();
        assert_eq!(found.len(), 2);
    }
}
