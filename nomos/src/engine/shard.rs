/*
 * This file is a part of Nomos
*/

//! A `ShardSet` is the fixed `[Shard; N]` array a sub-level owns (spec §4.1).
//! Each shard is independently locked so that two items hashing to different
//! shards never contend. This is deliberately a plain `RwLock<HashMap>` per
//! shard rather than the teacher's lock-free `Coremap`/`RawTable` machinery
//! (see DESIGN.md) -- the spec's concurrency table (§5) only ever names a
//! single lock per map, not a sharded lock-free structure.

use crate::engine::item::StoredItem;
use crate::engine::key::{checksum32, Key};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ShardSet {
    shards: [RwLock<HashMap<Key, Arc<StoredItem>>>; super::N_SHARDS],
}

impl ShardSet {
    pub fn new() -> Self {
        Self {
            shards: Default::default(),
        }
    }

    fn shard_index(key: &Key) -> usize {
        (checksum32(key) as usize) % super::N_SHARDS
    }

    pub fn get(&self, key: &Key) -> Option<Arc<StoredItem>> {
        let shard = &self.shards[Self::shard_index(key)];
        shard.read().get(key).cloned()
    }

    /// Replace (or insert) the entry wholesale. Returns the previous value,
    /// if any, so callers can decide whether this was a fresh insert.
    pub fn put(&self, key: Key, item: Arc<StoredItem>) -> Option<Arc<StoredItem>> {
        let shard = &self.shards[Self::shard_index(&key)];
        shard.write().insert(key, item)
    }

    pub fn remove(&self, key: &Key) -> Option<Arc<StoredItem>> {
        let shard = &self.shards[Self::shard_index(key)];
        shard.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot every `(key, item)` pair across all shards. Used by pack and
    /// by the hourly `clear_old` sweep, which need a point-in-time view
    /// without holding every shard lock for the whole pass.
    pub fn snapshot(&self) -> Vec<(Key, Arc<StoredItem>)> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            out.extend(shard.read().iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    /// Drop every entry for which `pred` returns true. Used by `clear_old` to
    /// evict expired/tombstoned items from memory once they're no longer
    /// needed for conflict resolution against late replication frames.
    pub fn retain(&self, mut pred: impl FnMut(&Key, &StoredItem) -> bool) {
        for shard in &self.shards {
            shard.write().retain(|k, v| pred(k, v));
        }
    }
}

impl Default for ShardSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tag::pack;
    use bytes::Bytes;

    fn item(tag: u64) -> Arc<StoredItem> {
        Arc::new(StoredItem::new(Bytes::from_static(b"v"), 0, tag))
    }

    #[test]
    fn put_then_get_roundtrips() {
        let shards = ShardSet::new();
        shards.put(Key::Str("a".into()), item(pack(1, 0)));
        assert!(shards.get(&Key::Str("a".into())).is_some());
        assert_eq!(shards.len(), 1);
    }

    #[test]
    fn remove_drops_entry() {
        let shards = ShardSet::new();
        shards.put(Key::U32(1), item(pack(1, 0)));
        assert!(shards.remove(&Key::U32(1)).is_some());
        assert!(shards.get(&Key::U32(1)).is_none());
    }

    #[test]
    fn retain_evicts_matching_entries() {
        let shards = ShardSet::new();
        for i in 0..20u32 {
            shards.put(Key::U32(i), item(pack(1, i)));
        }
        shards.retain(|k, _| !matches!(k, Key::U32(n) if n % 2 == 0));
        assert_eq!(shards.len(), 10);
    }
}
