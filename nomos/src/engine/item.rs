/*
 * This file is a part of Nomos
*/

use crate::engine::tag::Tag;
use bytes::Bytes;

/// `liveTo = 0` never expires. `liveTo = 1` is a tombstone and is otherwise
/// indistinguishable from an expired item to a reader.
pub const LIVE_FOREVER: u32 = 0;
pub const TOMBSTONE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    pub live_to: u32,
    pub size: u32,
    pub tag: Tag,
}

impl ItemHeader {
    pub fn is_tombstone(&self) -> bool {
        self.live_to == TOMBSTONE
    }
    pub fn is_expired(&self, now: u32) -> bool {
        self.live_to != LIVE_FOREVER && self.live_to <= now && self.live_to != TOMBSTONE
    }
    /// A record is dead weight on disk once it's either a tombstone or has
    /// actually expired.
    pub fn is_dead(&self, now: u32) -> bool {
        self.is_tombstone() || self.is_expired(now)
    }
}

/// A live, shared-owned entry. Readers that clone an `Arc<StoredItem>` out of
/// a shard keep seeing the header as it was at lookup time -- mutations
/// never touch an existing `StoredItem` in place, they replace the map
/// entry's `Arc`. This is the discipline the spec's design notes (§9)
/// recommend in lieu of atomic header fields.
#[derive(Debug, Clone)]
pub struct StoredItem {
    pub header: ItemHeader,
    pub payload: Bytes,
}

impl StoredItem {
    pub fn new(payload: Bytes, live_to: u32, tag: Tag) -> Self {
        Self {
            header: ItemHeader {
                live_to,
                size: payload.len() as u32,
                tag,
            },
            payload,
        }
    }
}
