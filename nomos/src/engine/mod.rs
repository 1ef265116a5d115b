/*
 * This file is a part of Nomos
*/

//! The storage engine: everything from the tagged key type up through the
//! top-level index, the index directory, the background sync/compaction
//! workers and the binary replication log.

pub mod directory;
pub mod error;
pub mod item;
pub mod key;
pub mod maintenance;
pub mod meta;
pub mod record;
pub mod replication;
pub mod shard;
pub mod syncpool;
pub mod tag;
pub mod toplevel;

/// Largest single buffer `read_for`/pack ever materialize in one go.
pub const MAX_BUF_SIZE: usize = 300_000;
/// Largest a single item's payload (or a key's encoded length) may be.
pub const MAX_ITEM_SIZE: usize = 300_000;
/// `read_for`'s buffer cap: one `MAX_BUF_SIZE` chunk plus headroom for the
/// record straddling its end not being split mid-record.
pub const MAX_REPLICATION_BUFFER: usize = MAX_BUF_SIZE + 2 * MAX_ITEM_SIZE;
pub const MAX_TOP_LEVEL_NAME_LENGTH: usize = 16;
pub const MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;
pub const MAX_REPLICATION_FILE_SIZE: u64 = 1024 * 1024 * 1024;
/// A touched-but-not-yet-synced item is still flushed if its remaining
/// lifetime fraction drops below this -- expiry must not race a segment
/// roll that would otherwise lose the touch.
pub const MIN_SYNC_TOUCH_TIME_PERCENT: f64 = 0.10;
/// A put is always considered "stale enough to sync" once it's sat in the
/// pending queue this long, independent of the touch-time heuristic above.
pub const MIN_SYNC_PUT_UPDATE_TIME: u64 = 300;
/// Shards per sub-level, fixed for the process's lifetime.
pub const N_SHARDS: usize = 10;

/// `[A-Za-z0-9_.\-]{1,16}` -- validated once at `create` time.
pub fn is_valid_top_level_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TOP_LEVEL_NAME_LENGTH
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_name_validation() {
        assert!(is_valid_top_level_name("users"));
        assert!(is_valid_top_level_name("a.b-c_9"));
        assert!(!is_valid_top_level_name(""));
        assert!(!is_valid_top_level_name("this-name-is-too-long-for-sure"));
        assert!(!is_valid_top_level_name("bad key"));
    }
}
