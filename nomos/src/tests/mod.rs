/*
 * This file is a part of Nomos
 */

//! End-to-end engine scenarios that cross module boundaries -- replication
//! between two independent `IndexDirectory` instances, chiefly. Grounded in
//! the teacher's own `server/src/tests` convention of keeping cross-module
//! integration tests as a `#[cfg(test)]` module inside the library crate
//! rather than a separate `tests/` directory, since these exercise more than
//! one module's internals (here, `directory` + `replication::log`).

use crate::engine::directory::{IndexDirectory, IndexDirectoryConfig};
use crate::engine::key::{Key, KeyType};
use crate::engine::replication::client::FrameSink;
use crate::engine::replication::frame::decode_frame;
use crate::engine::replication::log::Cursor;
use bytes::Bytes;

fn node(dir: &std::path::Path, server_id: u32) -> std::sync::Arc<IndexDirectory> {
    IndexDirectory::new(IndexDirectoryConfig {
        data_path: dir.join("data"),
        default_sub_level_type: KeyType::U32,
        default_item_type: KeyType::Str,
        auto_create_top_index: true,
        sync_threads_count: 1,
        server_id: Some(server_id),
        replication_log_keep_time: 0,
        replication_log_path: dir.join("repl"),
    })
    .unwrap()
}

/// Spec §8 scenario 5: Node A accepts a handful of mutations across two
/// top-levels, and replaying what `read_for` hands back for peer 2 against a
/// fresh Node B reproduces A's visible state exactly.
#[test]
fn replication_apply_reproduces_state_on_a_fresh_node() {
    let now = 1_000_000u32;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = node(dir_a.path(), 1);
    let b = node(dir_b.path(), 2);

    a.create("t", KeyType::U32, KeyType::Str).unwrap();
    a.create("t2", KeyType::Str, KeyType::Str).unwrap();

    a.put(
        "t",
        Key::U32(1),
        Key::Str("k".into()),
        Bytes::from_static(b"1234567"),
        0,
        false,
        now,
    )
    .unwrap();
    a.touch("t", Key::U32(1), Key::Str("k".into()), 3600, now)
        .unwrap();
    a.put(
        "t",
        Key::U32(1),
        Key::Str("k2".into()),
        Bytes::from_static(b"gone"),
        0,
        false,
        now,
    )
    .unwrap();
    a.remove("t", Key::U32(1), Key::Str("k2".into()), now).unwrap();
    a.put(
        "t2",
        Key::Str("sl".into()),
        Key::Str("k".into()),
        Bytes::from_static(b"1234567"),
        0,
        false,
        now,
    )
    .unwrap();

    // sync_pool workers drain the pending queues asynchronously; force a
    // synchronous flush so the replication log sees every frame before we
    // read it back.
    a.sync_all(now);

    let log_a = a.replication_log().expect("replication enabled on node a");
    let (bytes_for_b, _cursor) = log_a.read_for(2, Cursor { segment: 1, offset: 0 }).unwrap();
    assert!(!bytes_for_b.is_empty());

    let mut cur = &bytes_for_b[..];
    let mut applied_any = false;
    while let Some(frame) = decode_frame(&mut cur).unwrap() {
        b.apply_remote_frame(frame, 1, now);
        applied_any = true;
    }
    assert!(applied_any);

    assert_eq!(
        b.find("t", &Key::U32(1), &Key::Str("k".into()), now, 0).unwrap(),
        Bytes::from_static(b"1234567")
    );
    assert!(b.find("t", &Key::U32(1), &Key::Str("k2".into()), now, 0).is_err());
    assert_eq!(
        b.find("t2", &Key::Str("sl".into()), &Key::Str("k".into()), now, 0)
            .unwrap(),
        Bytes::from_static(b"1234567")
    );
}

/// Spec §8 scenario 6 / invariant 5: a peer never receives frames it
/// originated itself.
#[test]
fn cycle_suppression_drops_own_origin_frames() {
    let now = 1_000_000u32;
    let dir_a = tempfile::tempdir().unwrap();
    let a = node(dir_a.path(), 1);
    a.create("t", KeyType::U32, KeyType::Str).unwrap();
    a.put(
        "t",
        Key::U32(1),
        Key::Str("k".into()),
        Bytes::from_static(b"1234567"),
        0,
        false,
        now,
    )
    .unwrap();
    a.sync_all(now);

    let log_a = a.replication_log().unwrap();
    let (bytes_for_self, _) = log_a.read_for(1, Cursor { segment: 1, offset: 0 }).unwrap();
    assert!(bytes_for_self.is_empty());
}

/// Replaying the same frame twice must not change the visible state or
/// resurrect a superseded record (spec §8 invariant 4).
#[test]
fn apply_remote_frame_is_idempotent() {
    let now = 1_000_000u32;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = node(dir_a.path(), 1);
    let b = node(dir_b.path(), 2);

    a.create("t", KeyType::U32, KeyType::Str).unwrap();
    a.put(
        "t",
        Key::U32(1),
        Key::Str("k".into()),
        Bytes::from_static(b"1234567"),
        0,
        false,
        now,
    )
    .unwrap();
    a.sync_all(now);

    let log_a = a.replication_log().unwrap();
    let (bytes_for_b, _) = log_a.read_for(2, Cursor { segment: 1, offset: 0 }).unwrap();

    for _ in 0..2 {
        let mut cur = &bytes_for_b[..];
        while let Some(frame) = decode_frame(&mut cur).unwrap() {
            b.apply_remote_frame(frame, 1, now);
        }
    }

    assert_eq!(
        b.find("t", &Key::U32(1), &Key::Str("k".into()), now, 0).unwrap(),
        Bytes::from_static(b"1234567")
    );
}
