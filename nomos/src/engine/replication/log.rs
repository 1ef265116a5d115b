/*
 * This file is a part of Nomos
*/

//! The append-only binary replication log: a rolling sequence of segment
//! files per spec §4.4, each named `nomos_bin_<serverID>_<hex8 number>`.

use crate::engine::error::{EngineError, EngineResult, ErrorContext};
use crate::engine::meta::MetaData;
use crate::engine::record::Record;
use crate::engine::replication::frame::{decode_frame, encode_frame, ReplicationPacketHeader};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// `(segment_number, offset)` -- a peer's read position in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub segment: u32,
    pub offset: u64,
}

struct Segment {
    number: u32,
    path: PathBuf,
    /// `Arc`-wrapped so `read_for` can clone it out and hold the read guard
    /// across the segment's file reads without keeping `Inner`'s mutex
    /// locked meanwhile -- matches spec.md §5's per-segment read/write lock
    /// (lock 6), which `append` already takes for the duration of its write.
    lock: Arc<RwLock<()>>,
}

struct Inner {
    segments: Vec<Segment>,
    current_size: u64,
}

pub struct ReplicationLog {
    server_id: u32,
    dir: PathBuf,
    inner: Mutex<Inner>,
}

fn segment_file_name(server_id: u32, number: u32) -> String {
    format!("nomos_bin_{server_id}_{number:08x}")
}

fn parse_segment_file_name(name: &str, server_id: u32) -> Option<u32> {
    let rest = name.strip_prefix("nomos_bin_")?;
    let (id_str, num_str) = rest.split_once('_')?;
    let id: u32 = id_str.parse().ok()?;
    if id != server_id {
        return None;
    }
    u32::from_str_radix(num_str, 16).ok()
}

impl ReplicationLog {
    /// Scan `dir` for this node's own segments and open (or create) the
    /// current writable one.
    pub fn open(dir: impl Into<PathBuf>, server_id: u32) -> EngineResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context("create replication log dir")?;

        let mut numbers = Vec::new();
        for entry in fs::read_dir(&dir).context("list replication log dir")? {
            let entry = entry.context("replication log dir entry")?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(n) = parse_segment_file_name(name, server_id) {
                    numbers.push(n);
                }
            }
        }
        numbers.sort_unstable();

        let mut segments: Vec<Segment> = numbers
            .into_iter()
            .map(|number| Segment {
                number,
                path: dir.join(segment_file_name(server_id, number)),
                lock: Arc::new(RwLock::new(())),
            })
            .collect();

        let current_size = if let Some(last) = segments.last() {
            fs::metadata(&last.path).map(|m| m.len()).unwrap_or(0)
        } else {
            segments.push(Segment {
                number: 1,
                path: dir.join(segment_file_name(server_id, 1)),
                lock: Arc::new(RwLock::new(())),
            });
            0
        };

        Ok(Self {
            server_id,
            dir,
            inner: Mutex::new(Inner {
                segments,
                current_size,
            }),
        })
    }

    /// Append one frame's worth of records, sealing and rolling to a fresh
    /// segment first if it would overflow `MAX_REPLICATION_FILE_SIZE`.
    pub fn append_frame(
        &self,
        server_id: u32,
        meta: MetaData,
        top_level: &str,
        records: &[Record],
    ) -> EngineResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let bytes = encode_frame(server_id, meta, top_level, records)
            .context("encode replication frame")?;
        self.append(&bytes)
    }

    fn append(&self, bytes: &[u8]) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        if inner.current_size + bytes.len() as u64 > super::super::MAX_REPLICATION_FILE_SIZE {
            let next_number = inner.segments.last().map(|s| s.number + 1).unwrap_or(1);
            inner.segments.push(Segment {
                number: next_number,
                path: self.dir.join(segment_file_name(self.server_id, next_number)),
                lock: Arc::new(RwLock::new(())),
            });
            inner.current_size = 0;
        }
        let path = inner.segments.last().unwrap().path.clone();
        let _write_guard = inner.segments.last().unwrap().lock.write();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("open replication segment for append")?;
        file.write_all(bytes)
            .context("append to replication segment")?;
        inner.current_size += bytes.len() as u64;
        Ok(())
    }

    /// Read up to `MAX_REPLICATION_BUFFER` bytes of frames for `peer_id`
    /// starting at `cursor`, skipping any frame whose origin is `peer_id`
    /// itself (cycle suppression, spec invariant 5). Returns the raw bytes
    /// and the cursor the peer should resume from next.
    pub fn read_for(&self, peer_id: u32, cursor: Cursor) -> EngineResult<(Vec<u8>, Cursor)> {
        let (path, seg_lock, segment_count, last_number) = {
            let inner = self.inner.lock();
            let Some(seg) = inner.segments.iter().find(|s| s.number == cursor.segment) else {
                return Ok((Vec::new(), cursor));
            };
            (
                seg.path.clone(),
                seg.lock.clone(),
                inner.segments.len(),
                inner.segments.last().map(|s| s.number).unwrap_or(cursor.segment),
            )
        };

        let _read_guard = seg_lock.read();
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), cursor))
            }
            Err(e) => return Err(EngineError::Io(e)),
        };
        file.seek(SeekFrom::Start(cursor.offset))
            .context("seek replication segment")?;

        let mut out = Vec::new();
        let mut pos = cursor.offset;
        loop {
            let before = pos;
            let mut peek = [0u8; ReplicationPacketHeader::ENCODED_LEN];
            let n = read_fill(&mut file, &mut peek)?;
            if n < peek.len() {
                // EOF mid-header: nothing more in this segment right now.
                break;
            }
            let mut header_reader = &peek[..];
            let header = match ReplicationPacketHeader::decode_from(&mut header_reader) {
                Ok(h) => h,
                Err(_) => break,
            };
            let mut body = vec![0u8; header.packet_size as usize];
            let got = read_fill(&mut file, &mut body)?;
            if got < body.len() {
                // Partial frame at the tail -- stop before it, a later append
                // will complete it.
                break;
            }
            pos = before + peek.len() as u64 + body.len() as u64;

            if header.server_id != peer_id {
                out.extend_from_slice(&peek);
                out.extend_from_slice(&body);
            }

            if out.len() >= super::super::MAX_BUF_SIZE {
                return Ok((out, Cursor { segment: cursor.segment, offset: pos }));
            }
        }

        if cursor.segment < last_number && segment_count > 0 {
            return Ok((out, Cursor { segment: cursor.segment + 1, offset: 0 }));
        }
        Ok((out, Cursor { segment: cursor.segment, offset: pos }))
    }

    /// Delete segments whose mtime is older than `keep_time` seconds,
    /// never the currently writable (last) segment.
    pub fn sweep_retention(&self, keep_time: u64, now: std::time::SystemTime) {
        if keep_time == 0 {
            return;
        }
        let inner = self.inner.lock();
        let Some((_, rest)) = inner.segments.split_last() else {
            return;
        };
        for seg in rest {
            if let Ok(meta) = fs::metadata(&seg.path) {
                if let Ok(modified) = meta.modified() {
                    if let Ok(age) = now.duration_since(modified) {
                        if age.as_secs() > keep_time {
                            let _ = fs::remove_file(&seg.path);
                        }
                    }
                }
            }
        }
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }
}

fn read_fill(file: &mut File, buf: &mut [u8]) -> EngineResult<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => return Err(EngineError::Io(e)),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::item::ItemHeader;
    use crate::engine::key::{Key, KeyType};
    use crate::engine::tag::pack;
    use bytes::Bytes;

    #[test]
    fn append_then_read_back_skips_own_origin() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReplicationLog::open(dir.path(), 1).unwrap();
        let meta = MetaData::new(KeyType::U32, KeyType::Str);
        let header = ItemHeader {
            live_to: 0,
            size: 7,
            tag: pack(1_000_000, 1),
        };
        let rec = Record::put(
            Key::U32(1),
            Key::Str("k".into()),
            header,
            Bytes::from_static(b"1234567"),
        );
        log.append_frame(1, meta, "t", &[rec]).unwrap();

        let (bytes_for_peer2, _) = log
            .read_for(2, Cursor { segment: 1, offset: 0 })
            .unwrap();
        assert!(!bytes_for_peer2.is_empty());

        let (bytes_for_self, _) = log
            .read_for(1, Cursor { segment: 1, offset: 0 })
            .unwrap();
        assert!(bytes_for_self.is_empty());
    }
}
