/*
 * This file is a part of Nomos
*/

//! A single named namespace: its sub-level → shard map, its pending
//! mutation queues, and the data/header segment files that back it.

use crate::engine::error::{EngineResult, ErrorContext};
use crate::engine::item::{ItemHeader, StoredItem, TOMBSTONE};
use crate::engine::key::Key;
use crate::engine::key::KeyType;
use crate::engine::meta::MetaData;
use crate::engine::record::{Cmd, Record};
use crate::engine::replication::log::ReplicationLog;
use crate::engine::shard::ShardSet;
use crate::engine::tag::TagClock;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct PendingQueues {
    data: Vec<Record>,
    header: Vec<Record>,
}

struct OpenSegment {
    file: BufWriter<File>,
    size: u64,
}

#[derive(Default)]
struct IoState {
    data: Option<OpenSegment>,
    header: Option<OpenSegment>,
}

pub struct TopLevelIndex {
    pub name: String,
    pub meta: MetaData,
    dir_path: PathBuf,
    tag_clock: Arc<TagClock>,
    server_id: Option<u32>,
    sub_levels: RwLock<HashMap<Key, Arc<ShardSet>>>,
    pending: Mutex<PendingQueues>,
    io: Mutex<IoState>,
    segment_seq: AtomicU32,
}

impl TopLevelIndex {
    pub fn new(
        name: String,
        meta: MetaData,
        dir_path: PathBuf,
        tag_clock: Arc<TagClock>,
        server_id: Option<u32>,
    ) -> Self {
        Self {
            name,
            meta,
            dir_path,
            tag_clock,
            server_id,
            sub_levels: RwLock::new(HashMap::new()),
            pending: Mutex::new(PendingQueues::default()),
            io: Mutex::new(IoState::default()),
            segment_seq: AtomicU32::new(0),
        }
    }

    fn sub_level_type(&self) -> KeyType {
        self.meta
            .sub_level_key_type()
            .expect("meta validated at construction")
    }
    fn item_type(&self) -> KeyType {
        self.meta
            .item_key_type()
            .expect("meta validated at construction")
    }

    fn shards_for(&self, sub_level: &Key) -> Arc<ShardSet> {
        if let Some(s) = self.sub_levels.read().get(sub_level) {
            return s.clone();
        }
        self.sub_levels
            .write()
            .entry(sub_level.clone())
            .or_insert_with(|| Arc::new(ShardSet::new()))
            .clone()
    }

    fn enqueue_data(&self, record: Record) {
        self.pending.lock().data.push(record);
    }
    fn enqueue_header(&self, record: Record) {
        self.pending.lock().header.push(record);
    }

    // -- mutation path ----------------------------------------------------

    pub fn put(
        &self,
        sub_level: Key,
        item_key: Key,
        value: Bytes,
        live_to: u32,
        check_before_replace: bool,
        now: u32,
    ) {
        let shards = self.shards_for(&sub_level);

        if check_before_replace {
            if let Some(old) = shards.get(&item_key) {
                if old.payload == value {
                    let delta = (live_to as i64 - old.header.live_to as i64).unsigned_abs();
                    if delta > super::MIN_SYNC_PUT_UPDATE_TIME {
                        let tag = self.tag_clock.stamp(now);
                        let new_header = ItemHeader {
                            live_to,
                            size: old.header.size,
                            tag,
                        };
                        let new_item = Arc::new(StoredItem {
                            header: new_header,
                            payload: old.payload.clone(),
                        });
                        shards.put(item_key.clone(), new_item);
                        self.enqueue_header(Record::touch(sub_level, item_key, new_header));
                    }
                    return;
                }
            }
        }

        let tag = self.tag_clock.stamp(now);
        let header = ItemHeader {
            live_to,
            size: value.len() as u32,
            tag,
        };
        let item = Arc::new(StoredItem {
            header,
            payload: value.clone(),
        });
        let old = shards.put(item_key.clone(), item);
        self.enqueue_data(Record::put(
            sub_level.clone(),
            item_key.clone(),
            header,
            value,
        ));
        if let Some(old_item) = old {
            self.enqueue_header(Record::remove(sub_level, item_key, old_item.header));
        }
    }

    pub fn find(
        &self,
        sub_level: &Key,
        item_key: &Key,
        now: u32,
        lifetime_touch: u32,
    ) -> Option<Bytes> {
        let shards = self.shards_for(sub_level);
        let existing = shards.get(item_key)?;
        if existing.header.is_tombstone() {
            return None;
        }
        if existing.header.is_expired(now) {
            shards.remove(item_key);
            return None;
        }
        if lifetime_touch > 0 {
            self.apply_touch(
                &shards,
                sub_level.clone(),
                item_key.clone(),
                lifetime_touch,
                now,
                &existing,
            );
        }
        Some(existing.payload.clone())
    }

    pub fn touch(&self, sub_level: Key, item_key: Key, set_time: u32, now: u32) -> bool {
        let shards = self.shards_for(&sub_level);
        match shards.get(&item_key) {
            Some(existing) if !existing.header.is_dead(now) => {
                self.apply_touch(&shards, sub_level, item_key, set_time, now, &existing);
                true
            }
            _ => false,
        }
    }

    fn apply_touch(
        &self,
        shards: &Arc<ShardSet>,
        sub_level: Key,
        item_key: Key,
        set_time: u32,
        now: u32,
        old: &Arc<StoredItem>,
    ) {
        let new_live_to = if set_time == 0 {
            0
        } else {
            now.saturating_add(set_time)
        };
        let delta = (new_live_to as i64 - old.header.live_to as i64).unsigned_abs();
        let threshold = (set_time as f64 * super::MIN_SYNC_TOUCH_TIME_PERCENT) as u64;
        if delta > threshold {
            let tag = self.tag_clock.stamp(now);
            let new_header = ItemHeader {
                live_to: new_live_to,
                size: old.header.size,
                tag,
            };
            let new_item = Arc::new(StoredItem {
                header: new_header,
                payload: old.payload.clone(),
            });
            shards.put(item_key.clone(), new_item);
            self.enqueue_header(Record::touch(sub_level, item_key, new_header));
        }
    }

    pub fn remove(&self, sub_level: Key, item_key: Key, now: u32) -> bool {
        let shards = self.shards_for(&sub_level);
        if shards.remove(&item_key).is_none() {
            return false;
        }
        let tag = self.tag_clock.stamp(now);
        let header = ItemHeader {
            live_to: TOMBSTONE,
            size: 0,
            tag,
        };
        self.enqueue_header(Record::remove(sub_level, item_key, header));
        true
    }

    /// Apply one decoded replication entry. `peer_id` is only used by the
    /// caller for cycle-suppression before this is reached; by the time we're
    /// here the record's own header carries the tag that decides everything.
    pub fn apply_remote_frame(&self, sub_level: Key, item_key: Key, incoming: Record, _now: u32) {
        let shards = self.shards_for(&sub_level);
        match shards.get(&item_key) {
            Some(old) => {
                use std::cmp::Ordering::*;
                match incoming.header.tag.cmp(&old.header.tag) {
                    Equal => {
                        if incoming.cmd == Cmd::Remove {
                            shards.remove(&item_key);
                            self.enqueue_header(Record::remove(sub_level, item_key, incoming.header));
                        }
                    }
                    Greater => {
                        self.apply_incoming(&shards, sub_level, item_key, incoming, Some(old.header));
                    }
                    Less => {}
                }
            }
            None => match incoming.cmd {
                Cmd::Remove => {}
                _ => self.apply_incoming(&shards, sub_level, item_key, incoming, None),
            },
        }
    }

    fn apply_incoming(
        &self,
        shards: &Arc<ShardSet>,
        sub_level: Key,
        item_key: Key,
        incoming: Record,
        old_header: Option<ItemHeader>,
    ) {
        match incoming.cmd {
            Cmd::Touch => {
                if let Some(old) = shards.get(&item_key) {
                    let new_item = Arc::new(StoredItem {
                        header: incoming.header,
                        payload: old.payload.clone(),
                    });
                    shards.put(item_key.clone(), new_item);
                    self.enqueue_header(Record::touch(sub_level, item_key, incoming.header));
                }
                // a TOUCH on a key this node has never seen a PUT for carries
                // no payload to materialize an item from; nothing to apply.
            }
            Cmd::Put => {
                let payload = incoming.payload.clone().unwrap_or_default();
                let item = Arc::new(StoredItem {
                    header: incoming.header,
                    payload: payload.clone(),
                });
                shards.put(item_key.clone(), item);
                if let Some(old) = old_header {
                    self.enqueue_header(Record::remove(sub_level.clone(), item_key.clone(), old));
                }
                self.enqueue_data(Record::put(sub_level, item_key, incoming.header, payload));
            }
            Cmd::Remove => {
                shards.remove(&item_key);
                self.enqueue_header(Record::remove(sub_level, item_key, incoming.header));
            }
            Cmd::Unknown => {}
        }
    }

    pub fn clear_old(&self, now: u32) {
        let levels: Vec<Arc<ShardSet>> = self.sub_levels.read().values().cloned().collect();
        for shards in levels {
            shards.retain(|_, item| !item.header.is_dead(now));
        }
    }

    // -- durability path ----------------------------------------------------

    /// Drain the pending queues to disk. Non-blocking unless `force`. Returns
    /// `Ok(false)` only when a non-forced call could not acquire the I/O lock.
    pub fn sync(
        &self,
        now: u32,
        force: bool,
        replication: Option<&ReplicationLog>,
    ) -> EngineResult<bool> {
        let mut io = if force {
            self.io.lock()
        } else {
            match self.io.try_lock() {
                Some(g) => g,
                None => return Ok(false),
            }
        };

        let (data_batch, header_batch) = {
            let mut pending = self.pending.lock();
            (
                std::mem::take(&mut pending.data),
                std::mem::take(&mut pending.header),
            )
        };
        if data_batch.is_empty() && header_batch.is_empty() {
            return Ok(true);
        }

        if !data_batch.is_empty() {
            self.write_batch(&mut io.data, "data", now, &data_batch)?;
        }
        if !header_batch.is_empty() {
            self.write_batch(&mut io.header, "header", now, &header_batch)?;
        }

        if let (Some(repl), Some(server_id)) = (replication, self.server_id) {
            let mut all = Vec::with_capacity(data_batch.len() + header_batch.len());
            all.extend(data_batch);
            all.extend(header_batch);
            repl.append_frame(server_id, self.meta, &self.name, &all)?;
        }

        Ok(true)
    }

    fn write_batch(
        &self,
        slot: &mut Option<OpenSegment>,
        kind: &'static str,
        now: u32,
        batch: &[Record],
    ) -> EngineResult<()> {
        if slot.is_none() {
            *slot = Some(self.open_new_segment(kind, now)?);
        }
        for record in batch {
            let mut buf = Vec::new();
            record
                .encode_to(&mut buf)
                .context(format!("encode {kind} record"))?;
            {
                let seg = slot.as_ref().unwrap();
                if seg.size > 0 && seg.size + buf.len() as u64 > super::MAX_FILE_SIZE {
                    drop(slot.take());
                    *slot = Some(self.open_new_segment(kind, now)?);
                }
            }
            let seg = slot.as_mut().unwrap();
            seg.file
                .write_all(&buf)
                .context(format!("write {kind} record"))?;
            seg.size += buf.len() as u64;
        }
        slot.as_mut()
            .unwrap()
            .file
            .flush()
            .context(format!("flush {kind} segment"))?;
        Ok(())
    }

    fn open_new_segment(&self, kind: &str, now: u32) -> EngineResult<OpenSegment> {
        let idx = self.segment_seq.fetch_add(1, Ordering::SeqCst);
        let filename = format!("{kind}_{now}_{idx}");
        let path = self.dir_path.join(&filename);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!("open {filename}"))?;
        let mut writer = BufWriter::new(file);
        self.meta.write_to(&mut writer).context("write segment meta")?;
        Ok(OpenSegment { file: writer, size: 3 })
    }

    fn list_segment_files(&self) -> EngineResult<(Vec<PathBuf>, Vec<PathBuf>)> {
        let mut data = Vec::new();
        let mut header = Vec::new();
        if !self.dir_path.exists() {
            return Ok((data, header));
        }
        for entry in fs::read_dir(&self.dir_path).context("list segment dir")? {
            let entry = entry.context("dir entry")?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name.as_ref() == ".meta" {
                continue;
            }
            if name.starts_with("data_") {
                data.push(entry.path());
            } else if name.starts_with("header_") {
                header.push(entry.path());
            }
        }
        data.sort();
        header.sort();
        Ok((data, header))
    }

    fn seed_segment_seq(&self, files: &[PathBuf]) {
        let mut max_idx = 0u32;
        for f in files {
            if let Some(name) = f.file_name().and_then(|n| n.to_str()) {
                let trimmed = name.trim_end_matches("_pack");
                if let Some(idx_str) = trimmed.rsplit('_').next() {
                    if let Ok(idx) = idx_str.parse::<u32>() {
                        max_idx = max_idx.max(idx);
                    }
                }
            }
        }
        self.segment_seq.fetch_max(max_idx + 1, Ordering::SeqCst);
    }

    fn fold_header_file(
        &self,
        path: &Path,
        multimap: &mut HashMap<(Key, Key), (Cmd, ItemHeader)>,
    ) -> EngineResult<()> {
        let file = File::open(path).context("open header file")?;
        let mut reader = BufReader::new(file);
        let meta = match MetaData::read_from(&mut reader) {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };
        if meta.check_compatible(&self.meta).is_err() {
            log::warn!("skipping header file {path:?}: version mismatch");
            return Ok(());
        }
        loop {
            match Record::decode_from(&mut reader, self.sub_level_type(), self.item_type()) {
                Ok(rec) => {
                    let key = (rec.sub_level.clone(), rec.item_key.clone());
                    let better = match multimap.get(&key) {
                        None => true,
                        Some((old_cmd, old_header)) => {
                            rec.header.tag > old_header.tag
                                || (rec.header.tag == old_header.tag
                                    && rec.cmd == Cmd::Remove
                                    && *old_cmd != Cmd::Remove)
                        }
                    };
                    if better {
                        multimap.insert(key, (rec.cmd, rec.header));
                    }
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Rebuild in-memory state from every segment file on disk.
    pub fn load(&self, now: u32) -> EngineResult<()> {
        let (data_files, header_files) = self.list_segment_files()?;
        self.seed_segment_seq(&data_files);
        self.seed_segment_seq(&header_files);

        let mut multimap: HashMap<(Key, Key), (Cmd, ItemHeader)> = HashMap::new();
        for path in &header_files {
            self.fold_header_file(path, &mut multimap)?;
        }
        for path in &data_files {
            self.load_one_data_file(path, &multimap, now)?;
        }
        Ok(())
    }

    fn load_one_data_file(
        &self,
        path: &Path,
        multimap: &HashMap<(Key, Key), (Cmd, ItemHeader)>,
        now: u32,
    ) -> EngineResult<()> {
        let file = File::open(path).context("open data file")?;
        let mut reader = BufReader::new(file);
        let meta = match MetaData::read_from(&mut reader) {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };
        if meta.check_compatible(&self.meta).is_err() {
            log::warn!("skipping data file {path:?} on load: version mismatch");
            return Ok(());
        }
        loop {
            match Record::decode_from(&mut reader, self.sub_level_type(), self.item_type()) {
                Ok(mut rec) => {
                    let key = (rec.sub_level.clone(), rec.item_key.clone());
                    let mut drop_record = false;
                    if let Some((cmd, header)) = multimap.get(&key) {
                        match cmd {
                            Cmd::Remove if header.tag >= rec.header.tag => drop_record = true,
                            Cmd::Touch if header.tag > rec.header.tag => {
                                rec.header.live_to = header.live_to;
                                rec.header.tag = header.tag;
                            }
                            _ => {}
                        }
                    }
                    if !drop_record && rec.header.is_expired(now) {
                        drop_record = true;
                    }
                    if drop_record {
                        continue;
                    }
                    let shards = self.shards_for(&rec.sub_level);
                    let should_insert = match shards.get(&rec.item_key) {
                        Some(existing) => rec.header.tag > existing.header.tag,
                        None => true,
                    };
                    if should_insert {
                        let payload = rec.payload.clone().unwrap_or_default();
                        shards.put(
                            rec.item_key.clone(),
                            Arc::new(StoredItem {
                                header: rec.header,
                                payload,
                            }),
                        );
                    }
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Offline compaction: reconcile header mutations into data files,
    /// dropping dead weight, then unlink the header files they came from.
    pub fn pack(&self, now: u32) -> EngineResult<()> {
        {
            let mut io = self.io.lock();
            io.data.take();
            io.header.take();
        }

        let (data_files, header_files) = self.list_segment_files()?;

        let mut multimap: HashMap<(Key, Key), (Cmd, ItemHeader)> = HashMap::new();
        for path in &header_files {
            self.fold_header_file(path, &mut multimap)?;
        }

        for path in &data_files {
            self.pack_one_data_file(path, &multimap, now)?;
        }

        for path in &header_files {
            let _ = fs::remove_file(path);
        }

        Ok(())
    }

    fn pack_one_data_file(
        &self,
        path: &Path,
        multimap: &HashMap<(Key, Key), (Cmd, ItemHeader)>,
        now: u32,
    ) -> EngineResult<()> {
        let file = File::open(path).context("open data file")?;
        let mut reader = BufReader::new(file);
        let meta = match MetaData::read_from(&mut reader) {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };
        if meta.check_compatible(&self.meta).is_err() {
            log::warn!("skipping data file {path:?} during pack: version mismatch");
            return Ok(());
        }

        let mut survivors = Vec::new();
        let mut changed = false;
        loop {
            match Record::decode_from(&mut reader, self.sub_level_type(), self.item_type()) {
                Ok(mut rec) => {
                    let key = (rec.sub_level.clone(), rec.item_key.clone());
                    let mut drop_record = false;
                    if let Some((cmd, header)) = multimap.get(&key) {
                        match cmd {
                            Cmd::Remove if header.tag >= rec.header.tag => drop_record = true,
                            Cmd::Touch if header.tag > rec.header.tag => {
                                rec.header.live_to = header.live_to;
                                rec.header.tag = header.tag;
                                changed = true;
                            }
                            _ => {}
                        }
                    }
                    if !drop_record && rec.header.is_expired(now) {
                        drop_record = true;
                    }
                    if drop_record {
                        changed = true;
                    } else {
                        survivors.push(rec);
                    }
                }
                Err(_) => break,
            }
        }

        if !changed {
            return Ok(());
        }

        let staged_name = format!(".{}", path.file_name().unwrap().to_string_lossy());
        let staged_path = self.dir_path.join(&staged_name);

        let write_result: EngineResult<()> = (|| {
            let out = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&staged_path)
                .context("open staged pack file")?;
            let mut writer = BufWriter::new(out);
            self.meta.write_to(&mut writer).context("write staged meta")?;
            for rec in &survivors {
                rec.encode_to(&mut writer).context("write staged record")?;
            }
            writer.flush().context("flush staged pack file")?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = fs::remove_file(&staged_path);
            return Err(e);
        }

        if survivors.is_empty() {
            let _ = fs::remove_file(&staged_path);
            let _ = fs::remove_file(path);
            return Ok(());
        }

        let final_name = format!("{}_pack", path.file_name().unwrap().to_string_lossy());
        let final_path = self.dir_path.join(&final_name);
        fs::rename(&staged_path, &final_path).context("rename staged pack file")?;
        fs::remove_file(path).context("unlink superseded data file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::key::KeyType;

    fn index(dir: &Path) -> TopLevelIndex {
        fs::create_dir_all(dir).unwrap();
        TopLevelIndex::new(
            "t".into(),
            MetaData::new(KeyType::U32, KeyType::Str),
            dir.to_path_buf(),
            Arc::new(TagClock::new()),
            None,
        )
    }

    #[test]
    fn create_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        idx.put(
            Key::U32(1),
            Key::Str("k".into()),
            Bytes::from_static(b"1234567"),
            0,
            false,
            1_000_000,
        );
        let got = idx.find(&Key::U32(1), &Key::Str("k".into()), 1_000_000, 0);
        assert_eq!(got.unwrap(), Bytes::from_static(b"1234567"));
    }

    #[test]
    fn put_sync_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let idx = index(dir.path());
            idx.put(
                Key::U32(1),
                Key::Str("k".into()),
                Bytes::from_static(b"1234567"),
                0,
                false,
                1_000_000,
            );
            idx.sync(1_000_000, true, None).unwrap();
        }
        let idx2 = index(dir.path());
        idx2.load(1_000_000 + 3600).unwrap();
        let got = idx2.find(&Key::U32(1), &Key::Str("k".into()), 1_000_000 + 3600, 0);
        assert_eq!(got.unwrap(), Bytes::from_static(b"1234567"));
    }

    #[test]
    fn touch_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        idx.put(
            Key::U32(1),
            Key::Str("k".into()),
            Bytes::from_static(b"v"),
            1_000_000 + 3600,
            false,
            1_000_000,
        );
        assert!(idx.touch(Key::U32(1), Key::Str("k".into()), 10, 1_000_000));
        assert_eq!(idx.pending.lock().header.len(), 1);
        idx.pending.lock().header.clear();

        assert!(idx.touch(Key::U32(1), Key::Str("k".into()), 10, 1_000_000));
        assert_eq!(idx.pending.lock().header.len(), 0);
    }

    #[test]
    fn pack_drops_tombstone_keeps_live_item() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        idx.put(
            Key::U32(1),
            Key::Str("a".into()),
            Bytes::from_static(b"x"),
            0,
            false,
            1_000_000,
        );
        idx.sync(1_000_000, true, None).unwrap();
        idx.remove(Key::U32(1), Key::Str("a".into()), 1_000_000 + 1);
        idx.sync(1_000_000 + 1, true, None).unwrap();
        idx.put(
            Key::U32(1),
            Key::Str("b".into()),
            Bytes::from_static(b"1234567"),
            0,
            false,
            1_000_000 + 2,
        );
        idx.sync(1_000_000 + 2, true, None).unwrap();

        idx.pack(1_000_000 + 3).unwrap();
        idx.pack(1_000_000 + 3).unwrap();

        let idx2 = index(dir.path());
        idx2.load(1_000_000 + 3).unwrap();
        assert!(idx2
            .find(&Key::U32(1), &Key::Str("a".into()), 1_000_000 + 3, 0)
            .is_none());
        assert_eq!(
            idx2.find(&Key::U32(1), &Key::Str("b".into()), 1_000_000 + 3, 0)
                .unwrap(),
            Bytes::from_static(b"1234567")
        );
    }
}
