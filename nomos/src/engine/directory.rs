/*
 * This file is a part of Nomos
*/

//! The top of the engine: owns every `TopLevelIndex`, routes mutations to
//! them (auto-creating under the configured defaults), and wires up the
//! sync worker pool, the hourly maintenance thread and replication.

use crate::engine::error::{EngineError, EngineResult, ErrorContext};
use crate::engine::key::Key;
use crate::engine::key::KeyType;
use crate::engine::maintenance::{HourlyMaintenance, MaintenanceTarget};
use crate::engine::meta::MetaData;
use crate::engine::replication::client::FrameSink;
use crate::engine::replication::frame::Frame;
use crate::engine::replication::{ReplicationLog, ReplicationPeerClient, ReplicationPeerServer};
use crate::engine::syncpool::SyncWorkerPool;
use crate::engine::tag::TagClock;
use crate::engine::toplevel::TopLevelIndex;
use crate::registry;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct IndexDirectoryConfig {
    pub data_path: PathBuf,
    pub default_sub_level_type: KeyType,
    pub default_item_type: KeyType,
    pub auto_create_top_index: bool,
    pub sync_threads_count: usize,
    pub server_id: Option<u32>,
    pub replication_log_keep_time: u64,
    pub replication_log_path: PathBuf,
}

pub struct IndexDirectory {
    base_path: PathBuf,
    top_levels: RwLock<HashMap<String, Arc<TopLevelIndex>>>,
    tag_clock: Arc<TagClock>,
    server_id: Option<u32>,
    default_sub_level_type: KeyType,
    default_item_type: KeyType,
    auto_create: bool,
    sync_pool: SyncWorkerPool,
    replication_log: Option<Arc<ReplicationLog>>,
    replication_log_path: PathBuf,
    replication_log_keep_time: u64,
}

impl IndexDirectory {
    pub fn new(config: IndexDirectoryConfig) -> EngineResult<Arc<Self>> {
        fs::create_dir_all(&config.data_path).context("create data path")?;

        let replication_log = match config.server_id {
            Some(id) => Some(Arc::new(ReplicationLog::open(
                &config.replication_log_path,
                id,
            )?)),
            None => None,
        };

        let sync_pool = SyncWorkerPool::start(config.sync_threads_count, replication_log.clone());

        Ok(Arc::new(Self {
            base_path: config.data_path,
            top_levels: RwLock::new(HashMap::new()),
            tag_clock: Arc::new(TagClock::new()),
            server_id: config.server_id,
            default_sub_level_type: config.default_sub_level_type,
            default_item_type: config.default_item_type,
            auto_create: config.auto_create_top_index,
            sync_pool,
            replication_log,
            replication_log_path: config.replication_log_path,
            replication_log_keep_time: config.replication_log_keep_time,
        }))
    }

    pub fn create(&self, name: &str, sub_type: KeyType, item_type: KeyType) -> EngineResult<()> {
        if name.starts_with('.') {
            return Err(EngineError::Conflict(format!(
                "'{name}' is reserved for dotfiles"
            )));
        }
        if !super::is_valid_top_level_name(name) {
            return Err(EngineError::Conflict(format!("invalid top-level name '{name}'")));
        }
        let mut levels = self.top_levels.write();
        if levels.contains_key(name) {
            return Err(EngineError::Conflict(format!(
                "top-level '{name}' already exists"
            )));
        }
        let dir = self.base_path.join(name);
        fs::create_dir_all(&dir).context(format!("create top-level dir '{name}'"))?;
        let meta = MetaData::new(sub_type, item_type);
        let mut f = File::create(dir.join(".meta")).context("create .meta")?;
        meta.write_to(&mut f).context("write .meta")?;

        let top_level = Arc::new(TopLevelIndex::new(
            name.to_string(),
            meta,
            dir,
            self.tag_clock.clone(),
            self.server_id,
        ));
        levels.insert(name.to_string(), top_level);
        Ok(())
    }

    fn get_or_create(&self, name: &str) -> EngineResult<Arc<TopLevelIndex>> {
        if let Some(top) = self.top_levels.read().get(name) {
            return Ok(top.clone());
        }
        if !self.auto_create {
            return Err(EngineError::NotFound);
        }
        match self.create(name, self.default_sub_level_type, self.default_item_type) {
            Ok(()) | Err(EngineError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
        self.top_levels
            .read()
            .get(name)
            .cloned()
            .ok_or(EngineError::NotFound)
    }

    /// Like `get_or_create`, but for the replication-apply path: the
    /// top-level is materialized under the frame's own `MetaData` rather
    /// than this node's configured defaults, and always -- not only when
    /// `auto_create_top_index` is set. A replica must be able to reproduce
    /// any top-level it receives frames for, regardless of its own
    /// auto-create policy (spec.md line 48 applies equally here).
    fn get_or_create_for_replication(
        &self,
        name: &str,
        sub_type: KeyType,
        item_type: KeyType,
    ) -> EngineResult<Arc<TopLevelIndex>> {
        if let Some(top) = self.top_levels.read().get(name) {
            return Ok(top.clone());
        }
        match self.create(name, sub_type, item_type) {
            Ok(()) | Err(EngineError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
        self.top_levels
            .read()
            .get(name)
            .cloned()
            .ok_or(EngineError::NotFound)
    }

    pub fn put(
        &self,
        top_level: &str,
        sub_level: Key,
        item_key: Key,
        value: Bytes,
        live_to: u32,
        check_before_replace: bool,
        now: u32,
    ) -> EngineResult<()> {
        if registry::is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        let top = self.get_or_create(top_level)?;
        top.put(sub_level, item_key, value, live_to, check_before_replace, now);
        self.sync_pool.enqueue(top);
        Ok(())
    }

    pub fn find(
        &self,
        top_level: &str,
        sub_level: &Key,
        item_key: &Key,
        now: u32,
        lifetime_touch: u32,
    ) -> EngineResult<Bytes> {
        let top = self.get_or_create(top_level)?;
        let result = top.find(sub_level, item_key, now, lifetime_touch);
        if lifetime_touch > 0 && result.is_some() {
            self.sync_pool.enqueue(top);
        }
        result.ok_or(EngineError::NotFound)
    }

    pub fn touch(
        &self,
        top_level: &str,
        sub_level: Key,
        item_key: Key,
        set_time: u32,
        now: u32,
    ) -> EngineResult<()> {
        if registry::is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        let top = self.get_or_create(top_level)?;
        if top.touch(sub_level, item_key, set_time, now) {
            self.sync_pool.enqueue(top);
            Ok(())
        } else {
            Err(EngineError::NotFound)
        }
    }

    pub fn remove(
        &self,
        top_level: &str,
        sub_level: Key,
        item_key: Key,
        now: u32,
    ) -> EngineResult<()> {
        if registry::is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        let top = self.get_or_create(top_level)?;
        if top.remove(sub_level, item_key, now) {
            self.sync_pool.enqueue(top);
            Ok(())
        } else {
            Err(EngineError::NotFound)
        }
    }

    /// Rebuild every top-level found under the data path from its on-disk
    /// segments. Called once at startup.
    pub fn load(&self, now: u32) -> EngineResult<()> {
        if !self.base_path.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.base_path).context("list data path")? {
            let entry = entry.context("data path entry")?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let dir = entry.path();
            let mut meta_file = match File::open(dir.join(".meta")) {
                Ok(f) => f,
                Err(_) => continue,
            };
            let meta = MetaData::read_from(&mut meta_file)?;
            let top = Arc::new(TopLevelIndex::new(
                name.clone(),
                meta,
                dir,
                self.tag_clock.clone(),
                self.server_id,
            ));
            top.load(now)?;
            self.top_levels.write().insert(name, top);
        }
        Ok(())
    }

    /// Stop accepting new work and drain every top-level's pending queues
    /// synchronously. Invoked on SIGINT/SIGTERM.
    pub fn exit_flush(&self) {
        registry::begin_shutdown();
        self.sync_all(registry::wall_clock_seconds());
    }

    /// Force every top-level's pending queues to disk right now, without
    /// touching the shutdown flag. `exit_flush` is this plus the shutdown
    /// flag; tests that just want a deterministic flush point use this
    /// directly so they don't poison later test runs in the same process.
    pub fn sync_all(&self, now: u32) {
        for top in self.top_levels.read().values().cloned().collect::<Vec<_>>() {
            if let Err(e) = top.sync(now, true, self.replication_log.as_deref()) {
                log::error!("sync_all: sync failed for top-level '{}': {e}", top.name);
            }
        }
    }

    /// The key types a top-level was created with, for protocol layers that
    /// need to parse wire arguments into the right `Key` variant. `None` if
    /// the top-level doesn't exist (and auto-create is off, or hasn't run
    /// yet -- callers that want auto-create should `get_or_create` first).
    pub fn key_types(&self, top_level: &str) -> Option<(KeyType, KeyType)> {
        let top = self.top_levels.read().get(top_level).cloned()?;
        Some((top.meta.sub_level_key_type().ok()?, top.meta.item_key_type().ok()?))
    }

    pub fn ensure_top_level(&self, top_level: &str) -> EngineResult<(KeyType, KeyType)> {
        let top = self.get_or_create(top_level)?;
        Ok((top.meta.sub_level_key_type()?, top.meta.item_key_type()?))
    }

    pub fn start_maintenance(self: &Arc<Self>) -> HourlyMaintenance {
        HourlyMaintenance::start(self.clone())
    }

    /// `None` when replication is disabled (no `server_id` configured).
    pub fn replication_log(&self) -> Option<Arc<ReplicationLog>> {
        self.replication_log.clone()
    }

    pub fn spawn_replication_server(
        self: &Arc<Self>,
        host: IpAddr,
        port: u16,
        rt: &tokio::runtime::Handle,
        shutdown: broadcast::Receiver<()>,
    ) {
        let (Some(repl), Some(server_id)) = (&self.replication_log, self.server_id) else {
            return;
        };
        let server = Arc::new(ReplicationPeerServer::new(repl.clone(), server_id));
        rt.spawn(async move {
            if let Err(e) = server.run(host, port, shutdown).await {
                log::error!("replication server exited: {e}");
            }
        });
    }

    pub fn spawn_replication_clients(
        self: &Arc<Self>,
        masters: &[(IpAddr, u16)],
        rt: &tokio::runtime::Handle,
        shutdown: &broadcast::Sender<()>,
    ) {
        let Some(server_id) = self.server_id else {
            return;
        };
        for &(ip, port) in masters {
            let client = Arc::new(ReplicationPeerClient::new(
                SocketAddr::new(ip, port),
                server_id,
                self.replication_log_path.clone(),
                self.clone(),
            ));
            let rx = shutdown.subscribe();
            rt.spawn(async move {
                client.run(rx).await;
            });
        }
    }
}

impl MaintenanceTarget for IndexDirectory {
    fn top_levels_snapshot(&self) -> Vec<Arc<TopLevelIndex>> {
        self.top_levels.read().values().cloned().collect()
    }
    fn replication(&self) -> Option<Arc<ReplicationLog>> {
        self.replication_log.clone()
    }
    fn replication_log_keep_time(&self) -> u64 {
        self.replication_log_keep_time
    }
}

impl FrameSink for IndexDirectory {
    fn apply_remote_frame(&self, frame: Frame, peer_id: u32, now: u32) {
        if registry::is_shutting_down() {
            return;
        }
        if frame.header.server_id == peer_id {
            // belt-and-suspenders: read_for already filters these out.
            return;
        }
        let (sub_type, item_type) = match (
            frame.header.meta.sub_level_key_type(),
            frame.header.meta.item_key_type(),
        ) {
            (Ok(s), Ok(i)) => (s, i),
            _ => {
                log::warn!(
                    "dropping replication frame for '{}': malformed metadata",
                    frame.top_level
                );
                return;
            }
        };
        let top = match self.get_or_create_for_replication(&frame.top_level, sub_type, item_type) {
            Ok(top) => top,
            Err(e) => {
                log::warn!(
                    "dropping replication frame for '{}': {e}",
                    frame.top_level
                );
                return;
            }
        };
        for rec in frame.records {
            top.apply_remote_frame(rec.sub_level.clone(), rec.item_key.clone(), rec, now);
        }
        if let Err(e) = top.sync(now, true, self.replication_log.as_deref()) {
            log::error!(
                "apply_remote_frame: sync failed for top-level '{}': {e}",
                top.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> IndexDirectoryConfig {
        IndexDirectoryConfig {
            data_path: dir.join("data"),
            default_sub_level_type: KeyType::Str,
            default_item_type: KeyType::Str,
            auto_create_top_index: true,
            sync_threads_count: 1,
            server_id: None,
            replication_log_keep_time: 0,
            replication_log_path: dir.join("repl"),
        }
    }

    #[test]
    fn auto_create_on_put_then_find() {
        let dir = tempfile::tempdir().unwrap();
        let directory = IndexDirectory::new(config(dir.path())).unwrap();
        directory
            .put(
                "users",
                Key::Str("sl".into()),
                Key::Str("k".into()),
                Bytes::from_static(b"v"),
                0,
                false,
                1_000_000,
            )
            .unwrap();
        let got = directory
            .find("users", &Key::Str("sl".into()), &Key::Str("k".into()), 1_000_000, 0)
            .unwrap();
        assert_eq!(got, Bytes::from_static(b"v"));
    }

    #[test]
    fn explicit_create_rejects_duplicate_and_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        let directory = IndexDirectory::new(config(dir.path())).unwrap();
        directory.create("t", KeyType::U32, KeyType::Str).unwrap();
        assert!(matches!(
            directory.create("t", KeyType::U32, KeyType::Str),
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            directory.create(".hidden", KeyType::U32, KeyType::Str),
            Err(EngineError::Conflict(_))
        ));
    }
}
