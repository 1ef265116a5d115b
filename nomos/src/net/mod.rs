/*
 * This file is a part of Nomos
*/

//! The client-facing TCP protocol (spec §13): a minimal line-based command
//! set over `IndexDirectory`. Grounded in the teacher's `dbnet` accept loop --
//! a semaphore-bounded connection limit, a broadcast shutdown signal, and a
//! `NetBackoff` for transient accept errors -- but with a much simpler
//! per-connection handler, since this protocol is not the focus of the crate.

use crate::engine::directory::IndexDirectory;
use crate::engine::error::EngineError;
use crate::engine::key::{Key, KeyType};
use crate::registry;
use bytes::Bytes;
use std::cell::Cell;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::time;

/// Exponential backoff for the accept loop, grounded in the teacher's own
/// `NetBackoff` (`server/src/dbnet/mod.rs`).
struct NetBackoff {
    c: Cell<u8>,
}

impl NetBackoff {
    const MAX_BACKOFF: u8 = 64;

    fn new() -> Self {
        Self { c: Cell::new(1) }
    }

    async fn spin(&self) {
        time::sleep(Duration::from_secs(self.c.get() as u64)).await;
        self.c.set(self.c.get().saturating_mul(2));
    }

    fn should_disconnect(&self) -> bool {
        self.c.get() > Self::MAX_BACKOFF
    }
}

pub struct ClientServer {
    directory: Arc<IndexDirectory>,
    climit: Arc<Semaphore>,
    buffer_size: usize,
    cmd_timeout: Duration,
}

impl ClientServer {
    pub fn new(
        directory: Arc<IndexDirectory>,
        max_connections: usize,
        buffer_size: usize,
        cmd_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            climit: Arc::new(Semaphore::new(max_connections.max(1))),
            buffer_size: buffer_size.max(1),
            cmd_timeout,
        }
    }

    pub async fn run(
        self: Arc<Self>,
        host: IpAddr,
        port: u16,
        mut shutdown: broadcast::Receiver<()>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind((host, port)).await?;
        log::info!("client protocol listening on {host}:{port}");
        loop {
            tokio::select! {
                accepted = accept_with_backoff(&listener) => {
                    let stream = match accepted {
                        Ok(s) => s,
                        Err(e) => {
                            log::error!("accept loop giving up: {e}");
                            return Err(e);
                        }
                    };
                    let permit = self.climit.clone().acquire_owned().await.unwrap();
                    let directory = self.directory.clone();
                    let rx = shutdown.resubscribe();
                    let buffer_size = self.buffer_size;
                    let cmd_timeout = self.cmd_timeout;
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) =
                            serve_connection(stream, directory, rx, buffer_size, cmd_timeout).await
                        {
                            log::debug!("connection closed: {e}");
                        }
                    });
                }
                _ = shutdown.recv() => {
                    log::info!("client protocol accept loop shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn accept_with_backoff(listener: &TcpListener) -> std::io::Result<TcpStream> {
    let backoff = NetBackoff::new();
    loop {
        match listener.accept().await {
            Ok((stream, _)) => return Ok(stream),
            Err(e) => {
                if backoff.should_disconnect() {
                    return Err(e);
                }
            }
        }
        backoff.spin().await;
    }
}

async fn serve_connection(
    stream: TcpStream,
    directory: Arc<IndexDirectory>,
    mut shutdown: broadcast::Receiver<()>,
    buffer_size: usize,
    cmd_timeout: Duration,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::with_capacity(buffer_size, read_half).lines();
    loop {
        let line = tokio::select! {
            line = time::timeout(cmd_timeout, lines.next_line()) => match line {
                Ok(line) => line?,
                Err(_) => {
                    log::debug!("connection idle for {cmd_timeout:?}, closing");
                    return Ok(());
                }
            },
            _ = shutdown.recv() => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = dispatch(&directory, &line);
        write_half.write_all(reply.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }
}

fn dispatch(directory: &IndexDirectory, line: &str) -> String {
    let args = libnomos::split_into_args(line);
    let Some(cmd) = args.first() else {
        return "-ERR empty command".into();
    };
    let now = registry::wall_clock_seconds();
    match cmd.to_ascii_uppercase().as_str() {
        "CREATE" => handle_create(directory, &args),
        "PUT" => handle_put(directory, &args, now),
        "GET" => handle_get(directory, &args, now),
        "TOUCH" => handle_touch(directory, &args, now),
        "REMOVE" => handle_remove(directory, &args, now),
        other => format!("-ERR unknown command '{other}'"),
    }
}

fn parse_key_type(s: &str) -> Result<KeyType, String> {
    match s.to_ascii_uppercase().as_str() {
        "STR" | "STRING" => Ok(KeyType::Str),
        "U32" => Ok(KeyType::U32),
        "U64" => Ok(KeyType::U64),
        other => Err(format!("unknown key type '{other}'")),
    }
}

fn parse_key(s: &str, ty: KeyType) -> Result<Key, String> {
    match ty {
        KeyType::Str => Ok(Key::Str(s.to_string())),
        KeyType::U32 => s.parse().map(Key::U32).map_err(|e| format!("bad u32 key: {e}")),
        KeyType::U64 => s.parse().map(Key::U64).map_err(|e| format!("bad u64 key: {e}")),
    }
}

fn engine_err_reply(e: EngineError) -> String {
    match e {
        EngineError::NotFound => "-NOTFOUND".into(),
        EngineError::ShuttingDown => "-ERR server is shutting down".into(),
        other => format!("-ERR {other}"),
    }
}

fn handle_create(directory: &IndexDirectory, args: &[String]) -> String {
    if args.len() != 4 {
        return "-ERR usage: CREATE <top_level> <sub_type> <item_type>".into();
    }
    let sub_type = match parse_key_type(&args[2]) {
        Ok(t) => t,
        Err(e) => return format!("-ERR {e}"),
    };
    let item_type = match parse_key_type(&args[3]) {
        Ok(t) => t,
        Err(e) => return format!("-ERR {e}"),
    };
    match directory.create(&args[1], sub_type, item_type) {
        Ok(()) => "+OK".into(),
        Err(e) => engine_err_reply(e),
    }
}

fn handle_put(directory: &IndexDirectory, args: &[String], now: u32) -> String {
    if args.len() != 6 {
        return "-ERR usage: PUT <top_level> <sub_level> <item_key> <live_to> <value>".into();
    }
    let Some((sub_ty, item_ty)) = directory.key_types(&args[1]).or_else(|| {
        directory
            .ensure_top_level(&args[1])
            .ok()
    }) else {
        return "-ERR could not resolve top-level key types".into();
    };
    let sub_level = match parse_key(&args[2], sub_ty) {
        Ok(k) => k,
        Err(e) => return format!("-ERR {e}"),
    };
    let item_key = match parse_key(&args[3], item_ty) {
        Ok(k) => k,
        Err(e) => return format!("-ERR {e}"),
    };
    let live_to: u32 = match args[4].parse() {
        Ok(v) => v,
        Err(e) => return format!("-ERR bad live_to: {e}"),
    };
    let value = Bytes::from(args[5].clone().into_bytes());
    match directory.put(&args[1], sub_level, item_key, value, live_to, true, now) {
        Ok(()) => "+OK".into(),
        Err(e) => engine_err_reply(e),
    }
}

fn handle_get(directory: &IndexDirectory, args: &[String], now: u32) -> String {
    if args.len() != 4 {
        return "-ERR usage: GET <top_level> <sub_level> <item_key>".into();
    }
    let Some((sub_ty, item_ty)) = directory.key_types(&args[1]) else {
        return "-NOTFOUND".into();
    };
    let sub_level = match parse_key(&args[2], sub_ty) {
        Ok(k) => k,
        Err(e) => return format!("-ERR {e}"),
    };
    let item_key = match parse_key(&args[3], item_ty) {
        Ok(k) => k,
        Err(e) => return format!("-ERR {e}"),
    };
    match directory.find(&args[1], &sub_level, &item_key, now, 0) {
        Ok(value) => format!("+{}", String::from_utf8_lossy(&value)),
        Err(e) => engine_err_reply(e),
    }
}

fn handle_touch(directory: &IndexDirectory, args: &[String], now: u32) -> String {
    if args.len() != 5 {
        return "-ERR usage: TOUCH <top_level> <sub_level> <item_key> <set_time>".into();
    }
    let Some((sub_ty, item_ty)) = directory.key_types(&args[1]) else {
        return "-NOTFOUND".into();
    };
    let sub_level = match parse_key(&args[2], sub_ty) {
        Ok(k) => k,
        Err(e) => return format!("-ERR {e}"),
    };
    let item_key = match parse_key(&args[3], item_ty) {
        Ok(k) => k,
        Err(e) => return format!("-ERR {e}"),
    };
    let set_time: u32 = match args[4].parse() {
        Ok(v) => v,
        Err(e) => return format!("-ERR bad set_time: {e}"),
    };
    match directory.touch(&args[1], sub_level, item_key, set_time, now) {
        Ok(()) => "+OK".into(),
        Err(e) => engine_err_reply(e),
    }
}

fn handle_remove(directory: &IndexDirectory, args: &[String], now: u32) -> String {
    if args.len() != 4 {
        return "-ERR usage: REMOVE <top_level> <sub_level> <item_key>".into();
    }
    let Some((sub_ty, item_ty)) = directory.key_types(&args[1]) else {
        return "-NOTFOUND".into();
    };
    let sub_level = match parse_key(&args[2], sub_ty) {
        Ok(k) => k,
        Err(e) => return format!("-ERR {e}"),
    };
    let item_key = match parse_key(&args[3], item_ty) {
        Ok(k) => k,
        Err(e) => return format!("-ERR {e}"),
    };
    match directory.remove(&args[1], sub_level, item_key, now) {
        Ok(()) => "+OK".into(),
        Err(e) => engine_err_reply(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::directory::IndexDirectoryConfig;

    fn directory(dir: &std::path::Path) -> Arc<IndexDirectory> {
        IndexDirectory::new(IndexDirectoryConfig {
            data_path: dir.join("data"),
            default_sub_level_type: KeyType::Str,
            default_item_type: KeyType::Str,
            auto_create_top_index: true,
            sync_threads_count: 1,
            server_id: None,
            replication_log_keep_time: 0,
            replication_log_path: dir.join("repl"),
        })
        .unwrap()
    }

    #[test]
    fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let directory = directory(dir.path());
        assert_eq!(
            dispatch(&directory, r#"PUT users sl k 0 "hello world""#),
            "+OK"
        );
        assert_eq!(dispatch(&directory, "GET users sl k"), "+hello world");
    }

    #[test]
    fn get_on_missing_key_reports_notfound() {
        let dir = tempfile::tempdir().unwrap();
        let directory = directory(dir.path());
        dispatch(&directory, "CREATE users STR STR");
        assert_eq!(dispatch(&directory, "GET users sl nope"), "-NOTFOUND");
    }

    #[test]
    fn create_rejects_duplicate_top_level() {
        let dir = tempfile::tempdir().unwrap();
        let directory = directory(dir.path());
        assert_eq!(dispatch(&directory, "CREATE t STR STR"), "+OK");
        assert!(dispatch(&directory, "CREATE t STR STR").starts_with("-ERR"));
    }

    #[test]
    fn remove_then_get_is_notfound() {
        let dir = tempfile::tempdir().unwrap();
        let directory = directory(dir.path());
        dispatch(&directory, "PUT users sl k 0 v");
        assert_eq!(dispatch(&directory, "REMOVE users sl k"), "+OK");
        assert_eq!(dispatch(&directory, "GET users sl k"), "-NOTFOUND");
    }
}
