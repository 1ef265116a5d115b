/*
 * This file is a part of Nomos
*/

//! Layered configuration: CLI flags override environment variables, which
//! override the TOML config file, which overrides the built-in defaults.
//! A deliberately simplified take on the teacher's `Configset`/
//! `TryFromConfigSource` machinery -- one merge pass instead of a generic
//! per-source trait hierarchy, since Nomos has far fewer tunables.

use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
const DEFAULT_PORT: u16 = 2100;
const DEFAULT_REPLICATION_PORT: u16 = 2101;

#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub worker_queue_length: usize,
    pub buffer_size: usize,
    pub max_free_buffers: usize,
    pub cmd_timeout: u64,
    pub data_path: PathBuf,
    pub default_sublevel_key_type: KeyTypeArg,
    pub default_item_key_type: KeyTypeArg,
    pub auto_create_top_index: bool,
    pub sync_threads_count: usize,
    pub server_id: Option<u32>,
    pub replication_log_keep_time: u64,
    pub replication_log_path: PathBuf,
    pub replication_port: u16,
    pub masters: Vec<(IpAddr, u16)>,
    pub host: IpAddr,
    pub port: u16,
    pub no_art: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: num_cpus_fallback(),
            worker_queue_length: 4096,
            buffer_size: libnomos::BUF_CAP,
            max_free_buffers: 128,
            cmd_timeout: 60,
            data_path: PathBuf::from("data"),
            default_sublevel_key_type: KeyTypeArg::Str,
            default_item_key_type: KeyTypeArg::Str,
            auto_create_top_index: true,
            sync_threads_count: 4,
            server_id: None,
            replication_log_keep_time: 7 * 24 * 3600,
            replication_log_path: PathBuf::from("data/.replication"),
            replication_port: DEFAULT_REPLICATION_PORT,
            masters: Vec::new(),
            host: DEFAULT_HOST,
            port: DEFAULT_PORT,
            no_art: false,
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyTypeArg {
    Str,
    U32,
    U64,
}

impl KeyTypeArg {
    pub fn to_engine(self) -> crate::engine::key::KeyType {
        match self {
            Self::Str => crate::engine::key::KeyType::Str,
            Self::U32 => crate::engine::key::KeyType::U32,
            Self::U64 => crate::engine::key::KeyType::U64,
        }
    }
}

impl std::str::FromStr for KeyTypeArg {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STR" | "STRING" => Ok(Self::Str),
            "U32" => Ok(Self::U32),
            "U64" => Ok(Self::U64),
            other => Err(format!("unknown key type '{other}'")),
        }
    }
}

/// The on-disk TOML layer. Every field optional: absence means "defer to the
/// next layer down".
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    workers: Option<usize>,
    worker_queue_length: Option<usize>,
    buffer_size: Option<usize>,
    max_free_buffers: Option<usize>,
    cmd_timeout: Option<u64>,
    data_path: Option<PathBuf>,
    default_sublevel_key_type: Option<KeyTypeArg>,
    default_item_key_type: Option<KeyTypeArg>,
    auto_create_top_index: Option<bool>,
    sync_threads_count: Option<usize>,
    server_id: Option<u32>,
    replication_log_keep_time: Option<u64>,
    replication_log_path: Option<PathBuf>,
    replication_port: Option<u16>,
    masters: Option<Vec<String>>,
    host: Option<IpAddr>,
    port: Option<u16>,
    no_art: Option<bool>,
}

/// The CLI layer. `clap` derive, grounded in the teacher's own move towards
/// a derive-based CLI for its auxiliary binaries.
#[derive(Debug, Parser)]
#[command(name = "nomosd", version, about = "Nomos key/value store")]
pub struct CliArgs {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub workers: Option<usize>,
    #[arg(long)]
    pub data_path: Option<PathBuf>,
    #[arg(long)]
    pub host: Option<IpAddr>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub server_id: Option<u32>,
    #[arg(long)]
    pub replication_port: Option<u16>,
    #[arg(long)]
    pub replication_log_path: Option<PathBuf>,
    /// Repeatable `--master ip:port`.
    #[arg(long = "master")]
    pub masters: Vec<String>,
    #[arg(long)]
    pub no_art: bool,
}

fn parse_master(s: &str) -> Option<(IpAddr, u16)> {
    let (ip, port) = s.rsplit_once(':')?;
    Some((ip.parse().ok()?, port.parse().ok()?))
}

fn env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// `CLI > env > file > default`, applied field by field.
    pub fn load(cli: CliArgs) -> libnomos::TResult<Self> {
        let mut cfg = Config::default();

        let file_path = cli
            .config
            .clone()
            .or_else(|| env_var::<PathBuf>("NOMOS_CONFIG"));
        if let Some(path) = file_path {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| format!("reading config file {path:?}: {e}"))?;
            let file: FileConfig = toml::from_str(&contents)
                .map_err(|e| format!("parsing config file {path:?}: {e}"))?;
            cfg.apply_file(file);
        }

        cfg.apply_env();
        cfg.apply_cli(cli);
        cfg.warn_on_incomplete_replication_config();
        Ok(cfg)
    }

    /// `server_id` is the prerequisite for every replication setting (spec.md
    /// §6); flag the common misconfiguration of supplying one of the
    /// dependent settings without it, rather than silently ignoring them.
    fn warn_on_incomplete_replication_config(&self) {
        if self.server_id.is_some() {
            return;
        }
        if !self.masters.is_empty() {
            log::warn!(
                "'masters' configured but 'server_id' is unset -- replication will not start"
            );
        }
        if self.replication_log_keep_time != Config::default().replication_log_keep_time {
            log::warn!(
                "'replication_log_keep_time' configured but 'server_id' is unset -- \
                 replication will not start"
            );
        }
    }

    fn apply_file(&mut self, f: FileConfig) {
        if let Some(v) = f.workers {
            self.workers = v;
        }
        if let Some(v) = f.worker_queue_length {
            self.worker_queue_length = v;
        }
        if let Some(v) = f.buffer_size {
            self.buffer_size = v;
        }
        if let Some(v) = f.max_free_buffers {
            self.max_free_buffers = v;
        }
        if let Some(v) = f.cmd_timeout {
            self.cmd_timeout = v;
        }
        if let Some(v) = f.data_path {
            self.data_path = v;
        }
        if let Some(v) = f.default_sublevel_key_type {
            self.default_sublevel_key_type = v;
        }
        if let Some(v) = f.default_item_key_type {
            self.default_item_key_type = v;
        }
        if let Some(v) = f.auto_create_top_index {
            self.auto_create_top_index = v;
        }
        if let Some(v) = f.sync_threads_count {
            self.sync_threads_count = v;
        }
        if let Some(v) = f.server_id {
            self.server_id = Some(v);
        }
        if let Some(v) = f.replication_log_keep_time {
            self.replication_log_keep_time = v;
        }
        if let Some(v) = f.replication_log_path {
            self.replication_log_path = v;
        }
        if let Some(v) = f.replication_port {
            self.replication_port = v;
        }
        if let Some(v) = f.masters {
            self.masters = v.iter().filter_map(|s| parse_master(s)).collect();
        }
        if let Some(v) = f.host {
            self.host = v;
        }
        if let Some(v) = f.port {
            self.port = v;
        }
        if let Some(v) = f.no_art {
            self.no_art = v;
        }
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_var("NOMOS_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_var("NOMOS_DATA_PATH") {
            self.data_path = v;
        }
        if let Some(v) = env_var("NOMOS_HOST") {
            self.host = v;
        }
        if let Some(v) = env_var("NOMOS_PORT") {
            self.port = v;
        }
        if let Some(v) = env_var("NOMOS_SERVER_ID") {
            self.server_id = Some(v);
        }
        if let Some(v) = env_var("NOMOS_REPLICATION_PORT") {
            self.replication_port = v;
        }
        if let Ok(v) = std::env::var("NOMOS_MASTERS") {
            self.masters = v.split(',').filter_map(parse_master).collect();
        }
    }

    fn apply_cli(&mut self, cli: CliArgs) {
        if let Some(v) = cli.workers {
            self.workers = v;
        }
        if let Some(v) = cli.data_path {
            self.data_path = v;
        }
        if let Some(v) = cli.host {
            self.host = v;
        }
        if let Some(v) = cli.port {
            self.port = v;
        }
        if let Some(v) = cli.server_id {
            self.server_id = Some(v);
        }
        if let Some(v) = cli.replication_port {
            self.replication_port = v;
        }
        if let Some(v) = cli.replication_log_path {
            self.replication_log_path = v;
        }
        if !cli.masters.is_empty() {
            self.masters = cli.masters.iter().filter_map(|s| parse_master(s)).collect();
        }
        if cli.no_art {
            self.no_art = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_layer_overrides_default_but_cli_wins() {
        let mut cfg = Config::default();
        cfg.apply_file(FileConfig {
            port: Some(9999),
            ..Default::default()
        });
        assert_eq!(cfg.port, 9999);
        cfg.apply_cli(CliArgs {
            config: None,
            workers: None,
            data_path: None,
            host: None,
            port: Some(100),
            server_id: None,
            replication_port: None,
            replication_log_path: None,
            masters: Vec::new(),
            no_art: false,
        });
        assert_eq!(cfg.port, 100);
    }

    #[test]
    fn master_parsing_accepts_ip_colon_port() {
        assert_eq!(
            parse_master("10.0.0.1:2101"),
            Some(("10.0.0.1".parse().unwrap(), 2101))
        );
        assert_eq!(parse_master("garbage"), None);
    }
}
