/*
 * This file is a part of Nomos
 * Nomos is a persistent, high-throughput key/value store with a
 * hierarchical namespace and multi-master replication.
 *
*/

//! # Nomos server
//!
//! The `nomosd` binary: parses configuration, locks the data directory,
//! loads every top-level index from disk, then runs the sync worker pool,
//! hourly maintenance, optional replication, and the client TCP protocol
//! until asked to shut down.

use clap::Parser;
use fs2::FileExt;
use libnomos::util::terminal;
use libnomos::{URL, VERSION};
use nomos::config::{CliArgs, Config};
use nomos::engine::directory::{IndexDirectory, IndexDirectoryConfig};
use nomos::net::ClientServer;
use nomos::registry;
use std::fs::{self, File};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;

const LOCK_FILE_NAME: &str = ".nomos.lock";

static TEXT: &str = "\n███    ██  ██████  ███    ███  ██████  ███████ \n████   ██ ██    ██ ████  ████ ██    ██ ██      \n██ ██  ██ ██    ██ ██ ████ ██ ██    ██ ███████ \n██  ██ ██ ██    ██ ██  ██  ██ ██    ██      ██ \n██   ████  ██████  ██      ██  ██████  ███████ \n";

#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() {
    env_logger::Builder::new()
        .parse_filters(&std::env::var("NOMOS_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();

    let cli = CliArgs::parse();
    let config = match Config::load(cli) {
        Ok(c) => c,
        Err(e) => {
            log::error!("Startup failure: bad configuration: {e}");
            process::exit(0x100);
        }
    };

    if config.no_art {
        println!("Nomos v{VERSION} | {URL}");
    } else {
        println!("Nomos v{VERSION} | {URL}\n{TEXT}");
    }

    let lock_file = acquire_data_dir_lock(&config.data_path);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("nomos-client")
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    runtime.block_on(run_server(config));

    drop(lock_file);
    if let Err(e) = terminal::write_info("Goodbye :)\n") {
        log::warn!("failed to write shutdown banner: {e:?}");
    }
}

/// Steps 5-10 of the process lifecycle: build the engine, spawn its
/// background workers, serve clients until told to stop, then flush.
async fn run_server(config: Config) {
    let now = registry::wall_clock_seconds();

    let directory = match IndexDirectory::new(IndexDirectoryConfig {
        data_path: config.data_path.clone(),
        default_sub_level_type: config.default_sublevel_key_type.to_engine(),
        default_item_type: config.default_item_key_type.to_engine(),
        auto_create_top_index: config.auto_create_top_index,
        sync_threads_count: config.sync_threads_count,
        server_id: config.server_id,
        replication_log_keep_time: config.replication_log_keep_time,
        replication_log_path: config.replication_log_path.clone(),
    }) {
        Ok(d) => d,
        Err(e) => {
            log::error!("Startup failure: could not initialize engine: {e}");
            process::exit(0x100);
        }
    };

    if let Err(e) = directory.load(now) {
        log::error!("Startup failure: failed to load existing data: {e}");
        process::exit(0x100);
    }
    log::info!("loaded existing top-level indices from {:?}", config.data_path);

    let maintenance = directory.start_maintenance();

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
    let rt_handle = tokio::runtime::Handle::current();

    if config.server_id.is_some() {
        directory.spawn_replication_server(
            config.host,
            config.replication_port,
            &rt_handle,
            shutdown_tx.subscribe(),
        );
        directory.spawn_replication_clients(&config.masters, &rt_handle, &shutdown_tx);
    }

    let client_server = Arc::new(ClientServer::new(
        directory.clone(),
        config.workers.max(1),
        config.buffer_size,
        std::time::Duration::from_secs(config.cmd_timeout),
    ));
    let client_shutdown = shutdown_tx.subscribe();
    let client_handle = {
        let client_server = client_server.clone();
        tokio::spawn(async move {
            if let Err(e) = client_server.run(config.host, config.port, client_shutdown).await {
                log::error!("client accept loop exited with error: {e}");
            }
        })
    };

    let poisoned = tokio::select! {
        _ = wait_for_shutdown_signal() => {
            log::info!("shutdown signal received, draining connections");
            false
        }
        _ = wait_for_poison() => {
            log::error!("a background sync lost durability, flushing and terminating");
            true
        }
    };

    let _ = shutdown_tx.send(());
    let _ = client_handle.await;
    maintenance.shutdown();
    directory.exit_flush();

    if poisoned {
        process::exit(0x101);
    }
}

/// Poll `registry::is_poisoned()` until a background sync has reported a
/// durability-fatal I/O error (spec §7: such errors are fatal for the
/// process). Resolves immediately if already poisoned at the time of the
/// first poll.
async fn wait_for_poison() {
    loop {
        if registry::is_poisoned() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

/// Exclusive advisory lock on `<data_path>/.nomos.lock`, grounded in the
/// teacher's `diskstore::flock::FileLock` but using the `fs2` crate instead
/// of its hand-written C shim.
fn acquire_data_dir_lock(data_path: &std::path::Path) -> File {
    if let Err(e) = fs::create_dir_all(data_path) {
        log::error!("Startup failure: could not create data path {data_path:?}: {e}");
        process::exit(0x100);
    }
    let lock_path = data_path.join(LOCK_FILE_NAME);
    let file = match fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
    {
        Ok(f) => f,
        Err(e) => {
            log::error!("Startup failure: could not open lock file {lock_path:?}: {e}");
            process::exit(0x100);
        }
    };
    if let Err(e) = file.try_lock_exclusive() {
        log::error!(
            "Startup failure: another Nomos process is already using {data_path:?}: {e}"
        );
        process::exit(0x100);
    }
    file
}
