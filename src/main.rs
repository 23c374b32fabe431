//! rust-torrent-engine - Main entry point
//!
//! Seeds a local file or fetches one from known peers.

use anyhow::{Context, Result};
use rust_torrent_engine::{
    recheck, Bitfield, CliArgs, Command, Config, FileStorage, Sha1Verifier, Storage, Torrent, TorrentError,
    TorrentInfo,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    match args.command {
        Command::Seed {
            file,
            piece_length,
            manifest,
            ..
        } => {
            let manifest = manifest.unwrap_or_else(|| default_manifest_path(&file));
            run_seed(&config, &file, piece_length, &manifest).await
        }
        Command::Fetch {
            manifest,
            peers,
            output,
            ..
        } => run_fetch(&config, &manifest, peers, &output).await,
    }
}

/// Initialize logging based on CLI arguments
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized with level: {:?}", level);
}

fn default_manifest_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(".torrent.json");
    PathBuf::from(name)
}

/// Hash `file`, write the manifest and serve until interrupted
async fn run_seed(config: &Config, file: &Path, piece_length: u32, manifest: &Path) -> Result<()> {
    info!("Hashing {}", file.display());
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "torrent".to_string());
    let info = TorrentInfo::from_data(name, &data, piece_length)?;
    drop(data);

    info.save(manifest)
        .with_context(|| format!("Failed to write manifest {}", manifest.display()))?;
    display_torrent_info(&info, manifest);

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::open(file).await?);
    let have = Bitfield::full(info.piece_count());
    let torrent = Torrent::new(info, storage, have, config.torrent.clone())?;
    torrent.start().await.context("Failed to start torrent")?;

    let mut errors = torrent.notify_error();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = errors.changed() => {}
    }
    let failure = errors.borrow().clone();
    finish(&torrent).await;
    match failure {
        Some(err) => Err(anyhow::Error::from(err).context("Seeding failed")),
        None => Ok(()),
    }
}

/// Download the manifest's file from `peers` into `output`
async fn run_fetch(config: &Config, manifest: &Path, peers: Vec<SocketAddr>, output: &Path) -> Result<()> {
    let info = TorrentInfo::load(manifest).with_context(|| format!("Failed to load manifest {}", manifest.display()))?;
    display_torrent_info(&info, manifest);

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::create(output, info.total_length).await?);
    let shared = Arc::new(info.clone());
    let have = recheck(storage.as_ref(), &shared, &Sha1Verifier::new(shared.clone())).await?;

    let torrent = Torrent::new(info, storage, have, config.torrent.clone())?;
    torrent.start().await.context("Failed to start torrent")?;
    torrent.add_peers(peers)?;

    let mut complete = torrent.notify_complete();
    let mut errors = torrent.notify_error();
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => Err(anyhow::Error::from(TorrentError::validation_error("Interrupted before completion"))),
        done = complete.wait_for(|done| *done) => done.map(|_| ()).map_err(anyhow::Error::from),
        failed = errors.wait_for(|err| err.is_some()) => {
            let err = failed.ok().and_then(|err| err.clone());
            Err(err.map(anyhow::Error::from).unwrap_or_else(|| anyhow::anyhow!("Torrent stopped")))
        }
    };
    finish(&torrent).await;

    result?;
    info!("Download complete: {}", output.display());
    Ok(())
}

async fn finish(torrent: &Torrent) {
    torrent.close().await;
    let stats = torrent.stats();
    info!(
        "Pieces {}/{}, downloaded {} bytes, uploaded {} bytes",
        stats.pieces_owned, stats.piece_count, stats.downloaded, stats.uploaded
    );
}

/// Display torrent information
fn display_torrent_info(info: &TorrentInfo, manifest: &Path) {
    info!("Torrent: {}", info.name);
    info!("  Info hash: {}", info.info_hash_hex());
    info!("  Size: {} bytes", info.total_length);
    info!("  Pieces: {} x {} bytes", info.piece_count(), info.piece_length);
    info!("  Manifest: {}", manifest.display());
}
