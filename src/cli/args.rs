//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default piece size for new torrents
pub const DEFAULT_PIECE_LENGTH: u32 = 256 * 1024;

/// CLI arguments for the torrent engine
#[derive(Debug, Parser)]
#[command(name = "rust-torrent-engine")]
#[command(about = "Exchange a file with BitTorrent peers", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// JSON file with engine settings
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Hash a file, write its manifest and serve it until interrupted
    Seed {
        /// File to share
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,

        /// Piece size in bytes
        #[arg(long, default_value_t = DEFAULT_PIECE_LENGTH)]
        piece_length: u32,

        /// Listening port for incoming connections
        #[arg(short, long)]
        port: Option<u16>,

        /// Where to write the manifest (defaults to FILE.torrent.json)
        #[arg(short, long, value_name = "FILE")]
        manifest: Option<PathBuf>,
    },
    /// Download the file described by a manifest from known peers
    Fetch {
        /// Manifest written by `seed`
        #[arg(short, long, value_name = "FILE")]
        manifest: PathBuf,

        /// Peer to connect to (repeatable)
        #[arg(long = "peer", value_name = "ADDR", required = true)]
        peers: Vec<SocketAddr>,

        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Listening port for incoming connections
        #[arg(short, long)]
        port: Option<u16>,
    },
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

impl Command {
    /// Port requested on the command line
    pub fn port(&self) -> Option<u16> {
        match self {
            Command::Seed { port, .. } | Command::Fetch { port, .. } => *port,
        }
    }
}
