//! CLI configuration module
//!
//! Combines command-line arguments with an optional JSON settings file.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::cli::args::CliArgs;
use crate::error::TorrentError;
use crate::torrent::TorrentConfig;

/// Configuration for one run of the binary
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine settings
    pub torrent: TorrentConfig,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let mut torrent = match &args.config {
            Some(path) => Self::load_file(path)?,
            None => TorrentConfig::default(),
        };
        if let Some(port) = args.command.port() {
            torrent.listen_addr.set_port(port);
        }

        Ok(Self {
            torrent,
            verbose: args.verbose,
            quiet: args.quiet,
        })
    }

    /// Read engine settings from a JSON file; missing fields keep defaults
    pub fn load_file(path: &Path) -> Result<TorrentConfig> {
        debug!("Loading config file: {}", path.display());
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&text).map_err(|e| {
            TorrentError::config_error_with_field(format!("Invalid config file: {}", e), path.display().to_string())
        })?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.verbose && self.quiet {
            return Err(TorrentError::config_error_with_field("verbose and quiet are exclusive", "quiet").into());
        }
        self.torrent.validate()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
