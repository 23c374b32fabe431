//! Error types for the torrent engine
//!
//! Errors carry plain strings so they stay `Clone` and can be published on
//! the torrent's error notification channel.

use std::fmt;

/// Error type for torrent exchange operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentError {
    /// A remote peer broke the wire protocol
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Storage backend errors
    StorageError {
        message: String,
        location: Option<String>,
        source: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(message: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            location: None,
            source: None,
        }
    }

    /// Create a new StorageError with location and source
    pub fn storage_error_full(message: impl Into<String>, location: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            location: Some(location.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Whether this error means the remote peer misbehaved on the wire
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, TorrentError::ProtocolError { .. })
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ProtocolError { message, source } => {
                write_error(f, "Protocol error", message, &[("source", source)])
            }
            TorrentError::PeerError { message, peer, source } => {
                write_error(f, "Peer error", message, &[("peer", peer), ("source", source)])
            }
            TorrentError::StorageError { message, location, source } => {
                write_error(f, "Storage error", message, &[("location", location), ("source", source)])
            }
            TorrentError::NetworkError { message, address, source } => {
                write_error(f, "Network error", message, &[("address", address), ("source", source)])
            }
            TorrentError::ConfigError { message, field } => write_error(f, "Config error", message, &[("field", field)]),
            TorrentError::ValidationError { message, field } => {
                write_error(f, "Validation error", message, &[("field", field)])
            }
        }
    }
}

/// `kind: message (name: value, ...)` with the absent details left out
fn write_error(f: &mut fmt::Formatter<'_>, kind: &str, message: &str, details: &[(&str, &Option<String>)]) -> fmt::Result {
    write!(f, "{}: {}", kind, message)?;
    let mut present = details.iter().filter_map(|&(name, value)| value.as_ref().map(|v| (name, v)));
    if let Some((name, value)) = present.next() {
        write!(f, " ({}: {}", name, value)?;
        for (name, value) in present {
            write!(f, ", {}: {}", name, value)?;
        }
        write!(f, ")")?;
    }
    Ok(())
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::NetworkError {
            message: err.to_string(),
            address: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::config_error_with_field(format!("Failed to parse JSON data: {}", err), "json")
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown", err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}
