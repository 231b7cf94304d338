//! Error types for the torrent client
//!
//! Every fallible path in the crate builds one of these variants and hands it
//! to `anyhow` with `.into()`. Only load-time failures ever reach the caller of
//! a session; everything else is logged and recovered inside the coordinator.

use std::fmt;

/// Error type for torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Malformed bencode or torrent descriptor
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Wire protocol framing and handshake errors
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Failure scoped to a single peer connection
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// A tracker could not produce a usable peer list
    TrackerError {
        message: String,
        url: Option<String>,
        source: Option<String>,
    },

    /// File I/O and storage errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Socket level errors
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

    /// The session task has stopped and no longer answers commands
    SessionError {
        message: String,
    },
}

impl TorrentError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

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

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: None,
            source: None,
        }
    }

    /// Create a new TrackerError with the tracker URL
    pub fn tracker_error_with_url(message: impl Into<String>, url: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: Some(url.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with URL and source
    pub fn tracker_error_full(message: impl Into<String>, url: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: Some(url.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path
    pub fn storage_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
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

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new SessionError
    pub fn session_error(message: impl Into<String>) -> Self {
        TorrentError::SessionError {
            message: message.into(),
        }
    }

    /// Append context to the error's source chain
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        let chain = |source: &mut Option<String>| {
            *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
        };
        match &mut self {
            TorrentError::ParseError { source, .. }
            | TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::TrackerError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::NetworkError { source, .. } => chain(source),
            TorrentError::ConfigError { .. }
            | TorrentError::ValidationError { .. }
            | TorrentError::SessionError { .. } => {}
        }
        self
    }
}

fn write_labeled(
    f: &mut fmt::Formatter<'_>,
    kind: &str,
    message: &str,
    label: &str,
    subject: &Option<String>,
    source: &Option<String>,
) -> fmt::Result {
    match (subject, source) {
        (Some(p), Some(s)) => write!(f, "{}: {} ({}: {}, source: {})", kind, message, label, p, s),
        (Some(p), None) => write!(f, "{}: {} ({}: {})", kind, message, label, p),
        (None, Some(s)) => write!(f, "{}: {} (source: {})", kind, message, s),
        (None, None) => write!(f, "{}: {}", kind, message),
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            TorrentError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            TorrentError::PeerError { message, peer, source } => {
                write_labeled(f, "Peer error", message, "peer", peer, source)
            }
            TorrentError::TrackerError { message, url, source } => {
                write_labeled(f, "Tracker error", message, "url", url, source)
            }
            TorrentError::StorageError { message, path, source } => {
                write_labeled(f, "Storage error", message, "path", path, source)
            }
            TorrentError::NetworkError { message, address, source } => {
                write_labeled(f, "Network error", message, "address", address, source)
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
            TorrentError::SessionError { message } => write!(f, "Session error: {}", message),
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::storage_error_full("Failed to parse JSON data", "unknown".to_string(), err.to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}

#[cfg(feature = "http-tracker")]
impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
        TorrentError::tracker_error_full("HTTP request failed", url, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error() {
        let err = TorrentError::parse_error("Invalid torrent file");
        assert_eq!(err.to_string(), "Parse error: Invalid torrent file");
    }

    #[test]
    fn test_parse_error_with_source() {
        let err = TorrentError::parse_error_with_source("Missing key", "info");
        assert!(err.to_string().contains("Parse error"));
        assert!(err.to_string().contains("Missing key"));
        assert!(err.to_string().contains("info"));
    }

    #[test]
    fn test_peer_error_full() {
        let err = TorrentError::peer_error_full("Handshake failed", "127.0.0.1:6881", "info hash mismatch");
        let text = err.to_string();
        assert!(text.contains("Peer error"));
        assert!(text.contains("127.0.0.1:6881"));
        assert!(text.contains("info hash mismatch"));
    }

    #[test]
    fn test_tracker_error_with_url() {
        let err = TorrentError::tracker_error_with_url("transaction id mismatch", "udp://tracker.example:6969");
        assert!(err.to_string().contains("Tracker error"));
        assert!(err.to_string().contains("udp://tracker.example:6969"));
    }

    #[test]
    fn test_storage_error_with_path() {
        let err = TorrentError::storage_error_with_path("File not found", "/path/to/file");
        assert!(err.to_string().contains("Storage error"));
        assert!(err.to_string().contains("/path/to/file"));
    }

    #[test]
    fn test_with_context() {
        let err = TorrentError::parse_error("Invalid data").with_context("while parsing torrent");
        assert!(err.to_string().contains("while parsing torrent"));

        let err = TorrentError::config_error("bad").with_context("ignored");
        assert!(!err.to_string().contains("ignored"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::StorageError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: TorrentError = addr_err.into();
        assert!(matches!(err, TorrentError::NetworkError { .. }));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = TorrentError::config_error_with_field("Invalid value", "max_connections");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("max_connections"));
    }

    #[test]
    fn test_session_error() {
        let err = TorrentError::session_error("session is no longer running");
        assert_eq!(err.to_string(), "Session error: session is no longer running");
    }
}
