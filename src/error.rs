use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Broad error classes, used to decide how far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed, oversized, or unknown frame. Closes the connection.
    Protocol,
    /// Version record lock contention or record I/O. Aborts one message.
    Metadata,
    /// Version mismatch on a commit or chunk request. Logged and dropped.
    Stale,
    /// No free connection handler.
    ResourceExhaustion,
    /// Socket or file I/O. Closes the connection.
    Io,
    /// Startup configuration or local usage error.
    Local,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid message kind: 0x{0:02x}")]
    InvalidMessageKind(u8),

    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: u64, max: u64 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("version record is locked: {}", .0.display())]
    MetadataLocked(PathBuf),

    #[error("version record I/O failed for {}: {source}", path.display())]
    MetadataIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read chunk from {}: {source}", path.display())]
    ChunkRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("stale message: {0}")]
    StaleMessage(String),

    #[error("worker pool exhausted")]
    PoolExhausted,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("crypto provider error: {0}")]
    Crypto(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SyncError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        SyncError::MalformedMessage(msg.into())
    }

    pub fn metadata_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::MetadataIo {
            path: path.into(),
            source,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::InvalidMessageKind(_)
            | SyncError::MessageTooLarge { .. }
            | SyncError::MalformedMessage(_) => ErrorCategory::Protocol,
            SyncError::MetadataLocked(_) | SyncError::MetadataIo { .. } => {
                ErrorCategory::Metadata
            }
            // A chunk read failure aborts only the request being served.
            SyncError::ChunkRead { .. } => ErrorCategory::Metadata,
            SyncError::StaleMessage(_) => ErrorCategory::Stale,
            SyncError::PoolExhausted => ErrorCategory::ResourceExhaustion,
            SyncError::ConnectionClosed | SyncError::Io(_) => ErrorCategory::Io,
            SyncError::InvalidPath(_) | SyncError::Crypto(_) | SyncError::Config(_) => {
                ErrorCategory::Local
            }
        }
    }

    /// Whether the connection that produced this error must be closed.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Protocol | ErrorCategory::Io
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_and_io_errors_close_the_connection() {
        assert!(SyncError::InvalidMessageKind(0xff).is_connection_fatal());
        assert!(SyncError::MessageTooLarge { size: 10, max: 5 }.is_connection_fatal());
        assert!(SyncError::ConnectionClosed.is_connection_fatal());
        assert!(SyncError::malformed("short").is_connection_fatal());
    }

    #[test]
    fn metadata_and_stale_errors_are_per_message() {
        let locked = SyncError::MetadataLocked(PathBuf::from("a.txt"));
        assert_eq!(locked.category(), ErrorCategory::Metadata);
        assert!(!locked.is_connection_fatal());

        let stale = SyncError::StaleMessage("commit base 3 != 5".into());
        assert_eq!(stale.category(), ErrorCategory::Stale);
        assert!(!stale.is_connection_fatal());

        let io = io::Error::new(io::ErrorKind::Other, "disk");
        assert!(!SyncError::metadata_io("a.txt", io).is_connection_fatal());
    }

    #[test]
    fn display_includes_details() {
        let err = SyncError::MessageTooLarge { size: 100, max: 64 };
        let msg = err.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains("64"));
        assert_eq!(
            SyncError::InvalidMessageKind(0x7f).to_string(),
            "invalid message kind: 0x7f"
        );
    }
}
