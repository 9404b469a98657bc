//! Wire protocol.
//!
//! Stream-oriented: each frame is `varint(len) | payload`, and each payload
//! decodes to exactly one `Message` whose shape is determined by its leading
//! kind byte.

pub mod frame;
pub mod message;
pub mod varint;

pub use frame::{decode_frame, encode_frame, read_message, write_message};
pub use message::{
    Auth, Commit, FileChunk, Hello, Message, MessageKind, Nack, NackCode, NewVersion,
    RequestChunk, MAX_STRING_LEN, PROTOCOL_VERSION, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN,
};

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    /// Version is supported
    Supported(u16),
    /// Version is too old (client needs upgrade)
    TooOld { client: u16, min_supported: u16 },
    /// Version is too new (server needs upgrade)
    TooNew { client: u16, max_supported: u16 },
}

/// Check if a client protocol version is supported.
pub fn negotiate_version(client_version: u16) -> VersionNegotiationResult {
    if client_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            client: client_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if client_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            client: client_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(client_version)
    }
}
