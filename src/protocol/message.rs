//! Message types.
//!
//! Payload layout: kind:u8 | fields. All multi-byte integers are big-endian.
//! Strings are length-prefixed (u16 len + UTF-8), byte blobs u32 len + bytes.

use crate::error::{Result, SyncError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Longest string a u16 length prefix can carry
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

// =============================================================================
// Message kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Quit = 0x01,
    Hello = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    KeyExchange = 0x05,
    KeyExchangeReply = 0x06,
    Auth = 0x07,
    AuthResult = 0x08,
    Subscribe = 0x09,
    Unsubscribe = 0x0A,
    NewVersion = 0x0B,
    RequestChunk = 0x0C,
    FileChunk = 0x0D,
    Commit = 0x0E,
    Nack = 0x0F,
}

impl MessageKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Quit),
            0x02 => Some(Self::Hello),
            0x03 => Some(Self::Ping),
            0x04 => Some(Self::Pong),
            0x05 => Some(Self::KeyExchange),
            0x06 => Some(Self::KeyExchangeReply),
            0x07 => Some(Self::Auth),
            0x08 => Some(Self::AuthResult),
            0x09 => Some(Self::Subscribe),
            0x0A => Some(Self::Unsubscribe),
            0x0B => Some(Self::NewVersion),
            0x0C => Some(Self::RequestChunk),
            0x0D => Some(Self::FileChunk),
            0x0E => Some(Self::Commit),
            0x0F => Some(Self::Nack),
            _ => None,
        }
    }

    /// Messages refused until the session has authenticated.
    pub fn requires_auth(self) -> bool {
        matches!(
            self,
            Self::Subscribe
                | Self::Unsubscribe
                | Self::NewVersion
                | Self::RequestChunk
                | Self::FileChunk
                | Self::Commit
        )
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
}

impl Hello {
    pub fn new() -> Self {
        Self {
            version: PROTOCOL_VERSION,
        }
    }
}

impl Default for Hello {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub peer: String,
    /// Peer name encrypted to the server's public key
    pub proof: Bytes,
}

/// Announces that `path` has changed relative to `base_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVersion {
    pub path: String,
    pub base_version: u64,
    pub client_version: u64,
    /// Current file size, so the receiver can plan chunk requests
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestChunk {
    pub path: String,
    pub client_version: u64,
    pub offset: u64,
    pub size: u32,
}

/// Reply to `RequestChunk`. Empty `data` means the request's version was stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub path: String,
    pub client_version: u64,
    pub offset: u64,
    pub data: Bytes,
}

impl FileChunk {
    pub fn is_stale_reply(&self) -> bool {
        self.data.is_empty()
    }
}

/// Accepts `client_version` local edits made on top of `base_version`,
/// which now become `new_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Commit {
    pub base_version: u64,
    pub new_version: u64,
    pub client_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NackCode {
    Stale = 1,
    Locked = 2,
    Unauthenticated = 3,
    VersionMismatch = 4,
    Busy = 5,
    Internal = 6,
}

impl NackCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Stale),
            2 => Some(Self::Locked),
            3 => Some(Self::Unauthenticated),
            4 => Some(Self::VersionMismatch),
            5 => Some(Self::Busy),
            6 => Some(Self::Internal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub code: NackCode,
    pub path: String,
    pub message: String,
}

impl Nack {
    /// Build a nack; `path` and `message` are cut to what a frame can carry.
    pub fn new(code: NackCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            path: clamped(path.into()),
            message: clamped(message.into()),
        }
    }
}

fn clamped(mut s: String) -> String {
    let keep = clamp_str(&s, MAX_STRING_LEN).len();
    s.truncate(keep);
    s
}

/// Longest prefix of `s` within `max` bytes that ends on a char boundary.
fn clamp_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// =============================================================================
// Envelope
// =============================================================================

/// A decoded protocol message. The payload shape is fixed by the kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Quit,
    Hello(Hello),
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    KeyExchange { public_key: Bytes },
    KeyExchangeReply { public_key: Bytes },
    Auth(Auth),
    AuthResult { accepted: bool },
    Subscribe { path: String },
    Unsubscribe { path: String },
    NewVersion(NewVersion),
    RequestChunk(RequestChunk),
    FileChunk(FileChunk),
    Commit { path: String, commit: Commit },
    Nack(Nack),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Quit => MessageKind::Quit,
            Message::Hello(_) => MessageKind::Hello,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::KeyExchange { .. } => MessageKind::KeyExchange,
            Message::KeyExchangeReply { .. } => MessageKind::KeyExchangeReply,
            Message::Auth(_) => MessageKind::Auth,
            Message::AuthResult { .. } => MessageKind::AuthResult,
            Message::Subscribe { .. } => MessageKind::Subscribe,
            Message::Unsubscribe { .. } => MessageKind::Unsubscribe,
            Message::NewVersion(_) => MessageKind::NewVersion,
            Message::RequestChunk(_) => MessageKind::RequestChunk,
            Message::FileChunk(_) => MessageKind::FileChunk,
            Message::Commit { .. } => MessageKind::Commit,
            Message::Nack(_) => MessageKind::Nack,
        }
    }

    /// The tracked path this message refers to, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Message::Subscribe { path }
            | Message::Unsubscribe { path }
            | Message::Commit { path, .. } => Some(path),
            Message::NewVersion(m) => Some(&m.path),
            Message::RequestChunk(m) => Some(&m.path),
            Message::FileChunk(m) => Some(&m.path),
            Message::Nack(m) => Some(&m.path),
            _ => None,
        }
    }

    /// Serialize to a frame payload (kind byte + fields, no length prefix).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_hint());
        buf.put_u8(self.kind() as u8);

        match self {
            Message::Quit => {}
            Message::Hello(hello) => buf.put_u16(hello.version),
            Message::Ping { nonce } | Message::Pong { nonce } => buf.put_u64(*nonce),
            Message::KeyExchange { public_key } | Message::KeyExchangeReply { public_key } => {
                put_blob(&mut buf, public_key)
            }
            Message::Auth(auth) => {
                put_str(&mut buf, &auth.peer);
                put_blob(&mut buf, &auth.proof);
            }
            Message::AuthResult { accepted } => buf.put_u8(u8::from(*accepted)),
            Message::Subscribe { path } | Message::Unsubscribe { path } => {
                put_str(&mut buf, path)
            }
            Message::NewVersion(m) => {
                put_str(&mut buf, &m.path);
                buf.put_u64(m.base_version);
                buf.put_u64(m.client_version);
                buf.put_u64(m.size);
            }
            Message::RequestChunk(m) => {
                put_str(&mut buf, &m.path);
                buf.put_u64(m.client_version);
                buf.put_u64(m.offset);
                buf.put_u32(m.size);
            }
            Message::FileChunk(m) => {
                put_str(&mut buf, &m.path);
                buf.put_u64(m.client_version);
                buf.put_u64(m.offset);
                put_blob(&mut buf, &m.data);
            }
            Message::Commit { path, commit } => {
                put_str(&mut buf, path);
                buf.put_u64(commit.base_version);
                buf.put_u64(commit.new_version);
                buf.put_u64(commit.client_version);
            }
            Message::Nack(nack) => {
                buf.put_u16(nack.code as u16);
                put_str(&mut buf, &nack.path);
                put_str(&mut buf, &nack.message);
            }
        }

        buf.freeze()
    }

    /// Parse a frame payload. Unknown kinds are rejected, never coerced.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if !payload.has_remaining() {
            return Err(SyncError::malformed("empty payload"));
        }
        let tag = payload.get_u8();
        let kind = MessageKind::from_u8(tag).ok_or(SyncError::InvalidMessageKind(tag))?;
        let p = &mut payload;

        let msg = match kind {
            MessageKind::Quit => Message::Quit,
            MessageKind::Hello => {
                need(p, 2, "Hello")?;
                Message::Hello(Hello {
                    version: p.get_u16(),
                })
            }
            MessageKind::Ping => {
                need(p, 8, "Ping")?;
                Message::Ping { nonce: p.get_u64() }
            }
            MessageKind::Pong => {
                need(p, 8, "Pong")?;
                Message::Pong { nonce: p.get_u64() }
            }
            MessageKind::KeyExchange => Message::KeyExchange {
                public_key: get_blob(p, "KeyExchange key")?,
            },
            MessageKind::KeyExchangeReply => Message::KeyExchangeReply {
                public_key: get_blob(p, "KeyExchangeReply key")?,
            },
            MessageKind::Auth => Message::Auth(Auth {
                peer: get_str(p, "Auth peer")?,
                proof: get_blob(p, "Auth proof")?,
            }),
            MessageKind::AuthResult => {
                need(p, 1, "AuthResult")?;
                Message::AuthResult {
                    accepted: p.get_u8() != 0,
                }
            }
            MessageKind::Subscribe => Message::Subscribe {
                path: get_str(p, "Subscribe path")?,
            },
            MessageKind::Unsubscribe => Message::Unsubscribe {
                path: get_str(p, "Unsubscribe path")?,
            },
            MessageKind::NewVersion => {
                let path = get_str(p, "NewVersion path")?;
                need(p, 24, "NewVersion")?;
                Message::NewVersion(NewVersion {
                    path,
                    base_version: p.get_u64(),
                    client_version: p.get_u64(),
                    size: p.get_u64(),
                })
            }
            MessageKind::RequestChunk => {
                let path = get_str(p, "RequestChunk path")?;
                need(p, 20, "RequestChunk")?;
                Message::RequestChunk(RequestChunk {
                    path,
                    client_version: p.get_u64(),
                    offset: p.get_u64(),
                    size: p.get_u32(),
                })
            }
            MessageKind::FileChunk => {
                let path = get_str(p, "FileChunk path")?;
                need(p, 16, "FileChunk")?;
                let client_version = p.get_u64();
                let offset = p.get_u64();
                Message::FileChunk(FileChunk {
                    path,
                    client_version,
                    offset,
                    data: get_blob(p, "FileChunk data")?,
                })
            }
            MessageKind::Commit => {
                let path = get_str(p, "Commit path")?;
                need(p, 24, "Commit")?;
                Message::Commit {
                    path,
                    commit: Commit {
                        base_version: p.get_u64(),
                        new_version: p.get_u64(),
                        client_version: p.get_u64(),
                    },
                }
            }
            MessageKind::Nack => {
                need(p, 2, "Nack")?;
                let raw = p.get_u16();
                let code = NackCode::from_u16(raw)
                    .ok_or_else(|| SyncError::malformed(format!("unknown Nack code {}", raw)))?;
                Message::Nack(Nack {
                    code,
                    path: get_str(p, "Nack path")?,
                    message: get_str(p, "Nack message")?,
                })
            }
        };

        if payload.has_remaining() {
            return Err(SyncError::malformed(format!(
                "{:?} has {} trailing bytes",
                kind,
                payload.remaining()
            )));
        }

        Ok(msg)
    }

    fn encoded_hint(&self) -> usize {
        match self {
            Message::FileChunk(m) => 1 + 2 + m.path.len() + 16 + 4 + m.data.len(),
            _ => 64,
        }
    }
}

// =============================================================================
// Field helpers
// =============================================================================

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(SyncError::malformed(format!(
            "{} truncated: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let fitted = clamp_str(s, MAX_STRING_LEN);
    if fitted.len() < s.len() {
        tracing::warn!("string of {} bytes cut to {} on the wire", s.len(), fitted.len());
    }
    buf.put_u16(fitted.len() as u16);
    buf.put_slice(fitted.as_bytes());
}

fn get_str(buf: &mut Bytes, what: &str) -> Result<String> {
    need(buf, 2, what)?;
    let len = buf.get_u16() as usize;
    need(buf, len, what)?;
    String::from_utf8(buf.copy_to_bytes(len).to_vec())
        .map_err(|_| SyncError::malformed(format!("invalid UTF-8 in {}", what)))
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn get_blob(buf: &mut Bytes, what: &str) -> Result<Bytes> {
    need(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    need(buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}
