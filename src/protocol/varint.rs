//! Base-128 length prefix.
//!
//! 7 data bits per byte, least-significant group first, continuation bit
//! (0x80) set on every byte except the last.

use crate::error::{Result, SyncError};
use bytes::BufMut;

/// Longest encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

const CONTINUATION: u8 = 0x80;
const DATA_BITS: u8 = 0x7f;

/// Number of bytes `encode_len` writes for `len`.
pub fn encoded_len(mut len: u64) -> usize {
    let mut n = 1;
    while len >= 0x80 {
        len >>= 7;
        n += 1;
    }
    n
}

pub fn encode_len<B: BufMut>(mut len: u64, buf: &mut B) {
    while len >= 0x80 {
        buf.put_u8((len as u8 & DATA_BITS) | CONTINUATION);
        len >>= 7;
    }
    buf.put_u8(len as u8);
}

/// Incremental decoder, fed one byte at a time.
#[derive(Debug, Default)]
pub struct VarintDecoder {
    value: u64,
    shift: u32,
    bytes: usize,
}

impl VarintDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next byte. Returns the decoded value once a byte without the
    /// continuation bit is seen.
    pub fn push(&mut self, byte: u8) -> Result<Option<u64>> {
        self.bytes += 1;
        if self.bytes > MAX_VARINT_LEN {
            return Err(SyncError::malformed("length prefix too long"));
        }

        let part = u64::from(byte & DATA_BITS);
        let shifted = part << self.shift;
        if shifted >> self.shift != part {
            return Err(SyncError::malformed("length prefix overflows u64"));
        }
        self.value |= shifted;

        if byte & CONTINUATION == 0 {
            Ok(Some(self.value))
        } else {
            self.shift += 7;
            Ok(None)
        }
    }
}

/// Decode a length prefix from the front of `buf` without consuming it.
/// Returns `(value, prefix_len)`, or `None` if `buf` ends mid-prefix.
pub fn decode_len(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut decoder = VarintDecoder::new();
    for (i, &byte) in buf.iter().enumerate() {
        if let Some(value) = decoder.push(byte)? {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}
