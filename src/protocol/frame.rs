//! Frame reading/writing.
//!
//! Frame format: varint(len) | payload, where payload is one encoded
//! `Message`. Decoding is all-or-nothing: no partial frame ever reaches the
//! caller.

use super::message::Message;
use super::varint::{decode_len, encode_len, encoded_len, VarintDecoder};
use crate::error::{Result, SyncError};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Encode a message as a complete frame.
pub fn encode_frame(msg: &Message) -> Bytes {
    let payload = msg.encode();
    let len = payload.len() as u64;
    let mut buf = BytesMut::with_capacity(encoded_len(len) + payload.len());
    encode_len(len, &mut buf);
    buf.extend_from_slice(&payload);
    buf.freeze()
}

fn check_size(len: u64, max: u64) -> Result<()> {
    if len > max {
        return Err(SyncError::MessageTooLarge { size: len, max });
    }
    Ok(())
}

fn closed(e: std::io::Error) -> SyncError {
    tracing::debug!("frame read failed: {}", e);
    SyncError::ConnectionClosed
}

/// Read one message from the stream.
///
/// The length prefix is read one byte at a time; the payload is read in full
/// before parsing.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R, max_size: u64) -> Result<Message> {
    let mut prefix = VarintDecoder::new();
    let len = loop {
        let byte = r.read_u8().await.map_err(closed)?;
        if let Some(len) = prefix.push(byte)? {
            break len;
        }
    };

    // Validate frame size before allocation
    check_size(len, max_size)?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await.map_err(closed)?;

    Message::decode(Bytes::from(payload))
}

/// Write one message as a frame. Does not flush.
pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<()> {
    w.write_all(&encode_frame(msg)).await?;
    Ok(())
}

/// Decode one message from the front of a receive buffer.
///
/// Returns `Ok(None)` and consumes nothing until a whole frame is buffered.
/// An oversized length is reported as soon as the prefix is complete.
pub fn decode_frame(buf: &mut BytesMut, max_size: u64) -> Result<Option<Message>> {
    let Some((len, prefix_len)) = decode_len(&buf[..])? else {
        return Ok(None);
    };
    check_size(len, max_size)?;

    let total = prefix_len + len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    buf.advance(prefix_len);
    let payload = buf.split_to(len as usize).freeze();
    Message::decode(payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{
        Auth, Commit, FileChunk, Hello, Nack, NackCode, NewVersion, RequestChunk, MAX_STRING_LEN,
    };
    use proptest::prelude::*;

    const MAX: u64 = 1024 * 1024;

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let msgs = vec![
            Message::Ping { nonce: 42 },
            Message::RequestChunk(RequestChunk {
                path: "a.txt".to_string(),
                client_version: 3,
                offset: 100,
                size: 50,
            }),
            Message::Quit,
        ];

        let mut wire = Vec::new();
        for msg in &msgs {
            write_message(&mut wire, msg).await.unwrap();
        }

        let mut reader = &wire[..];
        for msg in &msgs {
            assert_eq!(&read_message(&mut reader, MAX).await.unwrap(), msg);
        }
        assert!(matches!(
            read_message(&mut reader, MAX).await,
            Err(SyncError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_short_payload_is_connection_closed() {
        let frame = encode_frame(&Message::Ping { nonce: 1 });
        let mut reader = &frame[..frame.len() - 1];
        assert!(matches!(
            read_message(&mut reader, MAX).await,
            Err(SyncError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut wire = Vec::new();
        encode_len(MAX + 1, &mut wire);
        let mut reader = &wire[..];
        assert!(matches!(
            read_message(&mut reader, MAX).await,
            Err(SyncError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_kind_on_stream() {
        let wire = [0x02u8, 0x77, 0x00];
        let mut reader = &wire[..];
        assert!(matches!(
            read_message(&mut reader, MAX).await,
            Err(SyncError::InvalidMessageKind(0x77))
        ));
    }

    #[test]
    fn test_buffer_decode_waits_for_full_frame() {
        let frame = encode_frame(&Message::Commit {
            path: "a.txt".to_string(),
            commit: Commit {
                base_version: 0,
                new_version: 1,
                client_version: 2,
            },
        });

        let mut buf = BytesMut::new();
        for &byte in &frame[..frame.len() - 1] {
            buf.extend_from_slice(&[byte]);
            assert_eq!(decode_frame(&mut buf, MAX).unwrap(), None);
        }
        assert_eq!(buf.len(), frame.len() - 1);

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert!(matches!(
            decode_frame(&mut buf, MAX).unwrap(),
            Some(Message::Commit { .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_buffer_decode_leaves_next_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&Message::Ping { nonce: 1 }));
        buf.extend_from_slice(&encode_frame(&Message::Pong { nonce: 2 }));

        assert_eq!(
            decode_frame(&mut buf, MAX).unwrap(),
            Some(Message::Ping { nonce: 1 })
        );
        assert_eq!(
            decode_frame(&mut buf, MAX).unwrap(),
            Some(Message::Pong { nonce: 2 })
        );
        assert_eq!(decode_frame(&mut buf, MAX).unwrap(), None);
    }

    #[test]
    fn test_buffer_decode_rejects_oversized_prefix_early() {
        let mut buf = BytesMut::new();
        encode_len(MAX * 2, &mut buf);
        assert!(matches!(
            decode_frame(&mut buf, MAX),
            Err(SyncError::MessageTooLarge { .. })
        ));
    }

    /// Short printable text, or a run of one char filling most of the u16
    /// length prefix.
    fn arb_text() -> BoxedStrategy<String> {
        let long = proptest::sample::select(vec!['a', 'é', '字', '🦀'])
            .prop_flat_map(|c| {
                let most = MAX_STRING_LEN / c.len_utf8();
                (Just(c), most - 64..=most)
            })
            .prop_map(|(c, n)| c.to_string().repeat(n));
        prop_oneof![4 => "\\PC{0,40}", 1 => long].boxed()
    }

    fn arb_blob() -> impl Strategy<Value = Bytes> {
        proptest::collection::vec(any::<u8>(), 0..2048).prop_map(Bytes::from)
    }

    fn arb_nack_code() -> impl Strategy<Value = NackCode> {
        proptest::sample::select(vec![
            NackCode::Stale,
            NackCode::Locked,
            NackCode::Unauthenticated,
            NackCode::VersionMismatch,
            NackCode::Busy,
            NackCode::Internal,
        ])
    }

    fn arb_session_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            Just(Message::Quit),
            any::<u16>().prop_map(|version| Message::Hello(Hello { version })),
            any::<u64>().prop_map(|nonce| Message::Ping { nonce }),
            any::<u64>().prop_map(|nonce| Message::Pong { nonce }),
            arb_blob().prop_map(|public_key| Message::KeyExchange { public_key }),
            arb_blob().prop_map(|public_key| Message::KeyExchangeReply { public_key }),
            (arb_text(), arb_blob()).prop_map(|(peer, proof)| Message::Auth(Auth { peer, proof })),
            any::<bool>().prop_map(|accepted| Message::AuthResult { accepted }),
            arb_text().prop_map(|path| Message::Subscribe { path }),
            arb_text().prop_map(|path| Message::Unsubscribe { path }),
        ]
    }

    fn arb_sync_message() -> impl Strategy<Value = Message> {
        let path = "[a-z]{1,12}(/[a-z0-9._]{1,12}){0,3}";
        prop_oneof![
            (path, any::<u64>(), any::<u64>(), any::<u64>()).prop_map(
                |(path, base_version, client_version, size)| {
                    Message::NewVersion(NewVersion {
                        path,
                        base_version,
                        client_version,
                        size,
                    })
                }
            ),
            (path, any::<u64>(), any::<u64>(), any::<u32>()).prop_map(
                |(path, client_version, offset, size)| {
                    Message::RequestChunk(RequestChunk {
                        path,
                        client_version,
                        offset,
                        size,
                    })
                }
            ),
            (path, any::<u64>(), any::<u64>(), arb_blob()).prop_map(
                |(path, client_version, offset, data)| {
                    Message::FileChunk(FileChunk {
                        path,
                        client_version,
                        offset,
                        data,
                    })
                }
            ),
            (path, any::<u64>(), any::<u64>(), any::<u64>()).prop_map(
                |(path, base_version, new_version, client_version)| Message::Commit {
                    path,
                    commit: Commit {
                        base_version,
                        new_version,
                        client_version,
                    },
                }
            ),
            (arb_nack_code(), arb_text(), arb_text()).prop_map(|(code, path, message)| {
                Message::Nack(Nack {
                    code,
                    path,
                    message,
                })
            }),
        ]
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![arb_session_message(), arb_sync_message()]
    }

    proptest! {
        #[test]
        fn frame_roundtrip(msg in arb_message()) {
            let mut buf = BytesMut::from(&encode_frame(&msg)[..]);
            let decoded = decode_frame(&mut buf, MAX).unwrap();
            prop_assert_eq!(decoded, Some(msg));
            prop_assert!(buf.is_empty());
        }
    }
}
