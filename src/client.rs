//! Protocol client.

use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::crypto::CryptoProvider;
use crate::error::{Result, SyncError};
use crate::protocol::{
    read_message, write_message, Auth, Hello, Message, NackCode, PROTOCOL_VERSION,
};
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    max_message_size: u64,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    pub fn with_max_message_size(mut self, max: u64) -> Self {
        self.max_message_size = max;
        self
    }

    /// Send one message and flush.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        write_message(&mut self.writer, msg).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Message> {
        read_message(&mut self.reader, self.max_message_size).await
    }

    async fn request(&mut self, msg: &Message) -> Result<Message> {
        self.send(msg).await?;
        self.recv().await
    }

    /// Negotiate the protocol version. Returns the server's version.
    pub async fn hello(&mut self) -> Result<u16> {
        match self
            .request(&Message::Hello(Hello {
                version: PROTOCOL_VERSION,
            }))
            .await?
        {
            Message::Hello(reply) => Ok(reply.version),
            other => Err(unexpected("Hello", &other)),
        }
    }

    pub async fn ping(&mut self, nonce: u64) -> Result<()> {
        match self.request(&Message::Ping { nonce }).await? {
            Message::Pong { nonce: echoed } if echoed == nonce => Ok(()),
            other => Err(unexpected("Pong", &other)),
        }
    }

    /// Exchange public keys. Returns the server's key.
    pub async fn key_exchange(&mut self, crypto: &dyn CryptoProvider) -> Result<Bytes> {
        let msg = Message::KeyExchange {
            public_key: crypto.public_key(),
        };
        match self.request(&msg).await? {
            Message::KeyExchangeReply { public_key } => Ok(public_key),
            other => Err(unexpected("KeyExchangeReply", &other)),
        }
    }

    /// Prove our peer name to the server. Returns whether it was accepted.
    pub async fn authenticate(
        &mut self,
        crypto: &dyn CryptoProvider,
        server_key: &[u8],
        peer: &str,
    ) -> Result<bool> {
        let proof = crypto.encrypt(peer.as_bytes(), server_key)?;
        let msg = Message::Auth(Auth {
            peer: peer.to_string(),
            proof,
        });
        match self.request(&msg).await? {
            Message::AuthResult { accepted } => Ok(accepted),
            other => Err(unexpected("AuthResult", &other)),
        }
    }

    pub async fn quit(mut self) -> Result<()> {
        self.send(&Message::Quit).await?;
        self.writer.shutdown().await?;
        debug!("sent quit");
        Ok(())
    }
}

fn unexpected(wanted: &str, got: &Message) -> SyncError {
    match got {
        Message::Nack(nack) if nack.code == NackCode::Stale => {
            SyncError::StaleMessage(nack.message.clone())
        }
        Message::Nack(nack) => SyncError::malformed(format!(
            "expected {}, server sent {:?} nack: {}",
            wanted, nack.code, nack.message
        )),
        other => SyncError::malformed(format!("expected {}, got {:?}", wanted, other.kind())),
    }
}
