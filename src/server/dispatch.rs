//! Message dispatcher.
//!
//! Routes each decoded message to one handling routine by kind. Failures
//! scoped to a single message become a `Nack` for the peer; only
//! connection-fatal errors propagate to the connection loop.

use crate::error::{ErrorCategory, Result, SyncError};
use crate::protocol::{
    negotiate_version, Auth, Hello, Message, Nack, NackCode, NewVersion,
    VersionNegotiationResult, PROTOCOL_VERSION,
};
use crate::server::ServerContext;
use crate::sync::{path_matches, TransferTable};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Work handed from a connection's reader to its worker.
#[derive(Debug)]
pub enum Job {
    /// A message decoded from the socket
    Inbound(Message),
    /// A local version notice from the hub
    Notice(NewVersion),
}

/// Whether the connection keeps going after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Outcome of dispatching one message.
#[derive(Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub flow: Flow,
    /// Sent in order, before the connection acts on `flow`
    pub replies: Vec<Message>,
}

impl Dispatch {
    fn reply(msg: Message) -> Self {
        Self {
            flow: Flow::Continue,
            replies: vec![msg],
        }
    }

    fn replies(replies: Vec<Message>) -> Self {
        Self {
            flow: Flow::Continue,
            replies,
        }
    }

    fn none() -> Self {
        Self::replies(Vec::new())
    }
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct Session {
    pub conn_id: u64,
    pub peer_key: Option<Bytes>,
    pub peer_name: Option<String>,
    pub authenticated: bool,
    /// Path prefixes; `""` subscribes to the whole tree
    pub subscriptions: BTreeSet<String>,
    pub transfers: TransferTable,
}

impl Session {
    pub fn new(conn_id: u64) -> Self {
        Self {
            conn_id,
            peer_key: None,
            peer_name: None,
            authenticated: false,
            subscriptions: BTreeSet::new(),
            transfers: TransferTable::new(),
        }
    }

    pub fn is_subscribed(&self, path: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|prefix| path_matches(prefix, path))
    }
}

/// Routes messages against the shared server context.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<ServerContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    pub fn dispatch(&self, session: &mut Session, msg: Message) -> Result<Dispatch> {
        let kind = msg.kind();
        debug!("conn {}: {:?}", session.conn_id, kind);

        let path = msg.path().unwrap_or_default().to_string();
        if self.ctx.config.require_auth && !session.authenticated && kind.requires_auth() {
            warn!(
                "conn {}: {:?} before authentication, refusing",
                session.conn_id, kind
            );
            return Ok(Dispatch::reply(Message::Nack(Nack::new(
                NackCode::Unauthenticated,
                path,
                "authenticate first",
            ))));
        }

        match self.route(session, msg) {
            Ok(dispatch) => Ok(dispatch),
            Err(e) if e.is_connection_fatal() => Err(e),
            Err(e) => Ok(Dispatch::reply(Message::Nack(nack_for(&e, path)))),
        }
    }

    /// Forward a hub notice if the session subscribes to its path.
    pub fn dispatch_notice(&self, session: &Session, notice: NewVersion) -> Dispatch {
        if self.ctx.config.require_auth && !session.authenticated {
            return Dispatch::none();
        }
        if session.is_subscribed(&notice.path) {
            Dispatch::reply(Message::NewVersion(notice))
        } else {
            Dispatch::none()
        }
    }

    fn route(&self, session: &mut Session, msg: Message) -> Result<Dispatch> {
        let reconciler = &self.ctx.reconciler;
        match msg {
            Message::Quit => Ok(Dispatch {
                flow: Flow::Quit,
                replies: Vec::new(),
            }),
            Message::Hello(hello) => Ok(self.hello(session, hello)),
            Message::Ping { nonce } => Ok(Dispatch::reply(Message::Pong { nonce })),
            Message::KeyExchange { public_key } => {
                session.peer_key = Some(public_key);
                Ok(Dispatch::reply(Message::KeyExchangeReply {
                    public_key: self.ctx.crypto.public_key(),
                }))
            }
            Message::Auth(auth) => Ok(self.authenticate(session, auth)),
            Message::Subscribe { path } => {
                if !path.is_empty() {
                    self.ctx.store.resolve(&path)?;
                }
                debug!("conn {}: subscribed to {:?}", session.conn_id, path);
                session.subscriptions.insert(path);
                Ok(Dispatch::none())
            }
            Message::Unsubscribe { path } => {
                session.subscriptions.remove(&path);
                Ok(Dispatch::none())
            }
            Message::NewVersion(nv) => reconciler
                .handle_new_version(&mut session.transfers, &nv)
                .map(Dispatch::replies),
            Message::RequestChunk(req) => reconciler.handle_request_chunk(&req).map(Dispatch::reply),
            Message::FileChunk(chunk) => reconciler
                .handle_file_chunk(&mut session.transfers, &chunk)
                .map(Dispatch::replies),
            Message::Commit { path, commit } => {
                reconciler.handle_commit(&path, &commit)?;
                Ok(Dispatch::none())
            }
            Message::Nack(nack) => {
                debug!(
                    "conn {}: peer nack {:?} for {:?}: {}",
                    session.conn_id, nack.code, nack.path, nack.message
                );
                if session.transfers.remove(&nack.path).is_some() {
                    debug!("conn {}: dropped transfer of {}", session.conn_id, nack.path);
                }
                Ok(Dispatch::none())
            }
            other @ (Message::Pong { .. }
            | Message::KeyExchangeReply { .. }
            | Message::AuthResult { .. }) => {
                debug!(
                    "conn {}: no routine for {:?}, dropping",
                    session.conn_id,
                    other.kind()
                );
                Ok(Dispatch::none())
            }
        }
    }

    fn hello(&self, session: &Session, hello: Hello) -> Dispatch {
        match negotiate_version(hello.version) {
            VersionNegotiationResult::Supported(v) => {
                debug!("conn {}: protocol version {}", session.conn_id, v);
                Dispatch::reply(Message::Hello(Hello {
                    version: PROTOCOL_VERSION,
                }))
            }
            unsupported => {
                warn!("conn {}: {:?}", session.conn_id, unsupported);
                Dispatch {
                    flow: Flow::Quit,
                    replies: vec![Message::Nack(Nack::new(
                        NackCode::VersionMismatch,
                        "",
                        format!("unsupported protocol version {}", hello.version),
                    ))],
                }
            }
        }
    }

    fn authenticate(&self, session: &mut Session, auth: Auth) -> Dispatch {
        let proof_ok = match self.ctx.crypto.decrypt(&auth.proof) {
            Ok(plain) => plain.as_ref() == auth.peer.as_bytes(),
            Err(e) => {
                warn!("conn {}: auth proof rejected: {}", session.conn_id, e);
                false
            }
        };
        let accepted = proof_ok && self.ctx.config.is_peer_allowed(&auth.peer);

        if accepted {
            info!("conn {}: authenticated as {}", session.conn_id, auth.peer);
            session.peer_name = Some(auth.peer);
        } else {
            warn!("conn {}: authentication failed for {}", session.conn_id, auth.peer);
        }
        session.authenticated = accepted;
        Dispatch::reply(Message::AuthResult { accepted })
    }
}

fn nack_for(err: &SyncError, path: String) -> Nack {
    let code = match (err, err.category()) {
        (_, ErrorCategory::Stale) => {
            warn!("dropping stale message for {:?}: {}", path, err);
            NackCode::Stale
        }
        (SyncError::MetadataLocked(_), _) => {
            debug!("version record for {:?} is locked", path);
            NackCode::Locked
        }
        _ => {
            warn!("message for {:?} failed: {}", path, err);
            NackCode::Internal
        }
    };
    Nack::new(code, path, err.to_string())
}
