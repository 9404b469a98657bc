//! Fixed-capacity pool of reusable connection handlers.
//!
//! Handlers are created once, when the pool is built. A checked-out handler
//! is wrapped in a `PooledHandler` that goes back to the pool on `reassign`
//! or, failing that, on drop.

use bytes::BytesMut;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Initial receive buffer capacity per handler
const RECV_BUF_CAPACITY: usize = 64 * 1024;

/// Per-connection state that survives across connections.
#[derive(Debug)]
pub struct ConnectionHandler {
    id: usize,
    /// Receive buffer for the frame decoder; cleared between connections
    pub recv_buf: BytesMut,
    served: u64,
}

impl ConnectionHandler {
    fn new(id: usize) -> Self {
        Self {
            id,
            recv_buf: BytesMut::with_capacity(RECV_BUF_CAPACITY),
            served: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Connections served by this handler, including the current one
    pub fn served(&self) -> u64 {
        self.served
    }
}

#[derive(Debug)]
struct PoolState {
    available: Vec<ConnectionHandler>,
    /// Indexed by handler id
    in_use: Vec<bool>,
}

#[derive(Debug)]
struct PoolInner {
    state: Mutex<PoolState>,
    capacity: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let available = (0..capacity).rev().map(ConnectionHandler::new).collect();
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    available,
                    in_use: vec![false; capacity],
                }),
                capacity,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        // Bookkeeping is only mutated in short sections that cannot panic
        // halfway, so a poisoned lock still guards consistent state.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a free handler, or `None` when every handler is busy.
    pub fn checkout(&self) -> Option<PooledHandler> {
        let mut state = self.state();
        let mut handler = state.available.pop()?;
        let slot = &mut state.in_use[handler.id];
        assert!(!*slot, "handler {} checked out twice", handler.id);
        *slot = true;
        drop(state);

        handler.served += 1;
        debug!("checked out handler {}", handler.id);
        Some(PooledHandler {
            handler: Some(handler),
            pool: self.clone(),
        })
    }

    fn give_back(&self, mut handler: ConnectionHandler) {
        handler.recv_buf.clear();
        let id = handler.id;
        let mut state = self.state();
        let slot = &mut state.in_use[id];
        assert!(*slot, "handler {} returned while not checked out", id);
        *slot = false;
        state.available.push(handler);
        drop(state);
        debug!("handler {} back in pool", id);
    }

    /// Handlers currently free
    pub fn available(&self) -> usize {
        self.state().available.len()
    }

    /// Alias of `available`, for diagnostics
    pub fn size(&self) -> usize {
        self.available()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// A handler checked out of a `WorkerPool`.
#[derive(Debug)]
pub struct PooledHandler {
    handler: Option<ConnectionHandler>,
    pool: WorkerPool,
}

impl PooledHandler {
    pub fn id(&self) -> usize {
        self.handler.as_ref().map_or(usize::MAX, |h| h.id)
    }

    pub fn handler(&mut self) -> &mut ConnectionHandler {
        // Only `None` after reassign/drop, both of which consume self.
        self.handler
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled handler already returned"))
    }

    /// Return the handler to its pool.
    pub fn reassign(mut self) {
        if let Some(handler) = self.handler.take() {
            self.pool.give_back(handler);
        }
    }
}

impl Drop for PooledHandler {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            warn!(
                "handler {} dropped without reassign; returning it to the pool",
                handler.id
            );
            self.pool.give_back(handler);
        }
    }
}
