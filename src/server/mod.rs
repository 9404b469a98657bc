//! Sync server.
//!
//! Accepts TCP connections and serves each one on a handler checked out of
//! a fixed-size pool. When the pool is exhausted the connection is refused
//! with a `Busy` nack; the accept loop itself never blocks on a handler.

pub mod connection;
pub mod dispatch;
pub mod handoff;
pub mod pool;

pub use dispatch::{Dispatch, Dispatcher, Flow, Job, Session};
pub use pool::{ConnectionHandler, PooledHandler, WorkerPool};

use crate::config::Config;
use crate::crypto::{CryptoProvider, PlaintextProvider};
use crate::error::{Result, SyncError};
use crate::meta::MetadataStore;
use crate::protocol::{write_message, Message, Nack, NackCode};
use crate::sync::{LocalEdits, Reconciler, VersionHub};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// State shared by every connection.
pub struct ServerContext {
    pub config: Config,
    pub store: MetadataStore,
    pub reconciler: Reconciler,
    pub crypto: Arc<dyn CryptoProvider>,
    pub hub: VersionHub,
}

impl ServerContext {
    pub fn new(config: Config, crypto: Arc<dyn CryptoProvider>) -> Self {
        let store = MetadataStore::new(config.data_dir.clone())
            .with_lock_timeout(config.lock_timeout());
        let reconciler = Reconciler::new(store.clone(), config.chunk_size);
        Self {
            config,
            store,
            reconciler,
            crypto,
            hub: VersionHub::new(),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    pool: WorkerPool,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Bind with the pass-through crypto provider.
    pub async fn bind(config: Config) -> Result<Self> {
        Self::bind_with(config, Arc::new(PlaintextProvider::default())).await
    }

    pub async fn bind_with(config: Config, crypto: Arc<dyn CryptoProvider>) -> Result<Self> {
        config.validate()?;
        if !config.data_dir.exists() {
            std::fs::create_dir_all(&config.data_dir)?;
        }

        let listener = TcpListener::bind(&config.listen_addr).await.map_err(|e| {
            SyncError::Config(format!("cannot listen on {}: {}", config.listen_addr, e))
        })?;
        let pool = WorkerPool::new(config.max_connections);
        info!(
            "serving {} on {} with {} handlers",
            config.data_dir.display(),
            listener.local_addr()?,
            pool.capacity()
        );

        Ok(Self {
            listener,
            ctx: Arc::new(ServerContext::new(config, crypto)),
            pool,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Entry point for the filesystem passthrough on this server's tree.
    pub fn local_edits(&self) -> LocalEdits {
        LocalEdits::new(self.ctx.store.clone(), self.ctx.hub.clone())
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Serve until the process is stopped.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes; open connections are then told to
    /// finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr, &stop_rx),
                    // Per-connection accept failures (e.g. EMFILE) must not
                    // take the server down.
                    Err(e) => error!("accept failed: {}", e),
                },
                _ = &mut shutdown => break,
            }
        }

        info!("shutting down; {} connection(s) open", self.pool.in_use());
        let _ = stop_tx.send(true);
        Ok(())
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr, stop: &watch::Receiver<bool>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let Some(handler) = self.pool.checkout() else {
            warn!(
                "refusing conn {} from {}: {}",
                conn_id,
                addr,
                SyncError::PoolExhausted
            );
            tokio::spawn(refuse(stream));
            return;
        };

        tokio::spawn(connection::serve_connection(
            stream,
            handler,
            Arc::clone(&self.ctx),
            conn_id,
            stop.clone(),
        ));
    }
}

/// Best-effort `Busy` nack before dropping a refused connection.
async fn refuse(mut stream: TcpStream) {
    let nack = Message::Nack(Nack::new(NackCode::Busy, "", "server at capacity"));
    if write_message(&mut stream, &nack).await.is_ok() {
        let _ = stream.flush().await;
        let _ = stream.shutdown().await;
    }
}
