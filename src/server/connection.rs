//! Per-connection loop.
//!
//! Three tasks per connection:
//! - the reader (this task) decodes frames from the handler's receive buffer
//!   and merges them with hub notices into the handoff queue
//! - a blocking worker drains the queue through the dispatcher, so lease
//!   waits never stall the runtime
//! - a writer sends replies in the order the worker produced them

use crate::error::{Result, SyncError};
use crate::protocol::{decode_frame, write_message, Message};
use crate::server::dispatch::{Dispatcher, Flow, Job, Session};
use crate::server::handoff::{handoff, Consumer};
use crate::server::pool::PooledHandler;
use crate::server::ServerContext;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Serve one connection to completion, then return the handler to its pool.
pub async fn serve_connection(
    stream: TcpStream,
    mut pooled: PooledHandler,
    ctx: Arc<ServerContext>,
    conn_id: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!(
        "conn {} from {} on handler {}",
        conn_id,
        peer,
        pooled.id()
    );

    let (mut reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(write_loop(writer, out_rx));

    let (mut producer, consumer) = handoff::<Job>();
    let quit = Arc::new(Notify::new());
    let worker = tokio::task::spawn_blocking({
        let dispatcher = Dispatcher::new(Arc::clone(&ctx));
        let out_tx = out_tx.clone();
        let quit = Arc::clone(&quit);
        move || work_loop(conn_id, dispatcher, consumer, out_tx, quit)
    });

    let mut notices = ctx.hub.subscribe();
    let mut hub_open = true;
    let max_size = ctx.config.max_message_size;
    let buf = &mut pooled.handler().recv_buf;

    let outcome: Result<()> = 'conn: loop {
        loop {
            match decode_frame(buf, max_size) {
                Ok(Some(msg)) => {
                    if !producer.enqueue(Job::Inbound(msg)) {
                        break 'conn Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => break 'conn Err(e),
            }
        }

        tokio::select! {
            read = reader.read_buf(buf) => match read {
                Ok(0) => {
                    if !buf.is_empty() {
                        debug!("conn {}: hang-up with {} bytes of partial frame", conn_id, buf.len());
                    }
                    break 'conn Ok(());
                }
                Ok(_) => {}
                Err(e) => break 'conn Err(e.into()),
            },
            notice = notices.recv(), if hub_open => match notice {
                Ok(nv) => {
                    if !producer.enqueue(Job::Notice(nv)) {
                        break 'conn Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("conn {}: missed {} version notices", conn_id, missed);
                }
                Err(broadcast::error::RecvError::Closed) => hub_open = false,
            },
            _ = quit.notified() => break 'conn Ok(()),
            _ = shutdown.changed() => {
                debug!("conn {}: server shutting down", conn_id);
                break 'conn Ok(());
            }
        }
    };

    match &outcome {
        Ok(()) => debug!("conn {}: reader done", conn_id),
        Err(SyncError::ConnectionClosed) => debug!("conn {}: closed", conn_id),
        Err(e) => warn!("conn {}: {}", conn_id, e),
    }

    // Let the worker drain what was already queued, then the writer flush
    // its replies.
    drop(producer);
    if let Err(e) = worker.await {
        warn!("conn {}: worker failed: {}", conn_id, e);
    }
    drop(out_tx);
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("conn {}: writer: {}", conn_id, e),
        Err(e) => warn!("conn {}: writer failed: {}", conn_id, e),
    }

    info!("conn {} from {} finished", conn_id, peer);
    pooled.reassign();
}

fn work_loop(
    conn_id: u64,
    dispatcher: Dispatcher,
    mut jobs: Consumer<Job>,
    out: mpsc::UnboundedSender<Message>,
    quit: Arc<Notify>,
) {
    let mut session = Session::new(conn_id);
    while let Some(job) = jobs.dequeue_blocking() {
        let outcome = match job {
            Job::Inbound(msg) => dispatcher.dispatch(&mut session, msg),
            Job::Notice(nv) => Ok(dispatcher.dispatch_notice(&session, nv)),
        };

        let dispatch = match outcome {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!("conn {}: closing after {}", conn_id, e);
                quit.notify_one();
                return;
            }
        };
        for reply in dispatch.replies {
            if out.send(reply).is_err() {
                debug!("conn {}: writer gone", conn_id);
                quit.notify_one();
                return;
            }
        }
        if dispatch.flow == Flow::Quit {
            debug!("conn {}: quit", conn_id);
            quit.notify_one();
            return;
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut replies: mpsc::UnboundedReceiver<Message>,
) -> Result<()> {
    while let Some(msg) = replies.recv().await {
        write_message(&mut writer, &msg).await?;
        if replies.is_empty() {
            writer.flush().await?;
        }
    }
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}
