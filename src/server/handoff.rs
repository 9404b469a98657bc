//! Single-producer/single-consumer handoff queue.
//!
//! Moves work from a connection's socket-reading task to its worker. Neither
//! end is `Clone`, so each queue has exactly one producer and one consumer.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

pub fn handoff<T>() -> (Producer<T>, Consumer<T>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (Producer { tx }, Consumer { rx })
}

#[derive(Debug)]
pub struct Producer<T> {
    tx: Sender<T>,
}

impl<T> Producer<T> {
    /// Link `item` at the tail. Never blocks. Returns `false` if the consumer
    /// is gone.
    pub fn enqueue(&mut self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

#[derive(Debug)]
pub struct Consumer<T> {
    rx: Receiver<T>,
}

impl<T> Consumer<T> {
    /// Take the head, or `None` when the queue is empty.
    pub fn dequeue(&mut self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait for the head. `None` once the producer is gone and the queue
    /// is drained.
    pub fn dequeue_blocking(&mut self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Wait up to `timeout` for the head.
    pub fn dequeue_timeout(&mut self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}
