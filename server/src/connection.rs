//! Per-connection message plumbing
//!
//! A connection is split in two halves:
//! - [`ConnectionHandle`] owns the read side. The connection worker calls
//!   [`ConnectionHandle::receive`] in a loop and gets decoded state updates.
//! - [`Outbox`] is the write side as seen by everybody else. Broadcasts drop
//!   the newest encoded snapshot into it, and a single writer task
//!   ([`run_writer`]) moves snapshots onto the socket, so frames from
//!   concurrent broadcasts are never interleaved.
//!
//! Framing lives behind [`FrameSource`] and [`FrameSink`]; see
//! [`crate::transport`] for the WebSocket and newline-delimited variants.

use crate::error::{SyncError, SyncResult};
use log::{debug, warn};
use shared::{ClientId, StateUpdate};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Source of complete inbound text frames.
pub trait FrameSource: Send {
    /// Resolves to the next frame, or `None` once the peer closed cleanly.
    fn next_frame(&mut self) -> impl Future<Output = SyncResult<Option<String>>> + Send;
}

/// Sink for outbound text frames.
pub trait FrameSink: Send {
    fn send_frame(&mut self, frame: &str) -> impl Future<Output = SyncResult<()>> + Send;

    fn close(&mut self) -> impl Future<Output = SyncResult<()>> + Send;
}

/// What a single [`ConnectionHandle::receive`] produced
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Update(StateUpdate),
    Closed,
}

/// Read side of one client connection
pub struct ConnectionHandle<S> {
    peer: SocketAddr,
    source: S,
}

impl<S: FrameSource> ConnectionHandle<S> {
    pub fn new(peer: SocketAddr, source: S) -> Self {
        Self { peer, source }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Waits for the next state update from the peer.
    ///
    /// A frame that does not decode is a protocol error; the stream cannot be
    /// trusted to resynchronise after it.
    pub async fn receive(&mut self) -> SyncResult<Inbound> {
        match self.source.next_frame().await? {
            Some(frame) => {
                let update = StateUpdate::decode(&frame)?;
                Ok(Inbound::Update(update))
            }
            None => Ok(Inbound::Closed),
        }
    }
}

/// Write side of one client connection, shared with the broadcaster
///
/// Holds only the newest undelivered snapshot. Every snapshot carries the
/// full state, so a peer whose writer falls behind skips straight to the
/// latest one instead of building up a backlog.
#[derive(Debug, Clone)]
pub struct Outbox {
    latest: Arc<watch::Sender<Option<Arc<str>>>>,
    kick: Arc<Notify>,
}

/// Receiving end of an [`Outbox`], owned by the writer task
#[derive(Debug)]
pub struct Frames {
    latest: watch::Receiver<Option<Arc<str>>>,
}

impl Outbox {
    /// Creates an empty outbox together with the receiving end for the writer
    /// task.
    pub fn channel() -> (Self, Frames) {
        let (latest, rx) = watch::channel(None);
        let outbox = Self {
            latest: Arc::new(latest),
            kick: Arc::new(Notify::new()),
        };
        (outbox, Frames { latest: rx })
    }

    /// Replaces the pending snapshot without waiting.
    ///
    /// Fails only when the writer has gone, in which case the connection is
    /// kicked so its worker tears it down.
    pub fn deliver(&self, frame: Arc<str>) -> SyncResult<()> {
        self.latest.send(Some(frame)).map_err(|_| {
            self.kick();
            SyncError::PeerClosed
        })
    }

    /// Asks the owning worker to close the connection.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Resolves once [`Outbox::kick`] has been called.
    pub async fn kicked(&self) {
        self.kick.notified().await;
    }
}

impl Frames {
    /// Waits for a snapshot newer than the last one taken.
    ///
    /// Returns `None` once every [`Outbox`] clone is dropped and the final
    /// snapshot has been taken.
    pub async fn next(&mut self) -> Option<Arc<str>> {
        loop {
            self.latest.changed().await.ok()?;
            let frame = self.latest.borrow_and_update().clone();
            if frame.is_some() {
                return frame;
            }
        }
    }
}

/// Drains `frames` onto `sink` until every [`Outbox`] clone is dropped or a
/// write fails.
///
/// A write that fails, or that the peer does not accept within
/// `write_timeout`, kicks the connection.
pub async fn run_writer<K: FrameSink>(
    mut sink: K,
    mut frames: Frames,
    outbox: Outbox,
    id: ClientId,
    write_timeout: Duration,
) {
    // Only the kick handle is needed here; holding the sender would keep the
    // channel open forever.
    let Outbox { latest, kick } = outbox;
    drop(latest);

    while let Some(frame) = frames.next().await {
        let result = match tokio::time::timeout(write_timeout, sink.send_frame(&frame)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::WriteStalled(write_timeout)),
        };

        if let Err(e) = result {
            warn!("Failed to send snapshot to client {}: {}", id, e);
            kick.notify_one();
            return;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Error closing connection of client {}: {}", id, e);
    }
}
