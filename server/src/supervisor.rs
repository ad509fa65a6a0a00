//! Connection acceptance and per-connection workers
//!
//! Every accepted socket gets its own task that walks through
//! `Accepted → Registered → Active → Closing → Terminated`:
//! - **Accepted**: transport established (WebSocket handshake done), no identity
//! - **Registered**: the store issued an identity and holds the outbox
//! - **Active**: updates are received and broadcast one at a time
//! - **Closing**: the peer closed, an error occurred, the connection was kicked
//!   or the server is shutting down
//! - **Terminated**: the identity is unregistered and the socket closed
//!
//! Unregistration is tied to a [`Registration`] guard, so it happens exactly
//! once on every path out of Active, including task cancellation.

use crate::broadcast::BroadcastCoordinator;
use crate::config::{ServerConfig, TransportKind};
use crate::connection::{run_writer, ConnectionHandle, FrameSink, FrameSource, Inbound, Outbox};
use crate::error::{ServerError, SyncError, SyncResult};
use crate::store::{Registration, StateStore};
use crate::transport;
use log::{debug, error, info, warn};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionPhase {
    Accepted,
    Registered,
    Active,
    Closing,
    Terminated,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Accepted => "accepted",
            ConnectionPhase::Registered => "registered",
            ConnectionPhase::Active => "active",
            ConnectionPhase::Closing => "closing",
            ConnectionPhase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Why a connection left the Active phase
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed the connection cleanly
    PeerClosed,
    /// A broadcast could not be delivered to this connection
    Kicked,
    Shutdown,
    Failed(SyncError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Kicked => write!(f, "dropped after failed delivery"),
            CloseReason::Shutdown => write!(f, "server shutting down"),
            CloseReason::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Stops a running [`ConnectionSupervisor`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Resolves once shutdown was requested (or the supervisor is gone).
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

/// What each connection worker needs from the supervisor
#[derive(Clone)]
struct WorkerContext {
    coordinator: BroadcastCoordinator,
    shutdown: watch::Receiver<bool>,
    idle_timeout: Option<Duration>,
    write_timeout: Duration,
}

/// Accepts connections and runs one worker per connection
pub struct ConnectionSupervisor {
    config: ServerConfig,
    listener: TcpListener,
    coordinator: BroadcastCoordinator,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ConnectionSupervisor {
    /// Validates `config` and binds the listening socket.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let listener =
            TcpListener::bind(config.bind_addr)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: config.bind_addr,
                    source,
                })?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            listener,
            coordinator: BroadcastCoordinator::new(StateStore::new()),
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn store(&self) -> StateStore {
        self.coordinator.store().clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Accepts connections until shutdown is requested, then waits for every
    /// worker to terminate.
    ///
    /// Accept failures are logged and do not stop the loop; connected clients
    /// keep being served.
    pub async fn run(self) {
        let local_addr = self
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| self.config.bind_addr.to_string());
        info!(
            "Server listening on {} ({}, max {} clients)",
            local_addr, self.config.transport, self.config.max_clients
        );

        let slots = Arc::new(Semaphore::new(self.config.max_clients));
        let mut workers = JoinSet::new();
        let mut shutdown = self.shutdown_tx.subscribe();

        let context = WorkerContext {
            coordinator: self.coordinator.clone(),
            shutdown: self.shutdown_tx.subscribe(),
            idle_timeout: self.config.idle_timeout,
            write_timeout: self.config.write_timeout,
        };

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let Ok(slot) = Arc::clone(&slots).try_acquire_owned() else {
                            warn!("Refusing connection from {}: server full", peer);
                            continue;
                        };

                        let kind = self.config.transport;
                        let context = context.clone();
                        workers.spawn(async move {
                            serve_stream(stream, peer, kind, context).await;
                            drop(slot);
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },

                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection worker panicked: {}", e);
                    }
                }
            }
        }

        info!(
            "Server shutting down, closing {} connection(s)",
            workers.len()
        );
        while let Some(finished) = workers.join_next().await {
            if let Err(e) = finished {
                error!("Connection worker panicked: {}", e);
            }
        }

        let store = self.coordinator.store();
        if !store.is_empty() {
            error!("{} client(s) still registered after shutdown", store.len());
        }
        info!("Server stopped");
    }
}

/// Sets up framing for a freshly accepted socket and runs its worker.
async fn serve_stream(
    stream: TcpStream,
    peer: SocketAddr,
    kind: TransportKind,
    context: WorkerContext,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", peer, e);
    }

    match kind {
        TransportKind::Lines => {
            let (source, sink) = transport::lines(stream);
            serve_connection(source, sink, peer, context).await;
        }
        TransportKind::WebSocket => {
            let mut shutdown = context.shutdown.clone();
            let handshake = tokio::select! {
                result = tokio::time::timeout(HANDSHAKE_TIMEOUT, transport::websocket(stream)) => result,
                _ = shutdown_requested(&mut shutdown) => return,
            };

            match handshake {
                Ok(Ok((source, sink))) => serve_connection(source, sink, peer, context).await,
                Ok(Err(e)) => warn!("WebSocket handshake with {} failed: {}", peer, e),
                Err(_) => warn!("WebSocket handshake with {} timed out", peer),
            }
        }
    }
}

/// Runs one connection from Accepted to Terminated.
async fn serve_connection<S, K>(
    source: S,
    sink: K,
    peer: SocketAddr,
    context: WorkerContext,
) where
    S: FrameSource,
    K: FrameSink + 'static,
{
    debug!("Connection from {} {}", peer, ConnectionPhase::Accepted);

    let (outbox, frames) = Outbox::channel();
    let registration: Registration = context.coordinator.store().register_guarded(outbox.clone());
    let id = registration.id();
    info!("Client {} connected from {}", id, peer);
    debug!("Client {} {}", id, ConnectionPhase::Registered);

    let mut writer = tokio::spawn(run_writer(
        sink,
        frames,
        outbox.clone(),
        id,
        context.write_timeout,
    ));
    let mut handle = ConnectionHandle::new(peer, source);

    debug!("Client {} {}", id, ConnectionPhase::Active);
    let reason = run_active(&mut handle, &registration, &outbox, &context).await;

    debug!("Client {} {}: {}", id, ConnectionPhase::Closing, reason);
    match &reason {
        CloseReason::Failed(e) => warn!("Client {} ({}) disconnected: {}", id, handle.peer(), e),
        _ => info!("Client {} ({}) disconnected: {}", id, handle.peer(), reason),
    }
    if let Some(state) = context.coordinator.store().get(id) {
        debug!(
            "Client {} left at ({}, {}) facing {}",
            id, state.x, state.y, state.direction
        );
    }

    // Unregistering drops the store's outbox; with ours gone too the writer
    // sends the last pending snapshot and closes the socket.
    drop(registration);
    drop(outbox);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    debug!("Client {} {}", id, ConnectionPhase::Terminated);
}

/// Receives updates and broadcasts them until the connection has to close.
async fn run_active<S: FrameSource>(
    handle: &mut ConnectionHandle<S>,
    registration: &Registration,
    outbox: &Outbox,
    context: &WorkerContext,
) -> CloseReason {
    let id = registration.id();
    let mut shutdown = context.shutdown.clone();

    loop {
        let received = tokio::select! {
            result = receive(handle, context.idle_timeout) => result,
            _ = outbox.kicked() => return CloseReason::Kicked,
            _ = shutdown_requested(&mut shutdown) => return CloseReason::Shutdown,
        };

        match received {
            Ok(Inbound::Update(update)) => {
                let report = context.coordinator.on_client_update(id, &update);
                debug!(
                    "Client {} update broadcast to {} client(s), {} failed",
                    id, report.delivered, report.failed
                );
            }
            Ok(Inbound::Closed) => return CloseReason::PeerClosed,
            Err(e) => return CloseReason::Failed(e),
        }
    }
}

async fn receive<S: FrameSource>(
    handle: &mut ConnectionHandle<S>,
    idle_timeout: Option<Duration>,
) -> SyncResult<Inbound> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, handle.receive())
            .await
            .unwrap_or(Err(SyncError::IdleTimeout(limit))),
        None => handle.receive().await,
    }
}
