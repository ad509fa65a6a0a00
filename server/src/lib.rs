//! # State Sync Server Library
//!
//! This library provides the server side of a real-time shared-state
//! synchronization service. Clients connect, periodically report their own
//! position and heading, and after every report the server sends each connected
//! client the full set of known client states.
//!
//! ## Core Responsibilities
//!
//! ### Shared State
//! The server keeps one entry per live connection, created with a default state
//! when the connection is accepted and removed when it closes. Reports are
//! partial: only the fields a client sends are overwritten.
//!
//! ### Connection Lifecycle
//! Handles the complete lifecycle of client connections including:
//! - Connection acceptance and identity assignment
//! - Decoding of state reports
//! - Disconnection handling and cleanup, exactly once per connection
//! - Capacity limits and optional idle eviction
//!
//! ### State Broadcasting
//! Every processed report triggers one broadcast of a consistent snapshot to all
//! connected clients, including the one that sent it.
//!
//! ## Architecture Design
//!
//! ### One Task Per Connection
//! Each connection is served by its own task on the multi-threaded runtime, so
//! a client waiting on the network never stalls the others. A second task per
//! connection owns the socket's write half and is the only writer on it.
//!
//! ### Narrow Critical Section
//! The client registry sits behind a single mutex that is held only while the
//! map is read or modified. Snapshot encoding and all socket I/O happen outside
//! of it.
//!
//! ### Transports
//! WebSocket (one JSON document per text message) is the default. A plain TCP
//! mode with newline-delimited JSON is available for simple tooling.
//!
//! ## Module Organization
//!
//! ### Store Module (`store`)
//! Identity issuing, state merging and snapshot copies.
//!
//! ### Connection Module (`connection`)
//! Read-side handle with message decoding and the newest-snapshot outbox that
//! feeds each connection's writer task.
//!
//! ### Transport Module (`transport`)
//! WebSocket and newline-delimited framing.
//!
//! ### Broadcast Module (`broadcast`)
//! Merge-then-fan-out of updates with per-connection failure isolation.
//!
//! ### Supervisor Module (`supervisor`)
//! Accept loop, per-connection workers and graceful shutdown.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{ConnectionSupervisor, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let supervisor = ConnectionSupervisor::bind(ServerConfig::default()).await?;
//!     let shutdown = supervisor.shutdown_handle();
//!
//!     let server = tokio::spawn(supervisor.run());
//!
//!     tokio::signal::ctrl_c().await?;
//!     shutdown.shutdown();
//!     server.await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use broadcast::{BroadcastCoordinator, BroadcastReport};
pub use config::{ServerConfig, TransportKind};
pub use connection::{ConnectionHandle, Inbound, Outbox};
pub use error::{ConfigError, ServerError, SyncError, SyncResult};
pub use store::{Registration, StateStore};
pub use supervisor::{ConnectionPhase, ConnectionSupervisor, ShutdownHandle};
