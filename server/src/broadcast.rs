//! Fan-out of state snapshots
//!
//! Every processed update produces exactly one broadcast round: the update is
//! merged, a snapshot is copied out of the store, encoded once, and the same
//! frame is handed to every registered connection, the sender included.

use crate::store::StateStore;
use log::{debug, error, warn};
use shared::{ClientId, StateUpdate};
use std::sync::Arc;

/// Outcome of one broadcast round
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the snapshot was handed to
    pub delivered: usize,
    /// Connections whose writer was gone; they were kicked
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct BroadcastCoordinator {
    store: StateStore,
}

impl BroadcastCoordinator {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Merges `update` from `id` and broadcasts the resulting snapshot.
    ///
    /// A connection that cannot accept the frame is kicked; the others still
    /// receive it. Updates from clients that already left are dropped without
    /// a broadcast.
    pub fn on_client_update(&self, id: ClientId, update: &StateUpdate) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let Some(round) = self.store.update_and_snapshot(id, update) else {
            debug!("Dropping update from departed client {}", id);
            return report;
        };

        let frame: Arc<str> = match round.snapshot.encode() {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed to encode snapshot: {}", e);
                return report;
            }
        };

        for (peer, outbox) in round.recipients {
            match outbox.deliver(Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Dropping client {}: {}", peer, e);
                    report.failed += 1;
                }
            }
        }

        report
    }
}
