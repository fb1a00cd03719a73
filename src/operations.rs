//! Correlation of asynchronous "operation end" reports with the do-sync
//! requests that triggered them.
//!
//! Each record remembers the connection it was issued on so that losing a
//! connection fails exactly the operations that can no longer complete.
//! Whichever of complete / expire / fail-all reaches a record first removes
//! it; later events for the same identifier are no-ops.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::connection::ConnectionId;
use crate::error::{Error, Result};
use crate::protocol::OperationId;

/// Outcome delivered to the waiter of a do-sync.
pub type OperationResult = Result<OperationId>;

/// Receiving half handed back by [`OperationTable::register`].
pub type OperationReceiver = oneshot::Receiver<OperationResult>;

#[derive(Debug)]
struct PendingOperation {
    connection: ConnectionId,
    timeout: Duration,
    deadline: Instant,
    done: oneshot::Sender<OperationResult>,
}

/// Pending do-sync operations keyed by identifier.
#[derive(Debug, Default)]
pub struct OperationTable {
    pending: HashMap<OperationId, PendingOperation>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record. Must happen before the do-sync bytes are written, or
    /// a fast report could arrive for an identifier nobody is waiting on.
    pub fn register(
        &mut self,
        id: OperationId,
        connection: ConnectionId,
        timeout: Duration,
    ) -> Result<OperationReceiver> {
        if self.pending.contains_key(&id) {
            return Err(Error::DuplicateOperation(id.to_string()));
        }
        let (done, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingOperation {
                connection,
                timeout,
                deadline: Instant::now() + timeout,
                done,
            },
        );
        Ok(rx)
    }

    /// Resolves an operation from an operation-end report.
    ///
    /// Returns `false` for unknown or already-resolved identifiers.
    pub fn complete(&mut self, id: &OperationId) -> bool {
        match self.pending.remove(id) {
            Some(op) => {
                let _ = op.done.send(Ok(id.clone()));
                true
            }
            None => false,
        }
    }

    /// Fails every record issued on `connection`. Returns how many were failed.
    pub fn fail_all_for(&mut self, connection: &ConnectionId, error: &Error) -> usize {
        let ids: Vec<OperationId> = self
            .pending
            .iter()
            .filter(|(_, op)| op.connection == *connection)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ids {
            if let Some(op) = self.pending.remove(id) {
                let _ = op.done.send(Err(error.clone()));
            }
        }
        ids.len()
    }

    /// Fails a record whose deadline elapsed.
    ///
    /// Returns the connection it was issued on if the record was still
    /// pending; the caller treats that connection as broken.
    pub fn expire(&mut self, id: &OperationId, error: Error) -> Option<ConnectionId> {
        let op = self.pending.remove(id)?;
        let _ = op.done.send(Err(error));
        Some(op.connection)
    }

    /// Operations whose deadline is at or before `now`, with the timeout
    /// each was given.
    pub fn overdue(&self, now: Instant) -> Vec<(OperationId, Duration)> {
        self.pending
            .iter()
            .filter(|(_, op)| op.deadline <= now)
            .map(|(id, op)| (id.clone(), op.timeout))
            .collect()
    }

    /// Drops a record without resolving it, for a do-sync that never made it
    /// onto the wire. The waiter sees its channel close.
    pub fn remove(&mut self, id: &OperationId) -> bool {
        self.pending.remove(id).is_some()
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
