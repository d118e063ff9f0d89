//! Pending-echo table correlating outgoing sends with their remote echoes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ids::{MatrixEventId, MatrixRoomId, TransactionId};
use crate::network::EchoHandler;
use crate::storage::MessageRecord;

/// A locally-initiated send waiting for its echo.
pub struct PendingEcho {
    /// Pre-persisted row, finalized when the echo arrives.
    pub draft: MessageRecord,
    pub room_id: MatrixRoomId,
    /// The Matrix event that caused the send; receives the status report.
    pub source_event_id: Option<MatrixEventId>,
    pub on_echo: Option<EchoHandler>,
    pub registered_at: DateTime<Utc>,
}

impl std::fmt::Debug for PendingEcho {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEcho")
            .field("draft", &self.draft.id)
            .field("source_event_id", &self.source_event_id)
            .field("registered_at", &self.registered_at)
            .finish_non_exhaustive()
    }
}

/// Portal-local map from transaction id to pending send. Entries are
/// one-shot: whoever removes one owns finalization and the status report.
#[derive(Debug, Default)]
pub struct PendingEchoTable {
    entries: Mutex<HashMap<TransactionId, PendingEcho>>,
}

impl PendingEchoTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transaction_id: TransactionId, pending: PendingEcho) {
        self.entries
            .lock()
            .expect("pending echo lock poisoned")
            .insert(transaction_id, pending);
    }

    /// Removes and returns the entry for the transaction, if any.
    pub fn take(&self, transaction_id: &TransactionId) -> Option<PendingEcho> {
        self.entries
            .lock()
            .expect("pending echo lock poisoned")
            .remove(transaction_id)
    }

    /// Removes entries older than `ttl`. The connector is supposed to
    /// always echo; this is the backstop when it does not.
    pub fn drain_expired(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<PendingEcho> {
        let cutoff = now - chrono::Duration::from_std(ttl).unwrap_or_default();
        let mut entries = self.entries.lock().expect("pending echo lock poisoned");
        let expired: Vec<TransactionId> = entries
            .iter()
            .filter(|(_, pending)| pending.registered_at < cutoff)
            .map(|(txn, _)| txn.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|txn| entries.remove(&txn))
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .expect("pending echo lock poisoned")
            .is_empty()
    }
}
