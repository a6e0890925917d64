//! # RPC Correlation
//!
//! ## Purpose
//! Matches replies arriving on a module's response destination back to the
//! caller blocked inside `execute`. The table is time-windowed: every entry
//! carries a deadline, abandoned calls remove their own entry on timeout,
//! and expired entries are swept on registration, so repeated timeouts never
//! grow the table.
//!
//! Late replies for abandoned correlation ids are ignored with a debug log;
//! the response subscription itself stays active for the transport's
//! lifetime.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

struct PendingReply {
    tx: oneshot::Sender<String>,
    deadline: Instant,
}

/// Pending-reply table keyed by correlation id.
#[derive(Default)]
pub struct CorrelationTable {
    pending: DashMap<String, PendingReply>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call and return the receiver the caller awaits.
    ///
    /// `window` bounds how long the entry may live; expired entries from
    /// earlier calls are swept here so the table stays bounded even when
    /// callers drop their receiver without calling [`abandon`].
    ///
    /// [`abandon`]: CorrelationTable::abandon
    pub fn register(&self, correlation_id: &str, window: Duration) -> oneshot::Receiver<String> {
        self.evict_expired();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            correlation_id.to_string(),
            PendingReply {
                tx,
                deadline: Instant::now() + window,
            },
        );
        rx
    }

    /// Resolve the pending call for `correlation_id` with the reply payload.
    ///
    /// Returns false for unknown or already-abandoned ids; those replies are
    /// simply dropped.
    pub fn complete(&self, correlation_id: &str, payload: String) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, entry)) => entry.tx.send(payload).is_ok(),
            None => {
                debug!(
                    correlation_id,
                    "ignoring reply for unknown or abandoned correlation id"
                );
                false
            }
        }
    }

    /// Drop the entry for a call the caller gave up on.
    pub fn abandon(&self, correlation_id: &str) {
        self.pending.remove(correlation_id);
    }

    /// Sweep entries whose window has elapsed.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.pending.retain(|_, entry| entry.deadline > now);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Process-unique message id generator.
///
/// A random prefix plus an atomic counter, injected into the bus rather
/// than living in process-wide state. Ids are unique across instances of
/// the same module, which matters because response destinations and
/// correlation ids are derived from them.
pub struct IdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            prefix: uuid::Uuid::new_v4().simple().to_string(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}
