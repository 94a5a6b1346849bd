//! Correlation of outgoing calls with their responses.
//!
//! Every outgoing call owns one entry in the [`TransactionTable`], keyed by a
//! per-connection transaction id. The entry is removed exactly once, by the
//! first of: the matching response, an explicit failure, the per-call timeout
//! task, or channel close. Whoever removes it completes the caller's
//! [`PendingCall`]; everyone else finds nothing and backs off.

use crate::error::{Result, TetherError};
use crate::registry::ParamType;
use crate::wire::ResponseFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// How a pending call ended.
#[derive(Debug)]
pub enum CallOutcome {
    /// The peer answered.
    Responded(ResponseFrame),
    /// The call failed locally (connection closed, encode error, ...).
    Failed(TetherError),
    /// The deadline passed first.
    TimedOut,
}

struct PendingEntry {
    slot: oneshot::Sender<CallOutcome>,
    expected: ParamType,
    created_at: Instant,
    timer: Option<AbortHandle>,
}

impl PendingEntry {
    fn complete(self, outcome: CallOutcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have given up already; nothing to deliver then.
        let _ = self.slot.send(outcome);
    }
}

/// Pending outgoing calls of one connection.
pub struct TransactionTable {
    address: String,
    next_id: AtomicU64,
    max_pending: usize,
    closed: AtomicBool,
    pending: Mutex<HashMap<u64, PendingEntry>>,
}

impl TransactionTable {
    pub fn new(address: impl Into<String>, max_pending: usize) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            next_id: AtomicU64::new(1),
            max_pending,
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingEntry>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a transaction id and schedule its timeout.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn allocate(
        self: &Arc<Self>,
        expected: ParamType,
        timeout: Duration,
    ) -> Result<(u64, PendingCall)> {
        let (slot, receiver) = oneshot::channel();
        let id = {
            let mut entries = self.entries();
            // Checked under the lock so `close` cannot miss a new entry.
            if self.closed.load(Ordering::Acquire) {
                return Err(TetherError::ConnectionClosed {
                    address: self.address.clone(),
                });
            }
            if entries.len() >= self.max_pending {
                return Err(TetherError::TooManyPending {
                    limit: self.max_pending,
                });
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            entries.insert(
                id,
                PendingEntry {
                    slot,
                    expected,
                    created_at: Instant::now(),
                    timer: None,
                },
            );
            id
        };

        let table = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.on_timeout(id);
            }
        });
        if let Some(entry) = self.entries().get_mut(&id) {
            entry.timer = Some(timer.abort_handle());
        }

        Ok((
            id,
            PendingCall {
                transaction_id: id,
                receiver,
                table: Arc::downgrade(self),
            },
        ))
    }

    fn take(&self, transaction_id: u64) -> Option<PendingEntry> {
        self.entries().remove(&transaction_id)
    }

    /// Deliver a response to its pending call.
    pub fn resolve(&self, transaction_id: u64, response: ResponseFrame) -> bool {
        match self.take(transaction_id) {
            Some(entry) => {
                debug!(
                    transaction_id,
                    expected = entry.expected.name(),
                    elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                    "resolved call"
                );
                entry.complete(CallOutcome::Responded(response));
                true
            }
            None => {
                debug!(
                    transaction_id,
                    peer = %self.address,
                    "discarding response with no pending call"
                );
                false
            }
        }
    }

    /// Fail a pending call with a local error.
    pub fn fail(&self, transaction_id: u64, error: TetherError) -> bool {
        match self.take(transaction_id) {
            Some(entry) => {
                debug!(transaction_id, error = %error, "failed call");
                entry.complete(CallOutcome::Failed(error));
                true
            }
            None => false,
        }
    }

    /// Expire a pending call. Called by its timeout task.
    pub fn on_timeout(&self, transaction_id: u64) -> bool {
        match self.take(transaction_id) {
            Some(entry) => {
                warn!(
                    transaction_id,
                    peer = %self.address,
                    expected = entry.expected.name(),
                    "call timed out"
                );
                entry.complete(CallOutcome::TimedOut);
                true
            }
            None => false,
        }
    }

    /// Fail every pending call and refuse new ones.
    pub fn close(&self, reason: &str) {
        let drained: Vec<(u64, PendingEntry)> = {
            let mut entries = self.entries();
            self.closed.store(true, Ordering::Release);
            entries.drain().collect()
        };
        if !drained.is_empty() {
            debug!(
                peer = %self.address,
                pending = drained.len(),
                reason,
                "failing pending calls on close"
            );
        }
        for (_, entry) in drained {
            entry.complete(CallOutcome::Failed(TetherError::ConnectionClosed {
                address: self.address.clone(),
            }));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.entries().len()
    }

    /// Ids of the calls still waiting, ascending.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.entries().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for TransactionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionTable")
            .field("address", &self.address)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Caller-side handle of one outstanding call.
///
/// Dropping it before completion removes the entry from the table.
#[derive(Debug)]
pub struct PendingCall {
    transaction_id: u64,
    receiver: oneshot::Receiver<CallOutcome>,
    table: Weak<TransactionTable>,
}

impl PendingCall {
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    /// Wait for the call to complete.
    pub async fn wait(mut self) -> CallOutcome {
        match (&mut self.receiver).await {
            Ok(outcome) => outcome,
            // The table itself went away without completing the slot.
            Err(_) => CallOutcome::Failed(TetherError::ConnectionClosed {
                address: self
                    .table
                    .upgrade()
                    .map(|t| t.address.clone())
                    .unwrap_or_default(),
            }),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            if let Some(entry) = table.take(self.transaction_id) {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<TransactionTable> {
        TransactionTable::new("test-peer", 16)
    }

    fn expected() -> ParamType {
        ParamType::of::<String>()
    }

    #[tokio::test]
    async fn test_ids_increase_from_one() {
        let table = table();
        let (first, _a) = table.allocate(expected(), Duration::from_secs(5)).unwrap();
        let (second, _b) = table.allocate(expected(), Duration::from_secs(5)).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(table.pending_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_resolve_completes_once() {
        let table = table();
        let (id, pending) = table.allocate(expected(), Duration::from_secs(5)).unwrap();

        assert!(table.resolve(id, ResponseFrame::empty(id)));
        assert!(!table.resolve(id, ResponseFrame::empty(id)));
        assert!(!table.on_timeout(id));

        match pending.wait().await {
            CallOutcome::Responded(resp) => assert_eq!(resp.transaction_id, id),
            other => panic!("Expected response, got: {:?}", other),
        }
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_and_late_response_is_discarded() {
        let table = table();
        let (id, pending) = table
            .allocate(expected(), Duration::from_millis(100))
            .unwrap();

        let outcome = pending.wait().await;
        assert!(matches!(outcome, CallOutcome::TimedOut));
        assert!(!table.resolve(id, ResponseFrame::empty(id)));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_rejects_new() {
        let table = table();
        let (_, pending) = table.allocate(expected(), Duration::from_secs(5)).unwrap();

        table.close("test");
        match pending.wait().await {
            CallOutcome::Failed(TetherError::ConnectionClosed { address }) => {
                assert_eq!(address, "test-peer");
            }
            other => panic!("Expected ConnectionClosed, got: {:?}", other),
        }

        let err = table
            .allocate(expected(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, TetherError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_max_pending_guard() {
        let table = TransactionTable::new("test-peer", 1);
        let (_, _held) = table.allocate(expected(), Duration::from_secs(5)).unwrap();
        let err = table
            .allocate(expected(), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, TetherError::TooManyPending { limit: 1 }));
    }

    #[tokio::test]
    async fn test_dropped_call_releases_entry() {
        let table = table();
        let (_, pending) = table.allocate(expected(), Duration::from_secs(5)).unwrap();
        assert_eq!(table.pending_count(), 1);
        drop(pending);
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_delivers_error() {
        let table = table();
        let (id, pending) = table.allocate(expected(), Duration::from_secs(5)).unwrap();
        assert!(table.fail(id, TetherError::protocol("encode failed")));
        assert!(matches!(
            pending.wait().await,
            CallOutcome::Failed(TetherError::Protocol { .. })
        ));
    }
}
