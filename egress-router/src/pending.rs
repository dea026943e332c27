//! Correlation of forwarded requests with the replies instances send back.
//!
//! Every forwarded request gets an entry keyed by a fresh request id. The entry is removed
//! exactly once, by whichever comes first of: the correlated reply, the deadline, the
//! connection dropping, or the waiting caller going away. Removal happens under the table
//! lock, so a reply racing a timeout resolves the caller at most once.

use crate::metrics_defs::{LATE_REPLIES, PENDING_REQUESTS};
use crate::registry::ConnectionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use shared::{counter, gauge};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Tag pairing a forwarded request with its reply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a pending request ended without a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyError {
    TimedOut,
    /// The connection the request was sent over closed first.
    Disconnected,
}

type Completion = oneshot::Sender<Result<JsonValue, ReplyError>>;

struct PendingEntry {
    connection: ConnectionId,
    completion: Completion,
}

#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
    sequence: AtomicU64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a pending request for a message about to be sent over `connection`.
    /// The returned reply resolves with the instance's reply, or fails once `timeout`
    /// has elapsed.
    pub fn open(self: &Arc<Self>, connection: ConnectionId, timeout: Duration) -> PendingReply {
        let id = self.next_id();
        let (completion, receiver) = oneshot::channel();

        let mut entries = self.entries.lock();
        entries.insert(
            id.clone(),
            PendingEntry {
                connection,
                completion,
            },
        );
        gauge!(PENDING_REQUESTS).set(entries.len() as f64);
        drop(entries);

        PendingReply {
            id,
            receiver,
            deadline: Instant::now() + timeout,
            table: self.clone(),
        }
    }

    /// Delivers a reply. Returns false if the request is no longer pending, which happens
    /// when the reply arrives after the deadline or is sent twice.
    pub fn complete(&self, request_id: &RequestId, payload: JsonValue) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.remove(request_id) else {
            drop(entries);
            counter!(LATE_REPLIES).increment(1);
            tracing::warn!(request_id = %request_id, "No pending request for reply, dropping it");
            return false;
        };
        gauge!(PENDING_REQUESTS).set(entries.len() as f64);

        // Sent while holding the lock so an expiring waiter finds the payload.
        // The waiter may already be gone, which is fine.
        let _ = entry.completion.send(Ok(payload));
        true
    }

    /// Fails every request that was sent over `connection`. Returns how many were failed.
    pub fn fail_connection(&self, connection: ConnectionId) -> usize {
        let mut entries = self.entries.lock();
        let ids: Vec<RequestId> = entries
            .iter()
            .filter(|(_, entry)| entry.connection == connection)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ids {
            if let Some(entry) = entries.remove(id) {
                let _ = entry.completion.send(Err(ReplyError::Disconnected));
            }
        }
        gauge!(PENDING_REQUESTS).set(entries.len() as f64);
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, request_id: &RequestId) -> bool {
        let mut entries = self.entries.lock();
        let removed = entries.remove(request_id).is_some();
        if removed {
            gauge!(PENDING_REQUESTS).set(entries.len() as f64);
        }
        removed
    }

    /// Millisecond timestamp plus a process-wide sequence number. The sequence alone makes
    /// ids unique within a process; the timestamp keeps them distinct across restarts.
    fn next_id(&self) -> RequestId {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        RequestId(format!("{millis}-{seq}"))
    }
}

/// Caller side of a pending request. Dropping it withdraws the request.
pub struct PendingReply {
    id: RequestId,
    receiver: oneshot::Receiver<Result<JsonValue, ReplyError>>,
    deadline: Instant,
    table: Arc<PendingRequests>,
}

impl PendingReply {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for the reply until the deadline.
    pub async fn wait(mut self) -> Result<JsonValue, ReplyError> {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            // The sender only disappears without a value if the table itself was dropped
            Ok(Err(_)) => Err(ReplyError::Disconnected),
            Err(_elapsed) => {
                if self.table.remove(&self.id) {
                    tracing::debug!(request_id = %self.id, "Pending request timed out");
                    Err(ReplyError::TimedOut)
                } else {
                    // Lost the race: the entry was completed right at the deadline and the
                    // outcome is already in the channel.
                    self.receiver
                        .try_recv()
                        .unwrap_or(Err(ReplyError::TimedOut))
                }
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}
