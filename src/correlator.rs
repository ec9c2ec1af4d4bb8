//! Request/response correlation.
//!
//! Every outgoing `Request` (or `RequestBatch`) is registered here under a
//! fresh UUID before the frame is sent. The reader task completes entries as
//! `RequestResponse` frames arrive; callers race that completion against their
//! own deadline. Whoever removes an entry from the table is the only one that
//! completes it, so each request sees exactly one outcome.
//!
//! When the session drops, [`Correlator::drain`] closes the table and fails all
//! outstanding entries with [`ObsError::ConnectionClosed`]. A closed table
//! refuses new registrations until [`Correlator::reopen`] is called for the
//! next session.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ObsError;
use crate::protocol::BatchResult;

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Successful payload of a pending entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `responseData` of a single request (`{}` when the server sent none).
    Single(Value),
    /// Per-request results of a batch, in server order.
    Batch(Vec<BatchResult>),
}

pub type Outcome = Result<Reply, ObsError>;

struct PendingRequest {
    request_type: String,
    deadline: Instant,
    tx: oneshot::Sender<Outcome>,
}

/// Read-only view of one in-flight request.
#[derive(Debug, Clone)]
pub struct PendingSummary {
    pub request_id: String,
    pub request_type: String,
    pub remaining: Duration,
}

struct Table {
    entries: HashMap<String, PendingRequest>,
    open: bool,
}

/// Table of in-flight requests for one client.
pub struct Correlator {
    table: Mutex<Table>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Create a closed table; call [`reopen`](Self::reopen) once a session is up.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                open: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new pending request and return its id and completion handle.
    pub fn register(
        &self,
        request_type: &str,
        timeout: Duration,
    ) -> Result<PendingHandle<'_>, ObsError> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock();
        if !table.open {
            return Err(ObsError::ConnectionClosed);
        }

        let mut request_id = uuid::Uuid::new_v4().to_string();
        while table.entries.contains_key(&request_id) {
            request_id = uuid::Uuid::new_v4().to_string();
        }

        table.entries.insert(
            request_id.clone(),
            PendingRequest {
                request_type: request_type.to_string(),
                deadline: Instant::now() + timeout,
                tx,
            },
        );

        Ok(PendingHandle {
            correlator: self,
            request_id,
            request_type: request_type.to_string(),
            timeout,
            rx: Some(rx),
        })
    }

    /// Complete the entry for `request_id`. Returns `false` if no such entry
    /// exists (already timed out, drained, or never issued).
    pub fn complete(&self, request_id: &str, outcome: Outcome) -> bool {
        let Some(pending) = self.lock().entries.remove(request_id) else {
            return false;
        };
        // The caller may have gone away; nothing else to notify.
        let _ = pending.tx.send(outcome);
        true
    }

    /// Remove an entry without completing it. Returns `false` if it was already gone.
    fn remove(&self, request_id: &str) -> bool {
        self.lock().entries.remove(request_id).is_some()
    }

    /// Close the table and fail every outstanding entry with `ConnectionClosed`.
    /// Returns the number of requests drained.
    pub fn drain(&self) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.lock();
            table.open = false;
            table.entries.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.tx.send(Err(ObsError::ConnectionClosed));
        }
        count
    }

    /// Accept registrations again (new session).
    pub fn reopen(&self) {
        self.lock().open = true;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<PendingSummary> {
        let now = Instant::now();
        self.lock()
            .entries
            .iter()
            .map(|(id, p)| PendingSummary {
                request_id: id.clone(),
                request_type: p.request_type.clone(),
                remaining: p.deadline.saturating_duration_since(now),
            })
            .collect()
    }
}

/// Caller side of a registered request.
///
/// Dropping the handle before it settles (e.g. the caller's future was
/// cancelled) removes the entry.
pub struct PendingHandle<'a> {
    correlator: &'a Correlator,
    request_id: String,
    request_type: String,
    timeout: Duration,
    rx: Option<oneshot::Receiver<Outcome>>,
}

impl PendingHandle<'_> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response, the deadline, or session teardown, whichever
    /// removes the entry first.
    pub async fn wait(mut self) -> Outcome {
        let outcome = self.race().await;
        self.rx = None;
        outcome
    }

    async fn race(&mut self) -> Outcome {
        let Some(rx) = self.rx.as_mut() else {
            return Err(ObsError::ConnectionClosed);
        };

        match tokio::time::timeout(self.timeout, &mut *rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ObsError::ConnectionClosed),
            Err(_) => {
                if self.correlator.remove(&self.request_id) {
                    Err(ObsError::RequestTimedOut {
                        request_type: self.request_type.clone(),
                        timeout: self.timeout,
                    })
                } else {
                    // Completed concurrently with the deadline; the value is
                    // already in the channel.
                    rx.await.unwrap_or(Err(ObsError::ConnectionClosed))
                }
            }
        }
    }
}

impl Drop for PendingHandle<'_> {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.correlator.remove(&self.request_id);
        }
    }
}
