//! Request/response correlation
//!
//! Each outstanding request owns one oneshot sender and one timer task.
//! Every way a request can end (answer, timeout, cancellation, local
//! failure) goes through [`Correlator::settle`], which removes the record
//! under the lock, so a request settles exactly once and no timer fires
//! after its request is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::crypto::random_bytes;
use crate::error::{ConnectError, ConnectResult};

struct PendingRequest {
    tx: oneshot::Sender<ConnectResult<String>>,
    timer: JoinHandle<()>,
}

/// Tracks in-flight requests by correlation id
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    timeout: Duration,
    prefix: String,
    counter: AtomicU64,
}

impl Correlator {
    /// A correlator whose requests expire after `timeout`
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Correlator {
            pending: Mutex::new(HashMap::new()),
            timeout,
            prefix: hex::encode(random_bytes::<4>()),
            counter: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A correlation id never handed out before in this session
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.prefix, n)
    }

    /// Register `id` and start its timeout
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register(self: &Arc<Self>, id: String) -> PendingResponse {
        let (tx, rx) = oneshot::channel();

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer_id = id.clone();
        let timeout = self.timeout;

        let mut pending = self.lock();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(correlator) = weak.upgrade() {
                let outcome = Err(ConnectError::Timeout {
                    id: timer_id.clone(),
                });
                correlator.settle(&timer_id, outcome);
            }
        });
        pending.insert(id.clone(), PendingRequest { tx, timer });
        drop(pending);

        debug!(%id, "request registered");
        PendingResponse { id, rx }
    }

    /// Settle `id` with `outcome`
    ///
    /// Returns `false` when `id` is unknown or already settled; the outcome
    /// is then discarded.
    pub fn settle(&self, id: &str, outcome: ConnectResult<String>) -> bool {
        let Some(request) = self.lock().remove(id) else {
            return false;
        };
        request.timer.abort();

        match &outcome {
            Ok(_) => debug!(%id, "request resolved"),
            Err(e) => debug!(%id, "request rejected: {}", e),
        }
        // the caller may have stopped waiting
        let _ = request.tx.send(outcome);
        true
    }

    /// Reject every pending request with a cancellation error
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();

        for (id, request) in drained {
            request.timer.abort();
            let _ = request.tx.send(Err(ConnectError::Cancelled { id }));
        }
        count
    }

    /// Number of requests awaiting settlement
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether `id` is still awaiting settlement
    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        let pending = self
            .pending
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, request) in pending.drain() {
            request.timer.abort();
        }
    }
}

/// The caller's end of a registered request
#[derive(Debug)]
pub struct PendingResponse {
    id: String,
    rx: oneshot::Receiver<ConnectResult<String>>,
}

impl PendingResponse {
    /// Correlation id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for settlement
    pub async fn wait(self) -> ConnectResult<String> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // sender dropped without settling: the correlator went away
            Err(_) => Err(ConnectError::Cancelled { id: self.id }),
        }
    }
}
