//! SIP client transaction contexts
//!
//! One `TransactionContext` per sent request awaiting responses. Responses
//! are demultiplexed by (Call-ID, CSeq, method); provisional responses flow
//! through the same channel until a final one or the timeout bound.

use super::message::SipResponse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default bounded wait for a response
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Responses are matched to transactions by these three fields
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct TransactionKey {
    pub call_id: String,
    pub cseq: u32,
    pub method: String,
}

impl TransactionKey {
    pub fn new(call_id: &str, cseq: u32, method: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            cseq,
            method: method.to_string(),
        }
    }
}

/// Outcome of a bounded wait
#[derive(Debug)]
pub enum TransactionOutcome {
    /// Final response received
    Received(SipResponse),
    /// No final response within the bound
    Timeout,
}

impl TransactionOutcome {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            TransactionOutcome::Received(resp) => Some(resp.status_code()),
            TransactionOutcome::Timeout => None,
        }
    }
}

/// Matches inbound responses to pending transaction contexts.
///
/// Uses a std `Mutex` so contexts can deregister from `Drop`.
pub struct TransactionRegistry {
    pending: Mutex<HashMap<TransactionKey, mpsc::Sender<SipResponse>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a context before the request goes on the wire, so an
    /// immediate response cannot race past it
    pub fn register(self: &Arc<Self>, key: TransactionKey) -> TransactionContext {
        let (tx, rx) = mpsc::channel(8);
        {
            let mut pending = self.pending.lock().expect("transaction registry poisoned");
            pending.insert(key.clone(), tx);
        }
        TransactionContext {
            key,
            rx,
            registry: Arc::clone(self),
        }
    }

    /// Offer an inbound response; returns false if no transaction matched
    pub fn dispatch(&self, response: &SipResponse) -> bool {
        let key = match (response.call_id(), response.cseq(), response.cseq_method()) {
            (Some(call_id), Some(cseq), Some(method)) => TransactionKey::new(&call_id, cseq, &method),
            _ => {
                warn!("Response missing Call-ID or CSeq, dropped");
                return false;
            }
        };

        let sender = {
            let pending = self.pending.lock().expect("transaction registry poisoned");
            pending.get(&key).cloned()
        };

        match sender {
            Some(tx) => {
                if tx.try_send(response.clone()).is_err() {
                    warn!(call_id = %key.call_id, "Transaction channel full or closed");
                }
                true
            }
            None => {
                debug!(call_id = %key.call_id, cseq = key.cseq, "No transaction for response");
                false
            }
        }
    }

    fn remove(&self, key: &TransactionKey) {
        let mut pending = self.pending.lock().expect("transaction registry poisoned");
        pending.remove(key);
    }

    pub fn pending_count(&self) -> usize {
        let pending = self.pending.lock().expect("transaction registry poisoned");
        pending.len()
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A single outstanding request/response exchange
pub struct TransactionContext {
    key: TransactionKey,
    rx: mpsc::Receiver<SipResponse>,
    registry: Arc<TransactionRegistry>,
}

impl TransactionContext {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// Wait for the next final response, skipping provisionals.
    ///
    /// The timeout spans the whole wait, ringing included; callers pass
    /// `ringing period + SIP timeout` for INVITE.
    pub async fn wait_final(&mut self, timeout: Duration) -> TransactionOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(response)) => {
                    let code = response.status_code();
                    if code >= 200 {
                        return TransactionOutcome::Received(response);
                    }
                    debug!(
                        call_id = %self.key.call_id,
                        "Provisional {} on {} transaction", code, self.key.method
                    );
                }
                Ok(None) => {
                    // Registry side dropped; treat as timeout
                    return TransactionOutcome::Timeout;
                }
                Err(_) => return TransactionOutcome::Timeout,
            }
        }
    }

    /// Wait for any response, provisional included
    pub async fn wait_any(&mut self, timeout: Duration) -> TransactionOutcome {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(response)) => TransactionOutcome::Received(response),
            _ => TransactionOutcome::Timeout,
        }
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        self.registry.remove(&self.key);
    }
}
