//! Pending-Call Table (C1).
//!
//! Correlates outbound inner requests sent over the extension transport with
//! their inbound responses, and fails every outstanding call when that
//! transport closes. See spec §4.1.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::protocol::{InnerOutcome, InnerRequest};

type InnerResult = std::result::Result<serde_json::Value, String>;

/// A pending-call entry: the method name is kept alongside the reply channel
/// purely for diagnostics, echoing the "preallocated-error captures the call
/// site" idea from spec §4.1 without threading a full error object through.
struct Entry {
    method: &'static str,
    reply: oneshot::Sender<InnerResult>,
}

/// Sink for outbound frames on the extension-facing socket.
pub type FrameSender = tokio::sync::mpsc::UnboundedSender<Message>;

/// Correlates inner requests with inner responses over one extension
/// transport. Rebound on every new extension connection (spec §3, "epoch").
pub struct PendingCallTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Entry>>,
    sender: Mutex<Option<FrameSender>>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            sender: Mutex::new(None),
        }
    }

    /// Bind the transport a new extension connection provides.
    pub async fn bind(&self, sender: FrameSender) {
        *self.sender.lock().await = Some(sender);
    }

    pub async fn is_open(&self) -> bool {
        self.sender.lock().await.is_some()
    }

    /// `send(method, params, sessionId?)`: allocate an id, write the inner
    /// `forwardCDPCommand` frame, and await its outcome.
    pub async fn send(
        &self,
        method: &str,
        params: serde_json::Value,
        session_id: Option<&str>,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = InnerRequest::forward_cdp_command(id, method, params, session_id);
        self.dispatch(id, "forwardCDPCommand", request.to_value()).await
    }

    /// The `attachToTab` inner request has no `forwardCDPCommand` wrapper.
    pub async fn attach_to_tab(&self) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = InnerRequest::attach_to_tab(id);
        self.dispatch(id, "attachToTab", request.to_value()).await
    }

    async fn dispatch(&self, id: u64, method: &'static str, frame: serde_json::Value) -> Result<serde_json::Value> {
        let sender = {
            let guard = self.sender.lock().await;
            guard
                .clone()
                .ok_or(RelayError::ExtensionNotConnected)?
        };

        let (reply, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, Entry { method, reply });

        if sender.send(Message::Text(frame.to_string())).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RelayError::ExtensionNotConnected);
        }

        debug!(id, method, "dispatched inner request");

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(RelayError::cdp_protocol(message)),
            Err(_) => Err(RelayError::TransportClosed),
        }
    }

    /// `deliver(message)`: route an inbound inner response to its waiting
    /// caller. Unknown ids are logged and dropped, matching spec §4.1.
    pub async fn deliver(&self, id: u64, outcome: InnerOutcome) {
        let entry = self.pending.lock().await.remove(&id);
        match entry {
            Some(Entry { method, reply }) => {
                let result = match outcome {
                    InnerOutcome::Result(value) => Ok(value),
                    InnerOutcome::Error(message) => Err(message),
                };
                debug!(id, method, "delivered inner response");
                if reply.send(result).is_err() {
                    warn!(id, method, "pending caller dropped before inner response arrived");
                }
            }
            None => warn!(id, "received inner response with unknown id"),
        }
    }

    /// `abort(reason)`: reject every pending entry and unbind the transport.
    /// Idempotent under repeated calls. Drops each reply sender rather than
    /// sending an inner error through it, so waiting callers observe a
    /// closed channel (`RelayError::TransportClosed`, "WebSocket closed")
    /// instead of a synthesized CDP protocol error.
    pub async fn abort(&self, reason: &str) {
        *self.sender.lock().await = None;
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), reason, "aborting pending inner calls");
        pending.clear();
    }
}

impl Default for PendingCallTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_without_bound_transport_fails_immediately() {
        let table = PendingCallTable::new();
        let err = table.send("Page.enable", json!(null), None).await.unwrap_err();
        assert!(matches!(err, RelayError::ExtensionNotConnected));
    }

    #[tokio::test]
    async fn deliver_resolves_matching_pending_call() {
        let table = PendingCallTable::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        table.bind(tx).await;

        let table = std::sync::Arc::new(table);
        let table_clone = table.clone();
        let handle = tokio::spawn(async move { table_clone.send("Page.enable", json!(null), None).await });

        let frame = rx.recv().await.unwrap();
        let text = match frame {
            Message::Text(t) => t,
            _ => panic!("expected text frame"),
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let id = value["id"].as_u64().unwrap();

        table.deliver(id, InnerOutcome::Result(json!({"ok": true}))).await;

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, json!({"ok": true}));
    }

    #[tokio::test]
    async fn abort_rejects_all_pending_calls() {
        let table = std::sync::Arc::new(PendingCallTable::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        table.bind(tx).await;

        let table_clone = table.clone();
        let handle = tokio::spawn(async move { table_clone.send("Page.enable", json!(null), None).await });

        let _ = rx.recv().await.unwrap();
        table.abort("extension disconnected").await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::TransportClosed));
        assert!(!table.is_open().await);
    }
}
