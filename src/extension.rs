//! Extension Endpoint (C2).
//!
//! Receives inner-protocol commands (`attachToTab`, `forwardCDPCommand`,
//! `detachFromTab`) over the extension-facing socket and drives a native
//! debugger attachment through them, answering with inner replies and
//! emitting `forwardCDPEvent`/`detachedFromTab` for spontaneous activity.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::{
    detached_from_tab_value, forward_cdp_event_value, protocol_parse_error_value, InnerCommand,
    InnerReply,
};

/// A spontaneous notification from the native debugger, i.e. one not caused
/// by a command C2 itself issued.
#[derive(Debug, Clone)]
pub enum DebuggerNotification {
    Event { method: String, params: Value },
    Detached { reason: String },
}

/// The seam between C2's protocol state machine and an actual debugger
/// attachment. A browser extension's service worker would implement this
/// against `chrome.debugger`; this crate ships a test-only in-memory fake
/// (see `tests` below) and exercises the state machine against it — the real
/// binding is out of scope, since it requires a JS/WASM extension runtime
/// this crate does not provide.
#[async_trait]
pub trait NativeDebugger: Send + Sync {
    /// Attach to the tab this endpoint owns and return its full `targetInfo`
    /// (`targetId`, `type`, `title`, `url`), as if freshly queried via
    /// `Target.getTargetInfo`.
    async fn attach(&self) -> Result<Value>;

    /// Forward one CDP command to the attached target and await its result.
    ///
    /// `session_id` is `None` when the relay cleared it because it named the
    /// root session (spec §4.2: forward at the debuggee level); `Some` names
    /// a flattened child session to address instead.
    async fn send_command(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value>;

    /// Detach from the tab. Idempotent once already detached.
    async fn detach(&self) -> Result<()>;
}

/// The endpoint's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Attaching,
    Attached,
    Terminated,
}

/// Drives one extension-facing connection's protocol state machine against
/// a `NativeDebugger`, writing inner-protocol replies/events to `replies`.
pub struct ExtensionEndpoint<D: NativeDebugger> {
    debugger: D,
    state: Mutex<State>,
    replies: mpsc::UnboundedSender<Value>,
}

impl<D: NativeDebugger> ExtensionEndpoint<D> {
    pub fn new(debugger: D, replies: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            debugger,
            state: Mutex::new(State::Idle),
            replies,
        }
    }

    pub async fn state(&self) -> State {
        *self.state.lock().await
    }

    /// Handle a raw inbound text frame. A frame that cannot be parsed at all
    /// is answered with a CDP-shaped `-32700` error on whatever id could be
    /// recovered, per spec §4.2.
    pub async fn handle_raw(&self, raw: &str) {
        match InnerCommand::parse(raw) {
            Ok(command) => self.handle(command).await,
            Err((id, err)) => {
                warn!(?id, error = %err, "malformed inner frame");
                let value = protocol_parse_error_value(id, &err.to_string());
                let _ = self.replies.send(value);
            }
        }
    }

    pub async fn handle(&self, command: InnerCommand) {
        match command {
            InnerCommand::AttachToTab { id } => self.handle_attach(id).await,
            InnerCommand::ForwardCdpCommand {
                id,
                session_id,
                method,
                params,
            } => self.handle_forward(id, session_id.as_deref(), &method, params).await,
            InnerCommand::DetachFromTab { id } => self.handle_detach(id).await,
        }
    }

    async fn handle_attach(&self, id: u64) {
        {
            let mut state = self.state.lock().await;
            if *state != State::Idle {
                drop(state);
                self.reply_error(id, "already attached").await;
                return;
            }
            *state = State::Attaching;
        }

        match self.debugger.attach().await {
            Ok(target_info) => {
                *self.state.lock().await = State::Attached;
                let target_id = target_info.get("targetId").and_then(Value::as_str).unwrap_or("unknown");
                let session_id = format!("pw-tab-{target_id}");
                debug!(target_id, %session_id, "attached to tab");
                self.reply_result(id, serde_json::json!({ "sessionId": session_id, "targetInfo": target_info }))
                    .await;
            }
            Err(err) => {
                *self.state.lock().await = State::Idle;
                self.reply_error(id, &err.to_string()).await;
            }
        }
    }

    async fn handle_forward(&self, id: u64, session_id: Option<&str>, method: &str, params: Value) {
        if *self.state.lock().await != State::Attached {
            self.reply_error(id, "not attached").await;
            return;
        }
        match self.debugger.send_command(method, params, session_id).await {
            Ok(result) => self.reply_result(id, result).await,
            Err(err) => self.reply_error(id, &err.to_string()).await,
        }
    }

    async fn handle_detach(&self, id: u64) {
        {
            let state = *self.state.lock().await;
            if state != State::Attached {
                *self.state.lock().await = State::Idle;
                self.reply_result(id, Value::Null).await;
                return;
            }
        }

        match self.debugger.detach().await {
            Ok(()) => {
                *self.state.lock().await = State::Idle;
                self.reply_result(id, Value::Null).await;
            }
            Err(err) => self.reply_error(id, &err.to_string()).await,
        }
    }

    /// Deliver a spontaneous notification from the native debugger.
    ///
    /// Per spec §9, a spontaneous detach only clears local state and emits
    /// `detachedFromTab` — it does not itself synthesize anything on the
    /// client-facing side; that's C3's job when it observes this event.
    pub async fn notify(&self, tab_id: &str, notification: DebuggerNotification) {
        match notification {
            DebuggerNotification::Event { method, params } => {
                let value = forward_cdp_event_value(tab_id, &method, params);
                let _ = self.replies.send(value);
            }
            DebuggerNotification::Detached { reason } => {
                *self.state.lock().await = State::Idle;
                let value = detached_from_tab_value(tab_id, &reason);
                let _ = self.replies.send(value);
            }
        }
    }

    pub async fn terminate(&self) {
        *self.state.lock().await = State::Terminated;
    }

    async fn reply_result(&self, id: u64, result: Value) {
        let _ = self.replies.send(InnerReply::Result { id, result }.to_value());
    }

    async fn reply_error(&self, id: u64, message: &str) {
        let _ = self
            .replies
            .send(InnerReply::Error { id, message: message.to_string() }.to_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc::unbounded_channel;

    struct FakeDebugger {
        attached: AtomicBool,
        fail_attach: bool,
        last_session_id: Mutex<Option<String>>,
    }

    impl FakeDebugger {
        fn new() -> Self {
            Self {
                attached: AtomicBool::new(false),
                fail_attach: false,
                last_session_id: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl NativeDebugger for FakeDebugger {
        async fn attach(&self) -> Result<Value> {
            if self.fail_attach {
                return Err(crate::error::RelayError::invalid_operation("no such tab"));
            }
            self.attached.store(true, Ordering::SeqCst);
            Ok(serde_json::json!({
                "targetId": "target-1",
                "type": "page",
                "title": "Example Domain",
                "url": "https://example.com/",
            }))
        }

        async fn send_command(&self, method: &str, _params: Value, session_id: Option<&str>) -> Result<Value> {
            *self.last_session_id.lock().await = session_id.map(str::to_string);
            Ok(serde_json::json!({ "echo": method }))
        }

        async fn detach(&self) -> Result<()> {
            self.attached.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn endpoint() -> (ExtensionEndpoint<FakeDebugger>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = unbounded_channel();
        (ExtensionEndpoint::new(FakeDebugger::new(), tx), rx)
    }

    #[tokio::test]
    async fn attach_then_forward_then_detach() {
        let (endpoint, mut rx) = endpoint();

        endpoint.handle(InnerCommand::AttachToTab { id: 1 }).await;
        assert_eq!(endpoint.state().await, State::Attached);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["result"]["sessionId"], serde_json::json!("pw-tab-target-1"));
        assert_eq!(reply["result"]["targetInfo"]["targetId"], serde_json::json!("target-1"));
        assert_eq!(reply["result"]["targetInfo"]["url"], serde_json::json!("https://example.com/"));

        endpoint
            .handle(InnerCommand::ForwardCdpCommand {
                id: 2,
                session_id: None,
                method: "Page.enable".to_string(),
                params: Value::Null,
            })
            .await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["result"]["echo"], serde_json::json!("Page.enable"));

        endpoint.handle(InnerCommand::DetachFromTab { id: 3 }).await;
        assert_eq!(endpoint.state().await, State::Idle);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["id"], serde_json::json!(3));
    }

    #[tokio::test]
    async fn forward_passes_flattened_session_id_to_the_debugger() {
        let (endpoint, mut rx) = endpoint();
        endpoint.handle(InnerCommand::AttachToTab { id: 1 }).await;
        let _ = rx.recv().await.unwrap();

        endpoint
            .handle(InnerCommand::ForwardCdpCommand {
                id: 2,
                session_id: Some("child-session-1".to_string()),
                method: "Page.enable".to_string(),
                params: Value::Null,
            })
            .await;
        let _ = rx.recv().await.unwrap();

        assert_eq!(
            endpoint.debugger.last_session_id.lock().await.as_deref(),
            Some("child-session-1")
        );
    }

    #[tokio::test]
    async fn forward_before_attach_is_rejected() {
        let (endpoint, mut rx) = endpoint();
        endpoint
            .handle(InnerCommand::ForwardCdpCommand {
                id: 5,
                session_id: None,
                method: "Page.enable".to_string(),
                params: Value::Null,
            })
            .await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["error"]["message"], serde_json::json!("not attached"));
    }

    #[tokio::test]
    async fn malformed_frame_answers_with_parse_error_code() {
        let (endpoint, mut rx) = endpoint();
        endpoint.handle_raw(r#"{"id":9,"method":"bogus"}"#).await;
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["id"], serde_json::json!(9));
        assert_eq!(reply["error"]["code"], serde_json::json!(crate::protocol::PARSE_ERROR_CODE));
    }

    #[tokio::test]
    async fn spontaneous_detach_clears_state_without_synthesizing_client_event() {
        let (endpoint, mut rx) = endpoint();
        endpoint.handle(InnerCommand::AttachToTab { id: 1 }).await;
        let _ = rx.recv().await.unwrap();

        endpoint
            .notify("target-1", DebuggerNotification::Detached { reason: "target closed".to_string() })
            .await;
        assert_eq!(endpoint.state().await, State::Idle);

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification["method"], serde_json::json!("detachedFromTab"));
        assert_eq!(notification["params"]["reason"], serde_json::json!("target closed"));
    }
}
