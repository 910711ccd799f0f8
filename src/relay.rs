//! Relay Core (C3).
//!
//! Owns the client socket handle, the pending-call table, and the
//! connected-tab descriptor behind one mutex (spec §5's single-owner-task
//! model), and implements the intercept table, auto-attach synthesis, and
//! forwarding rules that make an extension-mediated tab look like a native
//! CDP endpoint to the upstream client.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pending::PendingCallTable;
use crate::protocol::{
    ClientCommand, ClientEvent, ClientReply, DetachedFromTab, ForwardedEvent, InnerMessage,
};

/// The one browser tab this relay instance is, or is becoming, attached to.
#[derive(Debug, Clone)]
struct ConnectedTab {
    session_id: String,
    target_info: Value,
}

type ClientSender = mpsc::UnboundedSender<Message>;

struct RelayState {
    client: Option<ClientSender>,
    connected_tab: Option<ConnectedTab>,
}

/// The relay core: one instance per client connection (spec §3, "Relay
/// instance").
pub struct Relay {
    pending: PendingCallTable,
    state: Mutex<RelayState>,
    session_counter: AtomicU64,
    /// Re-armed every epoch (spec §3): `true` once an extension endpoint is
    /// bound, `false` again once it disconnects. `ensureExtensionForClient`
    /// waits on this rather than polling.
    extension_connected: watch::Sender<bool>,
}

impl Relay {
    pub fn new() -> Self {
        let (extension_connected, _) = watch::channel(false);
        Self {
            pending: PendingCallTable::new(),
            state: Mutex::new(RelayState {
                client: None,
                connected_tab: None,
            }),
            session_counter: AtomicU64::new(1),
            extension_connected,
        }
    }

    pub async fn bind_client(&self, sender: ClientSender) {
        self.state.lock().await.client = Some(sender);
    }

    /// The client socket closed. Per I2, the extension attachment has
    /// nothing left to serve, so its pending calls are aborted and the
    /// connected-tab descriptor is cleared.
    pub async fn client_disconnected(&self) {
        let mut state = self.state.lock().await;
        state.client = None;
        state.connected_tab = None;
        drop(state);
        self.pending.abort("client disconnected").await;
        info!("client disconnected, extension attachment torn down");
    }

    pub async fn bind_extension(&self, sender: mpsc::UnboundedSender<Message>) {
        self.pending.bind(sender).await;
        let _ = self.extension_connected.send(true);
    }

    /// The extension socket closed. Pending calls fail with "WebSocket
    /// closed"; the connected-tab descriptor is cleared so a fresh
    /// `setAutoAttach` re-synthesizes attachment once the extension
    /// reconnects.
    pub async fn extension_disconnected(&self) {
        self.pending.abort("extension disconnected").await;
        self.state.lock().await.connected_tab = None;
        let _ = self.extension_connected.send(false);
        warn!("extension disconnected");
    }

    pub async fn is_extension_connected(&self) -> bool {
        self.pending.is_open().await
    }

    /// `ensureExtensionForClient`'s wait-on-promise half (spec §4.3.5):
    /// resolves immediately if an extension is already bound, otherwise
    /// waits for the next `bind_extension`. No timeout — the upstream
    /// client's own timeout governs, per spec §5.
    pub async fn wait_for_extension(&self) {
        if self.is_extension_connected().await {
            return;
        }
        let mut rx = self.extension_connected.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Handle one raw text frame from the CDP client.
    pub async fn handle_client_frame(&self, raw: &str) {
        match ClientCommand::parse(raw) {
            Ok(command) => self.handle_client_command(command).await,
            Err(err) => warn!(error = %err, "malformed client frame"),
        }
    }

    async fn handle_client_command(&self, command: ClientCommand) {
        match (command.method.as_str(), command.session_id.is_some()) {
            ("Browser.getVersion", _) => self.reply_browser_get_version(command.id).await,
            ("Browser.setDownloadBehavior", _) => {
                self.send_client_result(command.id, command.session_id.clone(), json!({}))
                    .await
            }
            ("Target.setAutoAttach", false) => self.handle_set_auto_attach_top_level(command).await,
            ("Target.setAutoAttach", true) => self.forward_to_extension(command).await,
            ("Target.getTargetInfo", _) => self.reply_get_target_info(command).await,
            _ => self.forward_to_extension(command).await,
        }
    }

    /// Literal reply values per spec §4.3.2's intercept table.
    async fn reply_browser_get_version(&self, id: u64) {
        let result = json!({
            "protocolVersion": "1.3",
            "product": "Chrome/Extension-Bridge",
            "userAgent": "CDP-Bridge-Server/1.0.0",
        });
        self.send_client_result(id, None, result).await;
    }

    /// Per spec §4.3.2: replies `{targetInfo}`, or `{targetInfo: null}` when
    /// no tab is attached — not an error, since the client is simply asking
    /// what's there.
    async fn reply_get_target_info(&self, command: ClientCommand) {
        let tab = self.state.lock().await.connected_tab.clone();
        let target_info = tab.map(|tab| tab.target_info);
        self.send_client_result(command.id, command.session_id, json!({ "targetInfo": target_info }))
            .await;
    }

    /// Top-level `Target.setAutoAttach` synthesizes the single attachment
    /// this relay ever produces: mint a session id, attach through the
    /// extension, emit `Target.attachedToTarget` *before* replying so the
    /// client never observes the ack before it can act on the session
    /// (spec §5 ordering guarantee).
    async fn handle_set_auto_attach_top_level(&self, command: ClientCommand) {
        if self.state.lock().await.connected_tab.is_some() {
            self.send_client_result(command.id, None, json!({})).await;
            return;
        }

        let target_info = match self.pending.attach_to_tab().await {
            Ok(value) => value.get("targetInfo").cloned().unwrap_or(Value::Null),
            Err(err) => {
                self.send_client_error(command.id, None, &err.to_string()).await;
                return;
            }
        };

        let session_id = format!("pw-tab-{}", self.session_counter.fetch_add(1, Ordering::Relaxed));
        self.state.lock().await.connected_tab = Some(ConnectedTab {
            session_id: session_id.clone(),
            target_info: target_info.clone(),
        });

        let attached_event = ClientEvent::new(
            "Target.attachedToTarget",
            json!({
                "sessionId": session_id,
                "targetInfo": target_info,
                "waitingForDebugger": false,
            }),
            None,
        );
        self.send_client_frame(attached_event.to_value()).await;
        debug!(session_id, "synthesized Target.attachedToTarget");

        self.send_client_result(command.id, None, json!({})).await;
    }

    /// Every non-intercepted command is forwarded through C1. The original
    /// `sessionId` is always echoed back to the client, but per spec §4.3.2
    /// it is cleared before forwarding to the extension when it names the
    /// single connected tab, so the extension's native debugger sees a
    /// top-level call rather than a flat-session one.
    async fn forward_to_extension(&self, command: ClientCommand) {
        let session_id = command.session_id.clone();
        let connected_session_id = self
            .state
            .lock()
            .await
            .connected_tab
            .as_ref()
            .map(|t| t.session_id.clone());
        let forwarded_session_id = match (&session_id, &connected_session_id) {
            (Some(s), Some(c)) if s == c => None,
            _ => session_id.clone(),
        };
        match self
            .pending
            .send(&command.method, command.params, forwarded_session_id.as_deref())
            .await
        {
            Ok(result) => self.send_client_result(command.id, session_id, result).await,
            Err(err) => self.send_client_error(command.id, session_id, &err.to_string()).await,
        }
    }

    /// Handle one raw text frame from the extension: either a response to a
    /// previous inner request (routed through C1) or a spontaneous event.
    pub async fn handle_extension_frame(&self, raw: &str) {
        match InnerMessage::parse(raw) {
            Ok(InnerMessage::Response { id, outcome }) => self.pending.deliver(id, outcome).await,
            Ok(InnerMessage::Event { method, params }) => {
                self.handle_extension_event(&method, &params).await
            }
            Err(err) => warn!(error = %err, "malformed inner frame from extension"),
        }
    }

    async fn handle_extension_event(&self, method: &str, params: &Value) {
        match method {
            "forwardCDPEvent" => {
                let event = match ForwardedEvent::from_params(params) {
                    Ok(e) => e,
                    Err(err) => {
                        warn!(error = %err, "malformed forwardCDPEvent");
                        return;
                    }
                };
                // I6: an event that already names a session (e.g. a
                // flattened child session) passes through untouched; the
                // connected-tab's session id is only stamped on when the
                // extension left it absent.
                let session_id = self
                    .state
                    .lock()
                    .await
                    .connected_tab
                    .as_ref()
                    .map(|t| t.session_id.clone());
                let client_event = ClientEvent::new(event.method, event.params, event.session_id.or(session_id));
                self.send_client_frame(client_event.to_value()).await;
            }
            "detachedFromTab" => {
                let detached = DetachedFromTab::from_params(params);
                self.state.lock().await.connected_tab = None;
                debug!(reason = ?detached.reason, "extension reported detachedFromTab");
                // Per spec §9, a spontaneous detach only clears local state;
                // it is not relayed to the client as a synthesized
                // Target.detachedFromTarget.
            }
            other => warn!(method = other, "unknown inner event"),
        }
    }

    async fn send_client_result(&self, id: u64, session_id: Option<String>, result: Value) {
        let reply = ClientReply::Result { id, session_id, result };
        self.send_client_frame(reply.to_value()).await;
    }

    async fn send_client_error(&self, id: u64, session_id: Option<String>, message: &str) {
        let reply = ClientReply::Error {
            id,
            session_id,
            message: message.to_string(),
        };
        self.send_client_frame(reply.to_value()).await;
    }

    async fn send_client_frame(&self, value: Value) {
        let sender = self.state.lock().await.client.clone();
        if let Some(sender) = sender {
            if sender.send(Message::Text(value.to_string())).is_err() {
                warn!("client socket gone while sending frame");
            }
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}
