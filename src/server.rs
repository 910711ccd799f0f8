//! Endpoint Surface (C4): WebSocket listener and path routing.
//!
//! Exposes two UUID-suffixed paths over one listening socket — `/cdp/<uuid>`
//! for the upstream CDP client and `/extension/<uuid>` for the browser
//! extension — and enforces that each path holds at most one live
//! connection at a time (spec I1). Built on raw `tokio-tungstenite`, the
//! same transport the rest of this crate's corpus reaches for, rather than
//! a web framework this relay has no other use for.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::launch::{self, BrowserChannel};
use crate::relay::Relay;

/// The companion extension id this relay hands connecting clients off to.
/// Overridable since a fork of the extension is published under its own id.
const DEFAULT_EXTENSION_ID: &str = "cdp-relay-extension";

/// Configuration for the launch handoff `ensureExtensionForClient` performs
/// when a client connects with no extension currently attached.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub browser_channel: BrowserChannel,
    pub extension_id: String,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            browser_channel: BrowserChannel::Stable,
            extension_id: DEFAULT_EXTENSION_ID.to_string(),
        }
    }
}

/// Frames larger than this close the socket with 1000/"frame too large",
/// matching the bound spec §6 suggests.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Close code used for an unrecognized path (spec §6).
const INVALID_PATH_CLOSE_CODE: u16 = 4004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Extension,
}

/// The two unguessable endpoint paths minted for one relay instance.
#[derive(Debug, Clone)]
pub struct EndpointPaths {
    pub client_path: String,
    pub extension_path: String,
}

impl EndpointPaths {
    pub fn new() -> Self {
        Self {
            client_path: format!("/cdp/{}", Uuid::new_v4()),
            extension_path: format!("/extension/{}", Uuid::new_v4()),
        }
    }
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks whether the client/extension slots are currently occupied.
///
/// The client slot additionally tracks a per-connection generation and a
/// take-over signal: a second client connection replaces the first rather
/// than being rejected (spec §4.3.1), so the outgoing holder needs a way to
/// be told "a newer connection now owns this slot, close yourself". Both
/// slots also carry a cross-socket cancel sender used to implement I2/P5:
/// closing either socket closes the other, each cancel payload carrying the
/// close reason the peer should report.
#[derive(Default)]
struct Holders {
    client_held: bool,
    client_generation: u64,
    client_cancel: Option<tokio::sync::oneshot::Sender<String>>,
    extension_held: bool,
    extension_cancel: Option<tokio::sync::oneshot::Sender<String>>,
}

/// Owns the listening socket and the single `Relay` instance it serves.
pub struct RelayServer {
    relay: Arc<Relay>,
    paths: EndpointPaths,
    holders: Mutex<Holders>,
    host: String,
    port: u16,
    launch: Option<LaunchConfig>,
}

impl RelayServer {
    pub fn new(relay: Arc<Relay>, paths: EndpointPaths, host: String, port: u16, launch: Option<LaunchConfig>) -> Self {
        Self {
            relay,
            paths,
            holders: Mutex::new(Holders::default()),
            host,
            port,
            launch,
        }
    }

    pub fn paths(&self) -> &EndpointPaths {
        &self.paths
    }

    /// Bind `host:port`. Split from [`Self::serve`] so callers (tests, or a
    /// caller that needs to know an ephemeral port before accepting
    /// connections) can observe the bound address first.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            %addr,
            client_path = %self.paths.client_path,
            extension_path = %self.paths.extension_path,
            "relay listening"
        );
        Ok(listener)
    }

    /// Accept connections from `listener` until it errors out. Each
    /// accepted socket is routed by path and handled on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.accept(stream, peer).await {
                    warn!(%peer, error = %err, "connection handling failed");
                }
            });
        }
    }

    /// Bind and serve in one call; the common case for `main`.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// `ensureExtensionForClient(clientInfo)` (spec §4.3.5): the hook the
    /// external tool layer calls before it attempts to open its upstream CDP
    /// connection, not something this server wires to its own accept loop —
    /// the client socket handler above does not call this itself. Returns
    /// immediately if an extension endpoint is already bound; otherwise
    /// launches the user's browser at the extension's consent URL and waits
    /// on the extension-connection promise. Launching is best effort: a
    /// failure is logged but does not fail the call, since an extension may
    /// already be about to reconnect on its own.
    pub async fn ensure_extension_for_client(&self, client_info: &str) {
        let Some(launch_config) = &self.launch else {
            return;
        };
        if self.relay.is_extension_connected().await {
            return;
        }

        let executable = match launch::find_browser_executable(launch_config.browser_channel) {
            Ok(path) => path,
            Err(err) => {
                warn!(error = %err, "could not locate a browser executable for launch handoff");
                return;
            }
        };

        let extension_ws_url = format!("ws://{}:{}{}", self.host, self.port, self.paths.extension_path);
        let handoff_url = launch::build_handoff_url(&launch_config.extension_id, &extension_ws_url, client_info);

        match launch::launch_browser(&executable, &handoff_url) {
            Ok(process) => {
                let pid = process.detach();
                info!(pid, "launched browser for extension handoff");
            }
            Err(err) => {
                warn!(error = %err, "failed to launch browser for extension handoff");
                return;
            }
        }

        // Wait on the extension-connection promise (spec §4.3.5) so the
        // client's own traffic can't race ahead of the attachment the
        // browser we just launched is about to establish.
        self.relay.wait_for_extension().await;
    }

    async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let requested_path: Arc<StdMutex<String>> = Arc::new(StdMutex::new(String::new()));
        let path_slot = requested_path.clone();

        let callback = move |request: &Request, response: Response| {
            *path_slot.lock().unwrap() = request.uri().path().to_string();
            Ok(response)
        };

        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let path = requested_path.lock().unwrap().clone();

        let role = if path == self.paths.client_path {
            Role::Client
        } else if path == self.paths.extension_path {
            Role::Extension
        } else {
            warn!(%peer, path, "rejecting connection to unknown path");
            close(ws_stream, INVALID_PATH_CLOSE_CODE, "invalid path").await;
            return Ok(());
        };

        match role {
            Role::Client => self.serve_client(ws_stream, peer).await,
            Role::Extension => self.serve_extension(ws_stream, peer).await,
        }
    }

    async fn serve_client(&self, ws_stream: WebSocketStream<TcpStream>, peer: SocketAddr) -> Result<()> {
        let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel::<String>();
        let my_generation = {
            let mut holders = self.holders.lock().await;
            let previous_cancel = holders.client_cancel.take();
            holders.client_held = true;
            holders.client_generation += 1;
            holders.client_cancel = Some(cancel_tx);
            let generation = holders.client_generation;
            drop(holders);
            if let Some(previous_cancel) = previous_cancel {
                // A prior client socket is live; it takes the eviction path
                // below rather than being rejected (spec §4.3.1, P6).
                let _ = previous_cancel.send("new connection established".to_string());
            }
            generation
        };
        info!(%peer, "client connected");

        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.relay.bind_client(tx.clone()).await;

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Set once this socket is closing because the *other* side (the
        // extension) told it to, rather than its own peer going away —
        // distinguishes a forced cross-socket close from an organic one so
        // the end-of-loop bookkeeping below doesn't re-propagate a closure
        // that already originated from the extension side.
        let mut forced_closed = false;

        loop {
            tokio::select! {
                reason = &mut cancel_rx => {
                    let reason = reason.unwrap_or_else(|_| "closed".to_string());
                    let _ = tx.send(close_frame(1000, &reason));
                    forced_closed = true;
                    break;
                }
                message = stream.next() => {
                    let Some(message) = message else { break };
                    match message {
                        Ok(Message::Text(text)) if text.len() > MAX_FRAME_BYTES => {
                            let _ = tx.send(close_frame(1000, "frame too large"));
                            break;
                        }
                        Ok(Message::Text(text)) => self.relay.handle_client_frame(&text).await,
                        Ok(Message::Binary(_)) => {
                            warn!(%peer, "binary frame on client socket");
                            let _ = tx.send(close_frame(1000, "binary frames are not supported"));
                            break;
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%peer, error = %err, "client socket error");
                            break;
                        }
                    }
                }
            }
        }

        drop(tx);
        let _ = writer.await;

        let mut holders = self.holders.lock().await;
        if holders.client_generation == my_generation {
            // Nobody superseded us; this is an organic disconnect, so the
            // extension attachment tears down and the slot frees up.
            holders.client_held = false;
            holders.client_cancel = None;
            // Only propagate to the extension when we weren't ourselves
            // closed by it — otherwise it's already tearing itself down.
            let extension_cancel = if forced_closed { None } else { holders.extension_cancel.take() };
            drop(holders);
            self.relay.client_disconnected().await;
            if let Some(extension_cancel) = extension_cancel {
                // Give any task the abort just woke (e.g. one finishing a
                // forward with an error reply) a turn before the extension
                // socket closes out from under it.
                tokio::task::yield_now().await;
                let _ = extension_cancel.send("client disconnected".to_string());
            }
        }
        info!(%peer, "client disconnected");
        Ok(())
    }

    async fn serve_extension(&self, ws_stream: WebSocketStream<TcpStream>, peer: SocketAddr) -> Result<()> {
        let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel::<String>();
        {
            let mut holders = self.holders.lock().await;
            if holders.extension_held {
                drop(holders);
                close(ws_stream, 1000, "another extension connection already established").await;
                return Ok(());
            }
            holders.extension_held = true;
            holders.extension_cancel = Some(cancel_tx);
        }
        info!(%peer, "extension connected");

        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.relay.bind_extension(tx.clone()).await;

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let mut forced_closed = false;
        let mut disconnect_reason = "socket closed".to_string();

        loop {
            tokio::select! {
                reason = &mut cancel_rx => {
                    let reason = reason.unwrap_or_else(|_| "closed".to_string());
                    let _ = tx.send(close_frame(1000, &reason));
                    forced_closed = true;
                    break;
                }
                message = stream.next() => {
                    let Some(message) = message else { break };
                    match message {
                        Ok(Message::Text(text)) if text.len() > MAX_FRAME_BYTES => {
                            let _ = tx.send(close_frame(1000, "frame too large"));
                            disconnect_reason = "frame too large".to_string();
                            break;
                        }
                        Ok(Message::Text(text)) => self.relay.handle_extension_frame(&text).await,
                        Ok(Message::Binary(_)) => {
                            warn!(%peer, "binary frame on extension socket");
                            let _ = tx.send(close_frame(1000, "binary frames are not supported"));
                            disconnect_reason = "binary frames are not supported".to_string();
                            break;
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%peer, error = %err, "extension socket error");
                            disconnect_reason = err.to_string();
                            break;
                        }
                    }
                }
            }
        }

        drop(tx);
        let _ = writer.await;

        let client_cancel = {
            let mut holders = self.holders.lock().await;
            holders.extension_held = false;
            holders.extension_cancel = None;
            // Only propagate to the client when we weren't ourselves closed
            // by it — otherwise it's already tearing itself down.
            if forced_closed { None } else { holders.client_cancel.take() }
        };
        self.relay.extension_disconnected().await;
        if let Some(client_cancel) = client_cancel {
            // Give any task the abort just woke (e.g. one finishing a
            // forward with an error reply) a turn before the client socket
            // closes out from under it.
            tokio::task::yield_now().await;
            let _ = client_cancel.send(format!("extension disconnected: {disconnect_reason}"));
        }
        info!(%peer, "extension disconnected");
        Ok(())
    }
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

async fn close(mut ws_stream: WebSocketStream<TcpStream>, code: u16, reason: &str) {
    let _ = ws_stream.close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    })).await;
}
