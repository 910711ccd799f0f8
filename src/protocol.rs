//! Wire types for the two protocols this relay speaks.
//!
//! The client-facing path speaks CDP itself: `{id, method, params?, sessionId?}`
//! requests answered by `{id, sessionId?, result}` or `{id, sessionId?,
//! error:{message}}`, plus unsolicited `{method, params, sessionId?}` events.
//!
//! The extension-facing path speaks a small inner vocabulary drawn from
//! `attachToTab`, `forwardCDPCommand`, `forwardCDPEvent`, `detachedFromTab`,
//! `detachFromTab`. Both directions are parsed permissively out of a raw
//! `serde_json::Value` rather than a `#[serde(tag = ...)]` enum, because the
//! outer envelope mixes "id present" (command/response) and "id absent"
//! (event) framing that doesn't map to a clean internally-tagged union.

use serde_json::{json, Value};

use crate::error::{RelayError, Result};

/// CDP error code used by the extension when an inbound inner frame cannot
/// be parsed at all.
pub const PARSE_ERROR_CODE: i32 = -32700;

/// A command sent by the upstream CDP client.
#[derive(Debug, Clone)]
pub struct ClientCommand {
    pub id: u64,
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

impl ClientCommand {
    /// Parse a raw text frame received on the client-facing socket.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| RelayError::malformed_frame(e.to_string()))?;

        let id = value
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| RelayError::malformed_frame("client command missing id"))?;
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::malformed_frame("client command missing method"))?
            .to_string();
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            id,
            method,
            params,
            session_id,
        })
    }
}

/// The relay's reply to a single client command id.
#[derive(Debug, Clone)]
pub enum ClientReply {
    Result {
        id: u64,
        session_id: Option<String>,
        result: Value,
    },
    Error {
        id: u64,
        session_id: Option<String>,
        message: String,
    },
}

impl ClientReply {
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        match self {
            Self::Result {
                id,
                session_id,
                result,
            } => {
                map.insert("id".to_string(), json!(id));
                if let Some(sid) = session_id {
                    map.insert("sessionId".to_string(), json!(sid));
                }
                map.insert("result".to_string(), result.clone());
            }
            Self::Error {
                id,
                session_id,
                message,
            } => {
                map.insert("id".to_string(), json!(id));
                if let Some(sid) = session_id {
                    map.insert("sessionId".to_string(), json!(sid));
                }
                map.insert("error".to_string(), json!({ "message": message }));
            }
        }
        Value::Object(map)
    }
}

/// An unsolicited event the relay sends to the client.
#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

impl ClientEvent {
    pub fn new(method: impl Into<String>, params: Value, session_id: Option<String>) -> Self {
        Self {
            method: method.into(),
            params,
            session_id,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("method".to_string(), json!(self.method));
        map.insert("params".to_string(), self.params.clone());
        if let Some(sid) = &self.session_id {
            map.insert("sessionId".to_string(), json!(sid));
        }
        Value::Object(map)
    }
}

/// A request the relay sends to the extension over the inner protocol.
#[derive(Debug, Clone)]
pub struct InnerRequest {
    pub id: u64,
    pub method: &'static str,
    pub params: Value,
}

impl InnerRequest {
    pub fn attach_to_tab(id: u64) -> Self {
        Self {
            id,
            method: "attachToTab",
            params: Value::Null,
        }
    }

    pub fn forward_cdp_command(
        id: u64,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Self {
        Self {
            id,
            method: "forwardCDPCommand",
            params: json!({
                "method": method,
                "params": params,
                "sessionId": session_id,
            }),
        }
    }

    #[allow(dead_code)]
    pub fn detach_from_tab(id: u64) -> Self {
        Self {
            id,
            method: "detachFromTab",
            params: Value::Null,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "id": self.id, "method": self.method, "params": self.params })
    }
}

/// The outcome of an inner request, as delivered to the caller of C1's `send`.
#[derive(Debug, Clone)]
pub enum InnerOutcome {
    Result(Value),
    Error(String),
}

/// A frame received from the extension: either a response to a previous
/// inner request (carries `id`) or an event (`forwardCDPEvent` /
/// `detachedFromTab`, no `id`).
#[derive(Debug, Clone)]
pub enum InnerMessage {
    Response { id: u64, outcome: InnerOutcome },
    Event { method: String, params: Value },
}

impl InnerMessage {
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| RelayError::malformed_frame(e.to_string()))?;

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let outcome = match value.get("error") {
                Some(error) => InnerOutcome::Error(inner_error_message(error)),
                None => InnerOutcome::Result(value.get("result").cloned().unwrap_or(Value::Null)),
            };
            return Ok(Self::Response { id, outcome });
        }

        let method = value
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::malformed_frame("inner message missing method"))?
            .to_string();
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        Ok(Self::Event { method, params })
    }
}

/// Inner-response errors are inconsistent upstream: a bare string in the
/// inner protocol's own vocabulary, or `{message}` when re-encoding a native
/// debugger error. Accept both (spec.md §9).
fn inner_error_message(error: &Value) -> String {
    if let Some(s) = error.as_str() {
        return s.to_string();
    }
    error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

/// A `forwardCDPEvent` inner event's params, unpacked.
#[derive(Debug, Clone)]
pub struct ForwardedEvent {
    pub session_id: Option<String>,
    pub method: String,
    pub params: Value,
}

impl ForwardedEvent {
    pub fn from_params(params: &Value) -> Result<Self> {
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::malformed_frame("forwardCDPEvent missing method"))?
            .to_string();
        let event_params = params.get("params").cloned().unwrap_or(Value::Null);
        let session_id = params
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            session_id,
            method,
            params: event_params,
        })
    }
}

/// A `detachedFromTab` inner event's params, unpacked.
#[derive(Debug, Clone)]
pub struct DetachedFromTab {
    #[allow(dead_code)]
    pub tab_id: Option<String>,
    #[allow(dead_code)]
    pub reason: Option<String>,
}

impl DetachedFromTab {
    pub fn from_params(params: &Value) -> Self {
        Self {
            tab_id: params.get("tabId").and_then(Value::as_str).map(str::to_string),
            reason: params.get("reason").and_then(Value::as_str).map(str::to_string),
        }
    }
}

/// An inner request received by the extension endpoint from the relay.
#[derive(Debug, Clone)]
pub enum InnerCommand {
    AttachToTab {
        id: u64,
    },
    ForwardCdpCommand {
        id: u64,
        session_id: Option<String>,
        method: String,
        params: Value,
    },
    DetachFromTab {
        id: u64,
    },
}

impl InnerCommand {
    /// Parse a raw text frame received on the extension-facing socket.
    ///
    /// Returns the recovered `id` alongside the error when parsing fails
    /// past the point an id could be read, so the caller can still answer
    /// with a CDP `-32700` error on the right id per spec.md §4.2.
    pub fn parse(raw: &str) -> std::result::Result<Self, (Option<u64>, RelayError)> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| (None, RelayError::malformed_frame(e.to_string())))?;

        let id = value.get("id").and_then(Value::as_u64);

        let method = value
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| (id, RelayError::malformed_frame("inner request missing method")))?;

        let id = id.ok_or_else(|| (None, RelayError::malformed_frame("inner request missing id")))?;
        let params = value.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "attachToTab" => Ok(Self::AttachToTab { id }),
            "forwardCDPCommand" => {
                let inner_method = params
                    .get("method")
                    .and_then(Value::as_str)
                    .ok_or_else(|| (Some(id), RelayError::malformed_frame("forwardCDPCommand missing method")))?
                    .to_string();
                let inner_params = params.get("params").cloned().unwrap_or(Value::Null);
                let session_id = params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(Self::ForwardCdpCommand {
                    id,
                    session_id,
                    method: inner_method,
                    params: inner_params,
                })
            }
            "detachFromTab" => Ok(Self::DetachFromTab { id }),
            other => Err((Some(id), RelayError::malformed_frame(format!("unknown inner method: {other}")))),
        }
    }
}

/// The extension endpoint's reply to one inner request.
#[derive(Debug, Clone)]
pub enum InnerReply {
    Result { id: u64, result: Value },
    Error { id: u64, message: String },
}

impl InnerReply {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Result { id, result } => json!({ "id": id, "result": result }),
            Self::Error { id, message } => json!({ "id": id, "error": { "message": message } }),
        }
    }
}

/// Build the `forwardCDPEvent` inner event the extension sends for every
/// native debugger event on its tab.
pub fn forward_cdp_event_value(session_id: &str, method: &str, params: Value) -> Value {
    json!({
        "method": "forwardCDPEvent",
        "params": { "sessionId": session_id, "method": method, "params": params }
    })
}

/// Build the `detachedFromTab` inner event for a spontaneous native debugger
/// detach (i.e. not caused by `detachFromTab`).
pub fn detached_from_tab_value(tab_id: &str, reason: &str) -> Value {
    json!({
        "method": "detachedFromTab",
        "params": { "tabId": tab_id, "reason": reason }
    })
}

/// Build a CDP-shaped parse-error reply for a frame the extension could not
/// make sense of (spec.md §4.2: "malformed inbound frame is answered with a
/// protocol error code=-32700").
pub fn protocol_parse_error_value(id: Option<u64>, message: &str) -> Value {
    json!({ "id": id, "error": { "code": PARSE_ERROR_CODE, "message": message } })
}
