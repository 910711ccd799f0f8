use std::sync::Arc;

use cdp_relay::relay::Relay;
use cdp_relay::server::{EndpointPaths, RelayServer};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

async fn spawn_server() -> (Arc<RelayServer>, std::net::SocketAddr) {
    let relay = Arc::new(Relay::new());
    let paths = EndpointPaths::new();
    let server = Arc::new(RelayServer::new(relay, paths, "127.0.0.1".to_string(), 0, None));
    let listener = server.bind().await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let server_task = server.clone();
    tokio::spawn(async move {
        let _ = server_task.serve(listener).await;
    });
    (server, addr)
}

async fn connect(addr: std::net::SocketAddr, path: &str) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("ws://{addr}{path}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    ws
}

async fn recv_json(ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>) -> Value {
    loop {
        match ws.next().await.expect("stream ended").expect("ws error") {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn browser_get_version_is_answered_without_an_extension() {
    let (server, addr) = spawn_server().await;
    let mut client = connect(addr, &server.paths().client_path).await;

    client
        .send(Message::Text(json!({"id": 1, "method": "Browser.getVersion"}).to_string()))
        .await
        .unwrap();

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["id"], json!(1));
    assert!(reply["result"]["protocolVersion"].is_string());
}

#[tokio::test]
async fn unknown_path_is_closed_with_4004() {
    let (_server, addr) = spawn_server().await;
    let url = format!("ws://{addr}/nonsense/path");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.expect("connect");

    match ws.next().await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 4004);
            assert_eq!(frame.reason, "invalid path");
        }
        other => panic!("expected a 4004 close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn second_client_connection_takes_ownership_and_evicts_the_first() {
    let (server, addr) = spawn_server().await;
    let mut first = connect(addr, &server.paths().client_path).await;

    let second = connect(addr, &server.paths().client_path).await;

    match first.next().await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 1000);
            assert!(frame.reason.contains("new connection established"));
        }
        other => panic!("expected the first client to be evicted, got {other:?}"),
    }

    // The second connection is now the live holder and can transact.
    let mut second = second;
    second
        .send(Message::Text(json!({"id": 1, "method": "Browser.getVersion"}).to_string()))
        .await
        .unwrap();
    let reply = recv_json(&mut second).await;
    assert_eq!(reply["id"], json!(1));
}

#[tokio::test]
async fn second_extension_connection_is_rejected_while_one_is_held() {
    let (server, addr) = spawn_server().await;
    let _first = connect(addr, &server.paths().extension_path).await;

    let mut second = connect(addr, &server.paths().extension_path).await;
    match second.next().await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 1000);
            assert_eq!(frame.reason, "another extension connection already established");
        }
        other => panic!("expected the second extension connection to be closed, got {other:?}"),
    }
}

#[tokio::test]
async fn top_level_set_auto_attach_synthesizes_attach_before_replying() {
    let (server, addr) = spawn_server().await;
    let mut client = connect(addr, &server.paths().client_path).await;
    let mut extension = connect(addr, &server.paths().extension_path).await;

    client
        .send(Message::Text(json!({"id": 1, "method": "Target.setAutoAttach"}).to_string()))
        .await
        .unwrap();

    let inner_request = recv_json(&mut extension).await;
    assert_eq!(inner_request["method"], json!("attachToTab"));
    let inner_id = inner_request["id"].as_u64().unwrap();

    extension
        .send(Message::Text(
            json!({
                "id": inner_id,
                "result": {
                    "sessionId": "pw-tab-target-1",
                    "targetInfo": {"targetId": "target-1", "type": "page", "title": "Example", "url": "https://example.com/"},
                }
            })
            .to_string(),
        ))
        .await
        .unwrap();

    let attached_event = recv_json(&mut client).await;
    assert_eq!(attached_event["method"], json!("Target.attachedToTarget"));
    let session_id = attached_event["params"]["sessionId"].as_str().unwrap().to_string();

    let ack = recv_json(&mut client).await;
    assert_eq!(ack["id"], json!(1));
    assert_eq!(ack["result"], json!({}));

    client
        .send(Message::Text(
            json!({"id": 2, "sessionId": session_id, "method": "Page.enable"}).to_string(),
        ))
        .await
        .unwrap();

    let forwarded = recv_json(&mut extension).await;
    assert_eq!(forwarded["method"], json!("forwardCDPCommand"));
    let forward_id = forwarded["id"].as_u64().unwrap();
    assert_eq!(forwarded["params"]["method"], json!("Page.enable"));
    // sessionId names the single connected tab, so it is cleared before
    // reaching the extension's native debugger call (spec §4.3.2).
    assert!(forwarded["params"]["sessionId"].is_null());

    extension
        .send(Message::Text(json!({"id": forward_id, "result": {}}).to_string()))
        .await
        .unwrap();

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["id"], json!(2));
    assert_eq!(reply["sessionId"], json!(session_id));
}

#[tokio::test]
async fn extension_event_is_relayed_to_client_with_session_stamped() {
    let (server, addr) = spawn_server().await;
    let mut client = connect(addr, &server.paths().client_path).await;
    let mut extension = connect(addr, &server.paths().extension_path).await;

    client
        .send(Message::Text(json!({"id": 1, "method": "Target.setAutoAttach"}).to_string()))
        .await
        .unwrap();
    let inner_request = recv_json(&mut extension).await;
    let inner_id = inner_request["id"].as_u64().unwrap();
    extension
        .send(Message::Text(
            json!({"id": inner_id, "result": {"sessionId": "pw-tab-target-1", "targetInfo": {"targetId": "target-1", "type": "page"}}})
                .to_string(),
        ))
        .await
        .unwrap();
    let _attached = recv_json(&mut client).await;
    let _ack = recv_json(&mut client).await;

    extension
        .send(Message::Text(
            json!({
                "method": "forwardCDPEvent",
                "params": {"method": "Page.loadEventFired", "params": {"timestamp": 1.0}}
            })
            .to_string(),
        ))
        .await
        .unwrap();

    let event = recv_json(&mut client).await;
    assert_eq!(event["method"], json!("Page.loadEventFired"));
    assert_eq!(event["sessionId"], json!("pw-tab-1"));
}

#[tokio::test]
async fn extension_disconnect_fails_a_pending_forward_with_an_error() {
    let (server, addr) = spawn_server().await;
    let mut client = connect(addr, &server.paths().client_path).await;
    let mut extension = connect(addr, &server.paths().extension_path).await;

    client
        .send(Message::Text(json!({"id": 1, "method": "Page.enable"}).to_string()))
        .await
        .unwrap();

    // Wait for the forwarded request to actually reach the extension (so the
    // pending call is registered) before dropping it unanswered.
    let _forwarded = recv_json(&mut extension).await;
    drop(extension);

    let reply = recv_json(&mut client).await;
    assert_eq!(reply["id"], json!(1));
    assert_eq!(reply["error"]["message"], json!("WebSocket closed"));

    // I2/P5: the extension's disconnect also closes the client socket.
    match client.next().await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 1000);
            assert!(frame.reason.starts_with("extension disconnected:"));
        }
        other => panic!("expected the client socket to be closed too, got {other:?}"),
    }
}

#[tokio::test]
async fn client_disconnect_also_closes_the_extension_socket() {
    let (server, addr) = spawn_server().await;
    let client = connect(addr, &server.paths().client_path).await;
    let mut extension = connect(addr, &server.paths().extension_path).await;

    drop(client);

    match extension.next().await {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 1000);
            assert_eq!(frame.reason, "client disconnected");
        }
        other => panic!("expected the extension socket to be closed too, got {other:?}"),
    }
}
