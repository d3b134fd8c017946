//! Integration test: a signed Messenger delivery reaches a WebSocket inbox session, and a
//! reply goes out through a mocked Graph API.

use futures_util::{SinkExt, StreamExt};
use inbox::config::Config;
use inbox::gateway;
use inbox::webhook::{sign, SIGNATURE_HEADER};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "app-secret";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

async fn start_gateway(graph_base: &str) -> (u16, tempfile::TempDir) {
    let port = free_port();
    let dir = tempfile::tempdir().expect("temp dir");
    let config_path = dir.path().join("config.json");
    std::fs::write(&config_path, b"{}").expect("write config.json");

    let mut config = Config::default();
    config.gateway.port = port;
    config.channels.meta.verify_token = Some("verify-me".into());
    config.channels.meta.app_secret = Some(SECRET.into());
    config.channels.meta.graph_api_base = Some(graph_base.to_string());
    config.channels.facebook.page_access_token = Some("page-token".into());
    config.inbox.fetch_profiles = false;
    config.inbox.poll_interval_secs = 1;

    tokio::spawn(async move {
        let _ = gateway::run_gateway(config, config_path).await;
    });

    let url = format!("http://127.0.0.1:{}/", port);
    for _ in 0..100 {
        if reqwest::get(&url).await.map(|r| r.status().is_success()).unwrap_or(false) {
            return (port, dir);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("gateway did not start on port {}", port);
}

async fn request(ws: &mut Ws, id: &str, method: &str, params: Value) -> Value {
    let req = json!({ "type": "req", "id": id, "method": method, "params": params });
    ws.send(Message::Text(req.to_string())).await.expect("send request");
    loop {
        let frame = next_frame(ws).await;
        if frame["type"] == "res" && frame["id"] == id {
            return frame;
        }
    }
}

async fn next_frame(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("socket open")
            .expect("frame ok");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

async fn next_event(ws: &mut Ws, name: &str) -> Value {
    loop {
        let frame = next_frame(ws).await;
        if frame["type"] == "event" && frame["event"] == name {
            return frame["payload"].clone();
        }
    }
}

fn messenger_body(mid: &str, text: &str) -> String {
    json!({
        "object": "page",
        "entry": [{"id": "PAGE", "time": 1700000000000i64, "messaging": [{
            "sender": {"id": "U1"}, "recipient": {"id": "PAGE"},
            "timestamp": 1700000000000i64,
            "message": {"mid": mid, "text": text}
        }]}]
    })
    .to_string()
}

async fn post_webhook(port: u16, body: &str, signature: &str) -> reqwest::StatusCode {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/webhook", port))
        .header(SIGNATURE_HEADER, signature)
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .expect("post webhook")
        .status()
}

#[tokio::test]
async fn webhook_to_inbox_to_reply() {
    let graph = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "recipient_id": "U1",
            "message_id": "m_out_1"
        })))
        .mount(&graph)
        .await;
    let (port, _dir) = start_gateway(&graph.uri()).await;

    // Subscription handshake.
    let ok = reqwest::get(format!(
        "http://127.0.0.1:{}/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=c42",
        port
    ))
    .await
    .unwrap();
    assert_eq!(ok.status(), 200);
    assert_eq!(ok.text().await.unwrap(), "c42");
    let bad = reqwest::get(format!(
        "http://127.0.0.1:{}/webhook?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=c42",
        port
    ))
    .await
    .unwrap();
    assert_eq!(bad.status(), 403);

    // Same delivery twice (provider retry) plus one forged copy.
    let body = messenger_body("m1", "hi");
    assert_eq!(post_webhook(port, &body, &sign(SECRET, body.as_bytes())).await, 200);
    assert_eq!(post_webhook(port, &body, &sign(SECRET, body.as_bytes())).await, 200);
    assert_eq!(post_webhook(port, &body, "sha256=00").await, 403);

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", port))
        .await
        .expect("ws connect");
    let res = request(&mut ws, "0", "inbox.list", json!({})).await;
    assert_eq!(res["ok"], false);
    let res = request(&mut ws, "1", "connect", json!({ "auth": {} })).await;
    assert_eq!(res["ok"], true, "{}", res);

    let mut conversations = Vec::new();
    for _ in 0..50 {
        let res = request(&mut ws, "2", "inbox.list", json!({ "status": "open" })).await;
        conversations = res["payload"]["conversations"].as_array().cloned().unwrap_or_default();
        if !conversations.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(conversations.len(), 1);
    let conv_id = conversations[0]["id"].as_str().unwrap().to_string();
    assert_eq!(conversations[0]["unreadCount"], 1);

    let view = request(&mut ws, "3", "inbox.open", json!({ "conversationId": conv_id })).await;
    let items = view["payload"]["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["content"], "hi");
    assert_eq!(view["payload"]["conversation"]["unreadCount"], 0);

    let sent = request(&mut ws, "4", "inbox.send", json!({ "content": "hello" })).await;
    assert_eq!(sent["ok"], true, "{}", sent);
    assert_eq!(sent["payload"]["status"], "pending");
    let temp_id = sent["payload"]["tempId"].as_str().unwrap().to_string();
    let outcome = next_event(&mut ws, "inbox.pending").await;
    assert_eq!(outcome["tempId"], temp_id.as_str());
    assert_eq!(outcome["ok"], true);
    assert_eq!(outcome["externalMessageId"], "m_out_1");

    let view = request(&mut ws, "5", "inbox.current", json!({})).await;
    let contents: Vec<_> = view["payload"]["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| (i["kind"].as_str().unwrap().to_string(), i["content"].as_str().unwrap().to_string()))
        .collect();
    assert_eq!(
        contents,
        vec![
            ("message".to_string(), "hi".to_string()),
            ("message".to_string(), "hello".to_string())
        ]
    );

    let tagged = request(
        &mut ws,
        "6a",
        "conversation.addTag",
        json!({ "conversationId": conv_id, "tag": "vip" }),
    )
    .await;
    assert_eq!(tagged["ok"], true, "{}", tagged);
    let closed = request(
        &mut ws,
        "6b",
        "conversation.setStatus",
        json!({ "conversationId": conv_id, "status": "closed" }),
    )
    .await;
    assert_eq!(closed["payload"]["status"], "closed");

    let clear = request(&mut ws, "6", "conversation.clear", json!({ "conversationId": conv_id })).await;
    assert_eq!(clear["ok"], false);
    let clear = request(
        &mut ws,
        "7",
        "conversation.clear",
        json!({ "conversationId": conv_id, "confirm": true }),
    )
    .await;
    assert_eq!(clear["ok"], true);
    let view = request(&mut ws, "7a", "inbox.current", json!({})).await;
    assert_eq!(view["payload"]["items"].as_array().map(Vec::len), Some(0));
    assert_eq!(view["payload"]["conversation"]["id"], conv_id.as_str());
    assert_eq!(view["payload"]["conversation"]["status"], "closed");
    assert_eq!(view["payload"]["conversation"]["tags"], json!(["vip"]));

    // Provider retry of a cleared message stays cleared.
    assert_eq!(post_webhook(port, &body, &sign(SECRET, body.as_bytes())).await, 200);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let view = request(&mut ws, "7b", "inbox.current", json!({})).await;
    assert_eq!(view["payload"]["items"].as_array().map(Vec::len), Some(0));

    let deleted = request(&mut ws, "8", "conversation.delete", json!({ "conversationId": conv_id })).await;
    assert_eq!(deleted["payload"]["selected"], Value::Null);
}

#[tokio::test]
async fn capability_error_then_retry() {
    let graph = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "message": "(#230) Requires pages_messaging permission", "code": 230 }
        })))
        .up_to_n_times(1)
        .mount(&graph)
        .await;
    Mock::given(method("POST"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message_id": "m_retry" })))
        .mount(&graph)
        .await;
    let (port, _dir) = start_gateway(&graph.uri()).await;

    let body = messenger_body("m1", "hi");
    assert_eq!(post_webhook(port, &body, &sign(SECRET, body.as_bytes())).await, 200);

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", port))
        .await
        .expect("ws connect");
    request(&mut ws, "1", "connect", json!({})).await;
    let mut conv_id = String::new();
    for _ in 0..50 {
        let res = request(&mut ws, "2", "inbox.list", json!({})).await;
        if let Some(id) = res["payload"]["conversations"][0]["id"].as_str() {
            conv_id = id.to_string();
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!conv_id.is_empty());

    let sent = request(
        &mut ws,
        "3",
        "inbox.send",
        json!({ "conversationId": conv_id, "content": "hello" }),
    )
    .await;
    let temp_id = sent["payload"]["tempId"].as_str().unwrap().to_string();
    let outcome = next_event(&mut ws, "inbox.pending").await;
    assert_eq!(outcome["ok"], false);
    assert_eq!(outcome["failure"], "capability");
    assert_eq!(outcome["pending"]["status"], "failed");

    let retried = request(&mut ws, "4", "inbox.retry", json!({ "tempId": temp_id })).await;
    assert_eq!(retried["ok"], true, "{}", retried);
    let outcome = next_event(&mut ws, "inbox.pending").await;
    assert_eq!(outcome["ok"], true);
    assert_eq!(outcome["tempId"], temp_id.as_str());

    let requests = graph.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let first: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let second: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(first["message"]["text"], second["message"]["text"]);
    assert_eq!(second["message"]["metadata"], temp_id.as_str());
}
