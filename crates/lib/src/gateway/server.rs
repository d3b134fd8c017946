//! Gateway HTTP + WebSocket server (single port).

use crate::channels::{CredentialsProvider, MetaClient, OutboundTransport, StaticCredentials};
use crate::config::{self, Config};
use crate::delivery::{DeliveryError, PendingSend};
use crate::events::EventBus;
use crate::gateway::protocol::{
    AddTagParams, ClearParams, ConnectParams, ConversationParams, HelloOk, HelloPolicy,
    ListParams, SendParams, SendTemplateParams, SetStatusParams, TempIdParams, WsEvent,
    WsRequest, WsResponse,
};
use crate::init;
use crate::model::{ConversationStatus, StatusFilter, Tag};
use crate::session::{InboxSession, ListFilter, RefreshTrigger};
use crate::store::{MemoryStore, Store};
use crate::templates::Template;
use crate::webhook::{self, WebhookNormalizer};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const PROTOCOL_VERSION: u32 = 1;

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

/// When auth mode is token and a token is configured, returns it for connect validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Shared state for the gateway (config, store, outbound transport, event fan-out).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, WebSocket connect must provide params.auth.token matching this.
    pub required_token: Option<String>,
    /// Broadcasts raw frames to every connected client (shutdown).
    pub event_tx: broadcast::Sender<String>,
    /// Raw webhook bodies; the processor task drains this into the normalizer.
    pub webhook_tx: mpsc::Sender<Bytes>,
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn OutboundTransport>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub events: EventBus,
    pub verify_token: Option<String>,
    /// When Some, POST /webhook bodies must carry a valid X-Hub-Signature-256.
    pub app_secret: Option<String>,
    pub poll_interval: Duration,
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup fails.
/// Blocks until shutdown (e.g. Ctrl+C).
/// Requires the configuration directory to be initialized (`inbox init`).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or INBOX_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let store_path = config::resolve_store_path(&config, &config_path);
    let store: Arc<dyn Store> = Arc::new(
        MemoryStore::open(&store_path)
            .await
            .with_context(|| format!("opening store at {}", store_path.display()))?,
    );
    log::info!("store loaded from {}", store_path.display());

    let credentials = Arc::new(StaticCredentials::from_config(&config));
    for status in credentials.connection_status() {
        if !status.connected {
            log::warn!("no access token for {}; sends to it will fail", status.platform);
        }
    }
    let meta = Arc::new(
        MetaClient::new(config.channels.meta.graph_api_base.clone(), credentials.clone())
            .context("building Graph API client")?,
    );
    let events = EventBus::default();

    let verify_token = config::resolve_verify_token(&config);
    if verify_token.is_none() {
        log::warn!("no webhook verify token configured; subscription handshakes will be refused");
    }
    let app_secret = config::resolve_app_secret(&config);
    if app_secret.is_none() {
        log::info!("no app secret configured; webhook signatures are not checked");
    }

    let mut normalizer = WebhookNormalizer::new(store.clone(), events.clone());
    if config.inbox.fetch_profiles {
        normalizer = normalizer.with_profiles(meta.clone());
    }
    let (webhook_tx, mut webhook_rx) = mpsc::channel::<Bytes>(256);
    let processor = tokio::spawn(async move {
        while let Some(body) = webhook_rx.recv().await {
            normalizer.ingest(&body).await;
        }
    });

    let (event_tx, _) = broadcast::channel(64);
    let state = GatewayState {
        config: Arc::new(config.clone()),
        required_token: require_connect_token(&config),
        event_tx: event_tx.clone(),
        webhook_tx,
        store,
        transport: meta,
        credentials,
        events,
        verify_token,
        app_secret,
        poll_interval: Duration::from_secs(config.inbox.poll_interval_secs.max(1)),
    };

    let app = Router::new()
        .route("/", get(health_http))
        .route("/webhook", get(webhook_verify).post(webhook_receive))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx))
        .await
        .context("gateway server exited")?;
    // Queued bodies are still ingested once the last webhook sender is gone.
    if tokio::time::timeout(Duration::from_secs(5), processor).await.is_err() {
        log::warn!("webhook processor did not drain within 5s");
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event to WebSocket clients.
async fn shutdown_signal(event_tx: broadcast::Sender<String>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and draining connections");
    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());
}

/// GET / returns a simple health JSON (for liveness checks).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
    }))
}

/// GET /webhook: Meta subscription handshake. Echoes hub.challenge when hub.verify_token matches.
async fn webhook_verify(
    State(state): State<GatewayState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let expected = state.verify_token.as_deref().unwrap_or("");
    match webhook::verify_subscription(
        params.get("hub.mode").map(String::as_str),
        params.get("hub.verify_token").map(String::as_str),
        params.get("hub.challenge").map(String::as_str),
        expected,
    ) {
        Some(challenge) => {
            log::info!("webhook subscription verified");
            (StatusCode::OK, challenge).into_response()
        }
        None => {
            log::warn!("webhook subscription handshake refused");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

/// POST /webhook: queue the body for the normalizer and acknowledge.
/// Only a forged signature is refused; processing failures never turn into a negative ack.
async fn webhook_receive(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(ref secret) = state.app_secret {
        let provided = headers
            .get(webhook::SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !webhook::verify_signature(secret, &body, provided) {
            log::warn!("webhook: rejecting delivery with invalid signature");
            return StatusCode::FORBIDDEN;
        }
    }
    match state.webhook_tx.try_send(body) {
        Ok(()) => {}
        // Never hold the acknowledgement on a backed-up processor.
        Err(mpsc::error::TrySendError::Full(body)) => {
            log::warn!("webhook: processor queue full, delivery deferred");
            let tx = state.webhook_tx.clone();
            tokio::spawn(async move {
                if tx.send(body).await.is_err() {
                    log::warn!("webhook: processor stopped, delivery dropped");
                }
            });
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::warn!("webhook: processor stopped, delivery dropped");
        }
    }
    StatusCode::OK
}

/// GET /ws upgrades to WebSocket. First frame must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn event_frame(event: &str, payload: serde_json::Value) -> String {
    serde_json::to_string(&WsEvent::new(event, payload)).unwrap_or_default()
}

/// One authenticated client: its inbox session plus the background tasks feeding it.
struct Connection {
    session: Arc<InboxSession>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

impl Connection {
    fn start(state: &GatewayState, out_tx: mpsc::UnboundedSender<String>) -> Self {
        let session = Arc::new(InboxSession::new(
            state.store.clone(),
            state.transport.clone(),
            state.events.clone(),
        ));
        let mut tasks = vec![
            session.spawn_polling(state.poll_interval),
            session.spawn_event_listener(),
        ];

        let mut snapshots = session.watch();
        let tx = out_tx.clone();
        tasks.push(tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {
                let list = snapshots.borrow_and_update().clone();
                let frame = event_frame("inbox.conversations", json!({ "conversations": list }));
                if tx.send(frame).is_err() {
                    break;
                }
            }
        }));

        let mut events = state.events.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ev) => {
                        let payload = serde_json::to_value(&ev).unwrap_or(json!({}));
                        if out_tx.send(event_frame("inbox.changed", payload)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} inbox events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        Self { session, tasks }
    }
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut event_rx = state.event_tx.subscribe();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut conn: Option<Connection> = None;

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        let _ = socket.send(Message::Text(text)).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} broadcast messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            Some(frame) = out_rx.recv() => {
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req): Result<WsRequest, _> = serde_json::from_str(&text) else { continue };
                if req.typ != "req" {
                    continue;
                }

                let res = if req.method == "connect" {
                    match connect(&state, &req) {
                        Ok(hello) => {
                            if conn.is_none() {
                                conn = Some(Connection::start(&state, out_tx.clone()));
                            }
                            WsResponse::ok(&req.id, hello)
                        }
                        Err(e) => WsResponse::err(&req.id, e),
                    }
                } else if let Some(ref c) = conn {
                    match handle_request(&state, c, &req, &out_tx).await {
                        Ok(payload) => WsResponse::ok(&req.id, payload),
                        Err(e) => WsResponse::err(&req.id, e),
                    }
                } else {
                    WsResponse::err(&req.id, "connect first")
                };
                if socket
                    .send(Message::Text(serde_json::to_string(&res).unwrap_or_default()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    if conn.is_none() {
        log::debug!("ws client disconnected before sending connect");
    }
}

fn connect(state: &GatewayState, req: &WsRequest) -> Result<serde_json::Value, String> {
    let params: ConnectParams =
        serde_json::from_value(req.params.clone()).map_err(|_| "invalid connect params")?;
    if let Some(ref required) = state.required_token {
        let provided = params.auth.token.as_deref().unwrap_or("").trim();
        if provided.is_empty() {
            return Err(
                "unauthorized: gateway token missing (set INBOX_GATEWAY_TOKEN or gateway.auth.token)"
                    .to_string(),
            );
        }
        if provided != required {
            return Err("unauthorized: gateway token mismatch".to_string());
        }
    }
    let protocol = params
        .max_protocol
        .unwrap_or(PROTOCOL_VERSION)
        .min(PROTOCOL_VERSION);
    let hello = HelloOk {
        typ: "hello-ok".to_string(),
        protocol,
        policy: Some(HelloPolicy {
            poll_interval_ms: Some(state.poll_interval.as_millis() as u64),
        }),
    };
    Ok(serde_json::to_value(&hello).unwrap_or(json!({})))
}

fn parse<T: DeserializeOwned>(req: &WsRequest) -> Result<T, String> {
    serde_json::from_value(req.params.clone())
        .map_err(|e| format!("invalid {} params: {}", req.method, e))
}

fn to_payload<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

/// Resolve the send outcome in the background and push it as an `inbox.pending` event.
fn spawn_dispatch(session: Arc<InboxSession>, temp_id: String, out_tx: mpsc::UnboundedSender<String>) {
    tokio::spawn(async move {
        let result = session.complete_send(&temp_id).await;
        let entry = session.delivery().get(&temp_id).await;
        let payload = match result {
            Ok(receipt) => json!({
                "tempId": temp_id,
                "ok": true,
                "externalMessageId": receipt.external_message_id,
                "pending": entry,
            }),
            Err(DeliveryError::Send { kind, message, .. }) => json!({
                "tempId": temp_id,
                "ok": false,
                "failure": kind,
                "error": message,
                "pending": entry,
            }),
            Err(e) => json!({
                "tempId": temp_id,
                "ok": false,
                "error": e.to_string(),
                "pending": entry,
            }),
        };
        let _ = out_tx.send(event_frame("inbox.pending", payload));
    });
}

fn find_template(state: &GatewayState, params: &SendTemplateParams) -> Result<Template, String> {
    if let Some(ref body) = params.body {
        return Ok(Template {
            name: params.name.clone().unwrap_or_else(|| "inline".to_string()),
            body: body.clone(),
        });
    }
    let name = params
        .name
        .as_deref()
        .ok_or("template name or body required")?;
    state
        .config
        .inbox
        .templates
        .iter()
        .find(|t| t.name == name)
        .cloned()
        .ok_or_else(|| format!("unknown template: {}", name))
}

async fn select_if_given(session: &InboxSession, id: Option<&str>) -> Result<(), String> {
    if let Some(id) = id {
        session.open(id).await.map_err(|e| e.to_string())?;
    }
    Ok(())
}

async fn handle_request(
    state: &GatewayState,
    conn: &Connection,
    req: &WsRequest,
    out_tx: &mpsc::UnboundedSender<String>,
) -> Result<serde_json::Value, String> {
    let session = &conn.session;
    match req.method.as_str() {
        "health" => Ok(json!({
            "runtime": "running",
            "protocol": PROTOCOL_VERSION,
        })),
        "status" => {
            let auth_mode = if state.required_token.is_some() {
                "token"
            } else {
                "none"
            };
            Ok(json!({
                "runtime": "running",
                "protocol": PROTOCOL_VERSION,
                "port": state.config.gateway.port,
                "bind": state.config.gateway.bind,
                "auth": auth_mode,
                "pollIntervalSecs": state.poll_interval.as_secs(),
                "platforms": state.credentials.connection_status(),
                "webhookVerifyToken": state.verify_token.is_some(),
                "webhookSignatureCheck": state.app_secret.is_some(),
            }))
        }
        "inbox.list" => {
            let params: ListParams = if req.params.is_null() {
                ListParams::default()
            } else {
                parse(req)?
            };
            let status: StatusFilter = params.status.as_deref().unwrap_or("").parse()?;
            let list = session
                .set_filter(ListFilter {
                    status,
                    search: params.search.unwrap_or_default(),
                })
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({ "conversations": list }))
        }
        "inbox.refresh" => {
            let list = session
                .refresh(RefreshTrigger::Manual)
                .await
                .map_err(|e| e.to_string())?
                .unwrap_or_default();
            Ok(json!({ "conversations": list }))
        }
        "inbox.open" => {
            let params: ConversationParams = parse(req)?;
            let view = session
                .open(&params.conversation_id)
                .await
                .map_err(|e| e.to_string())?;
            to_payload(&view)
        }
        "inbox.current" => {
            let view = session.current().await.map_err(|e| e.to_string())?;
            to_payload(&view)
        }
        "inbox.send" => {
            let params: SendParams = parse(req)?;
            select_if_given(session, params.conversation_id.as_deref()).await?;
            let entry: PendingSend = session
                .begin_send(&params.content)
                .await
                .map_err(|e| e.to_string())?;
            spawn_dispatch(session.clone(), entry.temp_id.clone(), out_tx.clone());
            to_payload(&entry)
        }
        "inbox.templates" => Ok(json!({ "templates": state.config.inbox.templates })),
        "inbox.sendTemplate" => {
            let params: SendTemplateParams = parse(req)?;
            let template = find_template(state, &params)?;
            select_if_given(session, params.conversation_id.as_deref()).await?;
            let entry = session
                .begin_template_send(&template, &params.values)
                .await
                .map_err(|e| e.to_string())?;
            spawn_dispatch(session.clone(), entry.temp_id.clone(), out_tx.clone());
            to_payload(&entry)
        }
        "inbox.retry" => {
            let params: TempIdParams = parse(req)?;
            let entry = session
                .begin_retry(&params.temp_id)
                .await
                .map_err(|e| e.to_string())?;
            spawn_dispatch(session.clone(), entry.temp_id.clone(), out_tx.clone());
            to_payload(&entry)
        }
        "inbox.discard" => {
            let params: TempIdParams = parse(req)?;
            let entry = session
                .discard(&params.temp_id)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({ "discarded": entry.temp_id }))
        }
        "conversation.setStatus" => {
            let params: SetStatusParams = parse(req)?;
            let status: ConversationStatus = params.status.parse()?;
            let c = session
                .set_status(&params.conversation_id, status)
                .await
                .map_err(|e| e.to_string())?;
            to_payload(&c)
        }
        "conversation.addTag" => {
            let params: AddTagParams = parse(req)?;
            let tag: Tag = params.tag.parse()?;
            let c = session
                .add_tag(&params.conversation_id, tag)
                .await
                .map_err(|e| e.to_string())?;
            to_payload(&c)
        }
        "conversation.clear" => {
            let params: ClearParams = parse(req)?;
            let c = session
                .clear_messages(&params.conversation_id, params.confirm)
                .await
                .map_err(|e| e.to_string())?;
            to_payload(&c)
        }
        "conversation.delete" => {
            let params: ConversationParams = parse(req)?;
            session
                .delete_conversation(&params.conversation_id)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({
                "deleted": params.conversation_id,
                "selected": session.selected().await,
            }))
        }
        other => Err(format!("unknown method: {}", other)),
    }
}
