use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Parser)]
#[command(name = "inbox")]
#[command(about = "Unified Messenger and Instagram inbox", long_about = None)]
struct Cli {
    /// Config file path (default: INBOX_CONFIG_PATH or ~/.inbox/config.json)
    #[arg(long, short, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config with a sample template.
    Init,

    /// Run the gateway (webhook endpoint, HTTP health, WebSocket inbox sessions).
    Gateway {
        /// WebSocket and HTTP port (default from config or 15252)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// List conversations, most recent first.
    List {
        /// Status filter: all, open, closed
        #[arg(long, default_value = "all")]
        status: String,

        /// Case-insensitive match on name or last message
        #[arg(long)]
        search: Option<String>,
    },

    /// Open a conversation (marks it read) and print its thread.
    Show { conversation: String },

    /// Send a message and wait for the provider's answer.
    Send {
        conversation: String,
        message: String,
    },

    /// Send a saved template by name; values as key=value.
    Template {
        conversation: String,
        name: String,
        #[arg(value_name = "KEY=VALUE")]
        values: Vec<String>,
    },

    /// Set a conversation's status (open or closed).
    Status { conversation: String, status: String },

    /// Attach a tag (lead, customer, support, urgent, follow-up, vip).
    Tag { conversation: String, tag: String },

    /// Delete every message in a conversation; the conversation itself stays.
    Clear {
        conversation: String,
        /// Required: clearing is irreversible
        #[arg(long)]
        yes: bool,
    },

    /// Delete a conversation and its messages.
    Delete { conversation: String },

    /// Print conversation list snapshots as the gateway polls.
    Watch,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = cli.config;

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("inbox {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init) => run_init(config),
        Some(Commands::Gateway { port }) => run_gateway(config, port).await,
        Some(command) => run_client(config, command).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(inbox::config::default_config_path);
    let dir = inbox::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = inbox::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    inbox::gateway::run_gateway(config, path).await
}

/// Minimal request/response client over the gateway WebSocket.
struct GatewayClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl GatewayClient {
    async fn connect(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (config, _) = inbox::config::load_config(config_path)?;
        let ws_url = format!("ws://{}:{}/ws", config.gateway.bind.trim(), config.gateway.port);
        let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| anyhow::anyhow!("connecting to {}: {}", ws_url, e))?;
        let mut client = Self { ws, next_id: 0 };
        let mut params = serde_json::json!({
            "client": { "id": "inbox-cli", "mode": "operator" },
            "auth": {}
        });
        if let Some(token) = inbox::config::resolve_gateway_token(&config) {
            params["auth"] = serde_json::json!({ "token": token });
        }
        client.request("connect", params).await?;
        Ok(client)
    }

    async fn request(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let req = serde_json::json!({
            "type": "req",
            "id": id,
            "method": method,
            "params": params
        });
        self.ws.send(Message::Text(req.to_string())).await?;
        while let Some(msg) = self.ws.next().await {
            let Message::Text(text) = msg? else { continue };
            let res: serde_json::Value = serde_json::from_str(&text)?;
            if res.get("type").and_then(|v| v.as_str()) != Some("res")
                || res.get("id").and_then(|v| v.as_str()) != Some(id.as_str())
            {
                continue;
            }
            if !res.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
                let err = res
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("request failed");
                anyhow::bail!("{}", err);
            }
            return Ok(res.get("payload").cloned().unwrap_or_default());
        }
        anyhow::bail!("gateway closed the connection")
    }

    /// Wait for the next event with the given name (other frames are skipped).
    async fn next_event(&mut self, event: &str) -> anyhow::Result<serde_json::Value> {
        while let Some(msg) = self.ws.next().await {
            let Message::Text(text) = msg? else { continue };
            let frame: serde_json::Value = serde_json::from_str(&text)?;
            if frame.get("type").and_then(|v| v.as_str()) != Some("event") {
                continue;
            }
            match frame.get("event").and_then(|v| v.as_str()) {
                Some(name) if name == event => {
                    return Ok(frame.get("payload").cloned().unwrap_or_default())
                }
                Some("shutdown") => anyhow::bail!("gateway is shutting down"),
                _ => {}
            }
        }
        anyhow::bail!("gateway closed the connection")
    }

    /// Wait for the delivery outcome of one temp id.
    async fn await_delivery(&mut self, temp_id: &str) -> anyhow::Result<serde_json::Value> {
        loop {
            let payload = self.next_event("inbox.pending").await?;
            if payload.get("tempId").and_then(|v| v.as_str()) == Some(temp_id) {
                return Ok(payload);
            }
        }
    }
}

fn str_field<'a>(v: &'a serde_json::Value, key: &str) -> &'a str {
    v.get(key).and_then(|x| x.as_str()).unwrap_or("")
}

fn print_conversations(payload: &serde_json::Value) {
    let empty = Vec::new();
    let list = payload
        .get("conversations")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);
    if list.is_empty() {
        println!("(no conversations)");
        return;
    }
    for c in list {
        let name = match str_field(c, "displayName") {
            "" => str_field(c, "externalUserId"),
            n => n,
        };
        println!(
            "{}  [{}/{}] {} ({} unread) {}",
            str_field(c, "id"),
            str_field(c, "platform"),
            str_field(c, "status"),
            name,
            c.get("unreadCount").and_then(|v| v.as_u64()).unwrap_or(0),
            str_field(c, "lastMessagePreview"),
        );
    }
}

fn print_thread(view: &serde_json::Value) {
    let conv = view.get("conversation").cloned().unwrap_or_default();
    println!(
        "{} [{}/{}] tags: {}",
        str_field(&conv, "displayName"),
        str_field(&conv, "platform"),
        str_field(&conv, "status"),
        conv.get("tags").map(|t| t.to_string()).unwrap_or_default()
    );
    let empty = Vec::new();
    for item in view.get("items").and_then(|v| v.as_array()).unwrap_or(&empty) {
        match str_field(item, "kind") {
            "message" => {
                let who = if item
                    .get("isFromCustomer")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    "<"
                } else {
                    ">"
                };
                println!("{} {}  {}", who, str_field(item, "sentAt"), str_field(item, "content"));
            }
            _ => println!(
                "> ({})  {}",
                str_field(item, "deliveryStatus"),
                str_field(item, "content")
            ),
        }
    }
}

fn report_delivery(outcome: &serde_json::Value) -> anyhow::Result<()> {
    if outcome.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
        println!("sent ({})", str_field(outcome, "externalMessageId"));
        Ok(())
    } else {
        anyhow::bail!(
            "send failed ({}): {}",
            match str_field(outcome, "failure") {
                "" => "error",
                kind => kind,
            },
            str_field(outcome, "error")
        )
    }
}

async fn run_client(config_path: Option<PathBuf>, command: Commands) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(config_path).await?;
    match command {
        Commands::List { status, search } => {
            let payload = client
                .request("inbox.list", serde_json::json!({ "status": status, "search": search }))
                .await?;
            print_conversations(&payload);
        }
        Commands::Show { conversation } => {
            let view = client
                .request("inbox.open", serde_json::json!({ "conversationId": conversation }))
                .await?;
            print_thread(&view);
        }
        Commands::Send {
            conversation,
            message,
        } => {
            let pending = client
                .request(
                    "inbox.send",
                    serde_json::json!({ "conversationId": conversation, "content": message }),
                )
                .await?;
            let outcome = client.await_delivery(str_field(&pending, "tempId")).await?;
            report_delivery(&outcome)?;
        }
        Commands::Template {
            conversation,
            name,
            values,
        } => {
            let mut map = serde_json::Map::new();
            for kv in values {
                let (k, v) = kv
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got {}", kv))?;
                map.insert(k.to_string(), serde_json::Value::String(v.to_string()));
            }
            let pending = client
                .request(
                    "inbox.sendTemplate",
                    serde_json::json!({ "conversationId": conversation, "name": name, "values": map }),
                )
                .await?;
            let outcome = client.await_delivery(str_field(&pending, "tempId")).await?;
            report_delivery(&outcome)?;
        }
        Commands::Status {
            conversation,
            status,
        } => {
            let c = client
                .request(
                    "conversation.setStatus",
                    serde_json::json!({ "conversationId": conversation, "status": status }),
                )
                .await?;
            println!("{} is {}", str_field(&c, "id"), str_field(&c, "status"));
        }
        Commands::Tag { conversation, tag } => {
            let c = client
                .request(
                    "conversation.addTag",
                    serde_json::json!({ "conversationId": conversation, "tag": tag }),
                )
                .await?;
            println!("{} tags: {}", str_field(&c, "id"), c["tags"]);
        }
        Commands::Clear { conversation, yes } => {
            client
                .request(
                    "conversation.clear",
                    serde_json::json!({ "conversationId": conversation, "confirm": yes }),
                )
                .await?;
            println!("cleared {}", conversation);
        }
        Commands::Delete { conversation } => {
            client
                .request(
                    "conversation.delete",
                    serde_json::json!({ "conversationId": conversation }),
                )
                .await?;
            println!("deleted {}", conversation);
        }
        Commands::Watch => loop {
            let payload = client.next_event("inbox.conversations").await?;
            println!("--");
            print_conversations(&payload);
        },
        Commands::Version | Commands::Init | Commands::Gateway { .. } => {}
    }
    Ok(())
}
