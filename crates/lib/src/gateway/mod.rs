//! Gateway: HTTP + WebSocket control plane.
//!
//! Single port serves the Meta webhook endpoint, a health check, and WebSocket inbox
//! sessions. Protocol: first frame must be `connect`; then requests (req/res) and events.

mod protocol;
mod server;

pub use protocol::{ConnectParams, HelloOk, WsEvent, WsRequest, WsResponse};
pub use server::{run_gateway, GatewayState};
