//! Provider-facing channels (Messenger and Instagram Direct via the Meta Graph API).
//!
//! Traits for outbound sends, profile lookup and credentials live in `transport`, so the
//! inbox core can be driven by any implementation; `MetaClient` is the real one.

mod meta;
mod transport;

pub use meta::{MetaClient, DEFAULT_GRAPH_API_BASE};
pub use transport::{
    ChannelError, ConnectionStatus, CredentialsProvider, OutboundRequest, OutboundTransport,
    ProfileLookup, SendReceipt, StaticCredentials, MAX_TEXT_CHARS,
};
