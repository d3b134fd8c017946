//! Unified messaging inbox core: Messenger and Instagram webhook ingestion, a canonical
//! conversation store, optimistic outbound delivery, inbox queries, and the gateway
//! that exposes them to agents.

pub mod channels;
pub mod config;
pub mod delivery;
pub mod events;
pub mod gateway;
pub mod init;
pub mod model;
pub mod mutator;
pub mod query;
pub mod session;
pub mod store;
pub mod templates;
pub mod webhook;
