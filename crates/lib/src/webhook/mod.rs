//! Webhook ingestion: payload decoding, normalization into the canonical store, and
//! the Meta subscription/signature checks used by the gateway endpoint.

mod normalizer;
mod payload;
mod signature;

pub use normalizer::{IngestReport, WebhookNormalizer};
pub use payload::{decode_payload, Decoded, InboundEvent, WebhookError};
pub use signature::{sign, verify_signature, verify_subscription, SIGNATURE_HEADER};
