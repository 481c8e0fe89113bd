//! Wire contract of the Evolution WhatsApp gateway: reading inbound events
//! and producing outbound requests.

pub mod client;
pub mod decode;
pub mod encode;
pub mod metadata;
pub mod mime;
pub mod sanitize;

pub use client::{EvolutionClient, GatewayTarget};
pub use encode::{encode_outbound, OutboundContent, SenderDisplay};
pub use metadata::{extract_metadata, EventKind, EventMetadata};
pub use sanitize::sanitize_event;
