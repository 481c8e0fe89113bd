//! Webhook and reply routing between the Evolution gateway, the CRM store
//! and the automation engine.

pub mod delivery;
pub mod dispatch;
pub mod inbound;
pub mod instance;
pub mod pipeline;
pub mod relay;
pub mod tenant;

#[cfg(test)]
pub(crate) mod testing;

pub use delivery::{DeliveryRouter, SendRequest, SentMessage};
pub use dispatch::{AutomationDispatcher, DispatchError, GatewayDispatcher, OutboundDispatcher};
pub use inbound::InboundProcessor;
pub use instance::InstanceResolver;
pub use pipeline::{ProcessingResult, WebhookPipeline};
pub use relay::{EventForwarder, ForwardingRelay, HttpForwarder};
pub use tenant::{resolve_tenant, TenantResolution};
