use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use zaproute_core::error::RouteError;
use zaproute_core::types::Connection;
use zaproute_evolution::client::{external_id_from_response, EvolutionClient, GatewayTarget};
use zaproute_evolution::encode::{to_gateway_request, EncodeError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no gateway credentials for instance '{0}'")]
    MissingCredentials(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("gateway dispatch failed: {0}")]
    Gateway(String),

    #[error("automation dispatch failed: {0}")]
    Automation(String),

    #[error("no automation outbound webhook configured")]
    NotConfigured,
}

impl From<DispatchError> for RouteError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::MissingCredentials(_) => RouteError::MissingConnection(err.to_string()),
            DispatchError::Encode(e) => RouteError::Validation(e.to_string()),
            other => RouteError::Dispatch(other.to_string()),
        }
    }
}

/// Everything a dispatcher needs to hand one encoded reply downstream.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub correlation_id: String,
    pub tenant_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub instance: String,
    pub remote_jid: String,
    pub envelope: Value,
    /// Connection row for `instance`, when one exists.
    pub connection: Option<Connection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub external_id: Option<String>,
}

/// Downstream that carries replies to WhatsApp.
#[async_trait]
pub trait OutboundDispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReceipt, DispatchError>;
}

/// Calls the Evolution REST API directly.
pub struct GatewayDispatcher {
    client: EvolutionClient,
    default_api_url: Option<String>,
    default_api_key: Option<String>,
}

impl GatewayDispatcher {
    pub fn new(
        client: EvolutionClient,
        default_api_url: Option<String>,
        default_api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            default_api_url,
            default_api_key,
        }
    }

    /// Connection secret first, then the global gateway settings.
    pub fn target_for(
        &self,
        instance: &str,
        connection: Option<&Connection>,
    ) -> Result<GatewayTarget, DispatchError> {
        let secret = connection.and_then(|c| c.secret.as_ref());
        let non_blank = |v: Option<&String>| v.filter(|s| !s.trim().is_empty()).cloned();

        let api_token = non_blank(secret.map(|s| &s.api_token))
            .or_else(|| non_blank(self.default_api_key.as_ref()))
            .ok_or_else(|| DispatchError::MissingCredentials(instance.to_string()))?;
        let api_url = non_blank(secret.and_then(|s| s.api_url.as_ref()))
            .or_else(|| non_blank(self.default_api_url.as_ref()))
            .ok_or_else(|| DispatchError::MissingCredentials(instance.to_string()))?;

        Ok(GatewayTarget {
            api_url,
            api_token,
            instance: instance.to_string(),
        })
    }
}

#[async_trait]
impl OutboundDispatcher for GatewayDispatcher {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let target = self.target_for(&request.instance, request.connection.as_ref())?;
        let gateway_request = to_gateway_request(&request.envelope)?;

        let external_id = self
            .client
            .send(&target, &gateway_request)
            .await
            .map_err(|e| DispatchError::Gateway(format!("{e:#}")))?;

        info!(
            request_id = %request.correlation_id,
            instance = %request.instance,
            endpoint = gateway_request.endpoint,
            "Reply handed to gateway"
        );
        Ok(DispatchReceipt { external_id })
    }
}

/// Hands replies to the automation engine's outbound webhook.
pub struct AutomationDispatcher {
    client: Client,
    url: Option<String>,
}

impl AutomationDispatcher {
    pub fn new(url: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.filter(|u| !u.trim().is_empty()),
        })
    }

    pub fn payload(request: &DispatchRequest) -> Value {
        json!({
            "action": "send_message",
            "workspaceId": request.tenant_id,
            "conversationId": request.conversation_id,
            "messageId": request.message_id,
            "instance": request.instance,
            "remoteJid": request.remote_jid,
            "correlationId": request.correlation_id,
            "message": request.envelope,
        })
    }
}

#[async_trait]
impl OutboundDispatcher for AutomationDispatcher {
    fn name(&self) -> &'static str {
        "automation"
    }

    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReceipt, DispatchError> {
        let Some(url) = self.url.as_deref() else {
            return Err(DispatchError::NotConfigured);
        };

        let resp = self
            .client
            .post(url)
            .header("x-request-id", &request.correlation_id)
            .json(&Self::payload(&request))
            .send()
            .await
            .map_err(|e| DispatchError::Automation(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(
                request_id = %request.correlation_id,
                %status,
                "Automation engine rejected reply"
            );
            return Err(DispatchError::Automation(format!("status {status}: {body}")));
        }

        // An empty or non-JSON acknowledgment is still a success.
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(DispatchReceipt {
            external_id: external_id_from_response(&body),
        })
    }
}
