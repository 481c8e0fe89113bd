use reqwest::Client;
use serde_json::Value;
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::encode::GatewayRequest;

/// Credentials and base URL for one gateway instance.
#[derive(Debug, Clone)]
pub struct GatewayTarget {
    pub api_url: String,
    pub api_token: String,
    pub instance: String,
}

#[derive(Clone)]
pub struct EvolutionClient {
    client: Client,
    max_retries: u32,
    retry_jitter_ms: u64,
}

impl EvolutionClient {
    pub fn new(
        timeout: StdDuration,
        max_retries: u32,
        retry_jitter_ms: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            max_retries: max_retries.max(1),
            retry_jitter_ms,
        })
    }

    fn jitter_delay(&self, attempt: u32) -> StdDuration {
        if self.retry_jitter_ms == 0 {
            return StdDuration::from_millis(0);
        }
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let jitter = (seed ^ ((attempt as u64) << 7)) % (self.retry_jitter_ms + 1);
        StdDuration::from_millis(jitter)
    }

    /// POST the request to `{api_url}/{endpoint}/{instance}`. Returns the
    /// gateway's message id when present.
    ///
    /// Sends are not idempotent: only failures to connect are retried. A
    /// timeout or 5xx may mean the gateway already delivered the message.
    pub async fn send(
        &self,
        target: &GatewayTarget,
        request: &GatewayRequest,
    ) -> anyhow::Result<Option<String>> {
        let url = format!(
            "{}/{}/{}",
            target.api_url.trim_end_matches('/'),
            request.endpoint,
            target.instance
        );

        let mut delay = Duration::from_millis(500);
        for attempt in 1..=self.max_retries {
            let resp = self
                .client
                .post(&url)
                .header("apikey", &target.api_token)
                .json(&request.body)
                .send()
                .await;

            let r = match resp {
                Ok(r) => r,
                Err(e) if e.is_connect() && attempt < self.max_retries => {
                    warn!(attempt, error = %e, "Gateway unreachable, retrying");
                    sleep(delay + self.jitter_delay(attempt)).await;
                    delay *= 2;
                    continue;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Gateway send network error");
                    anyhow::bail!("gateway network error after {attempt} attempt(s): {e}");
                }
            };

            let status = r.status();
            if status.is_success() {
                let body: Value = r.json().await.unwrap_or(Value::Null);
                info!(instance = %target.instance, attempt, "Gateway send accepted");
                return Ok(external_id_from_response(&body));
            }

            let body = r.text().await.unwrap_or_default();
            if status.is_client_error() {
                anyhow::bail!("gateway rejected message ({status}): {body}");
            }
            warn!(attempt, %status, body = %body, "Gateway send failed");
            anyhow::bail!("gateway error {status}: {body}");
        }

        anyhow::bail!("gateway unreachable after {} attempts", self.max_retries)
    }
}

/// Message id from a gateway or automation response (`key.id`, `messageId`,
/// `external_id`).
pub fn external_id_from_response(body: &Value) -> Option<String> {
    let candidates = [
        body.get("key").and_then(|k| k.get("id")),
        body.get("messageId"),
        body.get("external_id"),
        body.get("data").and_then(|d| d.get("key")).and_then(|k| k.get("id")),
    ];
    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(str::to_string)
}
