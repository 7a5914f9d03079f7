//! Event sinks - where published events leave the process

use super::MailEvent;
use anyhow::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use outpost_common::config::EventsConfig;
use outpost_storage::EventDestination;
use reqwest::{Client, Url};
use serde::Serialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Delivers events for destinations that name an external target
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, destination: &EventDestination, event: &MailEvent) -> Result<()>;
}

/// Body posted to webhook endpoints
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookPayload<'a> {
    destination: &'a str,
    target: &'a str,
    event: &'a MailEvent,
}

/// Posts events as signed JSON to the URL configured for each target
/// (SNS topic, Firehose stream or CloudWatch namespace)
pub struct WebhookSink {
    client: Client,
    endpoints: HashMap<String, Url>,
    signing_secret: Option<String>,
}

impl WebhookSink {
    pub fn new(config: &EventsConfig) -> outpost_common::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| outpost_common::Error::Config(format!("HTTP client: {}", e)))?;

        let mut endpoints = HashMap::new();
        for (target, url) in &config.endpoints {
            endpoints.insert(target.clone(), parse_endpoint(url)?);
        }

        Ok(Self {
            client,
            endpoints,
            signing_secret: config.signing_secret.clone(),
        })
    }

    /// `sha256=<hex>` signature of `body`
    fn sign(&self, body: &[u8]) -> Result<Option<String>> {
        let Some(secret) = &self.signing_secret else {
            return Ok(None);
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid HMAC key: {}", e))?;
        mac.update(body);
        Ok(Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes()))))
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, destination: &EventDestination, event: &MailEvent) -> Result<()> {
        let Some(target) = destination.target() else {
            return Ok(());
        };
        let Some(url) = self.endpoints.get(target) else {
            debug!(event_target = target, "No webhook endpoint configured for target");
            return Ok(());
        };

        let body = serde_json::to_vec(&WebhookPayload {
            destination: &destination.name,
            target,
            event,
        })?;

        let mut request = self
            .client
            .post(url.clone())
            .header("Content-Type", "application/json")
            .header("X-Outpost-Event", event.kind().to_string())
            .header("X-Outpost-Message-Id", event.message_id.to_string());
        if let Some(signature) = self.sign(&body)? {
            request = request.header("X-Outpost-Signature", signature);
        }

        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Webhook {} returned status {}",
                url,
                response.status()
            ));
        }
        Ok(())
    }
}

fn parse_endpoint(url: &str) -> outpost_common::Result<Url> {
    let parsed = Url::parse(url).map_err(|e| {
        outpost_common::Error::Config(format!("invalid event endpoint {}: {}", url, e))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(outpost_common::Error::Config(format!(
            "event endpoint scheme '{}' is not allowed",
            scheme
        ))),
    }
}

/// Writes every event to the log
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, destination: &EventDestination, event: &MailEvent) -> Result<()> {
        info!(
            destination = %destination.name,
            event_target = destination.target().unwrap_or("-"),
            message_id = %event.message_id,
            kind = %event.kind(),
            "Mail event"
        );
        Ok(())
    }
}
