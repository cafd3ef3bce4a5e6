//! WebSub subscriber side
//!
//! Subscribe/unsubscribe requests to hubs, intent verification and
//! `X-Hub-Signature` checks for pushed content.
//! https://www.w3.org/TR/websub/

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Sha256, Sha384, Sha512};

use crate::data::{Subscription, SubscriptionMethod};
use crate::error::AppError;

/// Hub request mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubMode {
    Subscribe,
    Unsubscribe,
}

impl HubMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Form parameters of a hub request
#[derive(Debug, Clone)]
pub struct HubRequest {
    pub mode: HubMode,
    pub topic: String,
    pub callback: String,
    pub secret: Option<String>,
    pub lease_seconds: u64,
}

impl HubRequest {
    pub fn form_body(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        serializer
            .append_pair("hub.mode", self.mode.as_str())
            .append_pair("hub.topic", &self.topic)
            .append_pair("hub.callback", &self.callback);
        if self.mode == HubMode::Subscribe {
            serializer.append_pair("hub.lease_seconds", &self.lease_seconds.to_string());
            if let Some(secret) = &self.secret {
                serializer.append_pair("hub.secret", secret);
            }
        }
        serializer.finish()
    }
}

/// Sends requests to WebSub hubs
#[async_trait]
pub trait HubClient: Send + Sync {
    async fn send_hub_request(&self, hub: &str, request: &HubRequest) -> Result<(), AppError>;
}

/// HTTP hub client
#[derive(Clone)]
pub struct WebSubClient {
    http_client: Arc<reqwest::Client>,
}

impl WebSubClient {
    pub fn new(http_client: Arc<reqwest::Client>) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl HubClient for WebSubClient {
    async fn send_hub_request(&self, hub: &str, request: &HubRequest) -> Result<(), AppError> {
        super::client::check_remote_url(hub).await?;

        let response = self
            .http_client
            .post(hub)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(request.form_body())
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to reach hub {}: {}", hub, e)))?;

        // Hubs answer 202 Accepted and verify intent asynchronously
        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Hub {} rejected {}: HTTP {}",
                hub,
                request.mode.as_str(),
                response.status()
            )));
        }

        tracing::info!(hub = %hub, topic = %request.topic, mode = request.mode.as_str(), "Sent WebSub request");
        Ok(())
    }
}

/// Random per-subscription secret for signed content distribution
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Query parameters of a hub's verification request
#[derive(Debug, Clone, serde::Deserialize)]
pub struct IntentQuery {
    #[serde(rename = "hub.mode")]
    pub mode: String,
    #[serde(rename = "hub.topic", default)]
    pub topic: String,
    #[serde(rename = "hub.challenge", default)]
    pub challenge: String,
    #[serde(rename = "hub.lease_seconds", default)]
    pub lease_seconds: Option<u64>,
    #[serde(rename = "hub.reason", default)]
    pub reason: Option<String>,
}

/// Answer a hub's intent verification.
///
/// `subscription` is `None` when the callback's subscription no longer
/// exists. Returns the challenge to echo back.
pub fn verify_intent(
    subscription: Option<&Subscription>,
    query: &IntentQuery,
) -> Result<String, AppError> {
    let live_topic = subscription
        .filter(|s| s.method == SubscriptionMethod::WebSub)
        .and_then(|s| s.websub_topic.as_deref());

    match query.mode.as_str() {
        "subscribe" => match live_topic {
            Some(topic) if topic == query.topic => Ok(query.challenge.clone()),
            _ => Err(AppError::NotFound),
        },
        "unsubscribe" => match live_topic {
            Some(topic) if topic == query.topic => Err(AppError::NotFound),
            _ => Ok(query.challenge.clone()),
        },
        "denied" => {
            tracing::warn!(
                topic = %query.topic,
                reason = query.reason.as_deref().unwrap_or(""),
                "WebSub subscription denied by hub"
            );
            Ok(String::new())
        }
        other => Err(AppError::Validation(format!("Unknown hub.mode: {}", other))),
    }
}

fn verify_hmac<M: Mac + hmac::digest::KeyInit>(
    secret: &str,
    body: &[u8],
    expected: &[u8],
) -> Result<(), AppError> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(expected)
        .map_err(|_| AppError::InvalidSignature)
}

/// Verify an `X-Hub-Signature: method=hex` header against the body
pub fn verify_signature(secret: &str, header: Option<&str>, body: &[u8]) -> Result<(), AppError> {
    let header = header.ok_or(AppError::InvalidSignature)?;
    let (method, signature) = header
        .trim()
        .split_once('=')
        .ok_or(AppError::InvalidSignature)?;
    let expected = hex::decode(signature).map_err(|_| AppError::InvalidSignature)?;

    match method.to_ascii_lowercase().as_str() {
        "sha256" => verify_hmac::<Hmac<Sha256>>(secret, body, &expected),
        "sha384" => verify_hmac::<Hmac<Sha384>>(secret, body, &expected),
        "sha512" => verify_hmac::<Hmac<Sha512>>(secret, body, &expected),
        _ => Err(AppError::InvalidSignature),
    }
}
