//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from `@user@host` handles
//! entered as subscription targets.

use serde::{Deserialize, Serialize};

use super::client::{check_remote_url, read_body_limited};
use crate::error::AppError;

const MAX_WEBFINGER_BYTES: usize = 64 * 1024;

/// WebFinger result
#[derive(Debug, Clone)]
pub struct WebFingerResult {
    /// Subject (acct:user@domain)
    pub subject: String,
    /// ActivityPub actor URI
    pub actor_uri: String,
    /// Profile page URL (optional)
    pub profile_url: Option<String>,
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Split a handle into (username, host)
///
/// Accepts `user@host`, `@user@host` and `acct:user@host`. URLs are not handles.
pub fn parse_handle(target: &str) -> Option<(String, String)> {
    let target = target.trim();
    let target = target.strip_prefix("acct:").unwrap_or(target);
    let target = target.strip_prefix('@').unwrap_or(target);

    if target.contains('/') || target.contains(char::is_whitespace) {
        return None;
    }

    let (username, host) = target.split_once('@')?;
    if username.is_empty() || host.is_empty() || host.contains('@') {
        return None;
    }

    Some((username.to_string(), host.to_ascii_lowercase()))
}

/// Build the lookup URL for a handle
pub fn webfinger_url(username: &str, host: &str) -> Result<url::Url, AppError> {
    url::Url::parse_with_params(
        &format!("https://{}/.well-known/webfinger", host),
        &[("resource", format!("acct:{}@{}", username, host))],
    )
    .map_err(|e| AppError::Validation(format!("Invalid handle host: {}", e)))
}

/// Pick the ActivityPub actor and profile page out of a JRD response
pub fn parse_response(response: WebFingerResponse) -> Result<WebFingerResult, AppError> {
    let actor_uri = response
        .links
        .iter()
        .find(|link| {
            link.rel == "self"
                && link.link_type.as_deref().is_some_and(|t| {
                    t == "application/activity+json" || t.starts_with("application/ld+json")
                })
        })
        .and_then(|link| link.href.clone())
        .ok_or_else(|| {
            AppError::Federation(format!("No ActivityPub actor for {}", response.subject))
        })?;

    let profile_url = response
        .links
        .iter()
        .find(|link| link.rel == "http://webfinger.net/rel/profile-page")
        .and_then(|link| link.href.clone());

    Ok(WebFingerResult {
        subject: response.subject,
        actor_uri,
        profile_url,
    })
}

/// Resolve an address to ActivityPub actor
///
/// # Arguments
/// * `address` - Account address (user@domain)
/// * `http_client` - HTTP client
///
/// # Returns
/// WebFinger result with actor URI
pub async fn resolve_webfinger(
    address: &str,
    http_client: &reqwest::Client,
) -> Result<WebFingerResult, AppError> {
    let (username, host) = parse_handle(address)
        .ok_or_else(|| AppError::Validation(format!("Not a handle: {}", address)))?;
    let url = check_remote_url(webfinger_url(&username, &host)?.as_str()).await?;

    let response = http_client
        .get(url)
        .header("Accept", "application/jrd+json, application/json")
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "WebFinger lookup for {} failed: HTTP {}",
            address,
            response.status()
        )));
    }

    let bytes = read_body_limited(response, MAX_WEBFINGER_BYTES).await?;
    let body: WebFingerResponse = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::Parse(format!("Invalid WebFinger response: {}", e)))?;

    let result = parse_response(body)?;
    tracing::debug!(address = %address, actor = %result.actor_uri, "Resolved WebFinger handle");
    Ok(result)
}
