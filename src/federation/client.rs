//! Remote document client
//!
//! Fetches actors, collections and feeds. Failures surface as
//! `HttpClient`/`Federation`/`Parse` errors, which the subscription state
//! machine records as a Failure.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::document::RemoteDocument;
use super::webfinger::{parse_handle, resolve_webfinger};
use crate::config::FederationConfig;
use crate::error::AppError;

const ACCEPT: &str = "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"; q=0.9, application/atom+xml; q=0.8, application/rss+xml; q=0.8, application/feed+json; q=0.8, application/json; q=0.7, application/xml; q=0.6, text/xml; q=0.6";

/// Largest response body read from a remote server
pub const MAX_DOCUMENT_BYTES: usize = 5 * 1024 * 1024;

const MAX_REDIRECTS: usize = 5;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
                || v6.to_ipv4_mapped().is_some_and(|v4| is_disallowed_ip(IpAddr::V4(v4)))
        }
    }
}

/// True for hosts that name this machine or a private network
pub fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Reject URLs that are not http(s) or point at local or private hosts,
/// including hosts whose DNS records resolve to such addresses.
pub async fn check_remote_url(url: &str) -> Result<url::Url, AppError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "Unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation(format!("URL without host: {}", url)))?;
    if is_disallowed_host(host) {
        return Err(AppError::Validation(format!("Refusing to fetch local address {}", host)));
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let lookup_host = host.trim_start_matches('[').trim_end_matches(']');
    let addresses = tokio::net::lookup_host((lookup_host, port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve {}: {}", host, e)))?;

    let mut resolved_any = false;
    for address in addresses {
        resolved_any = true;
        if is_disallowed_ip(address.ip()) {
            return Err(AppError::Validation(format!(
                "Refusing to fetch {}: resolves to a local address",
                host
            )));
        }
    }
    if !resolved_any {
        return Err(AppError::Federation(format!("No DNS records for {}", host)));
    }

    Ok(parsed)
}

/// Read a response body, failing once it grows past `limit` bytes
pub async fn read_body_limited(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, AppError> {
    if response
        .content_length()
        .is_some_and(|length| length > limit as u64)
    {
        return Err(AppError::Federation(format!(
            "Response from {} exceeds {} bytes",
            response.url(),
            limit
        )));
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Err(AppError::Federation(format!(
                "Response from {} exceeds {} bytes",
                response.url(),
                limit
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn redirect_policy() -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if attempt.url().host_str().is_none_or(is_disallowed_host) {
            attempt.stop()
        } else {
            attempt.follow()
        }
    })
}

/// Fetches remote documents
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetch the actor or feed behind a subscription target.
    ///
    /// `@user@host` handles are resolved through WebFinger first.
    async fn load_actor(&self, target: &str) -> Result<RemoteDocument, AppError>;

    /// Fetch any document by URL
    async fn load_document(&self, url: &str) -> Result<RemoteDocument, AppError>;
}

/// Parse an RFC 8288 `Link` header into (href, rel) pairs
pub fn parse_link_header(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            let (target, params) = part.split_once('>')?;
            let href = target.trim().strip_prefix('<')?.trim().to_string();
            let rel = params.split(';').find_map(|param| {
                let (name, value) = param.trim().split_once('=')?;
                (name.trim().eq_ignore_ascii_case("rel"))
                    .then(|| value.trim().trim_matches('"').to_string())
            })?;
            Some((href, rel))
        })
        .collect()
}

fn link_with_rel(links: &[(String, String)], rel: &str) -> Option<String> {
    links
        .iter()
        .find(|(_, rels)| rels.split_whitespace().any(|r| r.eq_ignore_ascii_case(rel)))
        .map(|(href, _)| href.clone())
}

/// Decode a response body into a document.
///
/// ActivityStreams JSON is kept as-is; JSON Feed, RSS and Atom go through
/// `feed-rs` and are converted to collections.
pub fn parse_document(
    url: &str,
    content_type: &str,
    body: &[u8],
) -> Result<RemoteDocument, AppError> {
    let looks_like_json = content_type.contains("json")
        || body
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|b| *b == b'{');

    if looks_like_json {
        let value: serde_json::Value = serde_json::from_slice(body)?;
        let is_json_feed = value
            .get("version")
            .and_then(|v| v.as_str())
            .is_some_and(|v| v.starts_with("https://jsonfeed.org/"));

        if !is_json_feed {
            if value.get("type").is_none() && value.get("@context").is_none() {
                return Err(AppError::Parse(format!(
                    "{} is JSON but not an ActivityStreams document",
                    url
                )));
            }
            return Ok(RemoteDocument::activity_stream(value));
        }
    }

    let feed = feed_rs::parser::parse(body)
        .map_err(|e| AppError::Parse(format!("Unsupported document at {}: {}", url, e)))?;
    Ok(RemoteDocument::from_feed(feed, url))
}

/// HTTP implementation of [`RemoteClient`]
#[derive(Clone)]
pub struct HttpRemoteClient {
    http_client: Arc<reqwest::Client>,
}

impl HttpRemoteClient {
    /// Build a client with the configured User-Agent and per-request timeout
    pub fn new(config: &FederationConfig) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .redirect(redirect_policy())
            .build()?;

        Ok(Self {
            http_client: Arc::new(http_client),
        })
    }

    /// Shared HTTP client, reused by delivery and hub requests
    pub fn http_client(&self) -> Arc<reqwest::Client> {
        self.http_client.clone()
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn load_actor(&self, target: &str) -> Result<RemoteDocument, AppError> {
        if parse_handle(target).is_some() {
            let resolved = resolve_webfinger(target, &self.http_client).await?;
            return self.load_document(&resolved.actor_uri).await;
        }

        self.load_document(target).await
    }

    async fn load_document(&self, url: &str) -> Result<RemoteDocument, AppError> {
        let parsed = check_remote_url(url).await?;

        let response = self
            .http_client
            .get(parsed)
            .header("Accept", ACCEPT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "GET {} failed: HTTP {}",
                url,
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let links: Vec<(String, String)> = response
            .headers()
            .get_all(reqwest::header::LINK)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_link_header)
            .collect();

        let body = read_body_limited(response, MAX_DOCUMENT_BYTES).await?;
        let document = parse_document(url, &content_type, &body)?;

        tracing::debug!(url = %url, format = document.format().as_str(), "Loaded remote document");

        Ok(document.with_links(link_with_rel(&links, "hub"), link_with_rel(&links, "self")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DocumentFormat;

    #[test]
    fn parse_link_header_reads_hub_and_self() {
        let links = parse_link_header(
            r#"<https://hub.example/>; rel="hub", <https://blog.example/feed.xml>; rel=self"#,
        );
        assert_eq!(
            link_with_rel(&links, "hub").as_deref(),
            Some("https://hub.example/")
        );
        assert_eq!(
            link_with_rel(&links, "self").as_deref(),
            Some("https://blog.example/feed.xml")
        );
        assert_eq!(link_with_rel(&links, "alternate"), None);
    }

    #[test]
    fn local_and_private_hosts_are_disallowed() {
        for host in [
            "localhost",
            "api.localhost",
            "LOCALHOST.",
            "127.0.0.1",
            "10.1.2.3",
            "192.168.0.10",
            "169.254.169.254",
            "0.0.0.0",
            "[::1]",
            "fd00::1",
            "::ffff:127.0.0.1",
        ] {
            assert!(is_disallowed_host(host), "{} should be refused", host);
        }
        for host in ["remote.example", "93.184.216.34", "2606:4700::1111"] {
            assert!(!is_disallowed_host(host), "{} should be allowed", host);
        }
    }

    #[tokio::test]
    async fn check_remote_url_refuses_local_targets() {
        for url in [
            "http://127.0.0.1:8080/admin",
            "http://localhost/feed.xml",
            "https://[::1]/users/alice",
            "http://169.254.169.254/latest/meta-data",
            "ftp://remote.example/feed",
            "not a url",
        ] {
            assert!(
                matches!(check_remote_url(url).await, Err(AppError::Validation(_))),
                "{} should be refused",
                url
            );
        }
    }

    #[tokio::test]
    async fn load_document_refuses_loopback_before_sending() {
        let client = HttpRemoteClient::new(&crate::config::FederationConfig {
            base_url: "https://inbox.example".to_string(),
            user_agent: "fedinbox-test".to_string(),
            request_timeout_seconds: 1,
            websub_lease_seconds: 86_400,
        })
        .unwrap();

        let result = client.load_document("http://127.0.0.1:9/feed.xml").await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn parse_link_header_ignores_malformed_parts() {
        assert!(parse_link_header("garbage, <https://x.example/>").is_empty());
    }

    #[test]
    fn parse_document_keeps_activity_streams_json() {
        let body = br#"{"@context":"https://www.w3.org/ns/activitystreams","type":"Person","id":"https://remote.example/users/alice","inbox":"https://remote.example/users/alice/inbox"}"#;
        let document =
            parse_document("https://remote.example/users/alice", "application/activity+json", body)
                .unwrap();
        assert_eq!(document.format(), DocumentFormat::ActivityStream);
        assert!(document.is_actor());
    }

    #[test]
    fn parse_document_converts_json_feed() {
        let body = br#"{"version":"https://jsonfeed.org/version/1.1","title":"JF","items":[{"id":"1","url":"https://jf.example/1","content_text":"hi"}]}"#;
        let document = parse_document("https://jf.example/feed.json", "application/feed+json", body)
            .unwrap();
        assert_eq!(document.format(), DocumentFormat::JsonFeed);
        assert_eq!(document.items().len(), 1);
    }

    #[test]
    fn parse_document_rejects_plain_json_and_html() {
        assert!(matches!(
            parse_document("https://x.example/", "application/json", br#"{"hello":"world"}"#),
            Err(AppError::Parse(_))
        ));
        assert!(parse_document("https://x.example/", "text/html", b"<html><body></body></html>")
            .is_err());
    }
}
