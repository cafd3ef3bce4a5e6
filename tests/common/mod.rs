//! Common test utilities for pipeline and HTTP tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fedinbox::config::{
    AppConfig, DatabaseConfig, FederationConfig, LoggingConfig, PollingConfig, SchedulerConfig,
    ServerConfig,
};
use fedinbox::data::{Database, LocalActor, Subscription};
use fedinbox::error::AppError;
use fedinbox::federation::{
    ActivityPubTransport, ActivitySender, HubClient, HubRequest, RemoteClient, RemoteDocument,
    RssTransport, Transports, WebSubTransport, parse_document,
};
use fedinbox::service::{BackgroundTasks, RetentionPurger, Stores, SubscriptionService};
use fedinbox::{AppState, build_router};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const USER_ID: &str = "user-1";
pub const FOLDER_ID: &str = "inbox";
pub const ACTOR_URI: &str = "https://inbox.example/users/alice";

/// Remote web served from memory. Unknown URLs answer 404.
#[derive(Default)]
pub struct FakeRemote {
    documents: Mutex<HashMap<String, (String, Vec<u8>)>>,
    hubs: Mutex<HashMap<String, String>>,
}

impl FakeRemote {
    pub fn serve_json(&self, url: &str, value: serde_json::Value) {
        self.serve(url, "application/activity+json", value.to_string().into_bytes());
    }

    pub fn serve(&self, url: &str, content_type: &str, body: Vec<u8>) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), (content_type.to_string(), body));
    }

    /// Answer `url` with a `Link: <hub>; rel="hub"` header
    pub fn advertise_hub(&self, url: &str, hub: &str) {
        self.hubs
            .lock()
            .unwrap()
            .insert(url.to_string(), hub.to_string());
    }

    pub fn remove(&self, url: &str) {
        self.documents.lock().unwrap().remove(url);
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn load_actor(&self, target: &str) -> Result<RemoteDocument, AppError> {
        self.load_document(target).await
    }

    async fn load_document(&self, url: &str) -> Result<RemoteDocument, AppError> {
        let entry = self.documents.lock().unwrap().get(url).cloned();
        let Some((content_type, body)) = entry else {
            return Err(AppError::Federation(format!("Remote returned 404 for {}", url)));
        };

        let document = parse_document(url, &content_type, &body)?;
        match self.hubs.lock().unwrap().get(url).cloned() {
            Some(hub) => Ok(document.with_links(Some(hub), None)),
            None => Ok(document),
        }
    }
}

/// Activity sender that records instead of delivering
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(String, serde_json::Value)>>,
    failing: AtomicBool,
}

impl RecordingSender {
    /// Make every later delivery fail as if the remote inbox were down
    pub fn fail_deliveries(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn activity_types(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, activity)| activity["type"].as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl ActivitySender for RecordingSender {
    async fn deliver_to_inbox(
        &self,
        _actor: &LocalActor,
        inbox_uri: &str,
        activity: serde_json::Value,
    ) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Federation(format!(
                "POST {} failed: HTTP 503",
                inbox_uri
            )));
        }
        self.sent
            .lock()
            .unwrap()
            .push((inbox_uri.to_string(), activity));
        Ok(())
    }
}

/// WebSub hub client that records requests
#[derive(Default)]
pub struct RecordingHub {
    pub requests: Mutex<Vec<(String, HubRequest)>>,
}

#[async_trait]
impl HubClient for RecordingHub {
    async fn send_hub_request(&self, hub: &str, request: &HubRequest) -> Result<(), AppError> {
        self.requests
            .lock()
            .unwrap()
            .push((hub.to_string(), request.clone()));
        Ok(())
    }
}

pub fn federation_config() -> FederationConfig {
    FederationConfig {
        base_url: "https://inbox.example".to_string(),
        user_agent: "fedinbox-test".to_string(),
        request_timeout_seconds: 5,
        websub_lease_seconds: 86_400,
    }
}

pub fn test_config(db_path: std::path::PathBuf) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
        },
        database: DatabaseConfig { path: db_path },
        scheduler: SchedulerConfig {
            enabled: false,
            startup_delay_seconds: 0,
            between_subscriptions_millis: 0,
            ..SchedulerConfig::default()
        },
        polling: PollingConfig::default(),
        federation: federation_config(),
        logging: LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Full pipeline against a temporary database and an in-memory remote web
pub struct Harness {
    pub db: Arc<Database>,
    pub remote: Arc<FakeRemote>,
    pub sender: Arc<RecordingSender>,
    pub hub: Arc<RecordingHub>,
    pub service: SubscriptionService,
    pub purger: RetentionPurger,
    pub config: AppConfig,
    pub _temp_dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path().join("test.db"));
        let db = Arc::new(Database::connect(&config.database.path).await.unwrap());

        db.insert_user(
            "alice",
            &LocalActor {
                user_id: USER_ID.to_string(),
                actor_uri: ACTOR_URI.to_string(),
                key_id: format!("{}#main-key", ACTOR_URI),
                private_key_pem: String::new(),
            },
        )
        .await
        .unwrap();
        db.insert_folder(FOLDER_ID, USER_ID, "Inbox").await.unwrap();

        let stores = Stores::from_database(db.clone());
        let remote = Arc::new(FakeRemote::default());
        let sender = Arc::new(RecordingSender::default());
        let hub = Arc::new(RecordingHub::default());

        let transports = Transports::new(
            Arc::new(ActivityPubTransport::new(
                remote.clone(),
                sender.clone(),
                stores.users.clone(),
            )),
            Arc::new(WebSubTransport::new(hub.clone(), federation_config())),
            Arc::new(RssTransport),
        );

        let tasks = BackgroundTasks::disabled();
        let service = SubscriptionService::new(
            stores.clone(),
            remote.clone(),
            transports,
            tasks.clone(),
            &config.polling,
        );
        let purger = RetentionPurger::new(stores.inbox.clone(), tasks);

        Self {
            db,
            remote,
            sender,
            hub,
            service,
            purger,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Save a subscription without connecting it
    pub async fn subscription(&self, url: &str) -> Subscription {
        use fedinbox::data::SubscriptionStore;

        let subscription = Subscription::new(USER_ID, FOLDER_ID, url);
        self.db
            .save_subscription(&subscription, "test")
            .await
            .unwrap();
        subscription
    }

    pub async fn reload(&self, subscription: &Subscription) -> Subscription {
        use fedinbox::data::SubscriptionStore;

        self.db
            .load_subscription(USER_ID, &subscription.id)
            .await
            .unwrap()
    }
}

/// RSS 2.0 document. Items are (guid/link, title, RFC 2822 date, description).
pub fn rss_feed(
    link: &str,
    hub: Option<&str>,
    items: &[(String, String, String, String)],
) -> Vec<u8> {
    let hub_link = hub
        .map(|hub| {
            format!(
                r#"<atom:link rel="hub" href="{}"/><atom:link rel="self" href="{}/feed.xml"/>"#,
                hub, link
            )
        })
        .unwrap_or_default();
    let entries: String = items
        .iter()
        .map(|(url, title, date, description)| {
            format!(
                "<item><title>{}</title><link>{}</link><guid>{}</guid><pubDate>{}</pubDate><description>{}</description></item>",
                title, url, url, date, description
            )
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
<channel><title>Example Blog</title><link>{}</link><description>Posts</description>{}{}</channel>
</rss>"#,
        link, hub_link, entries
    )
    .into_bytes()
}

/// Items numbered 1..=count, newest first; item N is published N hours
/// after 2024-05-01T00:00:00Z
pub fn numbered_items(base: &str, count: usize) -> Vec<(String, String, String, String)> {
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    (1..=count)
        .rev()
        .map(|n| {
            let published = start + chrono::Duration::hours(n as i64);
            (
                format!("{}/posts/{}", base, n),
                format!("Post {}", n),
                published.to_rfc2822(),
                format!("Body of post {}", n),
            )
        })
        .collect()
}

/// Test server instance for the operational HTTP surface
pub struct TestServer {
    pub addr: String,
    pub harness: Harness,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        let harness = Harness::new().await;
        let state = AppState {
            config: Arc::new(harness.config.clone()),
            subscriptions: harness.service.clone(),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            harness,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }
}
