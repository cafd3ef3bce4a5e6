//! Transport adapters
//!
//! One adapter per delivery protocol. [`Transports`] holds them in
//! priority order (ActivityPub, WebSub, RSS) and picks the first whose
//! probe accepts the remote document.

use std::sync::Arc;

use async_trait::async_trait;

use super::client::RemoteClient;
use super::delivery::{ActivitySender, follow_activity_id};
use super::document::{ObjectRef, RemoteDocument};
use super::websub::{HubClient, HubMode, HubRequest, generate_secret};
use crate::config::FederationConfig;
use crate::data::{Subscription, SubscriptionMethod, UserDirectory};
use crate::error::AppError;

/// A strategy for receiving a remote source's activity
#[async_trait]
pub trait Transport: Send + Sync {
    fn method(&self) -> SubscriptionMethod;

    /// True when the remote document advertises this transport
    fn probe(&self, document: &RemoteDocument) -> bool;

    /// Start receiving updates; records protocol state on `subscription`
    async fn subscribe(
        &self,
        subscription: &mut Subscription,
        document: &RemoteDocument,
    ) -> Result<(), AppError>;

    /// Stop receiving updates
    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AppError>;

    /// Recent entries, newest first, at most `limit`
    async fn fetch_recent(
        &self,
        document: &RemoteDocument,
        limit: usize,
    ) -> Result<Vec<ObjectRef>, AppError>;
}

/// ActivityPub: Follow the actor and import its outbox
pub struct ActivityPubTransport {
    client: Arc<dyn RemoteClient>,
    sender: Arc<dyn ActivitySender>,
    users: Arc<dyn UserDirectory>,
}

impl ActivityPubTransport {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        sender: Arc<dyn ActivitySender>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            client,
            sender,
            users,
        }
    }

    async fn resolve_page(&self, page: ObjectRef) -> Result<RemoteDocument, AppError> {
        match page {
            ObjectRef::Embedded(document) => Ok(document),
            ObjectRef::Link(url) => self.client.load_document(&url).await,
        }
    }
}

#[async_trait]
impl Transport for ActivityPubTransport {
    fn method(&self) -> SubscriptionMethod {
        SubscriptionMethod::ActivityPub
    }

    fn probe(&self, document: &RemoteDocument) -> bool {
        document.is_actor()
    }

    async fn subscribe(
        &self,
        subscription: &mut Subscription,
        document: &RemoteDocument,
    ) -> Result<(), AppError> {
        let actor = self.users.local_actor(&subscription.user_id).await?;
        let follow_id = follow_activity_id(&actor, &subscription.id);

        self.sender
            .send_follow_with_id(&actor, &follow_id, document.id(), document.inbox())
            .await?;

        subscription.activitypub_inbox = Some(document.inbox().to_string());
        subscription.follow_activity_id = Some(follow_id);
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AppError> {
        let (Some(inbox), Some(follow_id)) = (
            subscription.activitypub_inbox.as_deref(),
            subscription.follow_activity_id.as_deref(),
        ) else {
            return Ok(());
        };

        let actor = self.users.local_actor(&subscription.user_id).await?;
        let target = if subscription.profile_url.is_empty() {
            &subscription.url
        } else {
            &subscription.profile_url
        };

        self.sender
            .send_undo_follow(&actor, follow_id, target, inbox)
            .await
    }

    async fn fetch_recent(
        &self,
        document: &RemoteDocument,
        limit: usize,
    ) -> Result<Vec<ObjectRef>, AppError> {
        if document.outbox().is_empty() {
            return Ok(Vec::new());
        }

        let outbox = self.client.load_document(document.outbox()).await?;
        let mut items = outbox.items();
        let mut next = if items.is_empty() {
            outbox.first_page()
        } else {
            outbox.next_page().map(ObjectRef::Link)
        };

        while items.len() < limit {
            let Some(page_ref) = next.take() else {
                break;
            };
            let page = match self.resolve_page(page_ref).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(outbox = %document.outbox(), error = %e, "Stopped paging outbox");
                    break;
                }
            };
            let page_items = page.items();
            if page_items.is_empty() {
                break;
            }
            items.extend(page_items);
            next = page.next_page().map(ObjectRef::Link);
        }

        items.truncate(limit);
        Ok(items)
    }
}

/// WebSub: subscribe at the hub, import the feed body
pub struct WebSubTransport {
    hub_client: Arc<dyn HubClient>,
    config: FederationConfig,
}

impl WebSubTransport {
    pub fn new(hub_client: Arc<dyn HubClient>, config: FederationConfig) -> Self {
        Self { hub_client, config }
    }
}

#[async_trait]
impl Transport for WebSubTransport {
    fn method(&self) -> SubscriptionMethod {
        SubscriptionMethod::WebSub
    }

    fn probe(&self, document: &RemoteDocument) -> bool {
        document.hub().is_some()
    }

    async fn subscribe(
        &self,
        subscription: &mut Subscription,
        document: &RemoteDocument,
    ) -> Result<(), AppError> {
        let hub = document
            .hub()
            .ok_or_else(|| AppError::Federation("Document has no WebSub hub".to_string()))?
            .to_string();
        let topic = document
            .self_url()
            .map(str::to_string)
            .unwrap_or_else(|| subscription.url.clone());
        let secret = subscription
            .websub_secret
            .clone()
            .unwrap_or_else(generate_secret);

        let request = HubRequest {
            mode: HubMode::Subscribe,
            topic: topic.clone(),
            callback: self.config.websub_callback(&subscription.id),
            secret: Some(secret.clone()),
            lease_seconds: self.config.websub_lease_seconds,
        };
        self.hub_client.send_hub_request(&hub, &request).await?;

        subscription.websub_hub = Some(hub);
        subscription.websub_topic = Some(topic);
        subscription.websub_secret = Some(secret);
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), AppError> {
        let (Some(hub), Some(topic)) = (
            subscription.websub_hub.as_deref(),
            subscription.websub_topic.as_deref(),
        ) else {
            return Ok(());
        };

        let request = HubRequest {
            mode: HubMode::Unsubscribe,
            topic: topic.to_string(),
            callback: self.config.websub_callback(&subscription.id),
            secret: None,
            lease_seconds: 0,
        };
        self.hub_client.send_hub_request(hub, &request).await
    }

    async fn fetch_recent(
        &self,
        document: &RemoteDocument,
        limit: usize,
    ) -> Result<Vec<ObjectRef>, AppError> {
        Ok(document.items().into_iter().take(limit).collect())
    }
}

/// RSS: plain polling, always available
#[derive(Default)]
pub struct RssTransport;

#[async_trait]
impl Transport for RssTransport {
    fn method(&self) -> SubscriptionMethod {
        SubscriptionMethod::Rss
    }

    fn probe(&self, _document: &RemoteDocument) -> bool {
        true
    }

    async fn subscribe(
        &self,
        _subscription: &mut Subscription,
        _document: &RemoteDocument,
    ) -> Result<(), AppError> {
        Ok(())
    }

    async fn unsubscribe(&self, _subscription: &Subscription) -> Result<(), AppError> {
        Ok(())
    }

    async fn fetch_recent(
        &self,
        document: &RemoteDocument,
        limit: usize,
    ) -> Result<Vec<ObjectRef>, AppError> {
        Ok(document.items().into_iter().take(limit).collect())
    }
}

/// Adapters in priority order
#[derive(Clone)]
pub struct Transports {
    adapters: Vec<Arc<dyn Transport>>,
}

impl Transports {
    /// ActivityPub > WebSub > RSS
    pub fn new(
        activitypub: Arc<dyn Transport>,
        websub: Arc<dyn Transport>,
        rss: Arc<dyn Transport>,
    ) -> Self {
        Self {
            adapters: vec![activitypub, websub, rss],
        }
    }

    /// Adapters whose probe accepts `document`, best first
    pub fn candidates(&self, document: &RemoteDocument) -> Vec<Arc<dyn Transport>> {
        self.adapters
            .iter()
            .filter(|adapter| adapter.probe(document))
            .cloned()
            .collect()
    }

    /// Adapter for an already negotiated method
    pub fn for_method(&self, method: SubscriptionMethod) -> Option<Arc<dyn Transport>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.method() == method)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{LocalActor, MockUserDirectory};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeClient {
        documents: HashMap<String, serde_json::Value>,
    }

    #[async_trait]
    impl RemoteClient for FakeClient {
        async fn load_actor(&self, target: &str) -> Result<RemoteDocument, AppError> {
            self.load_document(target).await
        }

        async fn load_document(&self, url: &str) -> Result<RemoteDocument, AppError> {
            self.documents
                .get(url)
                .cloned()
                .map(RemoteDocument::activity_stream)
                .ok_or_else(|| AppError::Federation(format!("404 {url}")))
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl ActivitySender for RecordingSender {
        async fn deliver_to_inbox(
            &self,
            _actor: &LocalActor,
            _inbox_uri: &str,
            activity: serde_json::Value,
        ) -> Result<(), AppError> {
            self.sent.lock().unwrap().push(activity);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHub {
        requests: Mutex<Vec<(String, HubRequest)>>,
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

    fn federation_config() -> FederationConfig {
        FederationConfig {
            base_url: "https://inbox.example".to_string(),
            user_agent: "test".to_string(),
            request_timeout_seconds: 5,
            websub_lease_seconds: 600,
        }
    }

    fn users() -> Arc<MockUserDirectory> {
        let mut users = MockUserDirectory::new();
        users.expect_local_actor().returning(|user_id| {
            Ok(LocalActor {
                user_id: user_id.to_string(),
                actor_uri: "https://inbox.example/users/alice".to_string(),
                key_id: "https://inbox.example/users/alice#main-key".to_string(),
                private_key_pem: String::new(),
            })
        });
        Arc::new(users)
    }

    fn actor_document() -> RemoteDocument {
        RemoteDocument::activity_stream(json!({
            "id": "https://remote.example/users/bob",
            "type": "Person",
            "inbox": "https://remote.example/users/bob/inbox",
            "outbox": "https://remote.example/users/bob/outbox",
        }))
        .with_links(Some("https://hub.example/".to_string()), None)
    }

    fn transports(client: Arc<FakeClient>, sender: Arc<RecordingSender>, hub: Arc<RecordingHub>) -> Transports {
        Transports::new(
            Arc::new(ActivityPubTransport::new(client, sender, users())),
            Arc::new(WebSubTransport::new(hub, federation_config())),
            Arc::new(RssTransport),
        )
    }

    #[test]
    fn candidates_follow_priority_order() {
        let transports = transports(
            Arc::new(FakeClient::default()),
            Arc::new(RecordingSender::default()),
            Arc::new(RecordingHub::default()),
        );

        let methods: Vec<_> = transports
            .candidates(&actor_document())
            .iter()
            .map(|t| t.method())
            .collect();
        assert_eq!(
            methods,
            vec![
                SubscriptionMethod::ActivityPub,
                SubscriptionMethod::WebSub,
                SubscriptionMethod::Rss
            ]
        );

        let plain_feed = RemoteDocument::activity_stream(json!({"type": "OrderedCollection"}));
        let methods: Vec<_> = transports
            .candidates(&plain_feed)
            .iter()
            .map(|t| t.method())
            .collect();
        assert_eq!(methods, vec![SubscriptionMethod::Rss]);
    }

    #[tokio::test]
    async fn activitypub_subscribe_sends_follow_and_records_inbox() {
        let sender = Arc::new(RecordingSender::default());
        let transport =
            ActivityPubTransport::new(Arc::new(FakeClient::default()), sender.clone(), users());
        let mut subscription = Subscription::new("user-1", "inbox", "@bob@remote.example");

        transport
            .subscribe(&mut subscription, &actor_document())
            .await
            .unwrap();

        assert_eq!(
            subscription.activitypub_inbox.as_deref(),
            Some("https://remote.example/users/bob/inbox")
        );
        let follow_id = format!("https://inbox.example/users/alice/follow/{}", subscription.id);
        assert_eq!(subscription.follow_activity_id.as_deref(), Some(follow_id.as_str()));

        transport.unsubscribe(&subscription).await.unwrap();
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[0]["type"], "Follow");
        assert_eq!(sent[1]["type"], "Undo");
    }

    #[tokio::test]
    async fn activitypub_fetch_recent_pages_outbox_up_to_limit() {
        let mut client = FakeClient::default();
        client.documents.insert(
            "https://remote.example/users/bob/outbox".to_string(),
            json!({
                "type": "OrderedCollection",
                "totalItems": 3,
                "first": "https://remote.example/users/bob/outbox?page=1",
            }),
        );
        client.documents.insert(
            "https://remote.example/users/bob/outbox?page=1".to_string(),
            json!({
                "type": "OrderedCollectionPage",
                "orderedItems": ["https://remote.example/a/3", "https://remote.example/a/2"],
                "next": "https://remote.example/users/bob/outbox?page=2",
            }),
        );
        client.documents.insert(
            "https://remote.example/users/bob/outbox?page=2".to_string(),
            json!({
                "type": "OrderedCollectionPage",
                "orderedItems": ["https://remote.example/a/1"],
            }),
        );
        let transport = ActivityPubTransport::new(
            Arc::new(client),
            Arc::new(RecordingSender::default()),
            users(),
        );

        let all = transport.fetch_recent(&actor_document(), 256).await.unwrap();
        let ids: Vec<_> = all.iter().map(ObjectRef::id).collect();
        assert_eq!(
            ids,
            vec![
                "https://remote.example/a/3",
                "https://remote.example/a/2",
                "https://remote.example/a/1"
            ]
        );

        let capped = transport.fetch_recent(&actor_document(), 2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn websub_subscribe_uses_self_topic_and_callback() {
        let hub = Arc::new(RecordingHub::default());
        let transport = WebSubTransport::new(hub.clone(), federation_config());
        let mut subscription = Subscription::new("user-1", "inbox", "https://blog.example/");
        let feed = RemoteDocument::activity_stream(json!({"type": "OrderedCollection"})).with_links(
            Some("https://hub.example/".to_string()),
            Some("https://blog.example/feed.xml".to_string()),
        );

        transport.subscribe(&mut subscription, &feed).await.unwrap();
        transport.unsubscribe(&subscription).await.unwrap();

        let requests = hub.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].0, "https://hub.example/");
        assert_eq!(requests[0].1.topic, "https://blog.example/feed.xml");
        assert_eq!(
            requests[0].1.callback,
            format!("https://inbox.example/websub/{}", subscription.id)
        );
        assert_eq!(requests[0].1.secret, subscription.websub_secret);
        assert_eq!(requests[1].1.mode, HubMode::Unsubscribe);
    }
}
