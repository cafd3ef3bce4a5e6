//! Subscription service
//!
//! Create/update/delete of subscriptions, transport negotiation
//! ("connect"), backlog import, and receipt of pushed content.

use std::sync::Arc;
use std::time::Instant;

use super::Stores;
use super::ingest::{IngestOutcome, MessageIngestor};
use super::moderation::{FilterOptions, RuleFilter, RuleService};
use super::state::PollPolicy;
use super::tasks::{BackgroundTasks, PURGE_SUBSCRIPTION_MESSAGES, PurgeSubscriptionMessages, Task};
use crate::config::PollingConfig;
use crate::data::{Message, Subscription, SubscriptionMethod, SubscriptionStatus, unix_now};
use crate::error::AppError;
use crate::federation::{
    IntentQuery, ObjectRef, Traversal, RemoteClient, RemoteDocument, RssTransport, Transport, Transports,
    parse_document, parse_handle, websub,
};
use crate::metrics::observe_connect;

/// Editable fields of a subscription; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub url: Option<String>,
    pub folder_id: Option<String>,
    pub label: Option<String>,
    pub collapse_threads: Option<bool>,
    pub purge_duration: Option<i64>,
}

/// Counts from one import
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub inserted: usize,
    pub merged: usize,
    pub unchanged: usize,
    pub blocked: usize,
    pub errors: Vec<String>,
}

impl ImportReport {
    fn record(&mut self, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Inserted => self.inserted += 1,
            IngestOutcome::Merged => self.merged += 1,
            IngestOutcome::Unchanged => self.unchanged += 1,
            IngestOutcome::Blocked => self.blocked += 1,
            IngestOutcome::Ignored => {}
        }
    }

    /// Status message noting item-level failures
    pub fn error_summary(&self) -> Option<String> {
        let first = self.errors.first()?;
        Some(format!(
            "{} item(s) could not be imported; first error: {}",
            self.errors.len(),
            first
        ))
    }
}

fn validate_target(url: &str) -> Result<(), AppError> {
    if url.is_empty() {
        return Err(AppError::Validation(
            "subscription URL cannot be empty".to_string(),
        ));
    }
    if parse_handle(url).is_some() {
        return Ok(());
    }

    let parsed = url::Url::parse(url)
        .map_err(|e| AppError::Validation(format!("invalid subscription URL {}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }
    Ok(())
}

fn validate_settings(subscription: &Subscription) -> Result<(), AppError> {
    if subscription.folder_id.trim().is_empty() {
        return Err(AppError::Validation("folder cannot be empty".to_string()));
    }
    if subscription.purge_duration < 0 {
        return Err(AppError::Validation(
            "retention cannot be negative".to_string(),
        ));
    }
    Ok(())
}

/// Clear everything learned from the remote side
fn reset_negotiation(subscription: &mut Subscription) {
    subscription.profile_url.clear();
    subscription.method = SubscriptionMethod::Rss;
    subscription.status = SubscriptionStatus::New;
    subscription.status_message.clear();
    subscription.error_count = 0;
    subscription.last_polled = 0;
    subscription.next_poll = 0;
    subscription.websub_hub = None;
    subscription.websub_topic = None;
    subscription.websub_secret = None;
    subscription.activitypub_inbox = None;
    subscription.follow_activity_id = None;
}

/// Subscription lifecycle and the Connect pipeline
#[derive(Clone)]
pub struct SubscriptionService {
    stores: Stores,
    client: Arc<dyn RemoteClient>,
    transports: Transports,
    ingestor: MessageIngestor,
    rules: RuleService,
    tasks: BackgroundTasks,
    policy: PollPolicy,
    import_limit: usize,
    bootstrap_read_count: usize,
}

impl SubscriptionService {
    pub fn new(
        stores: Stores,
        client: Arc<dyn RemoteClient>,
        transports: Transports,
        tasks: BackgroundTasks,
        polling: &PollingConfig,
    ) -> Self {
        let ingestor =
            MessageIngestor::new(client.clone(), stores.inbox.clone(), polling.max_chain_depth);
        let rules = RuleService::new(stores.rules.clone(), tasks.clone());

        Self {
            stores,
            client,
            transports,
            ingestor,
            rules,
            tasks,
            policy: PollPolicy::from(polling),
            import_limit: polling.import_limit,
            bootstrap_read_count: polling.bootstrap_read_count,
        }
    }

    pub fn rules(&self) -> &RuleService {
        &self.rules
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// New rule filter for one batch of documents
    pub fn new_filter(&self, user_id: &str, options: FilterOptions) -> RuleFilter {
        self.rules.filter(user_id, options)
    }

    /// Save a new subscription and connect it in the background
    pub async fn create_subscription(
        &self,
        user_id: &str,
        folder_id: &str,
        url: &str,
    ) -> Result<Subscription, AppError> {
        let subscription = Subscription::new(user_id, folder_id, url);
        validate_target(&subscription.url)?;
        validate_settings(&subscription)?;

        if self
            .stores
            .subscriptions
            .find_subscription_by_url(user_id, &subscription.url)
            .await?
            .is_some()
        {
            return Err(AppError::Validation(format!(
                "already subscribed to {}",
                subscription.url
            )));
        }

        self.stores
            .subscriptions
            .save_subscription(&subscription, "created")
            .await?;
        tracing::info!(subscription_id = %subscription.id, url = %subscription.url, "Subscription created");

        self.tasks.dispatch(Task::RecalculateFollowingCount {
            user_id: user_id.to_string(),
        });
        self.connect_in_background(subscription.clone());

        Ok(subscription)
    }

    /// Apply user edits. A new target URL renegotiates the transport.
    pub async fn update_subscription(
        &self,
        user_id: &str,
        subscription_id: &str,
        update: SubscriptionUpdate,
    ) -> Result<Subscription, AppError> {
        let mut subscription = self
            .stores
            .subscriptions
            .load_subscription(user_id, subscription_id)
            .await?;
        let previous = subscription.clone();

        if let Some(folder_id) = update.folder_id {
            subscription.folder_id = folder_id.trim().to_string();
        }
        if let Some(label) = update.label {
            subscription.label = label.trim().to_string();
        }
        if let Some(collapse_threads) = update.collapse_threads {
            subscription.collapse_threads = collapse_threads;
        }
        if let Some(purge_duration) = update.purge_duration {
            subscription.purge_duration = purge_duration;
        }

        let retarget = match update.url.map(|url| url.trim().to_string()) {
            Some(url) if url != subscription.url => {
                validate_target(&url)?;
                if let Some(other) = self
                    .stores
                    .subscriptions
                    .find_subscription_by_url(user_id, &url)
                    .await?
                    .filter(|other| other.id != subscription.id)
                {
                    return Err(AppError::Validation(format!(
                        "already subscribed to {} ({})",
                        url, other.id
                    )));
                }
                subscription.url = url;
                reset_negotiation(&mut subscription);
                true
            }
            _ => false,
        };

        validate_settings(&subscription)?;
        subscription.updated_at = chrono::Utc::now();
        self.stores
            .subscriptions
            .save_subscription(&subscription, "updated")
            .await?;

        if retarget {
            if previous.method.is_push() {
                self.tasks.dispatch(Task::Unsubscribe {
                    subscription: Box::new(previous),
                });
            }
            self.connect_in_background(subscription.clone());
        }

        Ok(subscription)
    }

    /// Remove a subscription, disconnect its push transport and queue
    /// deletion of its messages
    pub async fn delete_subscription(
        &self,
        user_id: &str,
        subscription_id: &str,
    ) -> Result<(), AppError> {
        let subscription = self
            .stores
            .subscriptions
            .load_subscription(user_id, subscription_id)
            .await?;

        self.stores
            .subscriptions
            .delete_subscription(&subscription, "deleted by user")
            .await?;
        tracing::info!(subscription_id = %subscription.id, "Subscription deleted");

        let payload = PurgeSubscriptionMessages {
            user_id: subscription.user_id.clone(),
            subscription_id: subscription.id.clone(),
            folder_id: subscription.folder_id.clone(),
        };
        let published = match serde_json::to_value(&payload) {
            Ok(payload) => {
                self.stores
                    .queue
                    .publish(PURGE_SUBSCRIPTION_MESSAGES, payload)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            tracing::error!(subscription_id = %subscription.id, error = %e, "Failed to queue message purge");
        }

        self.tasks.dispatch(Task::RecalculateFollowingCount {
            user_id: user_id.to_string(),
        });
        if subscription.method.is_push() {
            self.tasks.dispatch(Task::Unsubscribe {
                subscription: Box::new(subscription),
            });
        }

        Ok(())
    }

    /// Subscriptions due for polling at `now`
    pub async fn load_pollable(&self, now: i64) -> Result<Vec<Subscription>, AppError> {
        self.stores.subscriptions.query_pollable(now).await
    }

    fn connect_in_background(&self, subscription: Subscription) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut subscription = subscription;
            if let Err(e) = service.connect(&mut subscription).await {
                tracing::error!(subscription_id = %subscription.id, error = %e, "Background connect failed");
            }
        });
    }

    /// Fetch the target, negotiate a transport and import new entries.
    ///
    /// Remote failures are recorded on the subscription as Failure; only
    /// storage errors are returned.
    pub async fn connect(&self, subscription: &mut Subscription) -> Result<ImportReport, AppError> {
        let started = Instant::now();

        self.policy.set_status_loading(subscription, unix_now());
        self.stores
            .subscriptions
            .save_subscription(subscription, "loading")
            .await?;

        let (status, report) = match self.negotiate_and_import(subscription).await {
            Ok(report) => {
                self.policy.set_status_success(subscription, unix_now());
                if let Some(summary) = report.error_summary() {
                    subscription.status_message = summary;
                }
                tracing::debug!(
                    subscription_id = %subscription.id,
                    method = subscription.method.as_str(),
                    inserted = report.inserted,
                    merged = report.merged,
                    blocked = report.blocked,
                    "Subscription connected"
                );
                ("success", report)
            }
            Err(e) => {
                tracing::warn!(subscription_id = %subscription.id, url = %subscription.url, error = %e, "Subscription connect failed");
                self.policy
                    .set_status_failure(subscription, &e.to_string(), unix_now());
                ("failure", ImportReport::default())
            }
        };

        subscription.updated_at = chrono::Utc::now();
        self.stores
            .subscriptions
            .save_subscription(subscription, status)
            .await?;
        observe_connect(subscription.method.as_str(), status, started.elapsed());

        if report.inserted > 0 || report.merged > 0 {
            self.tasks.dispatch(Task::RecalculateUnreadCount {
                user_id: subscription.user_id.clone(),
                folder_id: subscription.folder_id.clone(),
            });
        }

        Ok(report)
    }

    async fn negotiate_and_import(
        &self,
        subscription: &mut Subscription,
    ) -> Result<ImportReport, AppError> {
        let document = self.client.load_actor(&subscription.url).await?;
        apply_profile(subscription, &document);

        let transport = self.negotiate(subscription, &document).await;
        subscription.poll_duration = self
            .policy
            .poll_hours(transport.method(), document.ttl_minutes());

        let mut report = ImportReport::default();
        let entries = match transport.fetch_recent(&document, self.import_limit).await {
            Ok(entries) => entries,
            Err(e) => {
                report.errors.push(format!("backlog: {}", e));
                Vec::new()
            }
        };

        self.import_entries(subscription, entries, &mut report).await;
        Ok(report)
    }

    /// Pick the best transport that accepts the subscription
    async fn negotiate(
        &self,
        subscription: &mut Subscription,
        document: &RemoteDocument,
    ) -> Arc<dyn Transport> {
        let previous = subscription.clone();
        let mut chosen: Option<Arc<dyn Transport>> = None;

        for transport in self.transports.candidates(document) {
            match transport.subscribe(subscription, document).await {
                Ok(()) => {
                    chosen = Some(transport);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        method = transport.method().as_str(),
                        error = %e,
                        "Transport unavailable, falling back"
                    );
                }
            }
        }
        let transport = chosen.unwrap_or_else(|| Arc::new(RssTransport));
        let method = transport.method();

        if previous.method != method && previous.method.is_push() {
            self.tasks.dispatch(Task::Unsubscribe {
                subscription: Box::new(previous),
            });
        }
        if method != SubscriptionMethod::WebSub {
            subscription.websub_hub = None;
            subscription.websub_topic = None;
        }
        if method != SubscriptionMethod::ActivityPub {
            subscription.activitypub_inbox = None;
            subscription.follow_activity_id = None;
        }

        subscription.method = method;
        transport
    }

    /// Walk entries newest first until a seen URL or the cap, then store
    /// them oldest first. A brand-new subscription gets its first few
    /// stored items marked read.
    async fn import_entries(
        &self,
        subscription: &Subscription,
        entries: Vec<ObjectRef>,
        report: &mut ImportReport,
    ) {
        let mut fresh: Vec<Message> = Vec::new();

        for entry in entries.into_iter().take(self.import_limit) {
            let entry_id = entry.id();
            let message = match self.ingestor.get_message_from_ref(subscription, entry).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    report.errors.push(format!("{}: {}", entry_id, e));
                    continue;
                }
            };

            match self.stores.inbox.url_seen(subscription, &message.url).await
            {
                Ok(true) => {
                    tracing::debug!(subscription_id = %subscription.id, url = %message.url, "Caught up with known entry");
                    break;
                }
                Ok(false) => fresh.push(message),
                Err(e) => report.errors.push(format!("{}: {}", message.url, e)),
            }
        }

        fresh.reverse();
        fresh.sort_by_key(|message| message.publish_date);

        let bootstrap = subscription.is_new();
        let filter = self.new_filter(&subscription.user_id, FilterOptions::default());
        let mut stored = 0;
        for message in fresh {
            let url = message.url.clone();
            let mark_read = bootstrap && stored < self.bootstrap_read_count;
            match self.ingestor.ingest_message(message, &filter, mark_read).await {
                Ok(outcome) => {
                    if !matches!(outcome, IngestOutcome::Blocked | IngestOutcome::Ignored) {
                        stored += 1;
                    }
                    report.record(outcome);
                }
                Err(e) => report.errors.push(format!("{}: {}", url, e)),
            }
        }
    }

    /// Ingest an activity pushed to `user_id`'s inbox.
    ///
    /// Returns `None` when no subscription of the user follows the actor,
    /// and for activities that carry no content. A Delete removes the
    /// unread message the subscription delivered for its object.
    pub async fn receive_activity(
        &self,
        user_id: &str,
        activity: RemoteDocument,
    ) -> Result<Option<IngestOutcome>, AppError> {
        let actor_id = activity
            .actor_id()
            .ok_or_else(|| AppError::Validation("activity has no actor".to_string()))?;

        let Some(mut subscription) = self
            .stores
            .subscriptions
            .find_subscription_by_url(user_id, &actor_id)
            .await?
        else {
            tracing::debug!(actor = %actor_id, "Activity from unfollowed actor ignored");
            return Ok(None);
        };

        match activity.doc_type() {
            "Accept" => {
                tracing::info!(subscription_id = %subscription.id, "Follow accepted");
                return Ok(None);
            }
            "Reject" => {
                self.policy.set_status_failure(
                    &mut subscription,
                    "Follow request rejected",
                    unix_now(),
                );
                self.stores
                    .subscriptions
                    .save_subscription(&subscription, "follow rejected")
                    .await?;
                return Ok(None);
            }
            "Delete" => {
                self.remove_deleted(&subscription, &activity).await?;
                return Ok(None);
            }
            _ if activity.document_type().traversal() == Traversal::Ignore => {
                tracing::debug!(subscription_id = %subscription.id, kind = %activity.doc_type(), "Activity without content ignored");
                return Ok(None);
            }
            _ => {}
        }

        let filter = self.new_filter(user_id, FilterOptions::default());
        let outcome = self
            .ingestor
            .ingest(&subscription, activity, &filter, false)
            .await?;

        if matches!(outcome, IngestOutcome::Inserted | IngestOutcome::Merged) {
            self.tasks.dispatch(Task::RecalculateUnreadCount {
                user_id: subscription.user_id.clone(),
                folder_id: subscription.folder_id.clone(),
            });
        }
        Ok(Some(outcome))
    }

    async fn remove_deleted(
        &self,
        subscription: &Subscription,
        activity: &RemoteDocument,
    ) -> Result<(), AppError> {
        let Some(object) = activity.object() else {
            return Ok(());
        };
        let url = object.id();
        let Some(message) = self
            .stores
            .inbox
            .load_unread_by_url(&subscription.user_id, &url)
            .await?
        else {
            return Ok(());
        };
        if message.subscription_id != subscription.id {
            return Ok(());
        }

        self.stores
            .inbox
            .delete_message(&message, "deleted by author")
            .await?;
        tracing::info!(subscription_id = %subscription.id, url = %url, "Removed message deleted by its author");
        self.tasks.dispatch(Task::RecalculateUnreadCount {
            user_id: subscription.user_id.clone(),
            folder_id: subscription.folder_id.clone(),
        });
        Ok(())
    }

    /// Ingest a feed pushed by a WebSub hub after checking its signature.
    ///
    /// Returns the number of entries stored or merged.
    pub async fn receive_websub(
        &self,
        subscription_id: &str,
        signature: Option<&str>,
        content_type: &str,
        body: &[u8],
    ) -> Result<usize, AppError> {
        let subscription = self
            .stores
            .subscriptions
            .load_subscription_by_id(subscription_id)
            .await?;
        if subscription.method != SubscriptionMethod::WebSub {
            return Err(AppError::NotFound);
        }

        let secret = subscription
            .websub_secret
            .as_deref()
            .ok_or(AppError::InvalidSignature)?;
        websub::verify_signature(secret, signature, body)?;

        let topic = subscription
            .websub_topic
            .as_deref()
            .unwrap_or(&subscription.url);
        let document = parse_document(topic, content_type, body)?;

        let filter = self.new_filter(&subscription.user_id, FilterOptions::default());
        let mut stored = 0;
        for entry in document.items().into_iter().rev() {
            let entry_id = entry.id();
            let result = match self.ingestor.get_message_from_ref(&subscription, entry).await {
                Ok(Some(message)) => self.ingestor.ingest_message(message, &filter, false).await,
                Ok(None) => Ok(IngestOutcome::Ignored),
                Err(e) => Err(e),
            };
            match result {
                Ok(IngestOutcome::Inserted | IngestOutcome::Merged) => stored += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(subscription_id = %subscription.id, entry = %entry_id, error = %e, "Failed to ingest pushed entry");
                }
            }
        }

        if stored > 0 {
            self.tasks.dispatch(Task::RecalculateUnreadCount {
                user_id: subscription.user_id.clone(),
                folder_id: subscription.folder_id.clone(),
            });
        }
        Ok(stored)
    }

    /// Answer a hub's intent verification for a callback
    pub async fn verify_intent(
        &self,
        subscription_id: &str,
        query: &IntentQuery,
    ) -> Result<String, AppError> {
        let subscription = match self
            .stores
            .subscriptions
            .load_subscription_by_id(subscription_id)
            .await
        {
            Ok(subscription) => Some(subscription),
            Err(AppError::NotFound) => None,
            Err(e) => return Err(e),
        };

        websub::verify_intent(subscription.as_ref(), query)
    }
}

/// Copy display metadata from the fetched document
fn apply_profile(subscription: &mut Subscription, document: &RemoteDocument) {
    subscription.profile_url = if document.is_actor() {
        document.id().to_string()
    } else {
        document.url()
    };
    if subscription.profile_url.is_empty() {
        subscription.profile_url = subscription.url.clone();
    }

    if subscription.label.is_empty() {
        subscription.label = match document.label().trim() {
            "" => subscription.profile_url.clone(),
            label => label.to_string(),
        };
    }
    subscription.summary = ammonia::clean(document.summary());
    subscription.image_url = document.image_url();
    subscription.format = document.format();
}
