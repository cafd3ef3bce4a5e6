//! Message ingestion
//!
//! Two stages: resolve an inbound document to the content it stands for
//! (following Like/Dislike/Announce pointers and, for collapsed threads,
//! `inReplyTo`), then save it keyed by URL so repeat deliveries of an
//! unread message only add an origin reference.

use std::collections::HashSet;
use std::sync::Arc;

use crate::data::{
    EntityId, InboxStore, Message, OriginType, PersonLink, Subscription, unix_now,
};
use crate::error::AppError;
use crate::federation::{ObjectRef, RemoteClient, RemoteDocument, Traversal};
use crate::metrics::DOCUMENTS_INGESTED_TOTAL;

use super::moderation::{FilterAction, RuleFilter};

/// What happened to one inbound document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored as a new message
    Inserted,
    /// Added a reference to an existing unread message
    Merged,
    /// Exact repeat of a known delivery
    Unchanged,
    /// Discarded by a Block rule
    Blocked,
    /// Not content (Delete, Undo, Follow...)
    Ignored,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Merged => "merged",
            Self::Unchanged => "unchanged",
            Self::Blocked => "blocked",
            Self::Ignored => "ignored",
        }
    }
}

fn is_unique_violation(error: &AppError) -> bool {
    match error {
        AppError::Database(e) => e
            .as_database_error()
            .is_some_and(|db_error| db_error.is_unique_violation()),
        _ => false,
    }
}

/// Resolves and stores inbound documents
#[derive(Clone)]
pub struct MessageIngestor {
    client: Arc<dyn RemoteClient>,
    inbox: Arc<dyn InboxStore>,
    max_depth: usize,
}

impl MessageIngestor {
    pub fn new(client: Arc<dyn RemoteClient>, inbox: Arc<dyn InboxStore>, max_depth: usize) -> Self {
        Self {
            client,
            inbox,
            max_depth,
        }
    }

    async fn resolve(&self, reference: ObjectRef) -> Result<RemoteDocument, AppError> {
        match reference {
            ObjectRef::Embedded(document) => Ok(document),
            ObjectRef::Link(url) => self.client.load_document(&url).await,
        }
    }

    /// Resolve an entry (embedded or linked) and build its message
    pub async fn get_message_from_ref(
        &self,
        subscription: &Subscription,
        reference: ObjectRef,
    ) -> Result<Option<Message>, AppError> {
        let document = self.resolve(reference).await?;
        self.get_message(subscription, document).await
    }

    /// Follow the chain from `document` to the content it stands for.
    ///
    /// A failed hop keeps the last document that did load. The origin
    /// type is the outermost pointer that was followed. Returns `None` when
    /// the chain ends at something that is not content.
    pub async fn get_message(
        &self,
        subscription: &Subscription,
        document: RemoteDocument,
    ) -> Result<Option<Message>, AppError> {
        let mut current = document;
        let mut origin_type: Option<OriginType> = None;
        let mut visited = HashSet::new();
        visited.insert(current.id().to_string());

        for _ in 0..self.max_depth {
            let next = match current.document_type().traversal() {
                Traversal::Unwrap => current.object(),
                Traversal::Pointer(reason) => {
                    origin_type.get_or_insert(reason);
                    current.object()
                }
                Traversal::Content if subscription.collapse_threads => {
                    current.in_reply_to().map(|parent| {
                        origin_type.get_or_insert(OriginType::Reply);
                        ObjectRef::Link(parent)
                    })
                }
                Traversal::Content | Traversal::Ignore => None,
            };

            let Some(next) = next else {
                break;
            };
            if !visited.insert(next.id()) {
                tracing::debug!(url = %next.id(), "Activity chain loops, stopping");
                break;
            }

            match self.resolve(next).await {
                Ok(document) => current = document,
                Err(e) => {
                    tracing::debug!(from = %current.id(), error = %e, "Could not follow activity chain, using last document");
                    break;
                }
            }
        }

        if current.document_type().traversal() == Traversal::Ignore {
            tracing::debug!(url = %current.id(), kind = %current.doc_type(), "Not content, skipping");
            return Ok(None);
        }

        build_message(
            subscription,
            &current,
            origin_type.unwrap_or(OriginType::Follow),
        )
        .map(Some)
    }

    /// Store `message` unless an unread message with its URL exists, in
    /// which case only its origin is merged into that message.
    ///
    /// A read message with the URL absorbs the delivery too when the new
    /// message is stored read (muted or bootstrap) or arrives again through
    /// the subscription that delivered it.
    pub async fn save_unique_message(&self, message: Message) -> Result<IngestOutcome, AppError> {
        let existing = match self
            .inbox
            .load_unread_by_url(&message.user_id, &message.url)
            .await?
        {
            Some(existing) => Some(existing),
            None => self
                .inbox
                .load_live_by_url(&message.user_id, &message.url)
                .await?
                .filter(|existing| {
                    message.is_read() || existing.subscription_id == message.subscription_id
                }),
        };
        if let Some(existing) = existing {
            return self.merge(existing, &message).await;
        }

        match self.inbox.save_message(&message, "ingested").await {
            Ok(()) => Ok(IngestOutcome::Inserted),
            // lost a race with a concurrent delivery of the same URL
            Err(e) if is_unique_violation(&e) => {
                let existing = self
                    .inbox
                    .load_unread_by_url(&message.user_id, &message.url)
                    .await?
                    .ok_or(e)?;
                self.merge(existing, &message).await
            }
            Err(e) => Err(e),
        }
    }

    async fn merge(&self, mut existing: Message, message: &Message) -> Result<IngestOutcome, AppError> {
        if !existing.add_reference(message.origin.clone()) {
            return Ok(IngestOutcome::Unchanged);
        }

        existing.updated_at = unix_now();
        self.inbox.save_message(&existing, "reference added").await?;
        Ok(IngestOutcome::Merged)
    }

    /// Resolve, filter and store one document.
    ///
    /// `mark_read` stores the message already read. Muted messages are
    /// always stored read and flagged.
    pub async fn ingest(
        &self,
        subscription: &Subscription,
        document: RemoteDocument,
        filter: &RuleFilter,
        mark_read: bool,
    ) -> Result<IngestOutcome, AppError> {
        match self.get_message(subscription, document).await? {
            Some(message) => self.ingest_message(message, filter, mark_read).await,
            None => {
                DOCUMENTS_INGESTED_TOTAL
                    .with_label_values(&[IngestOutcome::Ignored.as_str()])
                    .inc();
                Ok(IngestOutcome::Ignored)
            }
        }
    }

    /// Filter and store an already resolved message
    pub async fn ingest_message(
        &self,
        mut message: Message,
        filter: &RuleFilter,
        mark_read: bool,
    ) -> Result<IngestOutcome, AppError> {
        let verdict = filter.evaluate(&message).await?;
        let outcome = match verdict.action {
            FilterAction::Block => IngestOutcome::Blocked,
            action => {
                let now = unix_now();
                message.labels.extend(verdict.labels);
                if action == FilterAction::Mute {
                    message.muted = true;
                    message.mark_read(now);
                }
                if mark_read {
                    message.mark_read(now);
                }
                self.save_unique_message(message).await?
            }
        };

        DOCUMENTS_INGESTED_TOTAL
            .with_label_values(&[outcome.as_str()])
            .inc();
        Ok(outcome)
    }
}

/// Convert a resolved document into a message owned by the subscription's user
pub fn build_message(
    subscription: &Subscription,
    document: &RemoteDocument,
    origin_type: OriginType,
) -> Result<Message, AppError> {
    let url = document.url();
    if url.is_empty() {
        return Err(AppError::Parse(format!(
            "Document without URL from subscription {}",
            subscription.id
        )));
    }

    let now = unix_now();
    let mut attributed_to = document.attributed_to();
    if attributed_to.is_empty() {
        let origin = subscription.origin(origin_type);
        attributed_to.push(PersonLink {
            name: origin.label,
            profile_url: origin.url,
            image_url: origin.image_url,
            ..Default::default()
        });
    }

    let origin = subscription.origin(origin_type);
    Ok(Message {
        id: EntityId::new().0,
        user_id: subscription.user_id.clone(),
        folder_id: subscription.folder_id.clone(),
        subscription_id: subscription.id.clone(),
        url,
        label: document.label().trim().to_string(),
        summary: ammonia::clean(document.summary()),
        image_url: document.image_url(),
        attributed_to,
        content_html: ammonia::clean(document.content()),
        publish_date: document
            .published()
            .or_else(|| document.updated())
            .unwrap_or(now),
        read_date: 0,
        muted: false,
        origin: origin.clone(),
        references: vec![origin],
        labels: Vec::new(),
        created_at: now,
        updated_at: now,
    })
}
