//! Activity delivery
//!
//! Sends Follow and Undo activities to remote inboxes on behalf of a
//! local user. Delivery goes through [`ActivitySender`] so the transport
//! logic can run without a network.

use std::sync::Arc;

use async_trait::async_trait;

use crate::data::LocalActor;
use crate::error::AppError;

/// ID of the Follow activity a subscription sends.
///
/// Deterministic so a later Undo can reference it and a repeated Follow is
/// recognised as the same request by the remote server.
pub fn follow_activity_id(actor: &LocalActor, subscription_id: &str) -> String {
    format!("{}/follow/{}", actor.actor_uri, subscription_id)
}

fn build_undo_object(activity_uri: &str, activity_type: &str, activity_object: &str) -> serde_json::Value {
    serde_json::json!({
        "id": activity_uri,
        "type": activity_type,
        "object": activity_object,
    })
}

/// Outbound activity delivery
#[async_trait]
pub trait ActivitySender: Send + Sync {
    /// Deliver activity to a single inbox
    ///
    /// # Errors
    /// Returns error if delivery fails (network, signature, rejection)
    async fn deliver_to_inbox(
        &self,
        actor: &LocalActor,
        inbox_uri: &str,
        activity: serde_json::Value,
    ) -> Result<(), AppError>;

    /// Send Follow activity with explicit activity URI.
    async fn send_follow_with_id(
        &self,
        actor: &LocalActor,
        follow_activity_uri: &str,
        target_actor_uri: &str,
        target_inbox_uri: &str,
    ) -> Result<(), AppError> {
        let activity = builder::follow(follow_activity_uri, &actor.actor_uri, target_actor_uri);

        self.deliver_to_inbox(actor, target_inbox_uri, activity)
            .await?;

        tracing::info!(
            "Sent Follow {} to {} for {}",
            follow_activity_uri,
            target_inbox_uri,
            target_actor_uri
        );

        Ok(())
    }

    /// Send Undo(Follow) to a single inbox.
    async fn send_undo_follow(
        &self,
        actor: &LocalActor,
        follow_activity_uri: &str,
        target_actor_uri: &str,
        inbox_uri: &str,
    ) -> Result<(), AppError> {
        let undo_id = format!("{}/undo/{}", actor.actor_uri, crate::data::EntityId::new().0);
        let object = build_undo_object(follow_activity_uri, "Follow", target_actor_uri);
        let activity = builder::undo(&undo_id, &actor.actor_uri, object);

        self.deliver_to_inbox(actor, inbox_uri, activity).await?;

        tracing::info!("Sent Undo {} to {}", follow_activity_uri, inbox_uri);
        Ok(())
    }
}

/// Signed HTTP delivery
///
/// Sends activities to remote inbox endpoints.
#[derive(Clone)]
pub struct ActivityDelivery {
    http_client: Arc<reqwest::Client>,
}

impl ActivityDelivery {
    /// Create new delivery service
    pub fn new(http_client: Arc<reqwest::Client>) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl ActivitySender for ActivityDelivery {
    async fn deliver_to_inbox(
        &self,
        actor: &LocalActor,
        inbox_uri: &str,
        activity: serde_json::Value,
    ) -> Result<(), AppError> {
        super::client::check_remote_url(inbox_uri).await?;

        // 1. Serialize activity
        let body = serde_json::to_vec(&activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        // 2. Sign request
        let sig_headers =
            crate::federation::sign_request("POST", inbox_uri, Some(&body), actor)?;

        // 3. POST to inbox with signed headers
        let mut request = self
            .http_client
            .post(inbox_uri)
            .header("Content-Type", "application/activity+json")
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(body).send().await.map_err(|e| {
            AppError::Federation(format!("Failed to deliver to {}: {}", inbox_uri, e))
        })?;

        // 4. Handle response
        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox_uri,
                response.status()
            )));
        }

        tracing::debug!("Delivered activity to {}", inbox_uri);
        Ok(())
    }
}

/// Activity builders
pub mod builder {
    use serde_json::Value;

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Undo activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (undoer)
    /// * `object` - Original activity being undone
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }
}
