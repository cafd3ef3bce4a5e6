//! Storage contracts
//!
//! Services depend on these traits rather than on `Database` so the
//! pipeline can be exercised against fakes. `Database` implements all of
//! them for SQLite.

use async_trait::async_trait;

use super::models::{
    LocalActor, Message, QueuedTask, Rule, RuleBehavior, RuleType, Subscription,
};
use crate::error::AppError;

/// Subscription records
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Load one subscription owned by `user_id`
    async fn load_subscription(
        &self,
        user_id: &str,
        subscription_id: &str,
    ) -> Result<Subscription, AppError>;

    /// Load a subscription by ID regardless of owner (push callbacks)
    async fn load_subscription_by_id(&self, subscription_id: &str)
    -> Result<Subscription, AppError>;

    /// Find the user's subscription whose target or profile URL is `url`
    async fn find_subscription_by_url(
        &self,
        user_id: &str,
        url: &str,
    ) -> Result<Option<Subscription>, AppError>;

    /// Insert or update
    async fn save_subscription(&self, subscription: &Subscription, note: &str)
    -> Result<(), AppError>;

    /// Soft delete
    async fn delete_subscription(
        &self,
        subscription: &Subscription,
        note: &str,
    ) -> Result<(), AppError>;

    /// Subscriptions due at `now`, excluding ActivityPub and parked imports
    async fn query_pollable(&self, now: i64) -> Result<Vec<Subscription>, AppError>;

    /// All live subscriptions of one user
    async fn query_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>, AppError>;
}

/// Inbox messages and folder counters
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Insert or update
    async fn save_message(&self, message: &Message, note: &str) -> Result<(), AppError>;

    /// The unread message with this URL, if any
    async fn load_unread_by_url(&self, user_id: &str, url: &str)
    -> Result<Option<Message>, AppError>;

    /// The most recent live message (read or unread) with this URL, if any
    async fn load_live_by_url(&self, user_id: &str, url: &str)
    -> Result<Option<Message>, AppError>;

    /// True when a live message of the user carries this URL, or when
    /// `subscription` delivered it before, even if it was purged since
    async fn url_seen(&self, subscription: &Subscription, url: &str) -> Result<bool, AppError>;

    /// Soft delete
    async fn delete_message(&self, message: &Message, note: &str) -> Result<(), AppError>;

    /// Messages of `subscription` ingested before `cutoff` (unix seconds)
    async fn query_purgeable(
        &self,
        subscription: &Subscription,
        cutoff: i64,
    ) -> Result<Vec<Message>, AppError>;

    /// Soft delete every message delivered by one subscription
    async fn delete_messages_by_subscription(
        &self,
        user_id: &str,
        subscription_id: &str,
        note: &str,
    ) -> Result<u64, AppError>;

    /// Recount unread messages of one folder, returning the new count
    async fn recalculate_unread_count(&self, user_id: &str, folder_id: &str)
    -> Result<i64, AppError>;
}

/// Moderation rules
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Rules of `user_id` (plus domain-wide rules) that could match a
    /// document with these actor identities and host candidates.
    ///
    /// Content and external rules are returned regardless of actor.
    async fn query_rules_for(
        &self,
        user_id: &str,
        identities: &[String],
        domains: &[String],
        behaviors: &[RuleBehavior],
    ) -> Result<Vec<Rule>, AppError>;

    /// The live rule with this (user, type, trigger), if any
    async fn load_rule_by_trigger(
        &self,
        user_id: &str,
        rule_type: RuleType,
        trigger: &str,
    ) -> Result<Option<Rule>, AppError>;

    async fn load_rule(&self, user_id: &str, rule_id: &str) -> Result<Rule, AppError>;

    async fn save_rule(&self, rule: &Rule, note: &str) -> Result<(), AppError>;

    async fn delete_rule(&self, rule: &Rule, note: &str) -> Result<(), AppError>;

    async fn query_rules(&self, user_id: &str) -> Result<Vec<Rule>, AppError>;
}

/// User-side collaborator: counters and the signing identity
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn recalculate_following_count(&self, user_id: &str) -> Result<(), AppError>;

    async fn recalculate_rule_count(&self, user_id: &str) -> Result<(), AppError>;

    /// Actor used to sign outbound Follow/Undo for this user
    async fn local_actor(&self, user_id: &str) -> Result<LocalActor, AppError>;
}

/// Durable, at-least-once deferred work
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task; returns once it is durably stored
    async fn publish(&self, name: &str, payload: serde_json::Value) -> Result<(), AppError>;

    /// Claim up to `limit` due tasks, hiding them for `lease_seconds`
    async fn claim_tasks(&self, limit: i64, lease_seconds: i64)
    -> Result<Vec<QueuedTask>, AppError>;

    /// Remove a finished task
    async fn complete_task(&self, task_id: &str) -> Result<(), AppError>;

    /// Record a failure and schedule the next attempt
    async fn retry_task(&self, task_id: &str, error: &str, delay_seconds: i64)
    -> Result<(), AppError>;
}
