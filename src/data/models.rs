//! Data models
//!
//! Rust structs representing stored records. IDs are ULIDs; scheduling
//! and inbox timestamps are unix seconds so they can be compared in SQL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Current time as unix seconds
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

// =============================================================================
// Subscription ("Following")
// =============================================================================

/// Protocol used to receive updates from a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SubscriptionMethod {
    /// Periodic polling of a feed
    Rss,
    /// Push via hub callback
    WebSub,
    /// Push via inbox delivery
    ActivityPub,
}

impl SubscriptionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rss => "rss",
            Self::WebSub => "websub",
            Self::ActivityPub => "activitypub",
        }
    }

    /// Push protocols deliver on their own; the scheduler only re-verifies them.
    pub fn is_push(&self) -> bool {
        matches!(self, Self::WebSub | Self::ActivityPub)
    }
}

/// Scheduling status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    New,
    Loading,
    Success,
    Failure,
    /// Parked during account migration, never polled
    ImportPending,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::ImportPending => "import_pending",
        }
    }
}

/// Document format discovered at the subscription target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DocumentFormat {
    ActivityStream,
    Rss,
    Atom,
    JsonFeed,
    Unknown,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActivityStream => "activity_stream",
            Self::Rss => "rss",
            Self::Atom => "atom",
            Self::JsonFeed => "json_feed",
            Self::Unknown => "unknown",
        }
    }
}

/// One user's intent to receive a remote account's or feed's activity
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    /// Destination folder for ingested messages
    pub folder_id: String,
    /// Target as entered by the user (URL or @user@host handle)
    pub url: String,
    /// Canonical profile URL discovered on connect
    pub profile_url: String,
    pub label: String,
    pub summary: String,
    pub image_url: String,
    pub method: SubscriptionMethod,
    pub format: DocumentFormat,
    /// Collapse replies to the thread root
    pub collapse_threads: bool,
    /// Retention window in days; 0 keeps messages forever
    pub purge_duration: i64,
    pub status: SubscriptionStatus,
    pub status_message: String,
    pub error_count: i64,
    /// Unix time of the last successful poll (0 = never)
    pub last_polled: i64,
    /// Unix time of the next attempt
    pub next_poll: i64,
    /// Hours between successful polls
    pub poll_duration: i64,
    /// Unix time the current attempt started (0 = idle)
    pub loading_since: i64,
    pub websub_hub: Option<String>,
    pub websub_topic: Option<String>,
    pub websub_secret: Option<String>,
    pub activitypub_inbox: Option<String>,
    /// ID of the Follow activity we sent, needed for Undo
    pub follow_activity_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// New subscription in the `New` state, due immediately
    pub fn new(user_id: &str, folder_id: &str, url: &str) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            user_id: user_id.to_string(),
            folder_id: folder_id.to_string(),
            url: url.trim().to_string(),
            profile_url: String::new(),
            label: String::new(),
            summary: String::new(),
            image_url: String::new(),
            method: SubscriptionMethod::Rss,
            format: DocumentFormat::Unknown,
            collapse_threads: true,
            purge_duration: 0,
            status: SubscriptionStatus::New,
            status_message: String::new(),
            error_count: 0,
            last_polled: 0,
            next_poll: 0,
            poll_duration: 24,
            loading_since: 0,
            websub_hub: None,
            websub_topic: None,
            websub_secret: None,
            activitypub_inbox: None,
            follow_activity_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True until the first successful poll
    pub fn is_new(&self) -> bool {
        self.last_polled == 0
    }

    /// Origin link stamped on messages discovered through this subscription
    pub fn origin(&self, origin_type: OriginType) -> OriginLink {
        OriginLink {
            origin_type,
            subscription_id: self.id.clone(),
            url: if self.profile_url.is_empty() {
                self.url.clone()
            } else {
                self.profile_url.clone()
            },
            label: self.label.clone(),
            image_url: self.image_url.clone(),
        }
    }
}

// =============================================================================
// Message
// =============================================================================

/// How a message was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginType {
    Follow,
    Like,
    Dislike,
    Announce,
    Reply,
}

impl OriginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Like => "like",
            Self::Dislike => "dislike",
            Self::Announce => "announce",
            Self::Reply => "reply",
        }
    }
}

/// Metadata recording how and through which subscription a message was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginLink {
    pub origin_type: OriginType,
    pub subscription_id: String,
    /// Profile URL of the subscription that delivered it
    pub url: String,
    pub label: String,
    pub image_url: String,
}

/// Author reference on a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonLink {
    pub name: String,
    pub profile_url: String,
    pub email: String,
    pub image_url: String,
}

/// A canonical locally-ingested content item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub user_id: String,
    pub folder_id: String,
    /// Subscription that first delivered this message
    pub subscription_id: String,
    /// Canonical content URL, the deduplication key
    pub url: String,
    pub label: String,
    pub summary: String,
    pub image_url: String,
    pub attributed_to: Vec<PersonLink>,
    pub content_html: String,
    pub publish_date: i64,
    /// 0 = unread
    pub read_date: i64,
    pub muted: bool,
    pub origin: OriginLink,
    /// Every route that led to this message, including `origin`
    pub references: Vec<OriginLink>,
    /// Labels attached by moderation rules
    pub labels: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Message {
    pub fn is_read(&self) -> bool {
        self.read_date > 0
    }

    pub fn mark_read(&mut self, now: i64) {
        if self.read_date == 0 {
            self.read_date = now.max(1);
        }
    }

    /// Add a reference unless an identical one is already recorded.
    ///
    /// Returns true when the reference set changed.
    pub fn add_reference(&mut self, origin: OriginLink) -> bool {
        if self.references.contains(&origin) {
            return false;
        }
        self.references.push(origin);
        true
    }
}

// =============================================================================
// Rules
// =============================================================================

/// What a rule's trigger is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RuleType {
    Actor,
    Domain,
    Content,
    External,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Actor => "actor",
            Self::Domain => "domain",
            Self::Content => "content",
            Self::External => "external",
        }
    }
}

/// What happens to a document matched by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RuleBehavior {
    Allow,
    Label,
    Mute,
    Block,
}

/// Where a rule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RuleOrigin {
    /// Written by the user
    Manual,
    /// Imported from a remote block list
    Imported,
    /// Shared server-wide
    Public,
}

/// A moderation directive
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Rule {
    pub id: String,
    /// Empty for domain-wide rules
    pub user_id: String,
    pub rule_type: RuleType,
    #[sqlx(rename = "rule_trigger")]
    pub trigger: String,
    pub behavior: RuleBehavior,
    /// Text attached to documents by `Label` rules
    pub label: String,
    pub summary: String,
    pub origin: RuleOrigin,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn new(user_id: &str, rule_type: RuleType, trigger: &str, behavior: RuleBehavior) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            user_id: user_id.to_string(),
            rule_type,
            trigger: trigger.to_string(),
            behavior,
            label: String::new(),
            summary: String::new(),
            origin: RuleOrigin::Manual,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Users and queued tasks
// =============================================================================

/// Signing identity of a local user, used to send Follow/Undo
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LocalActor {
    pub user_id: String,
    pub actor_uri: String,
    /// Full URL of the public key (actor#main-key)
    pub key_id: String,
    pub private_key_pem: String,
}

/// A durable deferred task
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub attempts: i64,
}
