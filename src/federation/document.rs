//! Remote documents
//!
//! Everything fetched from the network (ActivityStreams objects, actors,
//! collections, and converted RSS/Atom/JSON feeds) is held as an opaque
//! JSON value with accessors. Verb dispatch goes through [`DocumentType`].

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::data::{DocumentFormat, OriginType, PersonLink};

/// The public addressing pseudo-actor
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

const ACTOR_TYPES: &[&str] = &["Person", "Service", "Application", "Group", "Organization"];

/// ActivityStreams verbs the ingestion pipeline distinguishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentType {
    Create,
    Update,
    Like,
    Dislike,
    Announce,
    /// Activities and objects that carry no content of their own
    /// (Delete, Undo, Follow, Tombstone...)
    NonContent(String),
    /// Any non-activity object (Note, Article, Page, feed entry...)
    Object(String),
}

const NON_CONTENT_TYPES: &[&str] = &[
    "Delete",
    "Undo",
    "Follow",
    "Accept",
    "Reject",
    "TentativeAccept",
    "TentativeReject",
    "Block",
    "Add",
    "Remove",
    "Flag",
    "Move",
    "Ignore",
    "Join",
    "Leave",
    "Invite",
    "Read",
    "View",
    "Listen",
    "Tombstone",
];

/// How a document is resolved to the content it stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// Transparent wrapper: resolve to the object, keep the current origin
    Unwrap,
    /// Pointer activity: resolve to the object and record the reason
    Pointer(OriginType),
    /// Content: collapse to the parent only when threads are collapsed
    Content,
    /// Nothing to store
    Ignore,
}

impl DocumentType {
    pub fn parse(value: &str) -> Self {
        match value {
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Like" | "EmojiReact" => Self::Like,
            "Dislike" => Self::Dislike,
            "Announce" => Self::Announce,
            other if NON_CONTENT_TYPES.contains(&other) => Self::NonContent(other.to_string()),
            other => Self::Object(other.to_string()),
        }
    }

    pub fn traversal(&self) -> Traversal {
        match self {
            Self::Create | Self::Update => Traversal::Unwrap,
            Self::Like => Traversal::Pointer(OriginType::Like),
            Self::Dislike => Traversal::Pointer(OriginType::Dislike),
            Self::Announce => Traversal::Pointer(OriginType::Announce),
            Self::NonContent(_) => Traversal::Ignore,
            Self::Object(_) => Traversal::Content,
        }
    }
}

/// Reference to another document: embedded or by URL
#[derive(Debug, Clone)]
pub enum ObjectRef {
    Embedded(RemoteDocument),
    Link(String),
}

impl ObjectRef {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(url) if !url.is_empty() => Some(Self::Link(url.clone())),
            Value::Object(_) => {
                let document = RemoteDocument::activity_stream(value.clone());
                // A bare {"id": ...} carries nothing worth keeping
                if value.as_object().is_some_and(|o| o.len() == 1) && !document.id().is_empty() {
                    Some(Self::Link(document.id().to_string()))
                } else {
                    Some(Self::Embedded(document))
                }
            }
            Value::Array(values) => values.iter().find_map(Self::from_value),
            _ => None,
        }
    }

    /// ID or URL of the referenced document
    pub fn id(&self) -> String {
        match self {
            Self::Embedded(document) => document.id().to_string(),
            Self::Link(url) => url.clone(),
        }
    }
}

/// A fetched remote document
#[derive(Debug, Clone)]
pub struct RemoteDocument {
    value: Value,
    format: DocumentFormat,
    hub: Option<String>,
    self_url: Option<String>,
    ttl_minutes: Option<i64>,
}

fn first_string(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Array(values) => values.iter().find_map(first_string),
        Value::Object(object) => object
            .get("href")
            .or_else(|| object.get("url"))
            .or_else(|| object.get("id"))
            .and_then(first_string),
        _ => None,
    }
}

fn parse_timestamp(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc).timestamp())
}

impl RemoteDocument {
    /// Wrap an ActivityStreams JSON document
    pub fn activity_stream(value: Value) -> Self {
        Self {
            value,
            format: DocumentFormat::ActivityStream,
            hub: None,
            self_url: None,
            ttl_minutes: None,
        }
    }

    /// Attach WebSub links discovered outside the document body
    pub fn with_links(mut self, hub: Option<String>, self_url: Option<String>) -> Self {
        if hub.is_some() {
            self.hub = hub;
        }
        if self_url.is_some() {
            self.self_url = self_url;
        }
        self
    }

    /// Convert a parsed RSS/Atom/JSON feed into the document shape used
    /// for ActivityStreams collections: one `orderedItems` entry per item.
    pub fn from_feed(feed: feed_rs::model::Feed, source_url: &str) -> Self {
        use feed_rs::model::FeedType;

        let format = match feed.feed_type {
            FeedType::Atom => DocumentFormat::Atom,
            FeedType::JSON => DocumentFormat::JsonFeed,
            _ => DocumentFormat::Rss,
        };

        let link_with_rel = |links: &[feed_rs::model::Link], rel: &str| {
            links
                .iter()
                .find(|link| link.rel.as_deref() == Some(rel))
                .map(|link| link.href.clone())
        };
        let alternate = |links: &[feed_rs::model::Link]| {
            links
                .iter()
                .find(|link| matches!(link.rel.as_deref(), None | Some("alternate")))
                .map(|link| link.href.clone())
        };

        let hub = link_with_rel(&feed.links, "hub");
        let self_url = link_with_rel(&feed.links, "self");

        let items: Vec<Value> = feed
            .entries
            .iter()
            .map(|entry| {
                let url = alternate(&entry.links).unwrap_or_else(|| entry.id.clone());
                let id = if entry.id.is_empty() {
                    url.clone()
                } else {
                    entry.id.clone()
                };
                let authors: Vec<Value> = entry
                    .authors
                    .iter()
                    .map(|person| {
                        serde_json::json!({
                            "type": "Person",
                            "name": person.name,
                            "url": person.uri.clone().unwrap_or_default(),
                            "email": person.email.clone().unwrap_or_default(),
                        })
                    })
                    .collect();

                serde_json::json!({
                    "type": "Article",
                    "id": id,
                    "url": url,
                    "name": entry.title.as_ref().map(|t| t.content.clone()).unwrap_or_default(),
                    "summary": entry.summary.as_ref().map(|t| t.content.clone()).unwrap_or_default(),
                    "content": entry
                        .content
                        .as_ref()
                        .and_then(|c| c.body.clone())
                        .unwrap_or_default(),
                    "published": entry.published.map(|d| d.to_rfc3339()),
                    "updated": entry.updated.map(|d| d.to_rfc3339()),
                    "attributedTo": authors,
                })
            })
            .collect();

        let value = serde_json::json!({
            "type": "OrderedCollection",
            "id": self_url.clone().unwrap_or_else(|| source_url.to_string()),
            "url": alternate(&feed.links).unwrap_or_else(|| source_url.to_string()),
            "name": feed.title.as_ref().map(|t| t.content.clone()).unwrap_or_default(),
            "summary": feed.description.as_ref().map(|t| t.content.clone()).unwrap_or_default(),
            "icon": feed.logo.as_ref().or(feed.icon.as_ref()).map(|image| image.uri.clone()),
            "orderedItems": items,
        });

        Self {
            value,
            format,
            hub,
            self_url,
            ttl_minutes: feed.ttl.map(i64::from),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }

    fn str_field(&self, name: &str) -> &str {
        self.value.get(name).and_then(Value::as_str).unwrap_or("")
    }

    /// Document ID (falls back to its URL)
    pub fn id(&self) -> &str {
        match self.str_field("id") {
            "" => self.value.get("url").and_then(first_string).unwrap_or(""),
            id => id,
        }
    }

    /// Raw `type` value (first entry when it is an array)
    pub fn doc_type(&self) -> &str {
        self.value.get("type").and_then(first_string).unwrap_or("")
    }

    pub fn document_type(&self) -> DocumentType {
        DocumentType::parse(self.doc_type())
    }

    /// Human-facing URL of the document
    pub fn url(&self) -> String {
        self.value
            .get("url")
            .and_then(first_string)
            .unwrap_or_else(|| self.id())
            .to_string()
    }

    pub fn label(&self) -> &str {
        match self.str_field("name") {
            "" => self.str_field("preferredUsername"),
            name => name,
        }
    }

    pub fn summary(&self) -> &str {
        self.str_field("summary")
    }

    pub fn content(&self) -> &str {
        self.str_field("content")
    }

    pub fn image_url(&self) -> String {
        self.value
            .get("image")
            .and_then(first_string)
            .or_else(|| self.value.get("icon").and_then(first_string))
            .unwrap_or("")
            .to_string()
    }

    pub fn published(&self) -> Option<i64> {
        parse_timestamp(self.str_field("published"))
    }

    pub fn updated(&self) -> Option<i64> {
        parse_timestamp(self.str_field("updated"))
    }

    /// Authors from `attributedTo`, falling back to `actor`
    pub fn attributed_to(&self) -> Vec<PersonLink> {
        let source = match self.value.get("attributedTo") {
            Some(value) if !value.is_null() && value != &Value::Array(Vec::new()) => value,
            _ => match self.value.get("actor") {
                Some(value) => value,
                None => return Vec::new(),
            },
        };

        let entries: Vec<&Value> = match source {
            Value::Array(values) => values.iter().collect(),
            value => vec![value],
        };

        entries
            .into_iter()
            .filter_map(|entry| match entry {
                Value::String(url) if !url.is_empty() => Some(PersonLink {
                    profile_url: url.clone(),
                    ..Default::default()
                }),
                Value::Object(_) => {
                    let person = RemoteDocument::activity_stream(entry.clone());
                    let profile_url = match person.str_field("id") {
                        "" => person.url(),
                        id => id.to_string(),
                    };
                    Some(PersonLink {
                        name: person.label().to_string(),
                        profile_url,
                        email: person.str_field("email").to_string(),
                        image_url: person.image_url(),
                    })
                }
                _ => None,
            })
            .filter(|person| !person.profile_url.is_empty() || !person.email.is_empty())
            .collect()
    }

    /// ID of the acting account (first author)
    pub fn actor_id(&self) -> Option<String> {
        self.attributed_to()
            .into_iter()
            .find(|person| !person.profile_url.is_empty())
            .map(|person| person.profile_url)
    }

    pub fn object(&self) -> Option<ObjectRef> {
        self.value.get("object").and_then(ObjectRef::from_value)
    }

    pub fn in_reply_to(&self) -> Option<String> {
        self.value
            .get("inReplyTo")
            .and_then(first_string)
            .map(str::to_string)
    }

    /// True for ActivityPub actor documents
    pub fn is_actor(&self) -> bool {
        ACTOR_TYPES.contains(&self.doc_type()) && !self.inbox().is_empty()
    }

    pub fn inbox(&self) -> &str {
        self.str_field("inbox")
    }

    pub fn outbox(&self) -> &str {
        self.str_field("outbox")
    }

    pub fn shared_inbox(&self) -> Option<&str> {
        self.value
            .get("endpoints")
            .and_then(|endpoints| endpoints.get("sharedInbox"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// WebSub hub advertised by the document or its response headers
    pub fn hub(&self) -> Option<&str> {
        self.hub.as_deref()
    }

    /// Canonical topic URL advertised for WebSub
    pub fn self_url(&self) -> Option<&str> {
        self.self_url.as_deref()
    }

    /// RSS `<ttl>` in minutes
    pub fn ttl_minutes(&self) -> Option<i64> {
        self.ttl_minutes
    }

    /// Entries of a collection or collection page, in document order
    pub fn items(&self) -> Vec<ObjectRef> {
        let items = self
            .value
            .get("orderedItems")
            .or_else(|| self.value.get("items"));

        match items {
            Some(Value::Array(values)) => values.iter().filter_map(ObjectRef::from_value).collect(),
            Some(value) => ObjectRef::from_value(value).into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// First page of a paged collection
    pub fn first_page(&self) -> Option<ObjectRef> {
        self.value.get("first").and_then(ObjectRef::from_value)
    }

    /// Next page of a collection page
    pub fn next_page(&self) -> Option<String> {
        self.value
            .get("next")
            .and_then(first_string)
            .map(str::to_string)
    }
}

/// True for the public collection in any of its spellings
pub fn is_public_collection(id: &str) -> bool {
    matches!(id, PUBLIC_COLLECTION | "as:Public" | "Public")
}
