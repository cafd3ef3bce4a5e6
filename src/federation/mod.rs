//! Remote side of subscriptions
//!
//! Handles:
//! - Remote document fetching (ActivityStreams, RSS, Atom, JSON Feed)
//! - WebFinger handle resolution
//! - Transport adapters (ActivityPub, WebSub, RSS)
//! - Signed Follow/Undo delivery
//! - WebSub hub requests and push verification

mod client;
mod delivery;
mod document;
mod signature;
mod transport;
mod webfinger;
pub mod websub;

pub use client::{HttpRemoteClient, RemoteClient, parse_document, parse_link_header};
pub use delivery::{ActivityDelivery, ActivitySender, builder, follow_activity_id};
pub use document::{
    DocumentType, ObjectRef, PUBLIC_COLLECTION, RemoteDocument, Traversal, is_public_collection,
};
pub use signature::{SignatureHeaders, sign_request};
pub use transport::{ActivityPubTransport, RssTransport, Transport, Transports, WebSubTransport};
pub use webfinger::{WebFingerResponse, WebFingerResult, parse_handle, resolve_webfinger};
pub use websub::{HubClient, HubMode, HubRequest, IntentQuery, WebSubClient};
