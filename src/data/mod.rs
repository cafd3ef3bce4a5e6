//! Data layer module
//!
//! Handles all data persistence:
//! - Record types (subscriptions, messages, rules)
//! - Storage contracts consumed by the services
//! - SQLite implementation of those contracts

mod database;
mod models;
mod store;

pub use database::Database;
pub use models::*;
pub use store::{InboxStore, RuleStore, SubscriptionStore, TaskQueue, UserDirectory};

#[cfg(test)]
pub use store::MockUserDirectory;

#[cfg(test)]
mod database_test;
