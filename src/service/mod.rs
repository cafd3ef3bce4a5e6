//! Service layer
//!
//! Scheduling, transport negotiation, ingestion and moderation.
//! Services talk to storage only through the traits in [`crate::data`].

mod ingest;
mod moderation;
mod purge;
mod scheduler;
mod state;
mod subscription;
mod tasks;

use std::sync::Arc;

pub use ingest::{IngestOutcome, MessageIngestor, build_message};
pub use moderation::{
    FilterAction, FilterOptions, FilterOutcome, RuleFilter, RuleService, domain_suffixes, host_of,
};
pub use purge::RetentionPurger;
pub use scheduler::Scheduler;
pub use state::PollPolicy;
pub use subscription::{ImportReport, SubscriptionService, SubscriptionUpdate};
pub use tasks::{
    BackgroundTasks, PURGE_SUBSCRIPTION_MESSAGES, PurgeSubscriptionMessages, Task, TaskContext,
    TaskRunner, drain_task_queue, retry_delay_seconds, run_task_queue,
};

use crate::data::{Database, InboxStore, RuleStore, SubscriptionStore, TaskQueue, UserDirectory};

/// Storage handles shared by the services
#[derive(Clone)]
pub struct Stores {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub inbox: Arc<dyn InboxStore>,
    pub rules: Arc<dyn RuleStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub users: Arc<dyn UserDirectory>,
}

impl Stores {
    /// Every store backed by the same SQLite database
    pub fn from_database(db: Arc<Database>) -> Self {
        Self {
            subscriptions: db.clone(),
            inbox: db.clone(),
            rules: db.clone(),
            queue: db.clone(),
            users: db,
        }
    }
}
