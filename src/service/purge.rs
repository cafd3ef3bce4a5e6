//! Retention
//!
//! Removes messages older than their subscription's retention window.

use std::sync::Arc;

use super::tasks::{BackgroundTasks, Task};
use crate::data::{InboxStore, Subscription};
use crate::error::AppError;
use crate::metrics::MESSAGES_PURGED_TOTAL;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Clone)]
pub struct RetentionPurger {
    inbox: Arc<dyn InboxStore>,
    tasks: BackgroundTasks,
}

impl RetentionPurger {
    pub fn new(inbox: Arc<dyn InboxStore>, tasks: BackgroundTasks) -> Self {
        Self { inbox, tasks }
    }

    /// Delete the subscription's messages ingested more than
    /// `purge_duration` days before `now`. Returns how many were removed.
    pub async fn purge_inbox(&self, subscription: &Subscription, now: i64) -> Result<usize, AppError> {
        if subscription.purge_duration <= 0 {
            return Ok(0);
        }

        let cutoff = now - subscription.purge_duration * SECONDS_PER_DAY;
        let expired = self.inbox.query_purgeable(subscription, cutoff).await?;

        let mut purged = 0;
        for message in &expired {
            if let Err(e) = self.inbox.delete_message(message, "retention").await {
                MESSAGES_PURGED_TOTAL.with_label_values(&["error"]).inc();
                return Err(e);
            }
            purged += 1;
        }

        if purged > 0 {
            MESSAGES_PURGED_TOTAL
                .with_label_values(&["ok"])
                .inc_by(purged as u64);
            tracing::debug!(subscription_id = %subscription.id, purged, "Purged expired messages");
            self.tasks.dispatch(Task::RecalculateUnreadCount {
                user_id: subscription.user_id.clone(),
                folder_id: subscription.folder_id.clone(),
            });
        }

        Ok(purged)
    }
}
