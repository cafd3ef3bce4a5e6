//! Subscription state machine
//!
//! `New -> Loading -> {Success, Failure}`; Failure retries through
//! Loading indefinitely. `ImportPending` is parked and never scheduled.
//! Transitions mutate the record in place; the caller saves it.

use crate::config::PollingConfig;
use crate::data::{Subscription, SubscriptionMethod, SubscriptionStatus};

const MAX_POLL_HOURS: i64 = 24 * 7;

/// Poll cadence and backoff curve
#[derive(Debug, Clone)]
pub struct PollPolicy {
    activitypub_hours: i64,
    websub_hours: i64,
    rss_hours: i64,
    backoff_base_minutes: i64,
    backoff_max_exponent: u32,
}

impl From<&PollingConfig> for PollPolicy {
    fn from(config: &PollingConfig) -> Self {
        Self {
            activitypub_hours: config.activitypub_hours,
            websub_hours: config.websub_hours,
            rss_hours: config.rss_hours,
            backoff_base_minutes: config.backoff_base_minutes,
            backoff_max_exponent: config.backoff_max_exponent,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

impl PollPolicy {
    /// Hours between successful polls for a method.
    ///
    /// A feed's `<ttl>` may lengthen the RSS interval, up to one week.
    pub fn poll_hours(&self, method: SubscriptionMethod, ttl_minutes: Option<i64>) -> i64 {
        match method {
            SubscriptionMethod::ActivityPub => self.activitypub_hours,
            SubscriptionMethod::WebSub => self.websub_hours,
            SubscriptionMethod::Rss => {
                let ttl_hours = (ttl_minutes.unwrap_or(0).max(0) + 59) / 60;
                self.rss_hours.max(ttl_hours.min(MAX_POLL_HOURS))
            }
        }
    }

    /// Delay before the next attempt after `error_count` consecutive failures
    pub fn backoff_seconds(&self, error_count: i64) -> i64 {
        let exponent = (error_count.max(1) - 1).min(i64::from(self.backoff_max_exponent));
        let minutes = self.backoff_base_minutes.max(1) << exponent;
        minutes * 60
    }

    /// Longest possible backoff
    pub fn max_backoff_seconds(&self) -> i64 {
        self.backoff_seconds(i64::from(self.backoff_max_exponent) + 1)
    }

    /// Mark an attempt as started. `last_polled` is left alone.
    pub fn set_status_loading(&self, subscription: &mut Subscription, now: i64) {
        subscription.status = SubscriptionStatus::Loading;
        subscription.status_message.clear();
        subscription.loading_since = now;
    }

    /// Record a successful poll and schedule the next one
    pub fn set_status_success(&self, subscription: &mut Subscription, now: i64) {
        subscription.status = SubscriptionStatus::Success;
        subscription.status_message.clear();
        subscription.error_count = 0;
        subscription.loading_since = 0;
        subscription.last_polled = now;
        subscription.next_poll = advance(
            subscription.next_poll,
            subscription.last_polled + subscription.poll_duration * 3600,
        );
    }

    /// Record a failed attempt and back off from `now`
    pub fn set_status_failure(&self, subscription: &mut Subscription, message: &str, now: i64) {
        subscription.status = SubscriptionStatus::Failure;
        subscription.status_message = message.to_string();
        subscription.error_count += 1;
        subscription.loading_since = 0;
        subscription.next_poll = advance(
            subscription.next_poll,
            now + self.backoff_seconds(subscription.error_count),
        );
    }
}

// next_poll only ever moves forward
fn advance(current: i64, candidate: i64) -> i64 {
    current.max(candidate)
}
