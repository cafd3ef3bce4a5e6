//! Polling scheduler
//!
//! A single background loop per process. Each pass loads the poll-based
//! subscriptions that are due, connects them one at a time and trims
//! their expired messages.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use super::purge::RetentionPurger;
use super::subscription::SubscriptionService;
use crate::config::SchedulerConfig;
use crate::data::unix_now;
use crate::error::AppError;
use crate::metrics::{SCHEDULER_PASSES_TOTAL, SUBSCRIPTIONS_DUE};

pub struct Scheduler {
    service: SubscriptionService,
    purger: RetentionPurger,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(service: SubscriptionService, purger: RetentionPurger, config: SchedulerConfig) -> Self {
        Self {
            service,
            purger,
            config,
        }
    }

    /// Run until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let startup = Duration::from_secs(self.config.startup_delay_seconds);
        if !startup.is_zero() && !wait_or_shutdown(&mut shutdown, startup).await {
            return;
        }
        tracing::info!("Scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_pass(&shutdown).await {
                Ok(0) => self.idle_duration(),
                Ok(_) => self.config.between_subscriptions(),
                Err(e) => {
                    tracing::error!(error = %e, "Scheduler pass failed");
                    self.idle_duration()
                }
            };

            if !wait_or_shutdown(&mut shutdown, pause).await {
                break;
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// One scan over due subscriptions. Returns how many were processed.
    ///
    /// Only loading the due set can fail; per-subscription errors are
    /// logged and the pass moves on.
    pub async fn run_pass(&self, shutdown: &watch::Receiver<bool>) -> Result<usize, AppError> {
        let due = match self.service.load_pollable(unix_now()).await {
            Ok(due) => due,
            Err(e) => {
                SCHEDULER_PASSES_TOTAL.with_label_values(&["error"]).inc();
                return Err(e);
            }
        };
        SUBSCRIPTIONS_DUE.set(due.len() as i64);

        if due.is_empty() {
            SCHEDULER_PASSES_TOTAL.with_label_values(&["idle"]).inc();
            return Ok(0);
        }
        tracing::info!(due = due.len(), "Scheduler pass started");

        let mut processed = 0;
        for (index, mut subscription) in due.into_iter().enumerate() {
            if *shutdown.borrow() {
                tracing::info!(processed, "Scheduler pass interrupted by shutdown");
                break;
            }
            if index > 0 {
                tokio::time::sleep(self.config.between_subscriptions()).await;
            }

            if let Err(e) = self.service.connect(&mut subscription).await {
                tracing::warn!(subscription_id = %subscription.id, error = %e, "Failed to record poll result");
            }
            if let Err(e) = self.purger.purge_inbox(&subscription, unix_now()).await {
                tracing::warn!(subscription_id = %subscription.id, error = %e, "Retention purge failed");
            }
            processed += 1;
        }

        SCHEDULER_PASSES_TOTAL.with_label_values(&["ok"]).inc();
        tracing::info!(processed, "Scheduler pass finished");
        Ok(processed)
    }

    fn idle_duration(&self) -> Duration {
        let min = self.config.min_idle_seconds;
        let max = self.config.max_idle_seconds.max(min);
        Duration::from_secs(rand::thread_rng().gen_range(min..=max))
    }
}

/// Sleep for `duration`. Returns false if shutdown was requested first.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow(),
            // Sender dropped: nobody can ask us to stop any more
            Err(_) => {
                tokio::time::sleep(duration).await;
                true
            }
        },
    }
}
