//! Background work
//!
//! Two kinds of deferred work:
//! - [`BackgroundTasks`]: in-process fire-and-forget side effects (counter
//!   recalculation, push unsubscribe) handled by a small worker pool.
//!   Failures are logged and counted, never returned to the caller.
//! - The durable [`TaskQueue`]: work that must survive a restart, drained
//!   periodically by [`drain_task_queue`] with retry.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use crate::data::{InboxStore, Subscription, TaskQueue, UserDirectory};
use crate::error::AppError;
use crate::federation::Transports;
use crate::metrics::BACKGROUND_TASKS_TOTAL;

/// Channel buffer size for tasks
const TASK_BUFFER_SIZE: usize = 1024;

/// Durable task: delete every message of a removed subscription
pub const PURGE_SUBSCRIPTION_MESSAGES: &str = "purge_subscription_messages";

const CLAIM_BATCH: i64 = 32;
const CLAIM_LEASE_SECONDS: i64 = 300;
const MAX_RETRY_DELAY_SECONDS: i64 = 6 * 3600;

/// Fire-and-forget side effects
#[derive(Debug, Clone)]
pub enum Task {
    RecalculateFollowingCount { user_id: String },
    RecalculateRuleCount { user_id: String },
    RecalculateUnreadCount { user_id: String, folder_id: String },
    /// Tear down the push transport of a subscription snapshot
    Unsubscribe { subscription: Box<Subscription> },
}

impl Task {
    fn name(&self) -> &'static str {
        match self {
            Self::RecalculateFollowingCount { .. } => "recalculate_following_count",
            Self::RecalculateRuleCount { .. } => "recalculate_rule_count",
            Self::RecalculateUnreadCount { .. } => "recalculate_unread_count",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// Handle for dispatching [`Task`]s
#[derive(Clone)]
pub struct BackgroundTasks {
    sender: Option<mpsc::Sender<Task>>,
}

impl BackgroundTasks {
    /// Create a dispatcher and the runner that will process its tasks
    pub fn channel() -> (Self, TaskRunner) {
        let (sender, receiver) = mpsc::channel(TASK_BUFFER_SIZE);
        (
            Self {
                sender: Some(sender),
            },
            TaskRunner { receiver },
        )
    }

    /// Dispatcher that discards every task
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Queue a task without waiting. A full queue drops the task.
    pub fn dispatch(&self, task: Task) {
        let Some(sender) = &self.sender else {
            tracing::trace!(task = task.name(), "Background tasks disabled");
            return;
        };

        let name = task.name();
        if let Err(e) = sender.try_send(task) {
            tracing::warn!(task = name, error = %e, "Dropped background task");
            BACKGROUND_TASKS_TOTAL
                .with_label_values(&[name, "dropped"])
                .inc();
        }
    }
}

/// Collaborators the workers need
#[derive(Clone)]
pub struct TaskContext {
    pub users: Arc<dyn UserDirectory>,
    pub inbox: Arc<dyn InboxStore>,
    pub transports: Transports,
}

/// Receiving half of [`BackgroundTasks`]
pub struct TaskRunner {
    receiver: mpsc::Receiver<Task>,
}

impl TaskRunner {
    /// Spawn the worker pool.
    ///
    /// The returned handle completes once every dispatcher is dropped and
    /// the in-flight tasks have finished.
    pub fn start(self, context: TaskContext, workers: usize) -> JoinHandle<()> {
        let workers = workers.max(1);
        let context = Arc::new(context);
        let mut receiver = self.receiver;

        tokio::spawn(async move {
            tracing::info!("Background task pool starting with {} workers", workers);
            let semaphore = Arc::new(Semaphore::new(workers));

            while let Some(task) = receiver.recv().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let context = context.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    run_task(task, &context).await;
                });
            }

            // wait for in-flight tasks
            let _ = semaphore.acquire_many(workers as u32).await;
            tracing::info!("Background task pool stopped");
        })
    }
}

async fn run_task(task: Task, context: &TaskContext) {
    let name = task.name();
    let result = match task {
        Task::RecalculateFollowingCount { user_id } => {
            context.users.recalculate_following_count(&user_id).await
        }
        Task::RecalculateRuleCount { user_id } => {
            context.users.recalculate_rule_count(&user_id).await
        }
        Task::RecalculateUnreadCount { user_id, folder_id } => context
            .inbox
            .recalculate_unread_count(&user_id, &folder_id)
            .await
            .map(|_| ()),
        Task::Unsubscribe { subscription } => match context.transports.for_method(subscription.method) {
            Some(transport) => transport.unsubscribe(&subscription).await,
            None => Ok(()),
        },
    };

    match result {
        Ok(()) => {
            BACKGROUND_TASKS_TOTAL.with_label_values(&[name, "ok"]).inc();
        }
        Err(e) => {
            tracing::warn!(task = name, error = %e, "Background task failed");
            BACKGROUND_TASKS_TOTAL
                .with_label_values(&[name, "error"])
                .inc();
        }
    }
}

/// Payload of [`PURGE_SUBSCRIPTION_MESSAGES`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeSubscriptionMessages {
    pub user_id: String,
    pub subscription_id: String,
    pub folder_id: String,
}

/// Exponential retry delay for a durable task, capped at six hours
pub fn retry_delay_seconds(attempts: i64) -> i64 {
    let exponent = attempts.clamp(0, 16) as u32;
    (60_i64 << exponent).min(MAX_RETRY_DELAY_SECONDS)
}

/// Claim and run one batch of durable tasks. Returns how many succeeded.
pub async fn drain_task_queue(
    queue: &dyn TaskQueue,
    inbox: &dyn InboxStore,
    tasks: &BackgroundTasks,
) -> Result<usize, AppError> {
    let claimed = queue.claim_tasks(CLAIM_BATCH, CLAIM_LEASE_SECONDS).await?;
    let mut completed = 0;

    for task in claimed {
        let result = match task.name.as_str() {
            PURGE_SUBSCRIPTION_MESSAGES => {
                purge_subscription_messages(inbox, tasks, task.payload.clone()).await
            }
            other => {
                tracing::error!(task_id = %task.id, name = %other, "Unknown durable task, discarding");
                queue.complete_task(&task.id).await?;
                continue;
            }
        };

        match result {
            Ok(()) => {
                queue.complete_task(&task.id).await?;
                completed += 1;
                BACKGROUND_TASKS_TOTAL
                    .with_label_values(&[PURGE_SUBSCRIPTION_MESSAGES, "ok"])
                    .inc();
            }
            Err(e) => {
                let delay = retry_delay_seconds(task.attempts);
                tracing::warn!(task_id = %task.id, name = %task.name, attempts = task.attempts, error = %e, "Durable task failed, retrying in {}s", delay);
                queue.retry_task(&task.id, &e.to_string(), delay).await?;
                BACKGROUND_TASKS_TOTAL
                    .with_label_values(&[PURGE_SUBSCRIPTION_MESSAGES, "retry"])
                    .inc();
            }
        }
    }

    Ok(completed)
}

async fn purge_subscription_messages(
    inbox: &dyn InboxStore,
    tasks: &BackgroundTasks,
    payload: serde_json::Value,
) -> Result<(), AppError> {
    let payload: PurgeSubscriptionMessages = serde_json::from_value(payload)?;
    let deleted = inbox
        .delete_messages_by_subscription(
            &payload.user_id,
            &payload.subscription_id,
            "subscription deleted",
        )
        .await?;

    tracing::info!(
        subscription_id = %payload.subscription_id,
        deleted,
        "Purged messages of deleted subscription"
    );
    tasks.dispatch(Task::RecalculateUnreadCount {
        user_id: payload.user_id,
        folder_id: payload.folder_id,
    });
    Ok(())
}

/// Drain the durable queue every `interval` until shutdown
pub async fn run_task_queue(
    queue: Arc<dyn TaskQueue>,
    inbox: Arc<dyn InboxStore>,
    tasks: BackgroundTasks,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        match drain_task_queue(queue.as_ref(), inbox.as_ref(), &tasks).await {
            Ok(0) => {}
            Ok(completed) => tracing::debug!(completed, "Drained durable task queue"),
            Err(e) => tracing::error!(error = %e, "Failed to drain durable task queue"),
        }
    }

    tracing::info!("Durable task queue loop stopped");
}
