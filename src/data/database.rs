//! SQLite database operations
//!
//! All database access goes through this module.
//! Records are soft deleted: `deleted_at` is set and every query filters on it.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use super::store::{InboxStore, RuleStore, SubscriptionStore, TaskQueue, UserDirectory};
use crate::error::AppError;

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

fn message_from_row(row: &SqliteRow) -> Result<Message, AppError> {
    let attributed_to: String = row.try_get("attributed_to")?;
    let origin: String = row.try_get("origin")?;
    let references: String = row.try_get("refs")?;
    let labels: String = row.try_get("labels")?;

    Ok(Message {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        folder_id: row.try_get("folder_id")?,
        subscription_id: row.try_get("subscription_id")?,
        url: row.try_get("url")?,
        label: row.try_get("label")?,
        summary: row.try_get("summary")?,
        image_url: row.try_get("image_url")?,
        attributed_to: serde_json::from_str(&attributed_to)?,
        content_html: row.try_get("content_html")?,
        publish_date: row.try_get("publish_date")?,
        read_date: row.try_get("read_date")?,
        muted: row.try_get("muted")?,
        origin: serde_json::from_str(&origin)?,
        references: serde_json::from_str(&references)?,
        labels: serde_json::from_str(&labels)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        // Create connection string
        let connection_string = format!("sqlite:{}?mode=rwc", path.display());

        // Create connection pool
        let pool = SqlitePool::connect(&connection_string).await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // =========================================================================
    // Users and folders
    // =========================================================================

    /// Register a local user with its signing identity
    pub async fn insert_user(&self, username: &str, actor: &LocalActor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, actor_uri, key_id, private_key_pem, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.user_id)
        .bind(username)
        .bind(&actor.actor_uri)
        .bind(&actor.key_id)
        .bind(&actor.private_key_pem)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create an inbox folder
    pub async fn insert_folder(
        &self,
        folder_id: &str,
        user_id: &str,
        label: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO folders (id, user_id, label, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(folder_id)
        .bind(user_id)
        .bind(label)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stored unread counter of a folder
    pub async fn get_folder_unread_count(&self, folder_id: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT unread_count FROM folders WHERE id = ?")
            .bind(folder_id)
            .fetch_optional(&self.pool)
            .await?;

        count.ok_or(AppError::NotFound)
    }

    /// Stored (following_count, rule_count) of a user
    pub async fn get_user_counters(&self, user_id: &str) -> Result<(i64, i64), AppError> {
        let row = sqlx::query("SELECT following_count, rule_count FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)?;

        Ok((row.try_get("following_count")?, row.try_get("rule_count")?))
    }

    /// Live messages of a user, oldest first
    pub async fn get_messages(&self, user_id: &str) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE user_id = ? AND deleted_at IS NULL
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }
}

#[async_trait]
impl SubscriptionStore for Database {
    async fn load_subscription(
        &self,
        user_id: &str,
        subscription_id: &str,
    ) -> Result<Subscription, AppError> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE id = ? AND user_id = ? AND deleted_at IS NULL",
        )
        .bind(subscription_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)
    }

    async fn load_subscription_by_id(
        &self,
        subscription_id: &str,
    ) -> Result<Subscription, AppError> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)
    }

    async fn find_subscription_by_url(
        &self,
        user_id: &str,
        url: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = ? AND (url = ? OR profile_url = ?) AND deleted_at IS NULL
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(url)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn save_subscription(
        &self,
        subscription: &Subscription,
        note: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, folder_id, url, profile_url, label, summary, image_url,
                method, format, collapse_threads, purge_duration,
                status, status_message, error_count, last_polled, next_poll, poll_duration,
                loading_since, websub_hub, websub_topic, websub_secret,
                activitypub_inbox, follow_activity_id, note, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                folder_id = excluded.folder_id,
                url = excluded.url,
                profile_url = excluded.profile_url,
                label = excluded.label,
                summary = excluded.summary,
                image_url = excluded.image_url,
                method = excluded.method,
                format = excluded.format,
                collapse_threads = excluded.collapse_threads,
                purge_duration = excluded.purge_duration,
                status = excluded.status,
                status_message = excluded.status_message,
                error_count = excluded.error_count,
                last_polled = excluded.last_polled,
                next_poll = excluded.next_poll,
                poll_duration = excluded.poll_duration,
                loading_since = excluded.loading_since,
                websub_hub = excluded.websub_hub,
                websub_topic = excluded.websub_topic,
                websub_secret = excluded.websub_secret,
                activitypub_inbox = excluded.activitypub_inbox,
                follow_activity_id = excluded.follow_activity_id,
                note = excluded.note,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&subscription.id)
        .bind(&subscription.user_id)
        .bind(&subscription.folder_id)
        .bind(&subscription.url)
        .bind(&subscription.profile_url)
        .bind(&subscription.label)
        .bind(&subscription.summary)
        .bind(&subscription.image_url)
        .bind(subscription.method)
        .bind(subscription.format)
        .bind(subscription.collapse_threads)
        .bind(subscription.purge_duration)
        .bind(subscription.status)
        .bind(&subscription.status_message)
        .bind(subscription.error_count)
        .bind(subscription.last_polled)
        .bind(subscription.next_poll)
        .bind(subscription.poll_duration)
        .bind(subscription.loading_since)
        .bind(&subscription.websub_hub)
        .bind(&subscription.websub_topic)
        .bind(&subscription.websub_secret)
        .bind(&subscription.activitypub_inbox)
        .bind(&subscription.follow_activity_id)
        .bind(note)
        .bind(subscription.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_subscription(
        &self,
        subscription: &Subscription,
        note: &str,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET deleted_at = ?, note = ?
            WHERE id = ? AND user_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(note)
        .bind(&subscription.id)
        .bind(&subscription.user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        Ok(())
    }

    async fn query_pollable(&self, now: i64) -> Result<Vec<Subscription>, AppError> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE deleted_at IS NULL
              AND next_poll <= ?
              AND method != 'activitypub'
              AND status != 'import_pending'
            ORDER BY next_poll ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    async fn query_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>, AppError> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = ? AND deleted_at IS NULL
            ORDER BY label ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }
}

#[async_trait]
impl InboxStore for Database {
    async fn save_message(&self, message: &Message, note: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO messages (
                id, user_id, folder_id, subscription_id, url, label, summary, image_url,
                attributed_to, content_html, publish_date, read_date, muted,
                origin, refs, labels, note, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                folder_id = excluded.folder_id,
                label = excluded.label,
                summary = excluded.summary,
                image_url = excluded.image_url,
                attributed_to = excluded.attributed_to,
                content_html = excluded.content_html,
                publish_date = excluded.publish_date,
                read_date = excluded.read_date,
                muted = excluded.muted,
                origin = excluded.origin,
                refs = excluded.refs,
                labels = excluded.labels,
                note = excluded.note,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&message.id)
        .bind(&message.user_id)
        .bind(&message.folder_id)
        .bind(&message.subscription_id)
        .bind(&message.url)
        .bind(&message.label)
        .bind(&message.summary)
        .bind(&message.image_url)
        .bind(serde_json::to_string(&message.attributed_to)?)
        .bind(&message.content_html)
        .bind(message.publish_date)
        .bind(message.read_date)
        .bind(message.muted)
        .bind(serde_json::to_string(&message.origin)?)
        .bind(serde_json::to_string(&message.references)?)
        .bind(serde_json::to_string(&message.labels)?)
        .bind(note)
        .bind(message.created_at)
        .bind(unix_now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_unread_by_url(
        &self,
        user_id: &str,
        url: &str,
    ) -> Result<Option<Message>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE user_id = ? AND url = ? AND read_date = 0 AND deleted_at IS NULL
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn load_live_by_url(
        &self,
        user_id: &str,
        url: &str,
    ) -> Result<Option<Message>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE user_id = ? AND url = ? AND deleted_at IS NULL
            ORDER BY read_date = 0 DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn url_seen(&self, subscription: &Subscription, url: &str) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE user_id = ? AND url = ?
              AND (deleted_at IS NULL OR subscription_id = ?)
            "#,
        )
        .bind(&subscription.user_id)
        .bind(url)
        .bind(&subscription.id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn delete_message(&self, message: &Message, note: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE messages SET deleted_at = ?, note = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(unix_now())
        .bind(note)
        .bind(&message.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query_purgeable(
        &self,
        subscription: &Subscription,
        cutoff: i64,
    ) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE user_id = ? AND subscription_id = ? AND created_at < ? AND deleted_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .bind(&subscription.user_id)
        .bind(&subscription.id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn delete_messages_by_subscription(
        &self,
        user_id: &str,
        subscription_id: &str,
        note: &str,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET deleted_at = ?, note = ?
            WHERE user_id = ? AND subscription_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(unix_now())
        .bind(note)
        .bind(user_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn recalculate_unread_count(
        &self,
        user_id: &str,
        folder_id: &str,
    ) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE user_id = ? AND folder_id = ? AND read_date = 0 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(folder_id)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query("UPDATE folders SET unread_count = ? WHERE id = ? AND user_id = ?")
            .bind(count)
            .bind(folder_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(count)
    }
}

#[async_trait]
impl RuleStore for Database {
    async fn query_rules_for(
        &self,
        user_id: &str,
        identities: &[String],
        domains: &[String],
        behaviors: &[RuleBehavior],
    ) -> Result<Vec<Rule>, AppError> {
        if behaviors.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT * FROM rules WHERE deleted_at IS NULL AND (user_id = ",
        );
        builder.push_bind(user_id);
        builder.push(" OR user_id = '') AND behavior IN (");
        {
            let mut separated = builder.separated(", ");
            for behavior in behaviors {
                separated.push_bind(*behavior);
            }
        }
        builder.push(") AND (rule_type IN ('content', 'external')");

        if !identities.is_empty() {
            builder.push(" OR (rule_type = 'actor' AND rule_trigger IN (");
            let mut separated = builder.separated(", ");
            for identity in identities {
                separated.push_bind(identity.as_str());
            }
            separated.push_unseparated("))");
        }

        if !domains.is_empty() {
            builder.push(" OR (rule_type = 'domain' AND rule_trigger IN (");
            let mut separated = builder.separated(", ");
            for domain in domains {
                separated.push_bind(domain.as_str());
            }
            separated.push_unseparated("))");
        }

        builder.push(") ORDER BY created_at ASC");

        let rules = builder
            .build_query_as::<Rule>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rules)
    }

    async fn load_rule_by_trigger(
        &self,
        user_id: &str,
        rule_type: RuleType,
        trigger: &str,
    ) -> Result<Option<Rule>, AppError> {
        let rule = sqlx::query_as::<_, Rule>(
            r#"
            SELECT * FROM rules
            WHERE user_id = ? AND rule_type = ? AND rule_trigger = ? AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(rule_type)
        .bind(trigger)
        .fetch_optional(&self.pool)
        .await?;

        Ok(rule)
    }

    async fn load_rule(&self, user_id: &str, rule_id: &str) -> Result<Rule, AppError> {
        sqlx::query_as::<_, Rule>(
            "SELECT * FROM rules WHERE id = ? AND user_id = ? AND deleted_at IS NULL",
        )
        .bind(rule_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)
    }

    async fn save_rule(&self, rule: &Rule, note: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO rules (
                id, user_id, rule_type, rule_trigger, behavior, label, summary, origin,
                note, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                rule_type = excluded.rule_type,
                rule_trigger = excluded.rule_trigger,
                behavior = excluded.behavior,
                label = excluded.label,
                summary = excluded.summary,
                origin = excluded.origin,
                note = excluded.note,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.user_id)
        .bind(rule.rule_type)
        .bind(&rule.trigger)
        .bind(rule.behavior)
        .bind(&rule.label)
        .bind(&rule.summary)
        .bind(rule.origin)
        .bind(note)
        .bind(rule.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_rule(&self, rule: &Rule, note: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE rules SET deleted_at = ?, note = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(note)
        .bind(&rule.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        Ok(())
    }

    async fn query_rules(&self, user_id: &str) -> Result<Vec<Rule>, AppError> {
        let rules = sqlx::query_as::<_, Rule>(
            r#"
            SELECT * FROM rules
            WHERE user_id = ? AND deleted_at IS NULL
            ORDER BY rule_type ASC, rule_trigger ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }
}

#[async_trait]
impl UserDirectory for Database {
    async fn recalculate_following_count(&self, user_id: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE users SET following_count = (
                SELECT COUNT(*) FROM subscriptions WHERE user_id = ? AND deleted_at IS NULL
            ) WHERE id = ?
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recalculate_rule_count(&self, user_id: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE users SET rule_count = (
                SELECT COUNT(*) FROM rules WHERE user_id = ? AND deleted_at IS NULL
            ) WHERE id = ?
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn local_actor(&self, user_id: &str) -> Result<LocalActor, AppError> {
        sqlx::query_as::<_, LocalActor>(
            r#"
            SELECT id AS user_id, actor_uri, key_id, private_key_pem
            FROM users WHERE id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound)
    }
}

#[async_trait]
impl TaskQueue for Database {
    async fn publish(&self, name: &str, payload: serde_json::Value) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO task_queue (id, name, payload, run_after, created_at)
            VALUES (?, ?, ?, 0, ?)
            "#,
        )
        .bind(EntityId::new().0)
        .bind(name)
        .bind(payload.to_string())
        .bind(unix_now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_tasks(
        &self,
        limit: i64,
        lease_seconds: i64,
    ) -> Result<Vec<QueuedTask>, AppError> {
        let now = unix_now();
        let rows = sqlx::query(
            r#"
            UPDATE task_queue
            SET locked_until = ?, attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM task_queue
                WHERE run_after <= ? AND locked_until <= ?
                ORDER BY created_at ASC, id ASC
                LIMIT ?
            )
            RETURNING id, name, payload, attempts
            "#,
        )
        .bind(now + lease_seconds)
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<QueuedTask, AppError> {
                let payload: String = row.try_get("payload")?;
                Ok(QueuedTask {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    payload: serde_json::from_str(&payload)?,
                    attempts: row.try_get("attempts")?,
                })
            })
            .collect()
    }

    async fn complete_task(&self, task_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM task_queue WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn retry_task(
        &self,
        task_id: &str,
        error: &str,
        delay_seconds: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE task_queue SET run_after = ?, locked_until = 0, last_error = ? WHERE id = ?",
        )
        .bind(unix_now() + delay_seconds)
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
