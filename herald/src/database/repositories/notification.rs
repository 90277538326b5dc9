//! Notification record store.
//!
//! Claims run inside `BEGIN IMMEDIATE` transactions so concurrent schedulers,
//! in this process or another one sharing the database file, never receive
//! the same record. Every status update is guarded by the expected source
//! status.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::database::models::{
    AttachmentDbModel, NotificationDbModel, NotificationStatus, StatusCounts,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{cutoff_ms, duration_ms, now_ms};
use crate::database::{DbPool, begin_immediate};
use crate::domain::RetryPolicy;
use crate::domain::notification::DUPLICATE_SUPPRESSED;
use crate::{Error, Result};

/// Provider name recorded on duplicate-suppressed records.
pub const DEDUP_PROVIDER: &str = "dedup";

/// Result of one delivery attempt, applied by [`NotificationStore::mark_terminal`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminalUpdate {
    pub success: bool,
    /// Ignored on success. A non-retryable failure goes straight to FAILED.
    pub retryable: bool,
    pub provider: Option<String>,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub cost: Option<f64>,
}

impl TerminalUpdate {
    pub fn sent(provider: impl Into<String>, message_id: Option<String>) -> Self {
        Self {
            success: true,
            retryable: false,
            provider: Some(provider.into()),
            message_id,
            error: None,
            cost: None,
        }
    }

    pub fn failed(provider: Option<String>, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            retryable,
            provider,
            message_id: None,
            error: Some(error.into()),
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: Option<f64>) -> Self {
        self.cost = cost;
        self
    }
}

/// Content identity used for duplicate suppression: the normalized
/// recipient set plus subject and body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    recipients: BTreeSet<String>,
    subject: Option<String>,
    body: Option<String>,
}

impl DedupKey {
    /// `None` when the stored recipient list cannot be read.
    pub fn of(record: &NotificationDbModel) -> Option<Self> {
        let recipients = record.recipient_list().ok()?;
        Some(Self {
            recipients: recipient_set(&recipients),
            subject: record.subject.clone(),
            body: record.body.clone(),
        })
    }
}

/// Durable notification store.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a PENDING record and its attachment rows atomically.
    async fn create(
        &self,
        record: &NotificationDbModel,
        attachments: &[AttachmentDbModel],
    ) -> Result<String>;
    async fn get(&self, id: &str) -> Result<NotificationDbModel>;
    async fn list_attachments(&self, notification_id: &str) -> Result<Vec<AttachmentDbModel>>;

    /// Reset stale PROCESSING records, then claim up to `limit` actionable
    /// records oldest first.
    async fn claim_batch(
        &self,
        limit: u32,
        stale_after: Duration,
    ) -> Result<Vec<NotificationDbModel>>;

    /// Claim one record if it is PENDING or a RETRYING record whose backoff
    /// has elapsed. Returns `None` when the record is not claimable.
    async fn claim(&self, id: &str) -> Result<Option<NotificationDbModel>>;

    /// Reset PROCESSING records older than `stale_after` to PENDING.
    async fn recover_stale(&self, stale_after: Duration) -> Result<u64>;

    /// Apply the outcome of an attempt to a PROCESSING record and return
    /// the resulting status.
    async fn mark_terminal(
        &self,
        id: &str,
        update: &TerminalUpdate,
        policy: &RetryPolicy,
    ) -> Result<NotificationStatus>;

    /// Mark a PROCESSING record SENT without dispatching it.
    async fn mark_duplicate(&self, id: &str, original_id: &str) -> Result<()>;

    /// SENT records with the same recipient set, subject and body whose
    /// `sent_at` falls within `window`.
    async fn find_recent_matches(
        &self,
        recipients: &[String],
        subject: Option<&str>,
        body: Option<&str>,
        window: Duration,
        exclude_id: Option<&str>,
    ) -> Result<Vec<NotificationDbModel>>;

    /// Unfinished records (PENDING, PROCESSING or RETRYING) with the same
    /// content as `record`, created before it within `window`, oldest first.
    async fn find_unfinished_predecessors(
        &self,
        record: &NotificationDbModel,
        window: Duration,
    ) -> Result<Vec<NotificationDbModel>>;

    /// Record an error message without changing the status.
    async fn record_error(&self, id: &str, error: &str) -> Result<()>;

    /// Records a transport should be handed again: PENDING records untouched
    /// for `idle_for`, and due RETRYING records not touched since they became
    /// due (or untouched for `idle_for`). Oldest first.
    async fn list_redispatchable(
        &self,
        idle_for: Duration,
        limit: u32,
    ) -> Result<Vec<NotificationDbModel>>;

    /// Refresh `updated_at` of a PENDING or RETRYING record after it was
    /// handed to a transport. Always lands past `next_attempt_at`.
    async fn touch(&self, id: &str) -> Result<()>;
    async fn list_by_status(
        &self,
        status: NotificationStatus,
        limit: u32,
    ) -> Result<Vec<NotificationDbModel>>;
    async fn count_by_status(&self) -> Result<StatusCounts>;
    /// Delete a record. Attachment rows cascade.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// SQLx implementation of [`NotificationStore`].
pub struct SqlxNotificationStore {
    pool: SqlitePool,
}

impl SqlxNotificationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn claim_batch_once(
        &self,
        limit: u32,
        stale_after: Duration,
    ) -> Result<Vec<NotificationDbModel>> {
        let now = now_ms();
        let mut tx = begin_immediate(&self.pool).await?;

        let recovered = sqlx::query(
            r#"
            UPDATE notification
            SET status = 'PENDING', updated_at = ?
            WHERE status = 'PROCESSING' AND updated_at < ?
            "#,
        )
        .bind(now)
        .bind(cutoff_ms(now, stale_after))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if recovered > 0 {
            warn!(
                "Reset {} stale PROCESSING notification(s) to PENDING",
                recovered
            );
        }

        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM notification
            WHERE status = 'PENDING'
               OR (status = 'RETRYING' AND COALESCE(next_attempt_at, 0) <= ?)
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(ids.len());
        for (id,) in ids {
            sqlx::query(
                r#"
                UPDATE notification
                SET status = 'PROCESSING', updated_at = ?, next_attempt_at = NULL
                WHERE id = ? AND status IN ('PENDING', 'RETRYING')
                "#,
            )
            .bind(now)
            .bind(&id)
            .execute(&mut *tx)
            .await?;

            let record = sqlx::query_as::<_, NotificationDbModel>(
                "SELECT * FROM notification WHERE id = ?",
            )
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
            claimed.push(record);
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn claim_once(&self, id: &str) -> Result<Option<NotificationDbModel>> {
        let now = now_ms();
        let mut tx = begin_immediate(&self.pool).await?;

        let updated = sqlx::query(
            r#"
            UPDATE notification
            SET status = 'PROCESSING', updated_at = ?, next_attempt_at = NULL
            WHERE id = ?
              AND (status = 'PENDING'
                   OR (status = 'RETRYING' AND COALESCE(next_attempt_at, 0) <= ?))
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let record =
            sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notification WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(Some(record))
    }

    async fn mark_sent_once(&self, id: &str, update: &TerminalUpdate) -> Result<()> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE notification
            SET status = 'SENT', sent_at = ?, updated_at = ?,
                provider = ?, provider_message_id = ?, error_message = NULL,
                cost = COALESCE(?, cost), next_attempt_at = NULL
            WHERE id = ? AND status = 'PROCESSING'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&update.provider)
        .bind(&update.message_id)
        .bind(update.cost)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, NotificationStatus::Sent).await);
        }
        Ok(())
    }

    async fn mark_failed_once(
        &self,
        id: &str,
        update: &TerminalUpdate,
        policy: &RetryPolicy,
    ) -> Result<NotificationStatus> {
        let mut tx = begin_immediate(&self.pool).await?;

        let current: Option<(String, i64)> =
            sqlx::query_as("SELECT status, retry_count FROM notification WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((status, retry_count)) = current else {
            tx.rollback().await?;
            return Err(Error::not_found("Notification", id));
        };

        let attempts = u32::try_from(retry_count.saturating_add(1)).unwrap_or(u32::MAX);
        let next = if update.retryable && policy.should_retry(attempts) {
            NotificationStatus::Retrying
        } else {
            NotificationStatus::Failed
        };

        if status != NotificationStatus::Processing.as_str() {
            tx.rollback().await?;
            return Err(Error::invalid_transition(status, next));
        }

        let now = now_ms();
        match next {
            NotificationStatus::Retrying => {
                let next_attempt_at =
                    now.saturating_add(duration_ms(policy.delay_for_retry(attempts)));
                sqlx::query(
                    r#"
                    UPDATE notification
                    SET status = 'RETRYING', retry_count = retry_count + 1,
                        provider = COALESCE(?, provider), error_message = ?,
                        cost = COALESCE(?, cost), next_attempt_at = ?, updated_at = ?
                    WHERE id = ? AND status = 'PROCESSING'
                    "#,
                )
                .bind(&update.provider)
                .bind(&update.error)
                .bind(update.cost)
                .bind(next_attempt_at)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            _ => {
                // FAILED always carries the full retry budget, even when a
                // non-retryable error ends the record early.
                sqlx::query(
                    r#"
                    UPDATE notification
                    SET status = 'FAILED', retry_count = MAX(retry_count, ?),
                        provider = COALESCE(?, provider), error_message = ?,
                        cost = COALESCE(?, cost), next_attempt_at = NULL, updated_at = ?
                    WHERE id = ? AND status = 'PROCESSING'
                    "#,
                )
                .bind(i64::from(policy.max_retries))
                .bind(&update.provider)
                .bind(&update.error)
                .bind(update.cost)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(next)
    }

    async fn mark_duplicate_once(&self, id: &str, original_id: &str) -> Result<()> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE notification
            SET status = 'SENT', sent_at = ?, updated_at = ?,
                provider = ?, provider_message_id = ?, error_message = ?,
                next_attempt_at = NULL
            WHERE id = ? AND status = 'PROCESSING'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(DEDUP_PROVIDER)
        .bind(DUPLICATE_SUPPRESSED)
        .bind(format!("duplicate of notification {original_id}"))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, NotificationStatus::Sent).await);
        }
        Ok(())
    }

    /// Explain why a guarded update matched no row.
    async fn transition_error(&self, id: &str, target: NotificationStatus) -> Error {
        let current: std::result::Result<Option<(String,)>, sqlx::Error> =
            sqlx::query_as("SELECT status FROM notification WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;
        match current {
            Ok(Some((status,))) => Error::invalid_transition(status, target),
            Ok(None) => Error::not_found("Notification", id),
            Err(e) => e.into(),
        }
    }
}

/// Normalized recipient set for order-insensitive comparison.
fn recipient_set(recipients: &[String]) -> BTreeSet<String> {
    recipients
        .iter()
        .map(|r| r.trim().to_ascii_lowercase())
        .collect()
}

#[async_trait]
impl NotificationStore for SqlxNotificationStore {
    async fn create(
        &self,
        record: &NotificationDbModel,
        attachments: &[AttachmentDbModel],
    ) -> Result<String> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO notification (
                id, channel_type, recipients, cc, bcc, subject, body,
                template_name, template_variables, from_address, status,
                provider, provider_message_id, error_message, retry_count, cost,
                created_at, updated_at, sent_at, next_attempt_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', NULL, NULL, NULL, 0, NULL, ?, ?, NULL, NULL)
            "#,
        )
        .bind(&record.id)
        .bind(&record.channel_type)
        .bind(&record.recipients)
        .bind(&record.cc)
        .bind(&record.bcc)
        .bind(&record.subject)
        .bind(&record.body)
        .bind(&record.template_name)
        .bind(&record.template_variables)
        .bind(&record.from_address)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        for attachment in attachments {
            sqlx::query(
                r#"
                INSERT INTO notification_attachment (
                    id, notification_id, file_name, content_type, size_bytes,
                    storage_provider, storage_path, is_inline, content_id, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&attachment.id)
            .bind(&record.id)
            .bind(&attachment.file_name)
            .bind(&attachment.content_type)
            .bind(attachment.size_bytes)
            .bind(&attachment.storage_provider)
            .bind(&attachment.storage_path)
            .bind(attachment.is_inline)
            .bind(&attachment.content_id)
            .bind(attachment.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Created notification {} with {} attachment(s)",
            record.id,
            attachments.len()
        );
        Ok(record.id.clone())
    }

    async fn get(&self, id: &str) -> Result<NotificationDbModel> {
        sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notification WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Notification", id))
    }

    async fn list_attachments(&self, notification_id: &str) -> Result<Vec<AttachmentDbModel>> {
        let attachments = sqlx::query_as::<_, AttachmentDbModel>(
            "SELECT * FROM notification_attachment WHERE notification_id = ? ORDER BY created_at, id",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attachments)
    }

    async fn claim_batch(
        &self,
        limit: u32,
        stale_after: Duration,
    ) -> Result<Vec<NotificationDbModel>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        retry_on_sqlite_busy("claim_batch", || self.claim_batch_once(limit, stale_after)).await
    }

    async fn claim(&self, id: &str) -> Result<Option<NotificationDbModel>> {
        retry_on_sqlite_busy("claim", || self.claim_once(id)).await
    }

    async fn recover_stale(&self, stale_after: Duration) -> Result<u64> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE notification
            SET status = 'PENDING', updated_at = ?
            WHERE status = 'PROCESSING' AND updated_at < ?
            "#,
        )
        .bind(now)
        .bind(cutoff_ms(now, stale_after))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_terminal(
        &self,
        id: &str,
        update: &TerminalUpdate,
        policy: &RetryPolicy,
    ) -> Result<NotificationStatus> {
        if update.success {
            retry_on_sqlite_busy("mark_sent", || self.mark_sent_once(id, update)).await?;
            Ok(NotificationStatus::Sent)
        } else {
            retry_on_sqlite_busy("mark_failed", || self.mark_failed_once(id, update, policy)).await
        }
    }

    async fn mark_duplicate(&self, id: &str, original_id: &str) -> Result<()> {
        retry_on_sqlite_busy("mark_duplicate", || self.mark_duplicate_once(id, original_id)).await
    }

    async fn find_recent_matches(
        &self,
        recipients: &[String],
        subject: Option<&str>,
        body: Option<&str>,
        window: Duration,
        exclude_id: Option<&str>,
    ) -> Result<Vec<NotificationDbModel>> {
        let cutoff = cutoff_ms(now_ms(), window);
        let candidates = sqlx::query_as::<_, NotificationDbModel>(
            r#"
            SELECT * FROM notification
            WHERE status = 'SENT'
              AND sent_at >= ?
              AND subject IS ?
              AND body IS ?
              AND (? IS NULL OR id <> ?)
            ORDER BY sent_at DESC
            "#,
        )
        .bind(cutoff)
        .bind(subject)
        .bind(body)
        .bind(exclude_id)
        .bind(exclude_id)
        .fetch_all(&self.pool)
        .await?;

        let wanted = recipient_set(recipients);
        let mut matches = Vec::new();
        for candidate in candidates {
            match candidate.recipient_list() {
                Ok(list) if recipient_set(&list) == wanted => matches.push(candidate),
                Ok(_) => {}
                Err(e) => warn!(
                    "Skipping notification {} with unreadable recipients: {}",
                    candidate.id, e
                ),
            }
        }
        Ok(matches)
    }

    async fn find_unfinished_predecessors(
        &self,
        record: &NotificationDbModel,
        window: Duration,
    ) -> Result<Vec<NotificationDbModel>> {
        let Some(wanted) = DedupKey::of(record) else {
            return Ok(Vec::new());
        };
        let candidates = sqlx::query_as::<_, NotificationDbModel>(
            r#"
            SELECT * FROM notification
            WHERE status IN ('PENDING', 'PROCESSING', 'RETRYING')
              AND created_at >= ?
              AND subject IS ?
              AND body IS ?
              AND (created_at < ? OR (created_at = ? AND id < ?))
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(cutoff_ms(now_ms(), window))
        .bind(&record.subject)
        .bind(&record.body)
        .bind(record.created_at)
        .bind(record.created_at)
        .bind(&record.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(candidates
            .into_iter()
            .filter(|candidate| DedupKey::of(candidate).as_ref() == Some(&wanted))
            .collect())
    }

    async fn list_redispatchable(
        &self,
        idle_for: Duration,
        limit: u32,
    ) -> Result<Vec<NotificationDbModel>> {
        let now = now_ms();
        let idle_cutoff = cutoff_ms(now, idle_for);
        let records = sqlx::query_as::<_, NotificationDbModel>(
            r#"
            SELECT * FROM notification
            WHERE (status = 'PENDING' AND updated_at <= ?)
               OR (status = 'RETRYING'
                   AND COALESCE(next_attempt_at, 0) <= ?
                   AND (updated_at <= COALESCE(next_attempt_at, 0) OR updated_at <= ?))
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(idle_cutoff)
        .bind(now)
        .bind(idle_cutoff)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn touch(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notification
            SET updated_at = MAX(?, COALESCE(next_attempt_at, 0) + 1)
            WHERE id = ? AND status IN ('PENDING', 'RETRYING')
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_error(&self, id: &str, error: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE notification SET error_message = ?, updated_at = ? WHERE id = ?")
                .bind(error)
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Notification", id));
        }
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: NotificationStatus,
        limit: u32,
    ) -> Result<Vec<NotificationDbModel>> {
        let records = sqlx::query_as::<_, NotificationDbModel>(
            "SELECT * FROM notification WHERE status = ? ORDER BY created_at ASC, id ASC LIMIT ?",
        )
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM notification GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.add(&status, count)?;
        }
        Ok(counts)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM notification WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Notification", id));
        }
        Ok(())
    }
}
