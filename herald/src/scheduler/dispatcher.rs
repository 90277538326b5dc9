//! Per-record delivery.
//!
//! The dispatcher drives a single claimed record through one attempt:
//! duplicate check, attachment loading, routing, sending, and applying the
//! outcome to the store. The queue scheduler runs it for every record of a
//! batch; the inline transport runs it for one record until that record is
//! terminal.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attachments::AttachmentStore;
use crate::channels::{ChannelRouter, LoadedAttachment, OutboundMessage};
use crate::database::models::{NotificationDbModel, NotificationStatus};
use crate::database::repositories::{DedupKey, NotificationStore, TerminalUpdate};
use crate::database::time::until_ms;
use crate::domain::{DeliveryOutcome, RetryPolicy};
use crate::{Error, Result};

/// Tunables shared by every delivery path.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPolicy {
    pub retry: RetryPolicy,
    /// Window in which an identical SENT record suppresses a new delivery.
    /// Zero disables deduplication.
    pub dedup_window: Duration,
    /// PROCESSING records older than this are considered orphaned.
    pub stale_after: Duration,
    /// How long inline delivery waits before re-checking a record another
    /// worker holds.
    pub poll_interval: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            dedup_window: Duration::from_secs(300),
            stale_after: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// What one attempt did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Sent,
    Retrying,
    Failed,
    /// Marked SENT as a duplicate without dispatching.
    Duplicate,
}

impl From<NotificationStatus> for AttemptResult {
    fn from(status: NotificationStatus) -> Self {
        match status {
            NotificationStatus::Sent => Self::Sent,
            NotificationStatus::Retrying => Self::Retrying,
            _ => Self::Failed,
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn NotificationStore>,
    router: ChannelRouter,
    attachments: Option<Arc<dyn AttachmentStore>>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        router: ChannelRouter,
        attachments: Option<Arc<dyn AttachmentStore>>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            store,
            router,
            attachments,
            policy,
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    /// Run one attempt for a record this worker has claimed.
    ///
    /// Errors are store failures only. Sender failures are recorded on the
    /// record and reported through the returned [`AttemptResult`].
    pub async fn process(&self, record: NotificationDbModel) -> Result<AttemptResult> {
        if let Some(original_id) = self.find_duplicate(&record).await? {
            self.store.mark_duplicate(&record.id, &original_id).await?;
            info!(
                "Suppressed notification {} as a duplicate of {}",
                record.id, original_id
            );
            return Ok(AttemptResult::Duplicate);
        }

        let update = self.attempt(&record).await;
        let status = self
            .store
            .mark_terminal(&record.id, &update, &self.policy.retry)
            .await?;

        match status {
            NotificationStatus::Sent => debug!("Notification {} sent", record.id),
            NotificationStatus::Retrying => warn!(
                "Notification {} failed, will retry: {}",
                record.id,
                update.error.as_deref().unwrap_or("unknown error")
            ),
            _ => warn!(
                "Notification {} failed permanently: {}",
                record.id,
                update.error.as_deref().unwrap_or("unknown error")
            ),
        }
        Ok(status.into())
    }

    /// Claim and attempt `id` until it is SENT or FAILED.
    ///
    /// RETRYING records are re-attempted once their backoff has elapsed. A
    /// record waits while an older identical record is unfinished, so the
    /// duplicate check sees that record's outcome. With `permits`, one permit
    /// is held per attempt and released during waits. `cancel` only
    /// interrupts the waits between attempts, never a send.
    pub async fn deliver_to_completion(
        self: &Arc<Self>,
        id: &str,
        cancel: &CancellationToken,
        permits: Option<&Semaphore>,
    ) -> Result<DeliveryOutcome> {
        loop {
            if cancel.is_cancelled() {
                return Err(interrupted(id));
            }

            let current = self.store.get(id).await?;
            let wait = match current.get_status() {
                Some(NotificationStatus::Sent) | Some(NotificationStatus::Failed) => {
                    return DeliveryOutcome::from_record(&current);
                }
                Some(NotificationStatus::Processing) => {
                    // Held by another worker, or orphaned by a crash.
                    self.store.recover_stale(self.policy.stale_after).await?;
                    self.policy.poll_interval
                }
                Some(NotificationStatus::Pending) | Some(NotificationStatus::Retrying) => {
                    let backoff = current.next_attempt_at.map(until_ms).unwrap_or_default();
                    if !backoff.is_zero() {
                        debug!("Notification {} retrying in {:?}", id, backoff);
                        backoff
                    } else if let Some(earlier) = self.unfinished_predecessor(&current).await? {
                        debug!(
                            "Notification {} waits for identical notification {}",
                            id, earlier
                        );
                        self.policy.poll_interval
                    } else {
                        let _permit = match permits {
                            Some(permits) => tokio::select! {
                                _ = cancel.cancelled() => return Err(interrupted(id)),
                                permit = permits.acquire() => Some(permit.map_err(|_| {
                                    Error::transport("delivery permits closed")
                                })?),
                            },
                            None => None,
                        };
                        if let Some(record) = self.store.claim(id).await? {
                            self.process_contained(record).await?;
                        }
                        continue;
                    }
                }
                None => {
                    return Err(Error::validation(format!(
                        "notification {} has unknown status '{}'",
                        id, current.status
                    )));
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Run [`Dispatcher::process`] on its own task. A panic is charged to the
    /// record as a failed, retryable attempt.
    pub async fn process_contained(
        self: &Arc<Self>,
        record: NotificationDbModel,
    ) -> Result<AttemptResult> {
        let id = record.id.clone();
        let dispatcher = self.clone();
        match tokio::spawn(async move { dispatcher.process(record).await }).await {
            Ok(result) => result,
            Err(join_error) => self.record_crash(&id, &join_error.to_string()).await,
        }
    }

    /// Charge a failed, retryable attempt to a PROCESSING record whose
    /// delivery task panicked.
    pub async fn record_crash(&self, id: &str, reason: &str) -> Result<AttemptResult> {
        let update = TerminalUpdate::failed(None, format!("delivery task panicked: {reason}"), true);
        let status = self
            .store
            .mark_terminal(id, &update, &self.policy.retry)
            .await?;
        warn!(
            "Delivery of notification {} panicked, now {}: {}",
            id, status, reason
        );
        Ok(status.into())
    }

    /// Grouping key for records that must not be attempted concurrently.
    /// `None` when deduplication is disabled or the record is unreadable.
    pub fn dedup_key(&self, record: &NotificationDbModel) -> Option<DedupKey> {
        if self.policy.dedup_window.is_zero() {
            return None;
        }
        DedupKey::of(record)
    }

    async fn unfinished_predecessor(&self, record: &NotificationDbModel) -> Result<Option<String>> {
        if self.policy.dedup_window.is_zero() {
            return Ok(None);
        }
        let earlier = self
            .store
            .find_unfinished_predecessors(record, self.policy.dedup_window)
            .await?;
        Ok(earlier.into_iter().next().map(|r| r.id))
    }

    async fn find_duplicate(&self, record: &NotificationDbModel) -> Result<Option<String>> {
        if self.policy.dedup_window.is_zero() {
            return Ok(None);
        }
        // Unreadable recipients fail later in `attempt`.
        let Ok(recipients) = record.recipient_list() else {
            return Ok(None);
        };

        let matches = self
            .store
            .find_recent_matches(
                &recipients,
                record.subject.as_deref(),
                record.body.as_deref(),
                self.policy.dedup_window,
                Some(&record.id),
            )
            .await?;
        Ok(matches.into_iter().next().map(|m| m.id))
    }

    /// Send the record and translate the result into a store update.
    async fn attempt(&self, record: &NotificationDbModel) -> TerminalUpdate {
        let attachments = self.load_attachments(&record.id).await;

        let message = match OutboundMessage::from_record(record, attachments) {
            Ok(message) => message,
            Err(e) => {
                return TerminalUpdate::failed(None, format!("malformed notification: {e}"), false);
            }
        };

        let sender = match self.router.sender_for(message.channel) {
            Ok(sender) => sender,
            Err(e) => return TerminalUpdate::failed(None, e.to_string(), e.is_retryable()),
        };
        let provider = sender.provider().to_string();

        match sender.send(&message).await {
            Ok(outcome) if outcome.success => {
                TerminalUpdate::sent(provider, outcome.message_id).with_cost(outcome.cost)
            }
            Ok(outcome) => TerminalUpdate::failed(
                Some(provider),
                outcome
                    .error
                    .unwrap_or_else(|| "provider reported failure".to_string()),
                true,
            )
            .with_cost(outcome.cost),
            Err(e) => TerminalUpdate::failed(Some(provider), e.to_string(), e.is_retryable()),
        }
    }

    /// Load attachment bytes. A failed download is logged and skipped.
    async fn load_attachments(&self, notification_id: &str) -> Vec<LoadedAttachment> {
        let rows = match self.store.list_attachments(notification_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(
                    "Failed to list attachments for notification {}: {}",
                    notification_id, e
                );
                return Vec::new();
            }
        };
        if rows.is_empty() {
            return Vec::new();
        }

        let Some(store) = &self.attachments else {
            warn!(
                "Notification {} has {} attachment(s) but no attachment store is configured",
                notification_id,
                rows.len()
            );
            return Vec::new();
        };

        let mut loaded = Vec::with_capacity(rows.len());
        for row in rows {
            match store.download(&row.storage_path).await {
                Ok(data) => loaded.push(LoadedAttachment {
                    file_name: row.file_name,
                    content_type: row.content_type,
                    inline: row.is_inline,
                    content_id: row.content_id,
                    data,
                }),
                Err(e) => warn!(
                    "Skipping attachment {} of notification {}: {}",
                    row.file_name, notification_id, e
                ),
            }
        }
        loaded
    }
}

fn interrupted(id: &str) -> Error {
    Error::Other(format!(
        "delivery of notification {id} interrupted by shutdown"
    ))
}
