//! Channel senders.
//!
//! A [`ChannelSender`] performs the actual per-channel delivery. The
//! [`ChannelRouter`] maps each [`ChannelType`] to the sender configured for
//! it and is built once at startup.
//!
//! Reference senders:
//! - [`LogSender`]: logs the message and reports success (dry runs)
//! - [`WebhookSender`]: posts the message as JSON to an HTTP endpoint

mod log;
mod webhook;

pub use log::LogSender;
pub use webhook::{WebhookAuth, WebhookConfig, WebhookSender};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::database::models::{ChannelType, NotificationDbModel};
use crate::{Error, Result};

/// Attachment content loaded from the attachment store.
#[derive(Debug, Clone)]
pub struct LoadedAttachment {
    pub file_name: String,
    pub content_type: String,
    pub inline: bool,
    pub content_id: Option<String>,
    pub data: Bytes,
}

/// Message handed to a channel sender.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub notification_id: String,
    pub channel: ChannelType,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub from_address: Option<String>,
    pub attachments: Vec<LoadedAttachment>,
}

impl OutboundMessage {
    /// Build the message for a claimed record.
    pub fn from_record(
        record: &NotificationDbModel,
        attachments: Vec<LoadedAttachment>,
    ) -> Result<Self> {
        let channel = record.get_channel_type().ok_or_else(|| {
            Error::validation(format!("unknown channel type '{}'", record.channel_type))
        })?;
        Ok(Self {
            notification_id: record.id.clone(),
            channel,
            recipients: record.recipient_list()?,
            cc: record.cc_list()?,
            bcc: record.bcc_list()?,
            subject: record.subject.clone(),
            body: record.body.clone(),
            from_address: record.from_address.clone(),
            attachments,
        })
    }
}

/// What a sender reports about one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub cost: Option<f64>,
}

impl SendOutcome {
    pub fn delivered(message_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id,
            error: None,
            cost: None,
        }
    }

    /// The provider answered but refused the message. Retried like a
    /// transient failure.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Trait for channel senders.
///
/// Returning `Err(Error::Configuration(_))` marks the record FAILED without
/// retrying. Any other error is treated as transient.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Provider name recorded on the notification.
    fn provider(&self) -> &str;

    async fn send(&self, message: &OutboundMessage) -> Result<SendOutcome>;
}

/// Routes each channel type to its sender.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    senders: HashMap<ChannelType, Arc<dyn ChannelSender>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sender(mut self, channel: ChannelType, sender: Arc<dyn ChannelSender>) -> Self {
        self.register(channel, sender);
        self
    }

    pub fn register(&mut self, channel: ChannelType, sender: Arc<dyn ChannelSender>) {
        self.senders.insert(channel, sender);
    }

    /// Sender for `channel`. A missing sender is a configuration error.
    pub fn sender_for(&self, channel: ChannelType) -> Result<Arc<dyn ChannelSender>> {
        self.senders
            .get(&channel)
            .cloned()
            .ok_or_else(|| Error::config(format!("no sender configured for {channel} channel")))
    }

    pub fn channels(&self) -> Vec<ChannelType> {
        let mut channels: Vec<_> = self.senders.keys().copied().collect();
        channels.sort_by_key(|c| c.as_str());
        channels
    }
}

impl std::fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes: Vec<_> = self
            .channels()
            .into_iter()
            .filter_map(|c| self.senders.get(&c).map(|s| (c, s.provider().to_string())))
            .collect();
        f.debug_struct("ChannelRouter").field("routes", &routes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_missing_sender_is_configuration_error() {
        let router = ChannelRouter::new().with_sender(ChannelType::Sms, Arc::new(LogSender::new()));
        assert!(router.sender_for(ChannelType::Sms).is_ok());

        let err = router.sender_for(ChannelType::Email).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_outbound_message_from_record() {
        let record = NotificationDbModel::new(ChannelType::Email, &["a@example.com".to_string()])
            .unwrap()
            .with_copies(&[], &["audit@example.com".to_string()])
            .unwrap()
            .with_content(Some("Hi".to_string()), Some("Body".to_string()));

        let message = OutboundMessage::from_record(&record, Vec::new()).unwrap();
        assert_eq!(message.notification_id, record.id);
        assert_eq!(message.recipients, vec!["a@example.com"]);
        assert_eq!(message.bcc, vec!["audit@example.com"]);
        assert!(message.cc.is_empty());
        assert_eq!(message.body.as_deref(), Some("Body"));
    }
}
