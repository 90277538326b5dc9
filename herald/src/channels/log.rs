//! Sender that only logs.

use async_trait::async_trait;
use tracing::info;

use super::{ChannelSender, OutboundMessage, SendOutcome};
use crate::Result;

/// Logs each message and reports it delivered.
#[derive(Debug, Clone)]
pub struct LogSender {
    provider: String,
}

impl LogSender {
    pub fn new() -> Self {
        Self::named("log")
    }

    pub fn named(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

impl Default for LogSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelSender for LogSender {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendOutcome> {
        info!(
            notification_id = %message.notification_id,
            channel = %message.channel,
            recipients = message.recipients.len(),
            attachments = message.attachments.len(),
            "Delivering {} notification: {}",
            message.channel,
            message.subject.as_deref().unwrap_or("(no subject)")
        );
        Ok(SendOutcome::delivered(Some(format!(
            "{}-{}",
            self.provider,
            uuid::Uuid::new_v4()
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::ChannelType;

    #[tokio::test]
    async fn test_log_sender_always_succeeds() {
        let sender = LogSender::named("dry-run");
        let message = OutboundMessage {
            notification_id: "n-1".to_string(),
            channel: ChannelType::Sms,
            recipients: vec!["+15550100".to_string()],
            cc: vec![],
            bcc: vec![],
            subject: None,
            body: Some("code 1234".to_string()),
            from_address: None,
            attachments: vec![],
        };

        let outcome = sender.send(&message).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.message_id.unwrap().starts_with("dry-run-"));
        assert_eq!(sender.provider(), "dry-run");
    }
}
