//! Notification requests and their persisted view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::database::models::{
    AttachmentDbModel, ChannelType, NotificationDbModel, NotificationStatus,
};
use crate::database::time::ms_to_datetime;
use crate::{Error, Result};

/// Reference to a named template and the variables to render it with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Reference to an attachment already uploaded to an attachment store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub file_name: String,
    pub content_type: String,
    #[serde(default)]
    pub size_bytes: u64,
    pub storage_provider: String,
    pub storage_path: String,
    #[serde(default)]
    pub inline: bool,
    #[serde(default)]
    pub content_id: Option<String>,
}

impl AttachmentRef {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        storage_provider: impl Into<String>,
        storage_path: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            size_bytes: 0,
            storage_provider: storage_provider.into(),
            storage_path: storage_path.into(),
            inline: false,
            content_id: None,
        }
    }

    pub(crate) fn to_db_model(&self, notification_id: &str) -> AttachmentDbModel {
        let mut model = AttachmentDbModel::new(
            notification_id,
            &self.file_name,
            &self.content_type,
            &self.storage_provider,
            &self.storage_path,
        );
        model.size_bytes = i64::try_from(self.size_bytes).unwrap_or(i64::MAX);
        model.is_inline = self.inline;
        model.content_id = self.content_id.clone();
        model
    }
}

/// A caller's request to deliver one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub channel: ChannelType,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub template: Option<TemplateRef>,
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl NotificationRequest {
    pub fn new(channel: ChannelType, recipients: Vec<String>) -> Self {
        Self {
            channel,
            recipients,
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: None,
            body: None,
            template: None,
            from_address: None,
            attachments: Vec::new(),
        }
    }

    pub fn email(recipient: impl Into<String>) -> Self {
        Self::new(ChannelType::Email, vec![recipient.into()])
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_template(
        mut self,
        name: impl Into<String>,
        variables: BTreeMap<String, String>,
    ) -> Self {
        self.template = Some(TemplateRef {
            name: name.into(),
            variables,
        });
        self
    }

    pub fn with_cc(mut self, cc: Vec<String>) -> Self {
        self.cc = cc;
        self
    }

    pub fn with_bcc(mut self, bcc: Vec<String>) -> Self {
        self.bcc = bcc;
        self
    }

    pub fn with_from_address(mut self, from: impl Into<String>) -> Self {
        self.from_address = Some(from.into());
        self
    }

    pub fn with_attachment(mut self, attachment: AttachmentRef) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Structural checks that need no collaborators.
    ///
    /// Template resolution is checked separately by the service.
    pub fn validate(&self) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(Error::validation("at least one recipient is required"));
        }
        let mut all = self.recipients.iter().chain(&self.cc).chain(&self.bcc);
        if all.any(|r| r.trim().is_empty()) {
            return Err(Error::validation("recipient addresses must not be blank"));
        }
        if !self.channel.supports_copies() && (!self.cc.is_empty() || !self.bcc.is_empty()) {
            return Err(Error::validation(format!(
                "{} notifications do not support cc/bcc recipients",
                self.channel
            )));
        }
        if self.subject.is_none() && self.body.is_none() && self.template.is_none() {
            return Err(Error::validation(
                "a subject, body or template reference is required",
            ));
        }
        if let Some(template) = &self.template {
            if template.name.trim().is_empty() {
                return Err(Error::validation("template name must not be blank"));
            }
        }
        if let Some(attachment) = self
            .attachments
            .iter()
            .find(|a| a.storage_path.trim().is_empty() || a.file_name.trim().is_empty())
        {
            return Err(Error::validation(format!(
                "attachment '{}' needs a file name and storage path",
                attachment.file_name
            )));
        }
        Ok(())
    }
}

/// Typed view of a persisted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub channel: ChannelType,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub template_name: Option<String>,
    pub template_variables: BTreeMap<String, String>,
    pub from_address: Option<String>,
    pub status: NotificationStatus,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub cost: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl TryFrom<NotificationDbModel> for Notification {
    type Error = Error;

    fn try_from(model: NotificationDbModel) -> Result<Self> {
        let channel = model.get_channel_type().ok_or_else(|| {
            Error::validation(format!("unknown channel type '{}'", model.channel_type))
        })?;
        let status = model
            .get_status()
            .ok_or_else(|| Error::validation(format!("unknown status '{}'", model.status)))?;

        Ok(Self {
            recipients: model.recipient_list()?,
            cc: model.cc_list()?,
            bcc: model.bcc_list()?,
            template_variables: model.variables()?,
            channel,
            status,
            retry_count: u32::try_from(model.retry_count).unwrap_or(0),
            created_at: ms_to_datetime(model.created_at),
            updated_at: ms_to_datetime(model.updated_at),
            sent_at: model.sent_at.map(ms_to_datetime),
            next_attempt_at: model.next_attempt_at.map(ms_to_datetime),
            id: model.id,
            subject: model.subject,
            body: model.body,
            template_name: model.template_name,
            from_address: model.from_address,
            provider: model.provider,
            provider_message_id: model.provider_message_id,
            error_message: model.error_message,
            cost: model.cost,
        })
    }
}

/// Result of driving one record through a delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub id: String,
    pub status: NotificationStatus,
    pub retry_count: u32,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    /// Suppressed as a duplicate of an earlier delivery.
    pub duplicate: bool,
}

/// Provider message id stored on records suppressed as duplicates.
pub const DUPLICATE_SUPPRESSED: &str = "DUPLICATE_SUPPRESSED";

impl DeliveryOutcome {
    pub fn from_record(record: &NotificationDbModel) -> Result<Self> {
        let status = record
            .get_status()
            .ok_or_else(|| Error::validation(format!("unknown status '{}'", record.status)))?;
        Ok(Self {
            id: record.id.clone(),
            status,
            retry_count: u32::try_from(record.retry_count).unwrap_or(0),
            provider: record.provider.clone(),
            provider_message_id: record.provider_message_id.clone(),
            error_message: record.error_message.clone(),
            duplicate: record.provider_message_id.as_deref() == Some(DUPLICATE_SUPPRESSED),
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == NotificationStatus::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_recipients() {
        let request = NotificationRequest::new(ChannelType::Sms, vec![]).with_body("hi");
        assert!(matches!(request.validate(), Err(Error::Validation(_))));

        let request =
            NotificationRequest::new(ChannelType::Sms, vec!["  ".to_string()]).with_body("hi");
        assert!(matches!(request.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_requires_payload() {
        let request = NotificationRequest::email("a@example.com");
        assert!(request.validate().is_err());
        assert!(request.clone().with_subject("Hello").validate().is_ok());
        assert!(
            request
                .with_template("welcome", BTreeMap::new())
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_copies_only_for_email() {
        let request = NotificationRequest::new(ChannelType::Chat, vec!["#ops".to_string()])
            .with_body("deploy finished")
            .with_cc(vec!["#dev".to_string()]);
        assert!(request.validate().is_err());

        let request = NotificationRequest::email("a@example.com")
            .with_body("hi")
            .with_bcc(vec!["audit@example.com".to_string()]);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_attachment_needs_path() {
        let request = NotificationRequest::email("a@example.com")
            .with_body("see attached")
            .with_attachment(AttachmentRef::new("report.pdf", "application/pdf", "local", ""));
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_notification_from_db_model() {
        let mut vars = BTreeMap::new();
        vars.insert("name".to_string(), "Ada".to_string());
        let model = NotificationDbModel::new(ChannelType::Email, &["a@example.com".to_string()])
            .unwrap()
            .with_content(Some("Hi".to_string()), Some("Body".to_string()))
            .with_template("welcome", &vars)
            .unwrap();

        let notification = Notification::try_from(model.clone()).unwrap();
        assert_eq!(notification.id, model.id);
        assert_eq!(notification.channel, ChannelType::Email);
        assert_eq!(notification.status, NotificationStatus::Pending);
        assert_eq!(notification.template_variables.get("name").unwrap(), "Ada");
        assert!(notification.sent_at.is_none());
    }

    #[test]
    fn test_outcome_flags_duplicates() {
        let mut model =
            NotificationDbModel::new(ChannelType::Sms, &["+15550100".to_string()]).unwrap();
        model.status = "SENT".to_string();
        model.provider_message_id = Some(DUPLICATE_SUPPRESSED.to_string());
        let outcome = DeliveryOutcome::from_record(&model).unwrap();
        assert!(outcome.is_success());
        assert!(outcome.duplicate);
    }
}
