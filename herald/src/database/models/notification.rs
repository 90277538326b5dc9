//! Notification database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

use crate::database::time::now_ms;
use crate::{Error, Result};

/// Persisted notification record.
///
/// Address lists and template variables are stored as JSON text.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct NotificationDbModel {
    pub id: String,
    /// EMAIL, SMS or CHAT
    pub channel_type: String,
    /// JSON array of primary recipients
    pub recipients: String,
    /// JSON array, email only
    pub cc: Option<String>,
    /// JSON array, email only
    pub bcc: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub template_name: Option<String>,
    /// JSON object of template variables
    pub template_variables: Option<String>,
    pub from_address: Option<String>,
    /// PENDING, PROCESSING, SENT, FAILED, RETRYING
    pub status: String,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub cost: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub sent_at: Option<i64>,
    /// Earliest time a RETRYING record may be claimed again.
    pub next_attempt_at: Option<i64>,
}

impl NotificationDbModel {
    /// Create a new PENDING record for the given channel and recipients.
    pub fn new(channel_type: ChannelType, recipients: &[String]) -> Result<Self> {
        let now = now_ms();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_type: channel_type.as_str().to_string(),
            recipients: serde_json::to_string(recipients)?,
            cc: None,
            bcc: None,
            subject: None,
            body: None,
            template_name: None,
            template_variables: None,
            from_address: None,
            status: NotificationStatus::Pending.as_str().to_string(),
            provider: None,
            provider_message_id: None,
            error_message: None,
            retry_count: 0,
            cost: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
            next_attempt_at: None,
        })
    }

    pub fn with_copies(mut self, cc: &[String], bcc: &[String]) -> Result<Self> {
        if !cc.is_empty() {
            self.cc = Some(serde_json::to_string(cc)?);
        }
        if !bcc.is_empty() {
            self.bcc = Some(serde_json::to_string(bcc)?);
        }
        Ok(self)
    }

    pub fn with_content(mut self, subject: Option<String>, body: Option<String>) -> Self {
        self.subject = subject;
        self.body = body;
        self
    }

    pub fn with_template(
        mut self,
        name: impl Into<String>,
        variables: &BTreeMap<String, String>,
    ) -> Result<Self> {
        self.template_name = Some(name.into());
        self.template_variables = Some(serde_json::to_string(variables)?);
        Ok(self)
    }

    pub fn with_from_address(mut self, from: Option<String>) -> Self {
        self.from_address = from;
        self
    }

    pub fn get_channel_type(&self) -> Option<ChannelType> {
        ChannelType::parse(&self.channel_type)
    }

    pub fn get_status(&self) -> Option<NotificationStatus> {
        NotificationStatus::parse(&self.status)
    }

    pub fn recipient_list(&self) -> Result<Vec<String>> {
        Ok(serde_json::from_str(&self.recipients)?)
    }

    pub fn cc_list(&self) -> Result<Vec<String>> {
        parse_address_list(self.cc.as_deref())
    }

    pub fn bcc_list(&self) -> Result<Vec<String>> {
        parse_address_list(self.bcc.as_deref())
    }

    pub fn variables(&self) -> Result<BTreeMap<String, String>> {
        match self.template_variables.as_deref() {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(BTreeMap::new()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.get_status().is_some_and(|s| s.is_terminal())
    }
}

fn parse_address_list(raw: Option<&str>) -> Result<Vec<String>> {
    match raw {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Vec::new()),
    }
}

/// Attachment metadata row, owned by a notification.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct AttachmentDbModel {
    pub id: String,
    pub notification_id: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub storage_provider: String,
    pub storage_path: String,
    pub is_inline: bool,
    pub content_id: Option<String>,
    pub created_at: i64,
}

impl AttachmentDbModel {
    pub fn new(
        notification_id: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        storage_provider: impl Into<String>,
        storage_path: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: notification_id.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            size_bytes: 0,
            storage_provider: storage_provider.into(),
            storage_path: storage_path.into(),
            is_inline: false,
            content_id: None,
            created_at: now_ms(),
        }
    }
}

/// Delivery status of a notification.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Retrying,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            "RETRYING" => Some(Self::Retrying),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the delivery state machine.
    ///
    /// `Processing -> Pending` is only taken by stale-claim recovery.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Retrying, Processing)
                | (Processing, Sent)
                | (Processing, Retrying)
                | (Processing, Failed)
                | (Processing, Pending)
        )
    }

    pub fn all() -> [Self; 5] {
        [
            Self::Pending,
            Self::Processing,
            Self::Sent,
            Self::Failed,
            Self::Retrying,
        ]
    }
}

/// Delivery channel types.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    Email,
    Sms,
    Chat,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Chat => "CHAT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EMAIL" => Some(Self::Email),
            "SMS" => Some(Self::Sms),
            "CHAT" => Some(Self::Chat),
            _ => None,
        }
    }

    /// Only email carries secondary and blind-copy recipients.
    pub fn supports_copies(&self) -> bool {
        matches!(self, Self::Email)
    }
}

/// Per-status record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub retrying: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.sent + self.failed + self.retrying
    }

    pub(crate) fn add(&mut self, status: &str, count: i64) -> Result<()> {
        let count = u64::try_from(count).unwrap_or(0);
        match NotificationStatus::parse(status) {
            Some(NotificationStatus::Pending) => self.pending += count,
            Some(NotificationStatus::Processing) => self.processing += count,
            Some(NotificationStatus::Sent) => self.sent += count,
            Some(NotificationStatus::Failed) => self.failed += count,
            Some(NotificationStatus::Retrying) => self.retrying += count,
            None => {
                return Err(Error::Other(format!(
                    "unknown notification status in store: {status}"
                )));
            }
        }
        Ok(())
    }
}
