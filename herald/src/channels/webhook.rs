//! Webhook sender for chat-like channels.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{ChannelSender, OutboundMessage, SendOutcome};
use crate::{Error, Result};

/// Webhook sender configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Webhook URL.
    pub url: String,
    /// Custom headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Authentication type.
    pub auth: Option<WebhookAuth>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Provider name recorded on delivered notifications.
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_timeout() -> u64 {
    30
}

fn default_provider() -> String {
    "webhook".to_string()
}

/// Webhook authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    /// Bearer token authentication.
    Bearer { token: String },
    /// Basic authentication.
    Basic { username: String, password: String },
    /// Custom header authentication.
    Header { name: String, value: String },
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: Vec::new(),
            auth: None,
            timeout_secs: default_timeout(),
            provider: default_provider(),
        }
    }
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Posts each message as JSON to a webhook URL.
pub struct WebhookSender {
    config: WebhookConfig,
    client: Client,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    /// Build the request headers.
    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        if let Some(auth) = &self.config.auth {
            match auth {
                WebhookAuth::Bearer { token } => {
                    if let Ok(value) = format!("Bearer {}", token).parse() {
                        headers.insert(reqwest::header::AUTHORIZATION, value);
                    }
                }
                WebhookAuth::Header { name, value } => {
                    if let (Ok(name), Ok(value)) = (
                        name.parse::<reqwest::header::HeaderName>(),
                        value.parse::<reqwest::header::HeaderValue>(),
                    ) {
                        headers.insert(name, value);
                    }
                }
                // Applied on the request builder.
                WebhookAuth::Basic { .. } => {}
            }
        }

        headers
    }

    /// Build the JSON payload.
    fn build_payload(&self, message: &OutboundMessage) -> serde_json::Value {
        let attachments: Vec<_> = message
            .attachments
            .iter()
            .map(|a| {
                json!({
                    "file_name": a.file_name,
                    "content_type": a.content_type,
                    "size": a.data.len(),
                    "inline": a.inline,
                })
            })
            .collect();

        json!({
            "id": message.notification_id,
            "channel": message.channel.as_str(),
            "recipients": message.recipients,
            "from": message.from_address,
            "subject": message.subject,
            "body": message.body,
            "attachments": attachments,
        })
    }
}

/// Map a non-success response status to an error.
///
/// Authentication and addressing failures will not fix themselves on retry.
fn classify_failure(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            Error::config(format!("webhook rejected request: {} - {}", status, body))
        }
        _ => Error::transport(format!("webhook failed: {} - {}", status, body)),
    }
}

/// Provider message id from a JSON response body, if any.
fn extract_message_id(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["message_id", "id", "ts"]
        .iter()
        .find_map(|key| match value.get(*key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[async_trait]
impl ChannelSender for WebhookSender {
    fn provider(&self) -> &str {
        &self.config.provider
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendOutcome> {
        if self.config.url.is_empty() {
            return Err(Error::config("webhook url is not configured"));
        }

        let payload = self.build_payload(message);
        let mut request = self
            .client
            .post(&self.config.url)
            .headers(self.build_headers())
            .json(&payload);

        if let Some(WebhookAuth::Basic { username, password }) = &self.config.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(
                "Webhook delivery of {} failed: {} - {}",
                message.notification_id, status, body
            );
            return Err(classify_failure(status, &body));
        }

        debug!("Webhook notification {} delivered", message.notification_id);
        Ok(SendOutcome::delivered(extract_message_id(&body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::LoadedAttachment;
    use crate::database::models::ChannelType;

    fn message() -> OutboundMessage {
        OutboundMessage {
            notification_id: "n-1".to_string(),
            channel: ChannelType::Chat,
            recipients: vec!["#ops".to_string()],
            cc: vec![],
            bcc: vec![],
            subject: Some("Deploy".to_string()),
            body: Some("v1.2 is live".to_string()),
            from_address: None,
            attachments: vec![LoadedAttachment {
                file_name: "log.txt".to_string(),
                content_type: "text/plain".to_string(),
                inline: false,
                content_id: None,
                data: bytes::Bytes::from_static(b"hello"),
            }],
        }
    }

    #[test]
    fn test_webhook_config_default() {
        let config = WebhookConfig::default();
        assert!(config.url.is_empty());
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.provider, "webhook");
    }

    #[test]
    fn test_build_payload() {
        let sender = WebhookSender::new(WebhookConfig::new("https://example.com/hook"));
        let payload = sender.build_payload(&message());
        assert_eq!(payload["id"], "n-1");
        assert_eq!(payload["channel"], "CHAT");
        assert_eq!(payload["recipients"][0], "#ops");
        assert_eq!(payload["attachments"][0]["size"], 5);
    }

    #[test]
    fn test_build_headers_with_bearer() {
        let config = WebhookConfig {
            url: "https://example.com/webhook".to_string(),
            auth: Some(WebhookAuth::Bearer {
                token: "test-token".to_string(),
            }),
            headers: vec![("X-Team".to_string(), "ops".to_string())],
            ..Default::default()
        };
        let sender = WebhookSender::new(config);
        let headers = sender.build_headers();

        assert_eq!(headers[reqwest::header::AUTHORIZATION], "Bearer test-token");
        assert_eq!(headers["x-team"], "ops");
    }

    #[test]
    fn test_failure_classification() {
        assert!(!classify_failure(StatusCode::UNAUTHORIZED, "").is_retryable());
        assert!(!classify_failure(StatusCode::NOT_FOUND, "").is_retryable());
        assert!(classify_failure(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_failure(StatusCode::BAD_GATEWAY, "").is_retryable());
    }

    #[test]
    fn test_extract_message_id() {
        assert_eq!(extract_message_id(r#"{"id": "abc"}"#).as_deref(), Some("abc"));
        assert_eq!(extract_message_id(r#"{"message_id": 42}"#).as_deref(), Some("42"));
        assert_eq!(extract_message_id("ok"), None);
    }

    #[tokio::test]
    async fn test_missing_url_is_configuration_error() {
        let sender = WebhookSender::new(WebhookConfig::default());
        let err = sender.send(&message()).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
