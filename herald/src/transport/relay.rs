//! Broker relay.
//!
//! The relay transport publishes a small envelope per persisted record. An
//! external consumer picks it up and reports back through [`RelayReceiver`],
//! which applies the store's claim and status-update contract. Redelivered
//! reports for records that are no longer claimable are rejected and have
//! no effect.

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Dispatch, Transport, TransportMode};
use crate::config::BrokerConfig;
use crate::database::models::{ChannelType, NotificationDbModel, NotificationStatus};
use crate::database::repositories::TerminalUpdate;
use crate::domain::DeliveryOutcome;
use crate::scheduler::Dispatcher;
use crate::{Error, Result};

/// Message published for each relayed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub notification_id: String,
    pub channel: ChannelType,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub retry_count: u32,
}

impl RelayEnvelope {
    pub fn from_record(record: &NotificationDbModel) -> Result<Self> {
        let channel = record.get_channel_type().ok_or_else(|| {
            Error::validation(format!("unknown channel type '{}'", record.channel_type))
        })?;
        Ok(Self {
            notification_id: record.id.clone(),
            channel,
            created_at: record.created_at,
            retry_count: u32::try_from(record.retry_count).unwrap_or(0),
        })
    }
}

/// Publishes envelopes to a message broker.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Returns the broker's message id when it reports one.
    async fn publish(&self, topic: &str, envelope: &RelayEnvelope) -> Result<Option<String>>;
}

/// Publishes envelopes as JSON to an HTTP broker endpoint.
pub struct HttpBrokerPublisher {
    config: BrokerConfig,
    client: Client,
}

impl HttpBrokerPublisher {
    pub fn new(config: BrokerConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

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

        if let Some(token) = &self.config.auth_token {
            if let Ok(value) = format!("Bearer {}", token).parse() {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }

        headers
    }

    fn build_payload(topic: &str, envelope: &RelayEnvelope) -> serde_json::Value {
        json!({
            "topic": topic,
            "key": envelope.notification_id,
            "payload": envelope,
        })
    }
}

#[async_trait]
impl BrokerPublisher for HttpBrokerPublisher {
    async fn publish(&self, topic: &str, envelope: &RelayEnvelope) -> Result<Option<String>> {
        let response = self
            .client
            .post(&self.config.url)
            .headers(self.build_headers())
            .json(&Self::build_payload(topic, envelope))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!("Broker publish failed: {} - {}", status, body);
            return Err(Error::transport(format!(
                "broker publish failed: {} - {}",
                status, body
            )));
        }

        let message_id = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("message_id")
                    .or_else(|| v.get("id"))
                    .and_then(|id| id.as_str().map(str::to_string))
            });
        Ok(message_id)
    }
}

/// Publishes each persisted record for an external consumer.
pub struct RelayTransport {
    publisher: Arc<dyn BrokerPublisher>,
    topic: String,
}

impl RelayTransport {
    pub fn new(publisher: Arc<dyn BrokerPublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Relay
    }

    async fn dispatch(&self, record: &NotificationDbModel) -> Result<Dispatch> {
        let envelope = RelayEnvelope::from_record(record)?;
        let message_id = self.publisher.publish(&self.topic, &envelope).await?;
        debug!(
            "Published notification {} to {} ({:?})",
            record.id, self.topic, message_id
        );
        Ok(Dispatch::Published { message_id })
    }
}

/// What the external consumer reports for a relayed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryReport {
    /// Ask this process to perform the send.
    Dispatch,
    /// The consumer delivered the message itself.
    Delivered {
        provider: String,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        cost: Option<f64>,
    },
    /// The consumer's attempt failed.
    Failed {
        #[serde(default)]
        provider: Option<String>,
        error: String,
        #[serde(default = "default_retryable")]
        retryable: bool,
    },
}

fn default_retryable() -> bool {
    true
}

/// Store-side entry point for the relay consumer.
#[derive(Clone)]
pub struct RelayReceiver {
    dispatcher: Arc<Dispatcher>,
}

impl RelayReceiver {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Claim the record and apply `report` to it.
    ///
    /// Fails with `InvalidStateTransition` when the record is terminal,
    /// held by another worker, or still waiting out its backoff.
    pub async fn apply(&self, id: &str, report: DeliveryReport) -> Result<DeliveryOutcome> {
        let store = self.dispatcher.store();
        let Some(record) = store.claim(id).await? else {
            let current = store.get(id).await?;
            return Err(Error::invalid_transition(
                current.status,
                NotificationStatus::Processing,
            ));
        };

        match report {
            DeliveryReport::Dispatch => {
                self.dispatcher.process_contained(record).await?;
            }
            DeliveryReport::Delivered {
                provider,
                message_id,
                cost,
            } => {
                let update = TerminalUpdate::sent(provider, message_id).with_cost(cost);
                store
                    .mark_terminal(id, &update, &self.dispatcher.policy().retry)
                    .await?;
            }
            DeliveryReport::Failed {
                provider,
                error,
                retryable,
            } => {
                let update = TerminalUpdate::failed(provider, error, retryable);
                store
                    .mark_terminal(id, &update, &self.dispatcher.policy().retry)
                    .await?;
            }
        }

        let outcome = DeliveryOutcome::from_record(&store.get(id).await?)?;
        info!(
            "Relay report applied to notification {}: {}",
            id, outcome.status
        );
        Ok(outcome)
    }
}
