//! Delivery transports.
//!
//! Once a record is persisted, the deployment's transport decides who
//! drives it:
//! - [`QueueTransport`]: nobody yet; the queue scheduler claims it later
//! - [`InlineTransport`]: a background task in this process, right away
//! - [`RelayTransport`]: an external consumer, via a broker publish
//!
//! The service only sees `Arc<dyn Transport>`.

mod inline;
mod queue;
mod relay;

pub use inline::InlineTransport;
pub use queue::QueueTransport;
pub use relay::{
    BrokerPublisher, DeliveryReport, HttpBrokerPublisher, RelayEnvelope, RelayReceiver,
    RelayTransport,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::config::InlineConfig;
use crate::database::models::NotificationDbModel;
use crate::domain::DeliveryOutcome;
use crate::scheduler::Dispatcher;
use crate::{Error, Result};

/// Delivery mode, fixed per deployment.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Persist and leave the record to the queue scheduler.
    #[default]
    Queue,
    /// Persist and deliver on a background task in this process.
    Inline,
    /// Persist and publish to an external broker.
    Relay,
}

/// What a transport did with a freshly persisted record.
#[derive(Debug)]
pub enum Dispatch {
    /// Left PENDING for the scheduler.
    Deferred,
    /// Delivery started; resolves once the record is terminal.
    InFlight(oneshot::Receiver<Result<DeliveryOutcome>>),
    /// Handed to the broker.
    Published { message_id: Option<String> },
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn mode(&self) -> TransportMode;

    async fn dispatch(&self, record: &NotificationDbModel) -> Result<Dispatch>;

    /// Stop accepting work and wait for background deliveries to settle.
    async fn shutdown(&self) {}
}

/// Collaborators a transport may need.
pub struct TransportDeps<'a> {
    pub dispatcher: Arc<Dispatcher>,
    pub inline: &'a InlineConfig,
    pub publisher: Option<Arc<dyn BrokerPublisher>>,
    pub topic: Option<String>,
}

/// Build the transport for `mode`.
pub fn build_transport(mode: TransportMode, deps: TransportDeps<'_>) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match mode {
        TransportMode::Queue => Arc::new(QueueTransport),
        TransportMode::Inline => Arc::new(InlineTransport::new(
            deps.dispatcher,
            deps.inline.max_in_flight,
        )),
        TransportMode::Relay => {
            let publisher = deps
                .publisher
                .ok_or_else(|| Error::config("relay mode requires a broker publisher"))?;
            let topic = deps
                .topic
                .ok_or_else(|| Error::config("relay mode requires a broker topic"))?;
            Arc::new(RelayTransport::new(publisher, topic))
        }
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_mode_names() {
        assert_eq!("queue".parse::<TransportMode>().unwrap(), TransportMode::Queue);
        assert_eq!("INLINE".parse::<TransportMode>().unwrap(), TransportMode::Inline);
        assert_eq!(TransportMode::Relay.to_string(), "relay");
        assert!("kafka".parse::<TransportMode>().is_err());

        let json = serde_json::to_string(&TransportMode::Inline).unwrap();
        assert_eq!(json, "\"inline\"");
    }
}
