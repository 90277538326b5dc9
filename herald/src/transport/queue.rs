use async_trait::async_trait;

use super::{Dispatch, Transport, TransportMode};
use crate::Result;
use crate::database::models::NotificationDbModel;

/// Leaves records PENDING for the queue scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueTransport;

#[async_trait]
impl Transport for QueueTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Queue
    }

    async fn dispatch(&self, _record: &NotificationDbModel) -> Result<Dispatch> {
        Ok(Dispatch::Deferred)
    }
}
