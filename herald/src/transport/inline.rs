//! In-process delivery on background tasks.

use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::{Dispatch, Transport, TransportMode};
use crate::database::models::NotificationDbModel;
use crate::scheduler::Dispatcher;
use crate::{Error, Result};

/// Releases a record's in-flight slot when its task ends, even by panic.
struct InFlightGuard {
    ids: Arc<DashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids.remove(&self.id);
    }
}

/// Delivers each record on its own task, acting as a one-shot scheduler
/// for that record until it is terminal.
pub struct InlineTransport {
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
    in_flight: Arc<DashSet<String>>,
}

impl InlineTransport {
    pub fn new(dispatcher: Arc<Dispatcher>, max_in_flight: usize) -> Self {
        Self {
            dispatcher,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Number of records currently owned by a background task. Tasks
    /// waiting on a retry backoff count here but hold no permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[async_trait]
impl Transport for InlineTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Inline
    }

    async fn dispatch(&self, record: &NotificationDbModel) -> Result<Dispatch> {
        if self.tracker.is_closed() {
            return Err(Error::transport("inline transport is shut down"));
        }
        if !self.in_flight.insert(record.id.clone()) {
            debug!("Notification {} already has a delivery task", record.id);
            return Ok(Dispatch::Deferred);
        }

        let (tx, rx) = oneshot::channel();
        let guard = InFlightGuard {
            ids: self.in_flight.clone(),
            id: record.id.clone(),
        };
        let dispatcher = self.dispatcher.clone();
        let permits = self.permits.clone();
        let token = self.cancellation_token.clone();

        self.tracker.spawn(async move {
            let id = guard.id.as_str();
            let result = dispatcher
                .deliver_to_completion(id, &token, Some(permits.as_ref()))
                .await;

            if let Err(e) = &result {
                warn!("Inline delivery of notification {} ended with error: {}", id, e);
            }
            // The caller may have dropped its handle.
            let _ = tx.send(result);
        });

        Ok(Dispatch::InFlight(rx))
    }

    async fn shutdown(&self) {
        self.tracker.close();
        self.cancellation_token.cancel();
        self.tracker.wait().await;
        debug!("Inline transport drained");
    }
}
