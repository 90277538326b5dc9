//! Queue scheduler.
//!
//! Every `poll_interval` the scheduler claims a batch of actionable records
//! and runs each one through the [`Dispatcher`] in its own task. A failing
//! or panicking record never affects the rest of the batch. Correctness
//! across processes relies only on the store's exclusive claim.

pub mod dispatcher;

pub use dispatcher::{AttemptResult, DispatchPolicy, Dispatcher};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::database::models::NotificationDbModel;
use crate::database::repositories::{DedupKey, NotificationStore};
use crate::{Error, Result};

/// Counters for one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub sent: usize,
    pub retrying: usize,
    pub failed: usize,
    pub duplicates: usize,
    /// Records whose processing errored or panicked. A panicked record is
    /// charged a failed attempt; a store error leaves it PROCESSING for
    /// stale recovery.
    pub errors: usize,
}

impl TickReport {
    fn record(&mut self, result: AttemptResult) {
        match result {
            AttemptResult::Sent => self.sent += 1,
            AttemptResult::Retrying => self.retrying += 1,
            AttemptResult::Failed => self.failed += 1,
            AttemptResult::Duplicate => self.duplicates += 1,
        }
    }
}

/// Polls the store and drives claimed records to completion.
pub struct QueueScheduler {
    store: Arc<dyn NotificationStore>,
    dispatcher: Arc<Dispatcher>,
    poll_interval: Duration,
    batch_size: u32,
    /// Bounds concurrent deliveries within a tick.
    semaphore: Arc<Semaphore>,
    cancellation_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueueScheduler {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        dispatcher: Arc<Dispatcher>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            poll_interval: config.poll_interval().max(Duration::from_millis(1)),
            batch_size: config.batch_size,
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            cancellation_token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Claim one batch and process every record in it.
    pub async fn tick(&self) -> Result<TickReport> {
        let claimed = self
            .store
            .claim_batch(self.batch_size, self.dispatcher.policy().stale_after)
            .await?;

        let mut report = TickReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        debug!("Claimed {} notification(s)", claimed.len());

        let mut tasks = JoinSet::new();
        let mut running = HashMap::with_capacity(claimed.len());
        // Identical records claimed together run one after another, so each
        // later one sees the earlier outcome in its duplicate check.
        let mut held_back: HashMap<DedupKey, VecDeque<NotificationDbModel>> = HashMap::new();

        for record in claimed {
            let key = self.dispatcher.dedup_key(&record);
            if let Some(key) = &key {
                if let Some(queue) = held_back.get_mut(key) {
                    debug!("Holding back notification {} behind an identical one", record.id);
                    queue.push_back(record);
                    continue;
                }
                held_back.insert(key.clone(), VecDeque::new());
            }
            self.spawn_attempt(&mut tasks, &mut running, record, key)
                .await?;
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let task_id = match &joined {
                Ok((task_id, _)) => *task_id,
                Err(join_error) => join_error.id(),
            };
            let (id, key) = running
                .remove(&task_id)
                .unwrap_or_else(|| ("?".to_string(), None));

            match joined {
                Ok((_, Ok(result))) => report.record(result),
                Ok((_, Err(e))) => {
                    error!("Failed to process notification {}: {}", id, e);
                    report.errors += 1;
                }
                Err(join_error) => {
                    error!(
                        "Delivery task for notification {} panicked: {}",
                        id, join_error
                    );
                    report.errors += 1;
                    if let Err(e) = self
                        .dispatcher
                        .record_crash(&id, &join_error.to_string())
                        .await
                    {
                        error!(
                            "Failed to record crashed attempt of notification {}: {}",
                            id, e
                        );
                    }
                }
            }

            if let Some(key) = key {
                match held_back.get_mut(&key).and_then(VecDeque::pop_front) {
                    Some(next) => {
                        self.spawn_attempt(&mut tasks, &mut running, next, Some(key))
                            .await?;
                    }
                    None => {
                        held_back.remove(&key);
                    }
                }
            }
        }

        info!(
            "Scheduler tick: {} claimed, {} sent, {} retrying, {} failed, {} duplicate(s), {} error(s)",
            report.claimed,
            report.sent,
            report.retrying,
            report.failed,
            report.duplicates,
            report.errors
        );
        Ok(report)
    }

    /// Start one record's attempt once a concurrency permit is free.
    async fn spawn_attempt(
        &self,
        tasks: &mut JoinSet<Result<AttemptResult>>,
        running: &mut HashMap<task::Id, (String, Option<DedupKey>)>,
        record: NotificationDbModel,
        key: Option<DedupKey>,
    ) -> Result<()> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("scheduler semaphore closed".to_string()))?;
        let dispatcher = self.dispatcher.clone();
        let id = record.id.clone();

        let handle = tasks.spawn(async move {
            let _permit = permit;
            dispatcher.process(record).await
        });
        running.insert(handle.id(), (id, key));
        Ok(())
    }

    /// Spawn the polling loop. Calling it again while running is a no-op.
    /// A stopped scheduler stays stopped.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Queue scheduler already running");
            return;
        }

        let scheduler = self.clone();
        let token = self.cancellation_token.clone();
        info!(
            "Starting queue scheduler (interval {:?}, batch size {})",
            self.poll_interval, self.batch_size
        );

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = scheduler.tick().await {
                    error!("Scheduler tick failed: {}", e);
                }
            }
            info!("Queue scheduler stopped");
        }));
    }

    /// Stop the polling loop and wait for the in-progress tick to finish.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Queue scheduler task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
