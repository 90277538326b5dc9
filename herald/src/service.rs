//! Notification service.
//!
//! The single entry point for callers: validates a request, renders its
//! template, persists the record and hands it to the deployment's
//! transport. Validation failures are returned before anything is written.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attachments::AttachmentStore;
use crate::channels::ChannelRouter;
use crate::config::HeraldConfig;
use crate::database::models::{NotificationDbModel, StatusCounts};
use crate::database::repositories::NotificationStore;
use crate::domain::{DeliveryOutcome, Notification, NotificationRequest};
use crate::scheduler::{Dispatcher, QueueScheduler};
use crate::templates::TemplateResolver;
use crate::transport::{
    BrokerPublisher, Dispatch, HttpBrokerPublisher, RelayReceiver, Transport, TransportDeps,
    TransportMode, build_transport,
};
use crate::{Error, Result};

/// Upper bound on records re-dispatched by one startup drain.
const RECOVERY_SCAN_LIMIT: u32 = 10_000;

/// Collaborators supplied by the embedding application.
pub struct ServiceDeps {
    pub store: Arc<dyn NotificationStore>,
    pub router: ChannelRouter,
    pub templates: Arc<dyn TemplateResolver>,
    pub attachments: Option<Arc<dyn AttachmentStore>>,
    /// Overrides the HTTP publisher built from the broker config.
    pub publisher: Option<Arc<dyn BrokerPublisher>>,
}

/// Handle returned by [`NotificationService::submit`].
#[derive(Debug)]
pub struct SubmitHandle {
    id: String,
    mode: TransportMode,
    dispatch: Dispatch,
}

impl SubmitHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// Immediate acknowledgement for the caller.
    pub fn acknowledgement(&self) -> &'static str {
        match self.dispatch {
            Dispatch::Deferred => "queued",
            Dispatch::InFlight(_) => "dispatching",
            Dispatch::Published { .. } => "published",
        }
    }

    pub fn published_message_id(&self) -> Option<&str> {
        match &self.dispatch {
            Dispatch::Published { message_id } => message_id.as_deref(),
            _ => None,
        }
    }

    /// Wait for the final outcome of an inline delivery.
    ///
    /// Queued and relayed submissions have no local outcome and return
    /// `None`; read the record later instead.
    pub async fn outcome(self) -> Result<Option<DeliveryOutcome>> {
        match self.dispatch {
            Dispatch::InFlight(rx) => match rx.await {
                Ok(result) => result.map(Some),
                Err(_) => Err(Error::Other(format!(
                    "delivery task for notification {} ended without an outcome",
                    self.id
                ))),
            },
            Dispatch::Deferred | Dispatch::Published { .. } => Ok(None),
        }
    }
}

pub struct NotificationService {
    mode: TransportMode,
    store: Arc<dyn NotificationStore>,
    templates: Arc<dyn TemplateResolver>,
    attachments: Option<Arc<dyn AttachmentStore>>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    scheduler: Option<Arc<QueueScheduler>>,
    relay_receiver: Option<RelayReceiver>,
    sweeper: Sweeper,
    sweep_token: CancellationToken,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationService {
    pub fn new(config: &HeraldConfig, deps: ServiceDeps) -> Result<Self> {
        config.validate()?;

        let dispatcher = Arc::new(Dispatcher::new(
            deps.store.clone(),
            deps.router,
            deps.attachments.clone(),
            config.scheduler.dispatch_policy(),
        ));

        let publisher = match (deps.publisher, &config.broker) {
            (Some(publisher), _) => Some(publisher),
            (None, Some(broker)) if config.mode == TransportMode::Relay => {
                Some(Arc::new(HttpBrokerPublisher::new(broker.clone())) as Arc<dyn BrokerPublisher>)
            }
            (None, _) => None,
        };

        let transport = build_transport(
            config.mode,
            TransportDeps {
                dispatcher: dispatcher.clone(),
                inline: &config.inline,
                publisher,
                topic: config.broker.as_ref().map(|b| b.topic.clone()),
            },
        )?;

        let scheduler = (config.mode == TransportMode::Queue).then(|| {
            Arc::new(QueueScheduler::new(
                deps.store.clone(),
                dispatcher.clone(),
                &config.scheduler,
            ))
        });
        let relay_receiver = (config.mode == TransportMode::Relay)
            .then(|| RelayReceiver::new(dispatcher.clone()));
        let sweeper = Sweeper {
            store: deps.store.clone(),
            transport: transport.clone(),
            stale_after: config.scheduler.stale_after(),
        };

        Ok(Self {
            mode: config.mode,
            store: deps.store,
            templates: deps.templates,
            attachments: deps.attachments,
            dispatcher,
            transport,
            scheduler,
            relay_receiver,
            sweeper,
            sweep_token: CancellationToken::new(),
            sweep_handle: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    /// The queue scheduler, in queue mode.
    pub fn scheduler(&self) -> Option<&Arc<QueueScheduler>> {
        self.scheduler.as_ref()
    }

    /// Entry point for the broker consumer, in relay mode.
    pub fn relay_receiver(&self) -> Option<RelayReceiver> {
        self.relay_receiver.clone()
    }

    /// Validate, persist and dispatch a request.
    pub async fn submit(&self, request: NotificationRequest) -> Result<SubmitHandle> {
        request.validate()?;

        let rendered = match &request.template {
            Some(template) => Some(
                self.templates
                    .resolve(&template.name, &template.variables)
                    .await?,
            ),
            None => None,
        };

        let record = self.build_record(&request, rendered)?;
        let attachments: Vec<_> = request
            .attachments
            .iter()
            .map(|a| a.to_db_model(&record.id))
            .collect();

        let id = self.store.create(&record, &attachments).await?;

        let dispatch = match self.transport.dispatch(&record).await {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!("Dispatch of notification {} failed: {}", id, e);
                let message = format!("{} dispatch failed: {}", self.mode, e);
                if let Err(record_err) = self.store.record_error(&id, &message).await {
                    error!(
                        "Failed to record dispatch error on notification {}: {}",
                        id, record_err
                    );
                }
                return Err(e);
            }
        };

        info!(
            "Accepted {} notification {} ({} mode)",
            request.channel, id, self.mode
        );
        Ok(SubmitHandle {
            id,
            mode: self.mode,
            dispatch,
        })
    }

    fn build_record(
        &self,
        request: &NotificationRequest,
        rendered: Option<crate::templates::RenderedTemplate>,
    ) -> Result<NotificationDbModel> {
        let (subject, body) = match rendered {
            Some(rendered) => (request.subject.clone().or(rendered.subject), Some(rendered.body)),
            None => (request.subject.clone(), request.body.clone()),
        };

        let mut record = NotificationDbModel::new(request.channel, &request.recipients)?
            .with_copies(&request.cc, &request.bcc)?
            .with_content(subject, body)
            .with_from_address(request.from_address.clone());
        if let Some(template) = &request.template {
            record = record.with_template(&template.name, &template.variables)?;
        }
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Notification> {
        Notification::try_from(self.store.get(id).await?)
    }

    pub async fn stats(&self) -> Result<StatusCounts> {
        self.store.count_by_status().await
    }

    /// Delete a record, its attachment rows and the stored attachment blobs.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let attachments = self.store.list_attachments(id).await?;
        self.store.delete(id).await?;

        if let Some(store) = &self.attachments {
            for attachment in attachments
                .iter()
                .filter(|a| a.storage_provider == store.provider())
            {
                if let Err(e) = store.delete(&attachment.storage_path).await {
                    warn!(
                        "Failed to delete attachment {} of notification {}: {}",
                        attachment.storage_path, id, e
                    );
                }
            }
        }
        info!("Deleted notification {}", id);
        Ok(())
    }

    /// Start background processing for the configured mode.
    ///
    /// Queue mode starts the scheduler. Inline and relay modes hand every
    /// unfinished record back to the transport, then keep sweeping on the
    /// poll interval so orphaned and due records are picked up again.
    pub async fn start(&self) -> Result<()> {
        match self.mode {
            TransportMode::Queue => {
                if let Some(scheduler) = &self.scheduler {
                    scheduler.start();
                }
            }
            TransportMode::Inline | TransportMode::Relay => {
                let redispatched = self.sweeper.sweep(Duration::ZERO).await?;
                if redispatched > 0 {
                    info!(
                        "Re-dispatched {} unfinished notification(s) ({} mode)",
                        redispatched, self.mode
                    );
                }
                self.start_sweeping();
            }
        }
        info!("Notification service started in {} mode", self.mode);
        Ok(())
    }

    fn start_sweeping(&self) {
        let mut handle = self.sweep_handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let sweeper = self.sweeper.clone();
        let token = self.sweep_token.clone();
        let poll_interval = self
            .dispatcher
            .policy()
            .poll_interval
            .max(Duration::from_millis(1));
        // Inline tasks are tracked in memory, so a record idle for a poll
        // interval and not in flight is orphaned. The grace period leaves
        // fresh submissions to their own dispatch. A published record is the
        // broker's until it has been idle past the staleness threshold.
        let idle_for = match self.mode {
            TransportMode::Relay => self.dispatcher.policy().stale_after,
            _ => poll_interval,
        };

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires at once; start() has just swept.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match sweeper.sweep(idle_for).await {
                    Ok(0) => {}
                    Ok(count) => info!("Recovery sweep re-dispatched {} notification(s)", count),
                    Err(e) => error!("Recovery sweep failed: {}", e),
                }
            }
            debug!("Recovery sweep stopped");
        }));
    }

    /// Stop background processing and wait for in-flight work.
    pub async fn stop(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop().await;
        }
        self.sweep_token.cancel();
        let handle = self.sweep_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Recovery sweep task ended abnormally: {}", e);
            }
        }
        self.transport.shutdown().await;
        info!("Notification service stopped");
    }
}

/// Hands unfinished records back to the transport in inline and relay modes.
#[derive(Clone)]
struct Sweeper {
    store: Arc<dyn NotificationStore>,
    transport: Arc<dyn Transport>,
    stale_after: Duration,
}

impl Sweeper {
    /// Recover stale PROCESSING records, then re-dispatch records untouched
    /// for `idle_for` and due retries. Returns how many were handed over.
    async fn sweep(&self, idle_for: Duration) -> Result<usize> {
        let recovered = self.store.recover_stale(self.stale_after).await?;
        if recovered > 0 {
            warn!("Reset {} stale PROCESSING notification(s)", recovered);
        }

        let mut count = 0;
        for record in self
            .store
            .list_redispatchable(idle_for, RECOVERY_SCAN_LIMIT)
            .await?
        {
            match self.transport.dispatch(&record).await {
                // Already driven by a live inline task.
                Ok(Dispatch::Deferred) => {}
                Ok(_) => {
                    count += 1;
                    if let Err(e) = self.store.touch(&record.id).await {
                        warn!("Failed to touch notification {}: {}", record.id, e);
                    }
                }
                Err(e) => warn!("Failed to re-dispatch notification {}: {}", record.id, e),
            }
        }
        Ok(count)
    }
}
