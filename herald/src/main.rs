use std::sync::Arc;

use herald::attachments::{AttachmentStore, LocalAttachmentStore};
use herald::channels::{ChannelRouter, LogSender, WebhookConfig, WebhookSender};
use herald::config::HeraldConfig;
use herald::database::{self, models::ChannelType, repositories::SqlxNotificationStore};
use herald::logging;
use herald::templates::InMemoryTemplateResolver;
use herald::{NotificationService, ServiceDeps};

fn build_router() -> ChannelRouter {
    let chat: Arc<dyn herald::channels::ChannelSender> =
        match std::env::var("HERALD_CHAT_WEBHOOK_URL") {
            Ok(url) if !url.is_empty() => Arc::new(WebhookSender::new(WebhookConfig::new(url))),
            _ => Arc::new(LogSender::named("log-chat")),
        };

    ChannelRouter::new()
        .with_sender(ChannelType::Email, Arc::new(LogSender::named("log-email")))
        .with_sender(ChannelType::Sms, Arc::new(LogSender::named("log-sms")))
        .with_sender(ChannelType::Chat, chat)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HeraldConfig::from_env()?;
    let _log_guard = logging::init_logging(config.log_format, config.log_dir.as_deref())?;
    config.validate()?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let attachments = config.attachment_dir.as_ref().map(|dir| {
        Arc::new(LocalAttachmentStore::new(dir.clone())) as Arc<dyn AttachmentStore>
    });

    let templates = match &config.template_file {
        Some(path) => {
            let templates = InMemoryTemplateResolver::from_json_file(path).await?;
            tracing::info!("Loaded {} template(s) from {}", templates.len(), path.display());
            templates
        }
        None => InMemoryTemplateResolver::new(),
    };

    let service = NotificationService::new(
        &config,
        ServiceDeps {
            store: Arc::new(SqlxNotificationStore::new(pool.clone())),
            router: build_router(),
            templates: Arc::new(templates),
            attachments,
            publisher: None,
        },
    )?;

    service.start().await?;
    tracing::info!("herald running in {} mode, press Ctrl-C to stop", config.mode);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    service.stop().await;
    pool.close().await;

    Ok(())
}
