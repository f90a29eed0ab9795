use std::sync::Arc;

use anyhow::Context;
use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use pvb_core::{
    audit::AuditLogger,
    config::Config,
    messaging::port::MessagingPort,
    notify::{run_notifier, NotificationQueue, ReportStore},
    security::RateLimiter,
    validator::{PipelineValidator, ValidatorConfig},
};
use pvb_validator::TokioProcessRunner;

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub validator: Arc<PipelineValidator>,
    pub messenger: Arc<dyn MessagingPort>,
    pub reports: Arc<ReportStore>,
    pub notifications: NotificationQueue,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
    pub audit: Arc<AuditLogger>,
}

pub async fn run_polling(cfg: Arc<Config>, audit: Arc<AuditLogger>) -> anyhow::Result<()> {
    let token = cfg
        .telegram_bot_token
        .clone()
        .context("TELEGRAM_BOT_TOKEN is not set")?;
    let bot = Bot::new(token);

    match bot.get_me().await {
        Ok(me) => tracing::info!(bot = %me.username(), "pvb started"),
        Err(e) => tracing::warn!(error = %e, "could not fetch bot identity"),
    }
    tracing::info!(
        allowed_users = cfg.allowed_users.len(),
        validator = %cfg.validator_path.display(),
        sandbox = cfg.sandbox_enabled,
        "configuration loaded"
    );

    let messenger: Arc<dyn MessagingPort> =
        Arc::new(TelegramMessenger::new(bot.clone(), cfg.message_limit));

    let validator = PipelineValidator::new(
        ValidatorConfig::from_config(&cfg),
        Arc::new(TokioProcessRunner::default()),
    )
    .with_audit(audit.clone());

    let reports = Arc::new(ReportStore::default());
    let (notifications, notify_rx) = NotificationQueue::channel(cfg.notify_queue_capacity);
    let cancel = CancellationToken::new();
    let notifier = tokio::spawn(run_notifier(
        notify_rx,
        reports.clone(),
        messenger.clone(),
        cancel.clone(),
    ));

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        validator: Arc::new(validator),
        messenger,
        reports,
        notifications,
        rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
            cfg.rate_limit_enabled,
            cfg.rate_limit_requests,
            cfg.rate_limit_window,
        ))),
        audit,
    });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    cancel.cancel();
    if let Err(e) = notifier.await {
        tracing::warn!(error = %e, "notifier task ended abnormally");
    }

    Ok(())
}
