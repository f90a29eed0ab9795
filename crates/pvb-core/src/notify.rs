//! "Details" button handling: a button press becomes a queued notification,
//! and a background task answers it with the chat's latest validation report.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ChatId, MessageRef, UserId},
    errors::Error,
    formatting::{escape_html, format_validation_details},
    messaging::{
        port::MessagingPort,
        types::{CallbackQuery, InlineKeyboard},
    },
    utils::iso_timestamp_utc,
    validator::ValidationReport,
    Result,
};

/// Callback payload carried by the details button.
pub const NOTIFY_CALLBACK_DATA: &str = "pvb:notify";
pub const NOTIFY_BUTTON_LABEL: &str = "📋 Details";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationEvent {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub username: Option<String>,
    pub requested_at: String,
}

/// Only the exact details payload produces an event.
pub fn notification_from_callback(q: &CallbackQuery) -> Option<NotificationEvent> {
    if q.data != NOTIFY_CALLBACK_DATA {
        return None;
    }
    Some(NotificationEvent {
        chat_id: q.chat_id,
        user_id: q.user_id,
        username: q.username.clone(),
        requested_at: iso_timestamp_utc(),
    })
}

pub fn details_keyboard() -> InlineKeyboard {
    InlineKeyboard::single(NOTIFY_BUTTON_LABEL, NOTIFY_CALLBACK_DATA)
}

/// Sending half of the bounded notification queue.
#[derive(Clone, Debug)]
pub struct NotificationQueue {
    tx: mpsc::Sender<NotificationEvent>,
}

impl NotificationQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<NotificationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Never waits: a full or closed queue is reported to the caller.
    pub fn enqueue(&self, event: NotificationEvent) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(Error::External("notification queue is full".to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(Error::External("notification queue is closed".to_string()))
            }
        }
    }
}

/// Latest validation report per chat.
#[derive(Default)]
pub struct ReportStore {
    inner: Mutex<HashMap<ChatId, ValidationReport>>,
}

impl ReportStore {
    /// Raw process output is dropped; details are rendered from diagnostics.
    pub async fn put(&self, chat_id: ChatId, mut report: ValidationReport) {
        report.result.raw_output = None;
        report.result.raw_error = None;
        self.inner.lock().await.insert(chat_id, report);
    }

    pub async fn get(&self, chat_id: ChatId) -> Option<ValidationReport> {
        self.inner.lock().await.get(&chat_id).cloned()
    }
}

/// Answer one notification through the messenger.
pub async fn deliver(
    event: &NotificationEvent,
    store: &ReportStore,
    messenger: &dyn MessagingPort,
) -> Result<MessageRef> {
    let limit = messenger.capabilities().max_message_len;
    let html = match store.get(event.chat_id).await {
        Some(report) => format_validation_details(&report, limit),
        None => format!(
            "Nothing to report yet, {}. Send <code>/validate</code> with a pipeline first.",
            escape_html(event.username.as_deref().unwrap_or("there"))
        ),
    };
    messenger.send_html(event.chat_id, &html).await
}

/// Drain the queue until it closes or `cancel` fires. Delivery failures are logged.
pub async fn run_notifier(
    mut rx: mpsc::Receiver<NotificationEvent>,
    store: Arc<ReportStore>,
    messenger: Arc<dyn MessagingPort>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break; };
                match deliver(&event, &store, messenger.as_ref()).await {
                    Ok(_) => tracing::debug!(chat_id = event.chat_id.0, "notification delivered"),
                    Err(e) => tracing::warn!(chat_id = event.chat_id.0, error = %e, "notification delivery failed"),
                }
            }
        }
    }
    tracing::debug!("notifier stopped");
}
