use std::sync::Arc;

use teloxide::prelude::*;

use pvb_core::{
    audit::AuditEvent,
    domain::{ChatId, MessageId, MessageRef, UserId},
    messaging::types::CallbackQuery as CoreCallback,
    notify::notification_from_callback,
    security::is_authorized,
};

use crate::router::AppState;

fn to_core_callback(q: &CallbackQuery) -> Option<CoreCallback> {
    let msg = q.message.as_ref()?;
    let chat_id = ChatId(msg.chat.id.0);
    Some(CoreCallback {
        chat_id,
        user_id: UserId(q.from.id.0 as i64),
        username: q.from.username.clone(),
        callback_id: q.id.clone(),
        data: q.data.clone().unwrap_or_default(),
        message: Some(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        }),
    })
}

/// Button presses: only the details button does anything; it queues a
/// notification and acknowledges immediately.
pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    // Always answer callback query eventually.
    let Some(cb) = to_core_callback(&q) else {
        let _ = bot.answer_callback_query(q.id).await;
        return Ok(());
    };
    let username = cb.username.clone().unwrap_or_else(|| "unknown".to_string());

    if !is_authorized(Some(cb.user_id), &state.cfg.allowed_users) {
        state
            .audit
            .write_best_effort(AuditEvent::auth(cb.user_id.0, &username, false));
        answer(&state, &cb.callback_id, Some("Unauthorized")).await;
        return Ok(());
    }

    let Some(event) = notification_from_callback(&cb) else {
        answer(&state, &cb.callback_id, None).await;
        return Ok(());
    };

    state
        .audit
        .write_best_effort(AuditEvent::callback(cb.user_id.0, &username, &cb.data));

    let reply = match state.notifications.enqueue(event) {
        Ok(()) => "Sending details…",
        Err(e) => {
            tracing::warn!(chat_id = cb.chat_id.0, error = %e, "could not queue notification");
            "Busy right now, try again in a moment."
        }
    };
    answer(&state, &cb.callback_id, Some(reply)).await;

    Ok(())
}

async fn answer(state: &AppState, callback_id: &str, text: Option<&str>) {
    if let Err(e) = state.messenger.answer_callback_query(callback_id, text).await {
        tracing::warn!(error = %e, "failed to answer callback query");
    }
}
