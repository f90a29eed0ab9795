//! Telegram update handlers.
//!
//! Each handler checks auth, then calls into `pvb-core` (validator, notify
//! queue, audit) and replies through the MessagingPort.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};

use pvb_core::{audit::AuditEvent, domain::UserId, security::is_authorized};

use crate::router::AppState;

mod callback;
mod commands;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = user.id.0 as i64;
    let username = user
        .username
        .clone()
        .unwrap_or_else(|| "unknown".to_string());

    if !is_authorized(Some(UserId(user_id)), &state.cfg.allowed_users) {
        state
            .audit
            .write_best_effort(AuditEvent::auth(user_id, &username, false));
        let _ = bot
            .send_message(
                msg.chat.id,
                "Unauthorized. Contact the bot owner for access.",
            )
            .await;
        return Ok(());
    }

    let Some(text) = msg.text() else {
        return Ok(());
    };

    let ctx = commands::CommandContext {
        chat_id: msg.chat.id.0,
        user_id,
        username,
    };

    if text.starts_with('/') {
        commands::handle_command(&state, &ctx, text).await;
        return Ok(());
    }

    commands::send_hint(&state, &ctx).await;
    Ok(())
}
