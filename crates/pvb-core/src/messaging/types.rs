use crate::domain::{ChatId, MessageRef, UserId};

/// A button press, stripped of messenger-specific fields.
#[derive(Clone, Debug)]
pub struct CallbackQuery {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub username: Option<String>,
    pub callback_id: String,
    pub data: String,
    pub message: Option<MessageRef>,
}

/// Inline keyboard (buttons) attached to a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub buttons: Vec<InlineButton>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineKeyboard {
    pub fn new(buttons: Vec<InlineButton>) -> Self {
        Self { buttons }
    }

    pub fn single(label: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            buttons: vec![InlineButton {
                label: label.into(),
                callback_data: callback_data.into(),
            }],
        }
    }
}

/// Capabilities / feature flags of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub supports_html: bool,
    pub supports_inline_keyboards: bool,
    pub max_message_len: usize,
}
