//! Selection of the messaging backend the bot runs on.

use std::{fmt, str::FromStr};

use crate::{errors::Error, Result};

/// Messaging backends the bot knows how to configure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Telegram,
    Discord,
}

impl ChannelKind {
    /// Fallback order when no channel is requested explicitly.
    pub const PRIORITY: [ChannelKind; 2] = [ChannelKind::Telegram, ChannelKind::Discord];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Telegram => "telegram",
            ChannelKind::Discord => "discord",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "telegram" | "tg" => Ok(ChannelKind::Telegram),
            "discord" => Ok(ChannelKind::Discord),
            other => Err(Error::Config(format!("unknown channel: {other}"))),
        }
    }
}

/// The slice of configuration channel selection needs.
#[derive(Clone, Debug, Default)]
pub struct ChannelSettings {
    pub preferred: Option<String>,
    pub telegram_token: Option<String>,
    pub discord_token: Option<String>,
}

impl ChannelSettings {
    pub fn is_configured(&self, kind: ChannelKind) -> bool {
        let token = match kind {
            ChannelKind::Telegram => &self.telegram_token,
            ChannelKind::Discord => &self.discord_token,
        };
        token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// Configured backends, in priority order.
pub fn available_channels(settings: &ChannelSettings) -> Vec<ChannelKind> {
    ChannelKind::PRIORITY
        .into_iter()
        .filter(|k| settings.is_configured(*k))
        .collect()
}

/// Pick the backend to run on.
///
/// An explicit preference wins but must have credentials; otherwise the first
/// configured backend in [`ChannelKind::PRIORITY`] is used.
pub fn select_channel(settings: &ChannelSettings) -> Result<ChannelKind> {
    if let Some(pref) = settings.preferred.as_deref().filter(|p| !p.trim().is_empty()) {
        let kind: ChannelKind = pref.parse()?;
        if !settings.is_configured(kind) {
            return Err(Error::Config(format!(
                "channel {kind} requested but no bot token is configured for it"
            )));
        }
        return Ok(kind);
    }

    available_channels(settings)
        .first()
        .copied()
        .ok_or_else(|| {
            Error::Config(
                "no messaging channel configured (set TELEGRAM_BOT_TOKEN or DISCORD_BOT_TOKEN)"
                    .to_string(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pref: Option<&str>, tg: Option<&str>, dc: Option<&str>) -> ChannelSettings {
        ChannelSettings {
            preferred: pref.map(str::to_string),
            telegram_token: tg.map(str::to_string),
            discord_token: dc.map(str::to_string),
        }
    }

    #[test]
    fn defaults_to_telegram_when_both_configured() {
        let s = settings(None, Some("t"), Some("d"));
        assert_eq!(select_channel(&s).unwrap(), ChannelKind::Telegram);
        assert_eq!(
            available_channels(&s),
            vec![ChannelKind::Telegram, ChannelKind::Discord]
        );
    }

    #[test]
    fn falls_back_to_discord() {
        let s = settings(None, Some("  "), Some("d"));
        assert_eq!(select_channel(&s).unwrap(), ChannelKind::Discord);
    }

    #[test]
    fn honours_explicit_preference() {
        let s = settings(Some("Discord"), Some("t"), Some("d"));
        assert_eq!(select_channel(&s).unwrap(), ChannelKind::Discord);
    }

    #[test]
    fn preference_without_token_is_an_error() {
        let s = settings(Some("discord"), Some("t"), None);
        assert!(matches!(select_channel(&s), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_preference_is_an_error() {
        let s = settings(Some("irc"), Some("t"), None);
        assert!(matches!(select_channel(&s), Err(Error::Config(_))));
    }

    #[test]
    fn nothing_configured_is_an_error() {
        let s = settings(Some(" "), None, None);
        assert!(select_channel(&s).is_err());
        assert!(available_channels(&s).is_empty());
    }
}
