use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{channels::ChannelSettings, Result};

/// Typed configuration for the bot, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Channels
    pub telegram_bot_token: Option<String>,
    pub discord_bot_token: Option<String>,
    pub preferred_channel: Option<String>,
    pub allowed_users: Vec<i64>,

    // Validator
    pub validator_path: PathBuf,
    pub validator_args: Vec<String>,
    pub validator_timeout: Duration,
    pub max_pipeline_bytes: usize,

    // Sandbox
    pub sandbox_enabled: bool,
    pub sandbox_runtime: String,
    pub sandbox_image: String,

    // Runtime
    pub temp_dir: PathBuf,

    // Messenger limits
    pub message_limit: usize,
    pub notify_queue_capacity: usize,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").and_then(non_empty);
        let discord_bot_token = env_str("DISCORD_BOT_TOKEN").and_then(non_empty);
        let preferred_channel = env_str("PVB_CHANNEL").and_then(non_empty);

        // An empty list denies everyone; the startup review reports it.
        let allowed_users = parse_csv_i64(env_str("TELEGRAM_ALLOWED_USERS"));
        if allowed_users.is_empty() {
            tracing::warn!("TELEGRAM_ALLOWED_USERS is empty; all requests will be rejected");
        }

        let validator_path = env_path("VALIDATOR_PATH")
            .or_else(|| which_in_path("pipeline-validator"))
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/pipeline-validator"));
        let validator_args = env_str("VALIDATOR_ARGS")
            .map(|v| parse_csv(&v))
            .unwrap_or_else(|| vec!["validate".to_string()]);
        let validator_timeout =
            Duration::from_millis(env_u64("VALIDATOR_TIMEOUT_MS").unwrap_or(30_000));
        let max_pipeline_bytes = env_usize("MAX_PIPELINE_BYTES").unwrap_or(64 * 1024);

        let sandbox_enabled = env_bool("SANDBOX_ENABLED").unwrap_or(true);
        let sandbox_runtime = env_str("SANDBOX_RUNTIME")
            .and_then(non_empty)
            .unwrap_or_else(|| "docker".to_string());
        let sandbox_image = env_str("SANDBOX_IMAGE")
            .and_then(non_empty)
            .unwrap_or_else(|| "pipeline-validator:latest".to_string());

        let temp_dir = PathBuf::from(env_str("TEMP_DIR").unwrap_or("/tmp/pvb".to_string()));
        fs::create_dir_all(&temp_dir)?;

        let message_limit = env_usize("TELEGRAM_MESSAGE_LIMIT").unwrap_or(4096);
        let notify_queue_capacity = env_usize("NOTIFY_QUEUE_CAPACITY").unwrap_or(64).max(1);

        let audit_log_path =
            PathBuf::from(env_str("AUDIT_LOG_PATH").unwrap_or("/tmp/pvb-audit.log".to_string()));
        let audit_log_json = env_bool("AUDIT_LOG_JSON").unwrap_or(true);

        let rate_limit_enabled = env_bool("RATE_LIMIT_ENABLED").unwrap_or(true);
        let rate_limit_requests = env_u32("RATE_LIMIT_REQUESTS").unwrap_or(20);
        let rate_limit_window = Duration::from_secs(env_u64("RATE_LIMIT_WINDOW").unwrap_or(60));

        Ok(Self {
            telegram_bot_token,
            discord_bot_token,
            preferred_channel,
            allowed_users,
            validator_path,
            validator_args,
            validator_timeout,
            max_pipeline_bytes,
            sandbox_enabled,
            sandbox_runtime,
            sandbox_image,
            temp_dir,
            message_limit,
            notify_queue_capacity,
            audit_log_path,
            audit_log_json,
            rate_limit_enabled,
            rate_limit_requests,
            rate_limit_window,
        })
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            preferred: self.preferred_channel.clone(),
            telegram_token: self.telegram_bot_token.clone(),
            discord_token: self.discord_bot_token.clone(),
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotenv_strips_quotes_and_comments() {
        let parsed = parse_dotenv(
            "# comment\nTELEGRAM_BOT_TOKEN=\"abc:123\"\n\nVALIDATOR_ARGS='check,--strict'\nbroken line\n=novalue\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("TELEGRAM_BOT_TOKEN".to_string(), "abc:123".to_string()),
                ("VALIDATOR_ARGS".to_string(), "check,--strict".to_string()),
            ]
        );
    }

    #[test]
    fn csv_helpers_skip_blanks() {
        assert_eq!(parse_csv(" validate , ,--json"), vec!["validate", "--json"]);
        assert_eq!(
            parse_csv_i64(Some("1, x, 42,".to_string())),
            vec![1, 42]
        );
        assert!(parse_csv_i64(None).is_empty());
    }

    #[test]
    fn bool_parsing_accepts_common_truthy_values() {
        for v in ["1", "true", "YES", " on "] {
            assert!(parse_bool(v), "{v}");
        }
        for v in ["0", "false", "off", ""] {
            assert!(!parse_bool(v), "{v}");
        }
    }

    #[test]
    fn load_accepts_an_empty_allow_list() {
        let temp_dir = std::env::temp_dir().join(format!("pvb-config-{}", std::process::id()));
        env::set_var("TELEGRAM_ALLOWED_USERS", " , ");
        env::set_var("TEMP_DIR", &temp_dir);

        let cfg = Config::load().unwrap();
        assert!(cfg.allowed_users.is_empty());
        assert_eq!(cfg.temp_dir, temp_dir);

        let ids: Vec<&str> = crate::audit::audit_config(&cfg)
            .iter()
            .map(|f| f.id)
            .collect();
        assert!(ids.contains(&"no-allowed-users"));
    }

    #[test]
    fn non_empty_rejects_whitespace() {
        assert_eq!(non_empty("  ".to_string()), None);
        assert_eq!(non_empty("x".to_string()), Some("x".to_string()));
    }
}
