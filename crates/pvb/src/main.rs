use std::sync::Arc;

use pvb_core::{
    audit::{audit_config, AuditLogger, FindingSeverity},
    channels::{select_channel, ChannelKind},
    config::Config,
};

#[tokio::main]
async fn main() -> Result<(), pvb_core::Error> {
    pvb_core::logging::init("pvb")?;

    let cfg = Arc::new(Config::load()?);
    let audit = Arc::new(AuditLogger::new(
        cfg.audit_log_path.clone(),
        cfg.audit_log_json,
    ));

    let findings = audit_config(&cfg);
    for f in findings.iter().filter(|f| f.severity >= FindingSeverity::High) {
        tracing::warn!(id = f.id, severity = f.severity.as_str(), "{}", f.title);
    }
    if let Err(e) = audit.record_findings(&findings) {
        tracing::warn!(path = %audit.path().display(), error = %e, "failed to record security findings");
    }

    let channel = select_channel(&cfg.channel_settings())?;
    tracing::info!(%channel, "messaging channel selected");

    match channel {
        ChannelKind::Telegram => pvb_telegram::router::run_polling(cfg, audit)
            .await
            .map_err(|e| pvb_core::Error::External(format!("telegram bot failed: {e}")))?,
        ChannelKind::Discord => {
            return Err(pvb_core::Error::Config(
                "Discord is configured but this build has no Discord adapter".to_string(),
            ))
        }
    }

    Ok(())
}
