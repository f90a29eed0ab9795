//! Audit trail and static security review of the running configuration.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Serialize;

use crate::{
    config::Config,
    errors::Error,
    utils::{duration_millis, iso_timestamp_utc, truncate_text},
    validator::ValidationReport,
    Result,
};

const AUDIT_MAX_TEXT: usize = 500;

// ============== Audit Events ==============

#[derive(Clone, Debug, Default, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorized: Option<bool>,

    // Validation runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandboxed: Option<bool>,

    // Findings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<FindingSeverity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

impl AuditEvent {
    fn base(event: &str) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            event: event.to_string(),
            ..Self::default()
        }
    }

    /// One validator run. Counts come straight from the diagnostic lists.
    pub fn validation(report: &ValidationReport) -> Self {
        Self {
            input_bytes: Some(report.input_bytes),
            input_sha256: Some(report.input_sha256.clone()),
            success: Some(report.result.success),
            exit_code: report.result.exit_code,
            error_count: Some(report.result.errors.len()),
            warning_count: Some(report.result.warnings.len()),
            duration_ms: Some(duration_millis(report.duration)),
            sandboxed: Some(report.sandboxed),
            ..Self::base("validation")
        }
    }

    pub fn callback(user_id: i64, username: &str, data: &str) -> Self {
        Self {
            user_id: Some(user_id),
            username: Some(username.to_string()),
            action: Some(data.to_string()),
            ..Self::base("callback")
        }
    }

    pub fn auth(user_id: i64, username: &str, authorized: bool) -> Self {
        Self {
            user_id: Some(user_id),
            username: Some(username.to_string()),
            authorized: Some(authorized),
            ..Self::base("auth")
        }
    }

    pub fn error(user_id: Option<i64>, error: &str, context: Option<&str>) -> Self {
        Self {
            user_id,
            error: Some(error.to_string()),
            context: context.map(|s| s.to_string()),
            ..Self::base("error")
        }
    }

    pub fn rate_limit(user_id: i64, username: &str, retry_after: Duration) -> Self {
        Self {
            user_id: Some(user_id),
            username: Some(username.to_string()),
            retry_after: Some(retry_after.as_secs_f64()),
            ..Self::base("rate_limit")
        }
    }

    pub fn finding(f: &SecurityFinding) -> Self {
        Self {
            finding_id: Some(f.id.to_string()),
            severity: Some(f.severity),
            action: Some(f.title.clone()),
            context: Some(f.detail.clone()),
            ..Self::base("security_finding")
        }
    }
}

// ============== Audit Logger ==============

#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        for field in [&mut event.username, &mut event.action, &mut event.error, &mut event.context]
        {
            if let Some(s) = field.as_deref() {
                *field = Some(truncate_text(s, AUDIT_MAX_TEXT));
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&event)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        // Plain text format for readability.
        let mut out = String::new();
        out.push('\n');
        out.push_str(&"=".repeat(60));

        let value = serde_json::to_value(&event)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::External(
                "audit event is not a JSON object".to_string(),
            ));
        };
        for (k, v) in obj {
            out.push('\n');
            out.push_str(k);
            out.push_str(": ");
            out.push_str(&json_value_to_display(v));
        }
        out.push('\n');

        file.write_all(out.as_bytes())?;
        Ok(())
    }

    /// Write without failing the caller; problems go to the log instead.
    pub fn write_best_effort(&self, event: AuditEvent) {
        let kind = event.event.clone();
        if let Err(e) = self.write(event) {
            tracing::warn!(event = %kind, error = %e, "failed to write audit event");
        }
    }

    pub fn record_findings(&self, findings: &[SecurityFinding]) -> Result<()> {
        for f in findings {
            self.write(AuditEvent::finding(f))?;
        }
        Ok(())
    }
}

fn json_value_to_display(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "<unprintable>".to_string()),
    }
}

// ============== Configuration Review ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FindingSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingSeverity::Low => "low",
            FindingSeverity::Medium => "medium",
            FindingSeverity::High => "high",
            FindingSeverity::Critical => "critical",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SecurityFinding {
    pub id: &'static str,
    pub severity: FindingSeverity,
    pub title: String,
    pub detail: String,
}

impl SecurityFinding {
    fn new(id: &'static str, severity: FindingSeverity, title: &str, detail: String) -> Self {
        Self {
            id,
            severity,
            title: title.to_string(),
            detail,
        }
    }
}

const LARGE_INPUT_LIMIT: usize = 1024 * 1024;
const LONG_VALIDATOR_TIMEOUT: Duration = Duration::from_secs(300);
const SHARED_TEMP_DIRS: [&str; 3] = ["/tmp", "/var/tmp", "/private/tmp"];

/// Review the configuration for risky settings. Most severe findings first.
pub fn audit_config(cfg: &Config) -> Vec<SecurityFinding> {
    use FindingSeverity::*;

    let mut out = Vec::new();

    if cfg.allowed_users.is_empty() {
        out.push(SecurityFinding::new(
            "no-allowed-users",
            High,
            "No allowed users configured",
            "TELEGRAM_ALLOWED_USERS is empty; every request is rejected until users are added"
                .to_string(),
        ));
    }

    if !cfg.sandbox_enabled {
        out.push(SecurityFinding::new(
            "sandbox-disabled",
            High,
            "Validator runs outside the sandbox",
            format!(
                "{} is executed directly on the host with user-supplied input",
                cfg.validator_path.display()
            ),
        ));
    } else if !is_pinned_image(&cfg.sandbox_image) {
        out.push(SecurityFinding::new(
            "unpinned-sandbox-image",
            Low,
            "Sandbox image is not pinned",
            format!("{} has no explicit version tag or digest", cfg.sandbox_image),
        ));
    }

    if cfg.validator_path.is_relative() {
        out.push(SecurityFinding::new(
            "relative-validator-path",
            Medium,
            "Validator path is relative",
            format!(
                "{} is resolved against the working directory at run time",
                cfg.validator_path.display()
            ),
        ));
    }

    if !cfg.rate_limit_enabled {
        out.push(SecurityFinding::new(
            "rate-limit-disabled",
            Medium,
            "Rate limiting is disabled",
            "any allowed user can start validator runs without limit".to_string(),
        ));
    }

    if cfg.max_pipeline_bytes > LARGE_INPUT_LIMIT {
        out.push(SecurityFinding::new(
            "large-input-limit",
            Medium,
            "Pipeline size limit is very high",
            format!(
                "MAX_PIPELINE_BYTES is {} (recommended at most {LARGE_INPUT_LIMIT})",
                cfg.max_pipeline_bytes
            ),
        ));
    }

    if cfg.validator_timeout > LONG_VALIDATOR_TIMEOUT {
        out.push(SecurityFinding::new(
            "long-validator-timeout",
            Low,
            "Validator timeout is long",
            format!(
                "runs may hold resources for {}s",
                cfg.validator_timeout.as_secs()
            ),
        ));
    }

    if SHARED_TEMP_DIRS
        .iter()
        .any(|dir| cfg.audit_log_path.starts_with(dir))
    {
        out.push(SecurityFinding::new(
            "shared-audit-log",
            Low,
            "Audit log lives in a shared temp directory",
            format!(
                "{} can be read or removed by other local users",
                cfg.audit_log_path.display()
            ),
        ));
    }

    if !cfg.audit_log_json {
        out.push(SecurityFinding::new(
            "plaintext-audit-log",
            Low,
            "Audit log is not structured",
            "AUDIT_LOG_JSON is off; entries cannot be ingested line by line".to_string(),
        ));
    }

    out.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.id.cmp(b.id)));
    out
}

fn is_pinned_image(image: &str) -> bool {
    if image.contains("@sha256:") {
        return true;
    }
    // A registry port (`host:5000/img`) is not a tag.
    let name = image.rsplit('/').next().unwrap_or(image);
    match name.split_once(':') {
        Some((_, tag)) => !tag.is_empty() && tag != "latest",
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{ValidationReport, ValidationResult};
    use crate::diagnostics::Diagnostic;

    fn tmp_file(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        let pid = std::process::id();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}.log"))
    }

    fn hardened_config() -> Config {
        Config {
            telegram_bot_token: Some("x".to_string()),
            discord_bot_token: None,
            preferred_channel: None,
            allowed_users: vec![1],
            validator_path: "/usr/local/bin/pipeline-validator".into(),
            validator_args: vec!["validate".to_string()],
            validator_timeout: Duration::from_secs(30),
            max_pipeline_bytes: 64 * 1024,
            sandbox_enabled: true,
            sandbox_runtime: "docker".to_string(),
            sandbox_image: "pipeline-validator:1.4.2".to_string(),
            temp_dir: "/tmp/pvb".into(),
            message_limit: 4096,
            notify_queue_capacity: 8,
            audit_log_path: "/var/log/pvb/audit.log".into(),
            audit_log_json: true,
            rate_limit_enabled: true,
            rate_limit_requests: 20,
            rate_limit_window: Duration::from_secs(60),
        }
    }

    fn report() -> ValidationReport {
        ValidationReport {
            result: ValidationResult {
                success: false,
                errors: vec![Diagnostic::new("a"), Diagnostic::new("b")],
                warnings: vec![Diagnostic::new("c")],
                exit_code: Some(1),
                raw_output: None,
                raw_error: Some("ERROR: a\nERROR: b".to_string()),
            },
            duration: Duration::from_millis(1500),
            input_bytes: 42,
            input_sha256: "abc".to_string(),
            sandboxed: true,
        }
    }

    #[test]
    fn hardened_config_has_no_findings() {
        assert!(audit_config(&hardened_config()).is_empty());
    }

    #[test]
    fn risky_config_is_reported_most_severe_first() {
        let mut cfg = hardened_config();
        cfg.allowed_users.clear();
        cfg.sandbox_enabled = false;
        cfg.validator_path = "bin/validator".into();
        cfg.rate_limit_enabled = false;
        cfg.audit_log_path = "/tmp/pvb-audit.log".into();
        cfg.audit_log_json = false;

        let findings = audit_config(&cfg);
        let ids: Vec<&str> = findings.iter().map(|f| f.id).collect();
        assert_eq!(
            ids,
            vec![
                "no-allowed-users",
                "sandbox-disabled",
                "rate-limit-disabled",
                "relative-validator-path",
                "plaintext-audit-log",
                "shared-audit-log",
            ]
        );
    }

    #[test]
    fn image_pinning_rules() {
        assert!(is_pinned_image("validator:1.2"));
        assert!(is_pinned_image("ghcr.io/acme/validator@sha256:deadbeef"));
        assert!(!is_pinned_image("validator"));
        assert!(!is_pinned_image("validator:latest"));
        assert!(!is_pinned_image("registry:5000/validator"));
    }

    #[test]
    fn validation_event_carries_counts() {
        let log = AuditLogger::new(tmp_file("pvb-audit-validation"), true);
        log.write(AuditEvent::validation(&report())).unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        let v: serde_json::Value = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(v["event"], "validation");
        assert_eq!(v["error_count"], 2);
        assert_eq!(v["warning_count"], 1);
        assert_eq!(v["exit_code"], 1);
        assert_eq!(v["duration_ms"], 1500);
        assert_eq!(v["sandboxed"], true);
        assert!(v.get("user_id").is_none());
    }

    #[test]
    fn json_log_is_one_line_per_event() {
        let log = AuditLogger::new(tmp_file("pvb-audit-lines"), true);
        let mut cfg = hardened_config();
        cfg.sandbox_enabled = false;
        cfg.audit_log_json = false;
        let findings = audit_config(&cfg);
        log.record_findings(&findings).unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), findings.len());
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["severity"], "high");
        assert_eq!(first["finding_id"], "sandbox-disabled");
    }

    #[test]
    fn long_fields_are_truncated_on_write() {
        let log = AuditLogger::new(tmp_file("pvb-audit-trunc"), true);
        let long = "x".repeat(AUDIT_MAX_TEXT + 10);
        log.write(AuditEvent::error(Some(1), &long, None)).unwrap();
        let written = std::fs::read_to_string(log.path()).unwrap();
        assert!(written.contains("..."));
        assert!(!written.contains(&long));
    }

    #[test]
    fn plain_text_log_is_readable() {
        let log = AuditLogger::new(tmp_file("pvb-audit-plain"), false);
        log.write(AuditEvent::auth(5, "alice", false)).unwrap();
        let written = std::fs::read_to_string(log.path()).unwrap();
        assert!(written.contains("event: auth"));
        assert!(written.contains("authorized: false"));
    }
}
