//! Wrapper around the external pipeline validator binary.
//!
//! The process itself is started through [`ProcessRunner`] so the wrapper can
//! be exercised without spawning anything.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    audit::{AuditEvent, AuditLogger},
    config::Config,
    diagnostics::{parse_output, Diagnostic, OutputStream},
    errors::Error,
    utils::{duration_millis, sha256_hex},
    Result,
};

/// Mount point of the pipeline directory inside the sandbox.
const SANDBOX_WORKDIR: &str = "/work";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A concrete process invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CliInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Captured result of one process run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

/// Starts a process and captures its output.
///
/// Failing to start, timing out or losing the pipes is an `Err`; a process
/// that ran and exited non-zero is an `Ok` with its exit code.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, inv: &CliInvocation) -> Result<ProcessOutput>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxConfig {
    pub runtime: String,
    pub image: String,
}

#[derive(Clone, Debug)]
pub struct ValidatorConfig {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub temp_dir: PathBuf,
    pub max_input_bytes: usize,
    pub sandbox: Option<SandboxConfig>,
}

impl ValidatorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let sandbox = cfg.sandbox_enabled.then(|| SandboxConfig {
            runtime: cfg.sandbox_runtime.clone(),
            image: cfg.sandbox_image.clone(),
        });
        Self {
            binary: cfg.validator_path.clone(),
            args: cfg.validator_args.clone(),
            timeout: cfg.validator_timeout,
            temp_dir: cfg.temp_dir.clone(),
            max_input_bytes: cfg.max_pipeline_bytes,
            sandbox,
        }
    }

    /// Build the command line for validating `file`.
    pub fn build_invocation(&self, file: &Path) -> CliInvocation {
        let Some(sandbox) = &self.sandbox else {
            let mut args = self.args.clone();
            args.push(file.display().to_string());
            return CliInvocation {
                program: self.binary.clone(),
                args,
                env: Vec::new(),
                timeout: self.timeout,
            };
        };

        let host_dir = file.parent().unwrap_or_else(|| Path::new("."));
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut args: Vec<String> = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--network".to_string(),
            "none".to_string(),
            "--read-only".to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "-v".to_string(),
            format!("{}:{SANDBOX_WORKDIR}:ro", host_dir.display()),
            sandbox.image.clone(),
        ];
        args.extend(self.args.iter().cloned());
        args.push(format!("{SANDBOX_WORKDIR}/{file_name}"));

        CliInvocation {
            program: PathBuf::from(&sandbox.runtime),
            args,
            env: Vec::new(),
            timeout: self.timeout,
        }
    }
}

/// Outcome of one validator run, in the shape reported to users and logs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub success: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_error: Option<String>,
}

impl ValidationResult {
    /// Errors come from stderr, warnings from stdout. Success is the exit code alone.
    pub fn from_output(output: ProcessOutput) -> Self {
        let mut errors = parse_output(&output.stderr, OutputStream::Stderr);
        let warnings = parse_output(&output.stdout, OutputStream::Stdout);

        let success = output.exit_code == Some(0);
        if !success && errors.is_empty() {
            let status = output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            errors.push(Diagnostic::new(format!(
                "validator exited with status {status}"
            )));
        }

        Self {
            success,
            errors,
            warnings,
            exit_code: output.exit_code,
            raw_output: non_blank(output.stdout),
            raw_error: non_blank(output.stderr),
        }
    }
}

/// A [`ValidationResult`] plus bookkeeping about the run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationReport {
    pub result: ValidationResult,
    pub duration: Duration,
    pub input_bytes: usize,
    pub input_sha256: String,
    pub sandboxed: bool,
}

#[derive(Clone)]
pub struct PipelineValidator {
    cfg: ValidatorConfig,
    runner: Arc<dyn ProcessRunner>,
    audit: Option<Arc<AuditLogger>>,
}

impl PipelineValidator {
    pub fn new(cfg: ValidatorConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            cfg,
            runner,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.cfg
    }

    /// Validate one pipeline document.
    pub async fn validate(&self, yaml: &str) -> Result<ValidationReport> {
        if yaml.trim().is_empty() {
            return Err(Error::Validator("pipeline is empty".to_string()));
        }
        if yaml.len() > self.cfg.max_input_bytes {
            return Err(Error::Validator(format!(
                "pipeline is {} bytes; the limit is {}",
                yaml.len(),
                self.cfg.max_input_bytes
            )));
        }

        let digest = sha256_hex(yaml.as_bytes());
        tokio::fs::create_dir_all(&self.cfg.temp_dir).await?;
        let path = self.temp_path(&digest);
        tokio::fs::write(&path, yaml).await?;

        let inv = self.cfg.build_invocation(&path);
        tracing::debug!(program = %inv.program.display(), args = ?inv.args, "running validator");

        let started = Instant::now();
        let output = self.runner.run(&inv).await;
        let duration = started.elapsed();

        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove pipeline temp file");
        }

        let output = match output {
            Ok(o) => o,
            Err(e) => {
                if let Some(audit) = &self.audit {
                    audit.write_best_effort(AuditEvent::error(
                        None,
                        &e.to_string(),
                        Some("validator"),
                    ));
                }
                return Err(e);
            }
        };

        let report = ValidationReport {
            result: ValidationResult::from_output(output),
            duration,
            input_bytes: yaml.len(),
            input_sha256: digest,
            sandboxed: self.cfg.sandbox.is_some(),
        };

        tracing::info!(
            success = report.result.success,
            errors = report.result.errors.len(),
            warnings = report.result.warnings.len(),
            exit_code = ?report.result.exit_code,
            duration_ms = duration_millis(duration),
            "pipeline validated"
        );
        if let Some(audit) = &self.audit {
            audit.write_best_effort(AuditEvent::validation(&report));
        }

        Ok(report)
    }

    fn temp_path(&self, digest: &str) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let short = &digest[..digest.len().min(12)];
        self.cfg
            .temp_dir
            .join(format!("pipeline-{}-{n}-{short}.yaml", std::process::id()))
    }
}

fn non_blank(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
