use pvb_core::{
    audit::{audit_config, AuditEvent, SecurityFinding},
    domain::{ChatId, UserId},
    formatting::{escape_html, format_validation_summary},
    notify::details_keyboard,
    pipeline::extract_yaml,
    security::RateDecision,
};

use crate::router::AppState;

pub struct CommandContext {
    pub chat_id: i64,
    pub user_id: i64,
    pub username: String,
}

const HELP: &str = "🧪 <b>Pipeline Validator Bot</b>\n\n\
<b>Commands:</b>\n\
/validate &lt;yaml&gt; - Validate a pipeline definition\n\
/audit - Review the bot's security settings\n\
/help - Show this message\n\n\
Paste the YAML after the command, optionally inside a ```yaml block.";

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`; the argument keeps its line layout.
    let text = text.trim_start();
    let (first, rest) = match text.find(char::is_whitespace) {
        Some(idx) => (&text[..idx], &text[idx..]),
        None => (text, ""),
    };

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    let arg = rest
        .trim_start_matches([' ', '\t'])
        .trim_start_matches(['\r', '\n'])
        .trim_end()
        .to_string();

    (cmd, arg)
}

async fn send(state: &AppState, chat_id: i64, html: &str) {
    if let Err(e) = state.messenger.send_html(ChatId(chat_id), html).await {
        tracing::warn!(chat_id, error = %e, "failed to send reply");
    }
}

pub async fn send_hint(state: &AppState, ctx: &CommandContext) {
    send(
        state,
        ctx.chat_id,
        "Send <code>/validate</code> followed by your pipeline YAML. See /help.",
    )
    .await;
}

pub async fn handle_command(state: &AppState, ctx: &CommandContext, text: &str) {
    let (cmd, arg) = parse_command(text);

    match cmd.as_str() {
        "start" | "help" => send(state, ctx.chat_id, HELP).await,
        "validate" => run_validate(state, ctx, &arg).await,
        "audit" => {
            let findings = audit_config(&state.cfg);
            send(state, ctx.chat_id, &format_findings(&findings)).await;
        }
        _ => {
            send(
                state,
                ctx.chat_id,
                &format!("Unknown command: /{}. See /help.", escape_html(&cmd)),
            )
            .await
        }
    }
}

async fn run_validate(state: &AppState, ctx: &CommandContext, arg: &str) {
    if arg.trim().is_empty() {
        send(
            state,
            ctx.chat_id,
            "Usage: <code>/validate &lt;pipeline yaml&gt;</code>",
        )
        .await;
        return;
    }

    let decision = state.rate_limiter.lock().await.check(UserId(ctx.user_id));
    if let RateDecision::Limited { retry_after } = decision {
        state
            .audit
            .write_best_effort(AuditEvent::rate_limit(ctx.user_id, &ctx.username, retry_after));
        send(
            state,
            ctx.chat_id,
            &format!(
                "⏳ Rate limited. Try again in {:.0}s.",
                retry_after.as_secs_f64().ceil()
            ),
        )
        .await;
        return;
    }

    let yaml = extract_yaml(arg).unwrap_or_else(|| arg.to_string());

    match state.validator.validate(&yaml).await {
        Ok(report) => {
            let limit = state.messenger.capabilities().max_message_len;
            let summary = format_validation_summary(&report, limit);
            state.reports.put(ChatId(ctx.chat_id), report).await;
            if let Err(e) = state
                .messenger
                .send_inline_keyboard(ChatId(ctx.chat_id), &summary, details_keyboard())
                .await
            {
                tracing::warn!(chat_id = ctx.chat_id, error = %e, "failed to send summary");
            }
        }
        Err(e) => {
            state.audit.write_best_effort(AuditEvent::error(
                Some(ctx.user_id),
                &e.to_string(),
                Some("validate"),
            ));
            send(
                state,
                ctx.chat_id,
                &format!("❌ Could not validate: {}", escape_html(&e.to_string())),
            )
            .await;
        }
    }
}

fn format_findings(findings: &[SecurityFinding]) -> String {
    if findings.is_empty() {
        return "🔒 <b>Security review</b>\n\nNo findings.".to_string();
    }

    let mut out = format!("🔒 <b>Security review</b> ({} findings)", findings.len());
    for f in findings {
        out.push_str(&format!(
            "\n\n<b>[{}]</b> {}\n{}",
            f.severity.as_str().to_uppercase(),
            escape_html(&f.title),
            escape_html(&f.detail)
        ));
    }
    out
}
