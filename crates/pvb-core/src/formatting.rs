use crate::{
    diagnostics::Diagnostic,
    utils::{duration_millis, truncate_text},
    validator::ValidationReport,
};

/// Longest message shown for the first error in a summary.
const SUMMARY_MESSAGE_CHARS: usize = 500;

/// Escape HTML special characters for messenger HTML parse modes.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Short HTML summary of a validation run, cut to `limit` characters.
pub fn format_validation_summary(report: &ValidationReport, limit: usize) -> String {
    let r = &report.result;
    let headline = if r.success {
        "✅ <b>Pipeline is valid</b>"
    } else {
        "❌ <b>Pipeline is invalid</b>"
    };

    let mut out = format!(
        "{headline}\nErrors: {} · Warnings: {} · {} ms",
        r.errors.len(),
        r.warnings.len(),
        duration_millis(report.duration)
    );
    if let Some(first) = r.errors.first() {
        let first = Diagnostic {
            message: truncate_text(&first.message, SUMMARY_MESSAGE_CHARS),
            ..first.clone()
        };
        out.push_str("\n\n");
        out.push_str(&format_diagnostic(&first));
    }
    fit_to_limit(out, limit)
}

/// Full HTML listing of every diagnostic, cut to `limit` characters.
pub fn format_validation_details(report: &ValidationReport, limit: usize) -> String {
    let r = &report.result;
    let mut out = String::from("📋 <b>Validation details</b>");

    if r.errors.is_empty() && r.warnings.is_empty() {
        out.push_str("\n\nNo errors or warnings.");
    }
    push_section(&mut out, "Errors", &r.errors);
    push_section(&mut out, "Warnings", &r.warnings);
    if let Some(code) = r.exit_code {
        out.push_str(&format!("\n\nExit code: <code>{code}</code>"));
    }

    fit_to_limit(out, limit)
}

fn push_section(out: &mut String, title: &str, diags: &[Diagnostic]) {
    if diags.is_empty() {
        return;
    }
    out.push_str(&format!("\n\n<b>{title}</b>"));
    for d in diags {
        out.push_str("\n• ");
        out.push_str(&format_diagnostic(d));
    }
}

fn format_diagnostic(d: &Diagnostic) -> String {
    let mut line = String::new();
    if let Some(code) = &d.code {
        line.push_str(&format!("<code>{}</code> ", escape_html(code)));
    }
    line.push_str(&escape_html(&d.message));
    if let Some(loc) = &d.location {
        line.push_str(&format!(" <i>({})</i>", escape_html(loc)));
    }
    line
}

/// Cut at a line boundary so no HTML tag is left open.
fn fit_to_limit(html: String, limit: usize) -> String {
    const MARKER: &str = "\n…";
    if html.chars().count() <= limit {
        return html;
    }

    let budget = limit.saturating_sub(MARKER.chars().count());
    let mut out = String::new();
    let mut used = 0usize;
    for (i, line) in html.split('\n').enumerate() {
        let cost = line.chars().count() + usize::from(i > 0);
        if used + cost > budget {
            break;
        }
        if i > 0 {
            out.push('\n');
        }
        out.push_str(line);
        used += cost;
    }
    out.push_str(MARKER);
    out
}
