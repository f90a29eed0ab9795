//! Line-oriented parser for validator output.
//!
//! Turns the free-form text a validator writes to stdout/stderr into
//! [`Diagnostic`]s: noise lines are dropped, severity markers stripped, codes
//! and `line N` locations extracted, and adjacent repeats collapsed.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Severity markers stripped from the start of a line, most specific first.
const SEVERITY_MARKERS: [&str; 3] = ["ERROR:", "WARNING:", "WARN:"];

/// Line prefixes that never carry a finding.
const NOISE_MARKERS: [&str; 2] = ["INFO", "DEBUG"];

/// Which stream of the validator process a chunk of text came from.
///
/// Parsing does not depend on it; callers use it to file results as errors
/// or warnings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn is_error(self) -> bool {
        matches!(self, OutputStream::Stderr)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// One finding extracted from validator output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            location: None,
        }
    }
}

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)line\s+([0-9]+)").expect("valid regex"))
}

fn code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Z]+[0-9]+)(?::\s*|\s+|$)").expect("valid regex"))
}

/// Parse one captured stream into an ordered list of diagnostics.
///
/// Never fails: text that matches no known shape comes back as a single
/// diagnostic carrying the whole trimmed input.
pub fn parse_output(raw: &str, stream: OutputStream) -> Vec<Diagnostic> {
    let mut out: Vec<Diagnostic> = Vec::new();

    for line in raw.lines() {
        let Some(diag) = parse_line(line) else {
            continue;
        };
        // Only consecutive repeats collapse.
        if out.last().is_some_and(|prev| prev.message == diag.message) {
            continue;
        }
        out.push(diag);
    }

    let trimmed = raw.trim();
    if out.is_empty() && !trimmed.is_empty() {
        out.push(Diagnostic::new(trimmed));
    }

    tracing::trace!(
        stream = stream.as_str(),
        count = out.len(),
        "parsed validator output"
    );
    out
}

fn parse_line(line: &str) -> Option<Diagnostic> {
    let line = line.trim();
    if line.is_empty() || is_noise(line) {
        return None;
    }

    let text = strip_severity_marker(line);
    if text.is_empty() {
        return None;
    }

    // The location phrase stays in the message.
    let location = location_re()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|n| format!("line {}", n.as_str()));

    let mut message = text.to_string();
    let mut code = None;
    if let Some(caps) = code_re().captures(text) {
        if let (Some(whole), Some(id)) = (caps.get(0), caps.get(1)) {
            code = Some(id.as_str().to_string());
            let rest = text[whole.end()..].trim();
            if !rest.is_empty() {
                message = rest.to_string();
            }
        }
    }

    Some(Diagnostic {
        message,
        code,
        location,
    })
}

fn is_noise(line: &str) -> bool {
    NOISE_MARKERS.iter().any(|marker| {
        line.strip_prefix(marker).is_some_and(|rest| {
            rest.is_empty() || rest.starts_with(':') || rest.starts_with(char::is_whitespace)
        })
    })
}

fn strip_severity_marker(line: &str) -> &str {
    for marker in SEVERITY_MARKERS {
        if let Some(rest) = line.strip_prefix(marker) {
            return rest.trim_start();
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.message.as_str()).collect()
    }

    #[test]
    fn empty_and_whitespace_input_yield_nothing() {
        assert!(parse_output("", OutputStream::Stderr).is_empty());
        assert!(parse_output("   \n\t\n  ", OutputStream::Stdout).is_empty());
    }

    #[test]
    fn strips_error_marker() {
        let out = parse_output("ERROR: missing required field", OutputStream::Stderr);
        assert_eq!(out, vec![Diagnostic::new("missing required field")]);
    }

    #[test]
    fn strips_warn_and_warning_markers() {
        let out = parse_output("WARN: deprecated option used", OutputStream::Stdout);
        assert_eq!(messages(&out), vec!["deprecated option used"]);

        let out = parse_output("WARNING:   shadowed step name", OutputStream::Stdout);
        assert_eq!(messages(&out), vec!["shadowed step name"]);
    }

    #[test]
    fn info_and_debug_lines_are_noise() {
        let out = parse_output(
            "INFO Starting validation\nERROR: bad config",
            OutputStream::Stderr,
        );
        assert_eq!(messages(&out), vec!["bad config"]);

        let out = parse_output(
            "DEBUG: loaded 3 steps\nINFO\nERROR: unknown key",
            OutputStream::Stderr,
        );
        assert_eq!(messages(&out), vec!["unknown key"]);
    }

    #[test]
    fn noise_marker_must_end_at_a_boundary() {
        let out = parse_output("INFORMATION leak in step", OutputStream::Stderr);
        assert_eq!(messages(&out), vec!["INFORMATION leak in step"]);
    }

    #[test]
    fn only_noise_falls_back_to_raw_text() {
        let out = parse_output("INFO Starting validation", OutputStream::Stdout);
        assert_eq!(messages(&out), vec!["INFO Starting validation"]);
    }

    #[test]
    fn adjacent_duplicates_collapse() {
        let out = parse_output("ERROR: same error\nERROR: same error", OutputStream::Stderr);
        assert_eq!(messages(&out), vec!["same error"]);
    }

    #[test]
    fn separated_duplicates_are_kept() {
        let out = parse_output(
            "ERROR: same error\nERROR: other error\nERROR: same error",
            OutputStream::Stderr,
        );
        assert_eq!(
            messages(&out),
            vec!["same error", "other error", "same error"]
        );
    }

    #[test]
    fn dedup_skips_over_noise_lines() {
        let out = parse_output(
            "ERROR: same error\nINFO retrying\n\nERROR: same error",
            OutputStream::Stderr,
        );
        assert_eq!(messages(&out), vec!["same error"]);
    }

    #[test]
    fn extracts_location_and_keeps_phrase() {
        let out = parse_output("parse error at line 42", OutputStream::Stderr);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].location.as_deref(), Some("line 42"));
        assert_eq!(out[0].message, "parse error at line 42");
    }

    #[test]
    fn location_is_case_insensitive_and_normalized() {
        let out = parse_output("ERROR: tab found on Line   7", OutputStream::Stderr);
        assert_eq!(out[0].location.as_deref(), Some("line 7"));

        // Matched as a substring, so `pipeline 3` counts too.
        let out = parse_output("ERROR: unknown pipeline 3", OutputStream::Stderr);
        assert_eq!(out[0].location.as_deref(), Some("line 3"));
        assert_eq!(out[0].message, "unknown pipeline 3");

        let out = parse_output("ERROR: lines 3 and 4", OutputStream::Stderr);
        assert_eq!(out[0].location, None);
    }

    #[test]
    fn extracts_leading_code() {
        let out = parse_output("E001: schema violation", OutputStream::Stderr);
        assert_eq!(out[0].code.as_deref(), Some("E001"));
        assert_eq!(out[0].message, "schema violation");

        let out = parse_output("ERROR: YAML12 bad indent at line 9", OutputStream::Stderr);
        assert_eq!(out[0].code.as_deref(), Some("YAML12"));
        assert_eq!(out[0].message, "bad indent at line 9");
        assert_eq!(out[0].location.as_deref(), Some("line 9"));
    }

    #[test]
    fn code_requires_a_boundary() {
        let out = parse_output("E001abc is not a code", OutputStream::Stderr);
        assert_eq!(out[0].code, None);
        assert_eq!(out[0].message, "E001abc is not a code");

        let out = parse_output("see E001: later", OutputStream::Stderr);
        assert_eq!(out[0].code, None);
    }

    #[test]
    fn bare_code_keeps_non_empty_message() {
        let out = parse_output("ERROR: E404", OutputStream::Stderr);
        assert_eq!(out[0].code.as_deref(), Some("E404"));
        assert_eq!(out[0].message, "E404");
    }

    #[test]
    fn bare_marker_line_produces_nothing() {
        let out = parse_output("ERROR:\nWARN: real warning", OutputStream::Stderr);
        assert_eq!(messages(&out), vec!["real warning"]);
    }

    #[test]
    fn unparseable_text_becomes_single_fallback() {
        let raw = "some unparseable binary garbage output";
        let out = parse_output(raw, OutputStream::Stderr);
        assert_eq!(out.len(), 1);
        assert!(out[0].message.contains(raw));
    }

    #[test]
    fn handles_crlf_and_indentation() {
        let out = parse_output(
            "  ERROR: first\r\n\r\n\tWARN: second  \r\n",
            OutputStream::Stderr,
        );
        assert_eq!(messages(&out), vec!["first", "second"]);
    }

    #[test]
    fn stream_flag_does_not_change_parsing() {
        let raw = "ERROR: E1: a\nWARN: b at line 2\nINFO c";
        assert_eq!(
            parse_output(raw, OutputStream::Stderr),
            parse_output(raw, OutputStream::Stdout)
        );
    }

    #[test]
    fn only_the_first_marker_is_stripped() {
        let out = parse_output("ERROR: ERROR: x", OutputStream::Stderr);
        assert_eq!(messages(&out), vec!["ERROR: x"]);
        // Feeding messages back in strips one more layer.
        let again = parse_output(&messages(&out).join("\n"), OutputStream::Stderr);
        assert_eq!(messages(&again), vec!["x"]);

        // Noise is only checked before the marker is removed.
        let out = parse_output("ERROR: INFO a\nERROR: b", OutputStream::Stderr);
        assert_eq!(messages(&out), vec!["INFO a", "b"]);
        let again = parse_output(&messages(&out).join("\n"), OutputStream::Stderr);
        assert_eq!(messages(&again), vec!["b"]);
    }

    #[test]
    fn reparsing_plain_messages_is_stable() {
        let raw = "INFO start\nERROR: missing field at line 3\nWARN: deprecated\nE002: bad key";
        let first = parse_output(raw, OutputStream::Stderr);
        let joined = messages(&first).join("\n");
        let second = parse_output(&joined, OutputStream::Stderr);
        assert_eq!(messages(&first), messages(&second));
    }

    #[test]
    fn serializes_without_absent_fields() {
        let v = serde_json::to_value(Diagnostic::new("x")).unwrap();
        assert_eq!(v, serde_json::json!({ "message": "x" }));
    }
}
