//! Access-log line grammar.
//!
//! A line is accepted when it starts with
//!
//! ```text
//! HOST - USER [DATE] "REQUEST_LINE" CODE BYTES
//! ```
//!
//! where `HOST` is an IPv4 dotted quad, `localhost` or `::1`, and
//! `REQUEST_LINE` is either `-` or `METHOD URL PROTOCOL`. Anything after
//! `BYTES` (the referer and user agent of the combined format) is ignored.
//!
//! Lines that do not match are dropped: a half-written line seen mid-append
//! must never stall the pipeline, so a no-match is `None`, not an error.

use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::models::LogRecord;

static LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?P<ip>(?:(?:[1-9]?[0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}",
        r"(?:[1-9]?[0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])|localhost|::1)",
        r" (?P<separator>-)",
        r" (?P<user>.+|-)",
        r" \[(?P<date>.+)\]",
        r#" "(?:-|(?P<method>.*) (?P<url>.*)? (?P<protocol>.*)?)""#,
        r" (?P<code>[0-9]{3})",
        r" (?P<byte>[0-9]+|-)",
    ))
    .unwrap()
});

/// Value persisted in place of a literal `-` or an empty capture.
pub const DASH_REPLACEMENT: &str = "0";

/// Returns `true` if the line satisfies the grammar.
pub fn is_match(line: &str) -> bool {
    LINE_REGEX.is_match(trim_line(line))
}

/// Parses one raw line into a normalized [`LogRecord`].
pub fn parse_line(line: &str) -> Option<LogRecord> {
    let caps = LINE_REGEX.captures(trim_line(line))?;

    Some(LogRecord {
        ip: field(&caps, "ip"),
        separator: field(&caps, "separator"),
        user: field(&caps, "user"),
        date: field(&caps, "date"),
        method: field(&caps, "method"),
        url: field(&caps, "url"),
        protocol: field(&caps, "protocol"),
        status_code: field(&caps, "code"),
        byte_count: field(&caps, "byte"),
    })
}

fn trim_line(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

fn field(caps: &Captures<'_>, name: &str) -> String {
    normalize(caps.name(name).map(|m| m.as_str()))
}

/// A literal `-`, an empty capture and an absent group all become `"0"`.
fn normalize(raw: Option<&str>) -> String {
    match raw {
        None | Some("") | Some("-") => DASH_REPLACEMENT.to_string(),
        Some(value) => value.to_string(),
    }
}
