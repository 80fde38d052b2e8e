//! Recovers structured data from raw CI job logs.
//!
//! Two things are extracted in a single pass over the bytes:
//! - metric lines (`METRIC_<name>{labels} value [timestamp]`), see [`Metric`]
//! - collapsible section markers (`section_start:<ts>:<name>` /
//!   `section_end:<ts>:<name>`), see [`Section`]

mod metrics;
mod sections;

use log::debug;
use serde::Serialize;
use thiserror::Error;

pub use metrics::{LineErrorKind, Metric};
pub use sections::{backfill_open, EofPolicy, Section, SectionStack};

/// Prefix that marks a log line as a metric sample.
pub const METRIC_PREFIX: &str = "METRIC_";

const SECTION_START: &[u8] = b"section_start:";
const SECTION_END: &[u8] = b"section_end:";

/// A rejected line. The rest of the log is still parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: usize,
    #[serde(serialize_with = "serialize_display")]
    pub kind: LineErrorKind,
}

fn serialize_display<S: serde::Serializer>(
    kind: &LineErrorKind,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(kind)
}

/// Everything recovered from one log.
#[derive(Debug, Default, Serialize)]
pub struct ParsedLog {
    pub sections: Vec<Section>,
    pub metrics: Vec<Metric>,
    pub errors: Vec<ParseError>,
}

/// Parses a job log.
///
/// Sections still open at the end of the log are returned with `end: None`.
pub fn parse(log: &[u8]) -> ParsedLog {
    parse_with(log, EofPolicy::LeaveOpen)
}

pub fn parse_with(log: &[u8], eof: EofPolicy) -> ParsedLog {
    let mut sections = SectionStack::new();
    let mut metrics = Vec::new();
    let mut errors = Vec::new();

    let mut pos = 0;
    let mut line = 1;
    while pos < log.len() {
        let end = log[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(log.len(), |i| pos + i + 1);
        let text = &log[pos..end];

        scan_section_markers(text, &mut sections);

        if let Some(rest) = text.strip_prefix(METRIC_PREFIX.as_bytes()) {
            match metrics::parse_metric(rest) {
                Ok(metric) => metrics.push(metric),
                Err(LineErrorKind::UnexpectedEof) => {
                    debug!("Discarding truncated metric on line {line}");
                }
                Err(kind) => errors.push(ParseError { line, kind }),
            }
        }

        pos = end;
        line += 1;
    }

    ParsedLog {
        sections: sections.finish(eof),
        metrics,
        errors,
    }
}

#[derive(Clone, Copy)]
enum Marker {
    Start,
    End,
}

fn scan_section_markers(line: &[u8], stack: &mut SectionStack) {
    let mut pos = 0;
    while pos < line.len() {
        let rest = &line[pos..];
        let found = [(SECTION_START, Marker::Start), (SECTION_END, Marker::End)]
            .into_iter()
            .filter_map(|(needle, marker)| find(rest, needle).map(|i| (i, needle.len(), marker)))
            .min_by_key(|(i, _, _)| *i);

        let Some((offset, needle_len, marker)) = found else {
            break;
        };

        let body_start = pos + offset + needle_len;
        let consumed = match parse_marker_body(&line[body_start..]) {
            Some((timestamp, name, consumed)) => {
                match marker {
                    Marker::Start => stack.start(name, timestamp),
                    Marker::End => stack.end(name, timestamp),
                }
                consumed
            }
            None => 0,
        };
        pos = body_start + consumed;
    }
}

/// Parses `<ts>:<name>` and returns the timestamp, the name and the number of
/// bytes consumed.
fn parse_marker_body(body: &[u8]) -> Option<(i64, &str, usize)> {
    let digits = body.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || body.get(digits) != Some(&b':') {
        return None;
    }
    let timestamp = std::str::from_utf8(&body[..digits]).ok()?.parse().ok()?;

    let name_start = digits + 1;
    let name_len = body[name_start..]
        .iter()
        .take_while(|&&b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        .count();
    if name_len == 0 {
        return None;
    }
    let name = std::str::from_utf8(&body[name_start..name_start + name_len]).ok()?;

    Some((timestamp, name, name_start + name_len))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
