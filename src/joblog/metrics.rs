use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::METRIC_PREFIX;

/// A metric sample emitted by a job script.
///
/// Written to the log as `METRIC_<name>{<labels>} <value> [<timestamp>]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub labels: IndexMap<String, String>,
    pub value: f64,
    pub timestamp: Option<i64>,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(METRIC_PREFIX)?;
        f.write_str(&self.name)?;
        if !self.labels.is_empty() {
            f.write_str("{")?;
            for (i, (name, value)) in self.labels.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{name}=\"{}\"", escape_label_value(value))?;
            }
            f.write_str("}")?;
        }
        write!(f, " {}", self.value)?;
        if let Some(timestamp) = self.timestamp {
            write!(f, " {timestamp}")?;
        }
        Ok(())
    }
}

fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Why a metric line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid metric name")]
    InvalidMetricName,
    #[error("invalid label name")]
    InvalidLabelName,
    #[error("duplicate label '{0}'")]
    DuplicateLabel(String),
    #[error("invalid escape sequence '\\{0}' in label value")]
    InvalidEscape(char),
    #[error("unescaped newline in label value")]
    NewlineInLabelValue,
    #[error("label set is not terminated")]
    UnterminatedLabels,
    #[error("label value is not valid UTF-8")]
    InvalidUtf8,
    #[error("expected {0}")]
    Expected(&'static str),
    #[error("missing metric value")]
    MissingValue,
    #[error("invalid metric value '{0}'")]
    InvalidValue(String),
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("unexpected characters after timestamp")]
    TrailingCharacters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingMetricName,
    ReadingLabels,
    StartLabelName,
    StartLabelValue,
    ReadingValue,
    StartTimestamp,
    Done,
}

/// Parses one metric line, starting right after the prefix.
///
/// `input` runs to the end of the line and includes the terminating `\n` when
/// there is one; running out of bytes therefore means end of the whole log.
pub(crate) fn parse_metric(input: &[u8]) -> Result<Metric, LineErrorKind> {
    let mut lexer = MetricLexer::new(input);
    let mut state = State::ReadingMetricName;

    loop {
        state = match state {
            State::ReadingMetricName => lexer.read_metric_name()?,
            State::ReadingLabels => lexer.read_labels()?,
            State::StartLabelName => lexer.read_label_name()?,
            State::StartLabelValue => lexer.read_label_value()?,
            State::ReadingValue => lexer.read_value()?,
            State::StartTimestamp => lexer.read_timestamp()?,
            State::Done => return Ok(lexer.finish()),
        };
    }
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b':'
}

fn is_label_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_label_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_blank(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r')
}

struct MetricLexer<'a> {
    input: &'a [u8],
    pos: usize,
    name: String,
    labels: IndexMap<String, String>,
    label_name: String,
    value: f64,
    timestamp: Option<i64>,
}

impl<'a> MetricLexer<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            name: String::new(),
            labels: IndexMap::new(),
            label_name: String::new(),
            value: 0.0,
            timestamp: None,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn skip_blanks(&mut self) {
        while self.peek().is_some_and(is_blank) {
            self.bump();
        }
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a [u8] {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
        &self.input[start..self.pos]
    }

    fn take_token(&mut self) -> &'a [u8] {
        self.take_while(|b| !is_blank(b) && b != b'\n')
    }

    fn ascii(bytes: &[u8]) -> String {
        bytes.iter().copied().map(char::from).collect()
    }

    fn read_metric_name(&mut self) -> Result<State, LineErrorKind> {
        match self.peek() {
            None => return Err(LineErrorKind::UnexpectedEof),
            Some(b) if is_name_start(b) => {}
            Some(_) => return Err(LineErrorKind::InvalidMetricName),
        }
        let name = self.take_while(is_name_char);
        self.name = Self::ascii(name);
        Ok(State::ReadingLabels)
    }

    fn read_labels(&mut self) -> Result<State, LineErrorKind> {
        match self.peek() {
            Some(b'{') => {
                self.bump();
                return Ok(State::StartLabelName);
            }
            Some(b) if is_blank(b) => {}
            None => return Err(LineErrorKind::UnexpectedEof),
            Some(b'\n') => return Err(LineErrorKind::MissingValue),
            Some(_) => return Err(LineErrorKind::InvalidMetricName),
        }

        self.skip_blanks();
        if self.peek() == Some(b'{') {
            self.bump();
            Ok(State::StartLabelName)
        } else {
            Ok(State::ReadingValue)
        }
    }

    fn read_label_name(&mut self) -> Result<State, LineErrorKind> {
        self.skip_blanks();
        match self.peek() {
            Some(b'}') => {
                self.bump();
                return Ok(State::ReadingValue);
            }
            None => return Err(LineErrorKind::UnexpectedEof),
            Some(b'\n') => return Err(LineErrorKind::UnterminatedLabels),
            Some(b) if is_label_start(b) => {}
            Some(_) => return Err(LineErrorKind::InvalidLabelName),
        }

        let name = self.take_while(is_label_char);
        self.label_name = Self::ascii(name);

        self.expect(b'=', "'=' after label name")?;
        self.expect(b'"', "'\"' to open label value")?;
        Ok(State::StartLabelValue)
    }

    fn expect(&mut self, byte: u8, what: &'static str) -> Result<(), LineErrorKind> {
        self.skip_blanks();
        match self.peek() {
            Some(b) if b == byte => {
                self.bump();
                Ok(())
            }
            None => Err(LineErrorKind::UnexpectedEof),
            Some(_) => Err(LineErrorKind::Expected(what)),
        }
    }

    fn read_label_value(&mut self) -> Result<State, LineErrorKind> {
        let mut value = Vec::new();
        loop {
            match self.peek() {
                None => return Err(LineErrorKind::UnexpectedEof),
                Some(b'\n') => return Err(LineErrorKind::NewlineInLabelValue),
                Some(b'"') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    match self.peek() {
                        Some(b'"') => value.push(b'"'),
                        Some(b'\\') => value.push(b'\\'),
                        Some(b'n') => value.push(b'\n'),
                        None => return Err(LineErrorKind::UnexpectedEof),
                        Some(other) => return Err(LineErrorKind::InvalidEscape(char::from(other))),
                    }
                    self.bump();
                }
                Some(b) => {
                    value.push(b);
                    self.bump();
                }
            }
        }

        let value = String::from_utf8(value).map_err(|_| LineErrorKind::InvalidUtf8)?;
        let name = std::mem::take(&mut self.label_name);
        if self.labels.contains_key(&name) {
            return Err(LineErrorKind::DuplicateLabel(name));
        }
        self.labels.insert(name, value);

        self.skip_blanks();
        match self.peek() {
            Some(b',') => {
                self.bump();
                Ok(State::StartLabelName)
            }
            Some(b'}') => {
                self.bump();
                Ok(State::ReadingValue)
            }
            None => Err(LineErrorKind::UnexpectedEof),
            Some(b'\n') => Err(LineErrorKind::UnterminatedLabels),
            Some(_) => Err(LineErrorKind::Expected("',' or '}' after label value")),
        }
    }

    fn read_value(&mut self) -> Result<State, LineErrorKind> {
        self.skip_blanks();
        let token = self.take_token();
        if token.is_empty() {
            return match self.peek() {
                None => Err(LineErrorKind::UnexpectedEof),
                Some(_) => Err(LineErrorKind::MissingValue),
            };
        }

        let invalid = || LineErrorKind::InvalidValue(String::from_utf8_lossy(token).into_owned());
        // Rejects hex floats and digit separators.
        if token.iter().any(|b| matches!(b, b'p' | b'P' | b'_')) {
            return Err(invalid());
        }
        self.value = std::str::from_utf8(token)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(invalid)?;

        Ok(State::StartTimestamp)
    }

    fn read_timestamp(&mut self) -> Result<State, LineErrorKind> {
        self.skip_blanks();
        if matches!(self.peek(), None | Some(b'\n')) {
            return Ok(State::Done);
        }

        let token = self.take_token();
        let timestamp = std::str::from_utf8(token)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                LineErrorKind::InvalidTimestamp(String::from_utf8_lossy(token).into_owned())
            })?;
        self.timestamp = Some(timestamp);

        self.skip_blanks();
        match self.peek() {
            None | Some(b'\n') => Ok(State::Done),
            Some(_) => Err(LineErrorKind::TrailingCharacters),
        }
    }

    fn finish(self) -> Metric {
        Metric {
            name: self.name,
            labels: self.labels,
            value: self.value,
            timestamp: self.timestamp,
        }
    }
}
