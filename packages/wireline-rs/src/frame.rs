//! Command and result frames.
//!
//! A frame is one line of text. Parsing uses shell-style tokenization so
//! quoted values survive embedded spaces; formatting re-quotes as needed.

use crate::code::WireCode;
use crate::value::{quote, ValueMap};

/// Frame parse failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty line")]
    Empty,

    #[error("malformed line (unbalanced quoting)")]
    Tokenize,

    #[error("invalid command id '{0}'")]
    InvalidId(String),

    #[error("missing command name")]
    MissingName,

    #[error("invalid complete flag '{0}'")]
    InvalidComplete(String),

    #[error("invalid error code '{0}'")]
    InvalidCode(String),

    #[error("malformed argument '{0}' (expected key=value)")]
    MalformedArgument(String),
}

/// A client → server command: `<id> <name> <key>=<value> …`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub id: u32,
    pub name: String,
    pub args: ValueMap,
}

impl CommandFrame {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            args: ValueMap::new(),
        }
    }

    pub fn with_args(id: u32, name: impl Into<String>, args: ValueMap) -> Self {
        Self {
            id,
            name: name.into(),
            args,
        }
    }

    /// Parse one request line.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let mut tokens = tokenize(line)?.into_iter();

        let id_token = tokens.next().ok_or(FrameError::Empty)?;
        let id = id_token
            .parse()
            .map_err(|_| FrameError::InvalidId(id_token.clone()))?;

        let name = tokens.next().ok_or(FrameError::MissingName)?;

        let args = parse_args(tokens)?;
        Ok(Self { id, name, args })
    }

    /// Format as one wire line (no trailing newline).
    pub fn format(&self) -> String {
        let mut line = format!("{} {}", self.id, self.name);
        if !self.args.is_empty() {
            line.push(' ');
            line.push_str(&self.args.format());
        }
        line
    }
}

/// A server → client result: `<id> <complete 0|1> <errorCode> <key>=<value> …`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFrame {
    pub id: u32,
    pub complete: bool,
    pub code: WireCode,
    pub data: ValueMap,
}

impl ResultFrame {
    /// A terminal success frame.
    pub fn ok(id: u32, data: ValueMap) -> Self {
        Self {
            id,
            complete: true,
            code: WireCode::Ok,
            data,
        }
    }

    /// An intermediate row of a multi-row result.
    pub fn row(id: u32, data: ValueMap) -> Self {
        Self {
            id,
            complete: false,
            code: WireCode::Ok,
            data,
        }
    }

    /// A terminal error frame carrying a human message under `message`.
    pub fn error(id: u32, code: WireCode, message: impl std::fmt::Display) -> Self {
        Self {
            id,
            complete: true,
            code,
            data: ValueMap::new().with("message", message),
        }
    }

    /// Parse one result line.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let mut tokens = tokenize(line)?.into_iter();

        let id_token = tokens.next().ok_or(FrameError::Empty)?;
        let id = id_token
            .parse()
            .map_err(|_| FrameError::InvalidId(id_token.clone()))?;

        let complete_token = tokens.next().ok_or_else(|| {
            FrameError::InvalidComplete(String::new())
        })?;
        let complete = match complete_token.as_str() {
            "0" => false,
            "1" => true,
            other => return Err(FrameError::InvalidComplete(other.to_string())),
        };

        let code_token = tokens
            .next()
            .ok_or_else(|| FrameError::InvalidCode(String::new()))?;
        let code: u32 = code_token
            .parse()
            .map_err(|_| FrameError::InvalidCode(code_token.clone()))?;

        let data = parse_args(tokens)?;
        Ok(Self {
            id,
            complete,
            code: WireCode::from_code(code),
            data,
        })
    }

    /// Format as one wire line (no trailing newline).
    pub fn format(&self) -> String {
        let mut line = format!(
            "{} {} {}",
            self.id,
            if self.complete { 1 } else { 0 },
            self.code.code()
        );
        if !self.data.is_empty() {
            line.push(' ');
            line.push_str(&self.data.format());
        }
        line
    }
}

fn tokenize(line: &str) -> Result<Vec<String>, FrameError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return Err(FrameError::Empty);
    }
    shlex::split(trimmed).ok_or(FrameError::Tokenize)
}

fn parse_args(tokens: impl Iterator<Item = String>) -> Result<ValueMap, FrameError> {
    let mut args = ValueMap::new();
    for token in tokens {
        // Split at the first '=' only; values may themselves contain '='.
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| FrameError::MalformedArgument(token.clone()))?;
        if key.is_empty() {
            return Err(FrameError::MalformedArgument(token.clone()));
        }
        args.set(key, value);
    }
    Ok(args)
}

/// Format a server-initiated prompt row: a `complete=0` success row the
/// client must answer with `actionResult id=<id> …`.
pub fn prompt(id: u32, data: ValueMap) -> ResultFrame {
    ResultFrame::row(id, data)
}

/// Quote one value the way [`ValueMap::format`] would.
pub fn quote_value(value: &str) -> String {
    quote(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_command() {
        let frame = CommandFrame::parse("17 jobStart jobUUID=abc type=FULL").unwrap();
        assert_eq!(frame.id, 17);
        assert_eq!(frame.name, "jobStart");
        assert_eq!(frame.args.get_str("type").unwrap(), "FULL");
    }

    #[test]
    fn test_parse_quoted_value() {
        let frame = CommandFrame::parse("3 jobNew name='my backup job'").unwrap();
        assert_eq!(frame.args.get_str("name").unwrap(), "my backup job");
    }

    #[test]
    fn test_command_round_trip() {
        let original = CommandFrame::with_args(
            9,
            "scheduleAdd",
            ValueMap::new()
                .with("date", "*-*-*")
                .with("customText", "nightly run"),
        );
        let parsed = CommandFrame::parse(&original.format()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_value_with_equals_sign() {
        let frame = CommandFrame::parse("5 jobOptionSet name=compress value=zstd=9").unwrap();
        assert_eq!(frame.args.get_str("value").unwrap(), "zstd=9");
    }

    #[test]
    fn test_parse_result() {
        let frame = ResultFrame::parse("12 1 0 count=4").unwrap();
        assert!(frame.complete);
        assert_eq!(frame.code, WireCode::Ok);
        assert_eq!(frame.data.get::<u32>("count").unwrap(), 4);
    }

    #[test]
    fn test_result_error_round_trip() {
        let original = ResultFrame::error(4, WireCode::JobNotFound, "no job with that UUID");
        let parsed = ResultFrame::parse(&original.format()).unwrap();
        assert_eq!(parsed, original);
        assert!(!parsed.code.is_ok());
    }

    #[test]
    fn test_result_row_not_complete() {
        let row = ResultFrame::row(8, ValueMap::new().with("name", "e1"));
        assert!(row.format().starts_with("8 0 0 "));
    }

    #[test]
    fn test_unknown_code_collapses() {
        let frame = ResultFrame::parse("1 1 999").unwrap();
        assert_eq!(frame.code, WireCode::Failure);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CommandFrame::parse("").is_err());
        assert!(CommandFrame::parse("x jobList").is_err());
        assert!(CommandFrame::parse("1").is_err());
        assert!(CommandFrame::parse("1 jobList loose-token").is_err());
        assert!(ResultFrame::parse("1 2 0").is_err());
    }
}
