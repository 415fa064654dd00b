//! Typed key-value argument maps.
//!
//! Both command and result frames carry a flat `key=value` map. Accessors
//! parse values on demand and report explicit failure modes so callers can
//! map them to wire errors (`ExpectedParameter`, `InvalidValue`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Failure modes when reading a typed value out of a map.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValueError {
    /// The key is absent.
    #[error("expected parameter '{0}'")]
    Missing(String),

    /// The key is present but its value does not parse as the requested type.
    #[error("invalid value '{value}' for parameter '{key}'")]
    Invalid {
        /// The offending key.
        key: String,
        /// The raw value as received.
        value: String,
    },
}

/// An ordered `key=value` map.
///
/// Keys are kept sorted so formatted frames are deterministic, which keeps
/// the protocol diffable in logs and stable in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueMap {
    entries: BTreeMap<String, String>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous one under the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl fmt::Display) -> &mut Self {
        self.entries.insert(key.into(), value.to_string());
        self
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.set(key, value);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Raw string access.
    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Required string value.
    pub fn get_str(&self, key: &str) -> Result<&str, ValueError> {
        self.get_raw(key)
            .ok_or_else(|| ValueError::Missing(key.to_string()))
    }

    /// Optional string value with a default.
    pub fn get_str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_raw(key).unwrap_or(default)
    }

    /// Required value parsed via [`FromStr`].
    pub fn get<T: FromStr>(&self, key: &str) -> Result<T, ValueError> {
        let raw = self.get_str(key)?;
        raw.parse().map_err(|_| ValueError::Invalid {
            key: key.to_string(),
            value: raw.to_string(),
        })
    }

    /// Optional value parsed via [`FromStr`]; absent keys yield `None`,
    /// unparseable values still fail.
    pub fn get_opt<T: FromStr>(&self, key: &str) -> Result<Option<T>, ValueError> {
        match self.get_raw(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| ValueError::Invalid {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
        }
    }

    /// Optional value with a fallback default.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ValueError> {
        Ok(self.get_opt(key)?.unwrap_or(default))
    }

    /// Booleans accept `yes|no`, `true|false`, `1|0`, `on|off`.
    pub fn get_bool(&self, key: &str) -> Result<bool, ValueError> {
        let raw = self.get_str(key)?;
        parse_bool(raw).ok_or_else(|| ValueError::Invalid {
            key: key.to_string(),
            value: raw.to_string(),
        })
    }

    /// Optional boolean with a default.
    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool, ValueError> {
        match self.get_raw(key) {
            None => Ok(default),
            Some(raw) => parse_bool(raw).ok_or_else(|| ValueError::Invalid {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    /// Required UUID value.
    pub fn get_uuid(&self, key: &str) -> Result<Uuid, ValueError> {
        self.get(key)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Format as `key=value` tokens with shell quoting where needed.
    pub fn format(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.iter() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(&quote(value));
        }
        out
    }
}

impl FromIterator<(String, String)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Some(true),
        "no" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

/// Quote a value for the wire when it contains whitespace or shell-special
/// characters; bare values pass through unchanged.
pub fn quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    match shlex::try_quote(value) {
        Ok(quoted) => quoted.into_owned(),
        // Values containing NUL cannot be quoted; strip it rather than
        // corrupting the line framing.
        Err(_) => {
            let cleaned: String = value.chars().filter(|c| *c != '\0').collect();
            shlex::try_quote(&cleaned)
                .map(|q| q.into_owned())
                .unwrap_or_default()
        }
    }
}
