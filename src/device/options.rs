//! Device option strings
//!
//! `device_options` is a comma-separated list of `key=value` tokens and bare
//! flags. Every backend declares the keys it understands; anything else is
//! rejected, naming the offending token.

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
    #[error("unknown device option \"{0}\"")]
    Unknown(String),

    #[error("device option \"{0}\" requires a value")]
    MissingValue(String),

    #[error("device option \"{0}\" is a flag and takes no value")]
    UnexpectedValue(String),

    #[error("device option \"{0}\" given more than once")]
    Duplicate(String),

    #[error("device option \"{token}\" is not a number")]
    NotNumeric { token: String },

    #[error("required device option \"{0}\" is missing")]
    Required(String),
}

impl OptionError {
    /// The token the error is about
    pub fn token(&self) -> &str {
        match self {
            OptionError::Unknown(t)
            | OptionError::MissingValue(t)
            | OptionError::UnexpectedValue(t)
            | OptionError::Duplicate(t)
            | OptionError::Required(t) => t,
            OptionError::NotNumeric { token } => token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// `key=value`
    Value,
    /// bare `key`
    Flag,
}

/// One recognised option key
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub key: &'static str,
    pub kind: OptionKind,
}

pub const fn value(key: &'static str) -> OptionSpec {
    OptionSpec {
        key,
        kind: OptionKind::Value,
    }
}

pub const fn flag(key: &'static str) -> OptionSpec {
    OptionSpec {
        key,
        kind: OptionKind::Flag,
    }
}

/// Parsed device options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceOptions {
    values: BTreeMap<&'static str, String>,
    flags: BTreeSet<&'static str>,
}

impl DeviceOptions {
    /// Parse `input` against the keys a backend recognises.
    pub fn parse(input: &str, table: &[OptionSpec]) -> Result<Self, OptionError> {
        let mut options = DeviceOptions::default();

        for token in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (token, None),
            };

            let spec = table
                .iter()
                .find(|spec| spec.key == key)
                .ok_or_else(|| OptionError::Unknown(token.to_string()))?;

            match (spec.kind, value) {
                (OptionKind::Flag, None) => {
                    if !options.flags.insert(spec.key) {
                        return Err(OptionError::Duplicate(token.to_string()));
                    }
                }
                (OptionKind::Flag, Some(_)) => {
                    return Err(OptionError::UnexpectedValue(token.to_string()));
                }
                (OptionKind::Value, None) | (OptionKind::Value, Some("")) => {
                    return Err(OptionError::MissingValue(token.to_string()));
                }
                (OptionKind::Value, Some(value)) => {
                    if options.values.insert(spec.key, value.to_string()).is_some() {
                        return Err(OptionError::Duplicate(token.to_string()));
                    }
                }
            }
        }

        Ok(options)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, OptionError> {
        self.get(key)
            .ok_or_else(|| OptionError::Required(format!("{}=", key)))
    }

    pub fn flag(&self, key: &str) -> bool {
        self.flags.contains(key)
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, OptionError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<u64>()
                .map(Some)
                .map_err(|_| OptionError::NotNumeric {
                    token: format!("{}={}", key, value),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[OptionSpec] = &[value("bucket"), value("stripe_unit"), flag("striped")];

    #[test]
    fn test_parse_values_and_flags() {
        let options = DeviceOptions::parse("bucket=backup, striped,stripe_unit=4096", TABLE).unwrap();
        assert_eq!(options.get("bucket"), Some("backup"));
        assert!(options.flag("striped"));
        assert_eq!(options.get_u64("stripe_unit").unwrap(), Some(4096));
    }

    #[test]
    fn test_empty_string() {
        let options = DeviceOptions::parse("", TABLE).unwrap();
        assert_eq!(options, DeviceOptions::default());
    }

    #[test]
    fn test_unknown_token_named() {
        let err = DeviceOptions::parse("bucket=b,insecure_http", TABLE).unwrap_err();
        assert_eq!(err, OptionError::Unknown("insecure_http".to_string()));
        assert_eq!(err.token(), "insecure_http");
    }

    #[test]
    fn test_malformed_tokens() {
        assert_eq!(
            DeviceOptions::parse("bucket", TABLE).unwrap_err(),
            OptionError::MissingValue("bucket".to_string())
        );
        assert_eq!(
            DeviceOptions::parse("bucket=", TABLE).unwrap_err(),
            OptionError::MissingValue("bucket=".to_string())
        );
        assert_eq!(
            DeviceOptions::parse("striped=yes", TABLE).unwrap_err(),
            OptionError::UnexpectedValue("striped=yes".to_string())
        );
        assert_eq!(
            DeviceOptions::parse("bucket=a,bucket=b", TABLE).unwrap_err(),
            OptionError::Duplicate("bucket=b".to_string())
        );
    }

    #[test]
    fn test_not_numeric() {
        let options = DeviceOptions::parse("stripe_unit=big", TABLE).unwrap();
        let err = options.get_u64("stripe_unit").unwrap_err();
        assert_eq!(err.token(), "stripe_unit=big");
    }

    #[test]
    fn test_require() {
        let options = DeviceOptions::parse("striped", TABLE).unwrap();
        assert_eq!(options.require("bucket").unwrap_err().token(), "bucket=");
    }
}
