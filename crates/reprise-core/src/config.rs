//! Runtime configuration loaded from TOML.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How much of an uncaught error is shown to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorDetails {
    /// Message, type and stack trace.
    #[default]
    Full,
    /// Type and stack trace; the message is redacted.
    StackTrace,
    /// Only the type.
    Type,
    /// Nothing but a generic notice.
    None,
}

impl FromStr for ErrorDetails {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "full" | "true" => Ok(ErrorDetails::Full),
            "stacktrace" | "false" => Ok(ErrorDetails::StackTrace),
            "type" => Ok(ErrorDetails::Type),
            "none" => Ok(ErrorDetails::None),
            other => Err(format!(
                "unknown show_error_details value `{other}` (expected full, stacktrace, type or none)"
            )),
        }
    }
}

impl From<bool> for ErrorDetails {
    fn from(show: bool) -> Self {
        if show {
            ErrorDetails::Full
        } else {
            ErrorDetails::StackTrace
        }
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorDetails::Full => "full",
            ErrorDetails::StackTrace => "stacktrace",
            ErrorDetails::Type => "type",
            ErrorDetails::None => "none",
        };
        f.write_str(name)
    }
}

impl<'de> Deserialize<'de> for ErrorDetails {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Flag(flag) => Ok(flag.into()),
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub show_error_details: ErrorDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Longest time buffered text waits before it is flushed.
    pub flush_interval_ms: u64,
    /// Unflushed text size that forces a flush.
    pub flush_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 50,
            flush_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Stack frames before the first frame containing this are trimmed.
    pub user_frame_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 120,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Top-level configuration shared by every session of a runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub client: ClientConfig,
    pub stream: StreamConfig,
    pub runner: RunnerConfig,
    pub session: SessionConfig,
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.client.show_error_details, ErrorDetails::Full);
        assert_eq!(config.stream.flush_interval_ms, 50);
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn show_error_details_accepts_flags_and_names() {
        let cases = [
            ("true", ErrorDetails::Full),
            ("\"True\"", ErrorDetails::Full),
            ("\"full\"", ErrorDetails::Full),
            ("false", ErrorDetails::StackTrace),
            ("\"False\"", ErrorDetails::StackTrace),
            ("\"stacktrace\"", ErrorDetails::StackTrace),
            ("\"type\"", ErrorDetails::Type),
            ("\"none\"", ErrorDetails::None),
        ];
        for (raw, expected) in cases {
            let source = format!("[client]\nshow_error_details = {raw}\n");
            let config = RuntimeConfig::from_toml_str(&source).unwrap();
            assert_eq!(config.client.show_error_details, expected, "value {raw}");
        }
    }

    #[test]
    fn unknown_detail_level_is_rejected() {
        let err = RuntimeConfig::from_toml_str("[client]\nshow_error_details = \"loud\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = RuntimeConfig::from_toml_str(
            "[stream]\nflush_bytes = 10\n\n[runner]\nuser_frame_prefix = \"app/\"\n",
        )
        .unwrap();
        assert_eq!(config.stream.flush_bytes, 10);
        assert_eq!(config.stream.flush_interval_ms, 50);
        assert_eq!(config.runner.user_frame_prefix, "app/");
    }
}
