// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven configuration for the channel subsystem.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{DEFAULT_MAX_STORAGE_SIZE, DEFAULT_SEND_TIMEOUT};
use crate::errors::ConfigError;
use crate::group::ChannelGroupConfig;
use crate::ingestion::LogUrl;

pub const ENV_LOG_URL: &str = "TELEMETRY_LOG_URL";
pub const ENV_APP_SECRET: &str = "TELEMETRY_APP_SECRET";
pub const ENV_MAX_STORAGE_SIZE: &str = "TELEMETRY_MAX_STORAGE_SIZE";
pub const ENV_STORAGE_PATH: &str = "TELEMETRY_STORAGE_PATH";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "TELEMETRY_HTTP_TIMEOUT_SECS";
pub const ENV_COMPRESSION_LEVEL: &str = "TELEMETRY_COMPRESSION_LEVEL";
pub const ENV_LOG_LEVEL: &str = "TELEMETRY_LOG_LEVEL";
pub const ENV_GROUP: &str = "TELEMETRY_GROUP";
pub const ENV_ENABLED: &str = "TELEMETRY_ENABLED";

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_GROUP: &str = "telemetry";

/// Settings for the channel subsystem resolved from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEnv {
    pub log_url: LogUrl,
    pub app_secret: Option<String>,
    pub max_storage_size: u64,
    /// `None` keeps the store in memory.
    pub storage_path: Option<PathBuf>,
    pub http_timeout: Duration,
    pub compression_level: Option<i32>,
    pub log_level: String,
    /// Group that forwarded logs are enqueued under.
    pub group: String,
    pub enabled: bool,
}

impl Default for ChannelEnv {
    fn default() -> Self {
        Self {
            log_url: LogUrl::default(),
            app_secret: None,
            max_storage_size: DEFAULT_MAX_STORAGE_SIZE,
            storage_path: None,
            http_timeout: DEFAULT_SEND_TIMEOUT,
            compression_level: None,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            group: DEFAULT_GROUP.to_string(),
            enabled: true,
        }
    }
}

impl ChannelEnv {
    /// Reads settings from the current process environment.
    pub fn from_os_env() -> Result<Self, ConfigError> {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from an iterator of key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| map.get(key).and_then(|value| sanitize_non_empty(value));
        let defaults = Self::default();

        let log_url = match get(ENV_LOG_URL) {
            Some(raw) => LogUrl::parse(&raw)?,
            None => defaults.log_url,
        };
        let max_storage_size = match get(ENV_MAX_STORAGE_SIZE) {
            Some(raw) => parse_number(ENV_MAX_STORAGE_SIZE, &raw)?,
            None => defaults.max_storage_size,
        };
        let http_timeout = match get(ENV_HTTP_TIMEOUT_SECS) {
            Some(raw) => Duration::from_secs(parse_number(ENV_HTTP_TIMEOUT_SECS, &raw)?),
            None => defaults.http_timeout,
        };
        let compression_level = get(ENV_COMPRESSION_LEVEL)
            .map(|raw| parse_number(ENV_COMPRESSION_LEVEL, &raw))
            .transpose()?;

        Ok(Self {
            log_url,
            app_secret: get(ENV_APP_SECRET),
            max_storage_size,
            storage_path: get(ENV_STORAGE_PATH).map(PathBuf::from),
            http_timeout,
            compression_level,
            log_level: get(ENV_LOG_LEVEL).unwrap_or(defaults.log_level),
            group: get(ENV_GROUP).unwrap_or(defaults.group),
            enabled: parse_bool(map.get(ENV_ENABLED).map(String::as_str), true),
        })
    }

    /// Settings of the group's default transport.
    #[must_use]
    pub fn to_group_config(&self) -> ChannelGroupConfig {
        ChannelGroupConfig {
            log_url: self.log_url.clone(),
            app_secret: self.app_secret.clone().unwrap_or_default(),
            install_id: None,
            http_timeout: self.http_timeout,
            compression_level: self.compression_level,
        }
    }
}

/// Helper trimming whitespace and discarding empty values.
fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_env_defaults() {
        let env = ChannelEnv::from_env_iter::<Vec<(String, String)>, _, _>(vec![]).unwrap();
        assert_eq!(env, ChannelEnv::default());
        assert_eq!(env.log_url.as_str(), "https://in.appcenter.ms");
        assert_eq!(env.max_storage_size, 10 * 1024 * 1024);
        assert!(env.storage_path.is_none());
        assert!(env.enabled);
    }

    #[test]
    fn channel_env_honours_overrides() {
        let env = ChannelEnv::from_env_iter([
            (ENV_LOG_URL, "http://localhost:8080/"),
            (ENV_APP_SECRET, "  secret \n"),
            (ENV_MAX_STORAGE_SIZE, "40960"),
            (ENV_STORAGE_PATH, "/var/lib/telemetry/logs.db"),
            (ENV_HTTP_TIMEOUT_SECS, "5"),
            (ENV_COMPRESSION_LEVEL, "3"),
            (ENV_LOG_LEVEL, "debug"),
            (ENV_GROUP, "crashes"),
            (ENV_ENABLED, "no"),
        ])
        .unwrap();

        assert_eq!(env.log_url.as_str(), "http://localhost:8080");
        assert_eq!(env.app_secret.as_deref(), Some("secret"));
        assert_eq!(env.max_storage_size, 40960);
        assert_eq!(
            env.storage_path,
            Some(PathBuf::from("/var/lib/telemetry/logs.db"))
        );
        assert_eq!(env.http_timeout, Duration::from_secs(5));
        assert_eq!(env.compression_level, Some(3));
        assert_eq!(env.log_level, "debug");
        assert_eq!(env.group, "crashes");
        assert!(!env.enabled);

        let group_config = env.to_group_config();
        assert_eq!(group_config.app_secret, "secret");
        assert_eq!(group_config.compression_level, Some(3));
    }

    #[test]
    fn channel_env_rejects_invalid_values() {
        assert_eq!(
            ChannelEnv::from_env_iter([(ENV_MAX_STORAGE_SIZE, "ten")]),
            Err(ConfigError::InvalidValue {
                key: ENV_MAX_STORAGE_SIZE,
                value: "ten".to_string()
            })
        );
        assert!(matches!(
            ChannelEnv::from_env_iter([(ENV_LOG_URL, "https://in.example.com/logs")]),
            Err(ConfigError::InvalidLogUrl { .. })
        ));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let env = ChannelEnv::from_env_iter([(ENV_APP_SECRET, "   "), (ENV_LOG_LEVEL, "")]).unwrap();
        assert!(env.app_secret.is_none());
        assert_eq!(env.log_level, DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn parse_bool_permits_common_variants() {
        assert!(parse_bool(Some("true"), false));
        assert!(parse_bool(Some("Yes"), false));
        assert!(!parse_bool(Some("0"), true));
        assert!(parse_bool(Some("maybe"), true));
        assert!(!parse_bool(None, false));
    }
}
