//! Runtime configuration for notez clients.
//!
//! `SyncConfig` tunes the synchronization engine (debounce windows, echo
//! suppression, realtime reconnects). `ClientConfig` locates the note API and
//! its realtime endpoint. Both are read from the environment through a lookup
//! function so tests can exercise parsing without touching process state.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::feed::FeedScope;
use crate::util::{is_http_url, normalize_text_option, url_origin};

const DEFAULT_AUTOSAVE_DELAY_MS: u64 = 1_000;
const DEFAULT_LOAD_DEBOUNCE_MS: u64 = 500;
const DEFAULT_SELF_ECHO_WINDOW_MS: u64 = 2_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Bounded exponential backoff for realtime reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Connection attempts before giving up on realtime.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay to wait before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Timing knobs for the synchronization engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiescence window before an edit burst is persisted.
    pub autosave_delay: Duration,
    /// Quiescence window after the last key change before a load fires.
    pub load_debounce: Duration,
    /// Change notifications this close to our own last save are echoes.
    pub self_echo_window: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            autosave_delay: Duration::from_millis(DEFAULT_AUTOSAVE_DELAY_MS),
            load_debounce: Duration::from_millis(DEFAULT_LOAD_DEBOUNCE_MS),
            self_echo_window: Duration::from_millis(DEFAULT_SELF_ECHO_WINDOW_MS),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let autosave_raw = optional_trimmed(&lookup, "NOTEZ_AUTOSAVE_DELAY_MS")
            .or_else(|| optional_trimmed(&lookup, "EXPO_PUBLIC_AUTO_SAVE_DELAY_MS"));
        let autosave_delay_ms = match autosave_raw {
            Some(raw) => parse_ranged(&raw, "NOTEZ_AUTOSAVE_DELAY_MS", 100, 60_000)?,
            None => DEFAULT_AUTOSAVE_DELAY_MS,
        };

        let load_debounce_ms = parse_ranged(
            &value_or_default(
                &lookup,
                "NOTEZ_LOAD_DEBOUNCE_MS",
                &DEFAULT_LOAD_DEBOUNCE_MS.to_string(),
            ),
            "NOTEZ_LOAD_DEBOUNCE_MS",
            0,
            10_000,
        )?;

        let self_echo_window_ms = parse_ranged(
            &value_or_default(
                &lookup,
                "NOTEZ_SELF_ECHO_WINDOW_MS",
                &DEFAULT_SELF_ECHO_WINDOW_MS.to_string(),
            ),
            "NOTEZ_SELF_ECHO_WINDOW_MS",
            0,
            30_000,
        )?;

        let max_attempts = parse_ranged(
            &value_or_default(&lookup, "NOTEZ_REALTIME_MAX_ATTEMPTS", "5"),
            "NOTEZ_REALTIME_MAX_ATTEMPTS",
            1,
            50,
        )?;

        Ok(Self {
            autosave_delay: Duration::from_millis(autosave_delay_ms),
            load_debounce: Duration::from_millis(load_debounce_ms),
            self_echo_window: Duration::from_millis(self_echo_window_ms),
            reconnect: ReconnectPolicy {
                max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
                ..ReconnectPolicy::default()
            },
        })
    }
}

/// Where the note API and its change feed live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub realtime_url: String,
    pub realtime_scope: FeedScope,
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Config for an explicit API base URL with defaults for everything else.
    pub fn new(api_base_url: impl Into<String>) -> Result<Self, ConfigError> {
        let api_base_url = normalize_http_url(api_base_url.into(), "api_base_url")?;
        let realtime_url = url_origin(&api_base_url).ok_or_else(|| {
            ConfigError::Invalid(format!("cannot derive realtime origin from {api_base_url}"))
        })?;
        Ok(Self {
            api_base_url,
            realtime_url,
            realtime_scope: FeedScope::Collection,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_base_url = optional_trimmed(&lookup, "NOTEZ_API_BASE_URL")
            .or_else(|| optional_trimmed(&lookup, "EXPO_PUBLIC_API_BASE_URL"))
            .ok_or(ConfigError::MissingVar("NOTEZ_API_BASE_URL"))?;
        let mut config = Self::new(api_base_url)?;

        if let Some(realtime_url) = optional_trimmed(&lookup, "NOTEZ_REALTIME_URL") {
            config.realtime_url = normalize_http_url(realtime_url, "NOTEZ_REALTIME_URL")?;
        }

        if let Some(scope) = optional_trimmed(&lookup, "NOTEZ_REALTIME_SCOPE") {
            config.realtime_scope = match scope.to_ascii_lowercase().as_str() {
                "record" => FeedScope::Record,
                "collection" => FeedScope::Collection,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "NOTEZ_REALTIME_SCOPE must be 'record' or 'collection', got '{other}'"
                    )))
                }
            };
        }

        let timeout_secs = parse_ranged(
            &value_or_default(
                &lookup,
                "NOTEZ_REQUEST_TIMEOUT_SECS",
                &DEFAULT_REQUEST_TIMEOUT_SECS.to_string(),
            ),
            "NOTEZ_REQUEST_TIMEOUT_SECS",
            1,
            300,
        )?;
        config.request_timeout = Duration::from_secs(timeout_secs);

        Ok(config)
    }
}

fn optional_trimmed(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}

fn value_or_default(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn parse_ranged(raw: &str, name: &str, min: u64, max: u64) -> Result<u64, ConfigError> {
    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
    })?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn normalize_http_url(raw: String, field: &str) -> Result<String, ConfigError> {
    let value = normalize_text_option(Some(raw))
        .ok_or_else(|| ConfigError::Invalid(format!("{field} must not be empty")))?;
    if is_http_url(&value) {
        Ok(value.trim_end_matches('/').to_string())
    } else {
        Err(ConfigError::Invalid(format!(
            "{field} must include http:// or https://"
        )))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |name| values.get(name).cloned()
    }

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.autosave_delay, Duration::from_millis(1_000));
        assert_eq!(config.self_echo_window, Duration::from_millis(2_000));
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn sync_config_honours_legacy_autosave_variable() {
        let config =
            SyncConfig::from_lookup(lookup_from(&[("EXPO_PUBLIC_AUTO_SAVE_DELAY_MS", "2500")]))
                .unwrap();
        assert_eq!(config.autosave_delay, Duration::from_millis(2_500));

        let config = SyncConfig::from_lookup(lookup_from(&[
            ("EXPO_PUBLIC_AUTO_SAVE_DELAY_MS", "2500"),
            ("NOTEZ_AUTOSAVE_DELAY_MS", "750"),
        ]))
        .unwrap();
        assert_eq!(config.autosave_delay, Duration::from_millis(750));
    }

    #[test]
    fn sync_config_rejects_out_of_range_values() {
        let error = SyncConfig::from_lookup(lookup_from(&[("NOTEZ_AUTOSAVE_DELAY_MS", "5")]))
            .unwrap_err();
        assert!(error.to_string().contains("NOTEZ_AUTOSAVE_DELAY_MS"));

        let error =
            SyncConfig::from_lookup(lookup_from(&[("NOTEZ_REALTIME_MAX_ATTEMPTS", "many")]))
                .unwrap_err();
        assert!(error.to_string().contains("integer"));
    }

    #[test]
    fn reconnect_delay_grows_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn client_config_requires_api_base_url() {
        let error = ClientConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(error, ConfigError::MissingVar("NOTEZ_API_BASE_URL")));
    }

    #[test]
    fn client_config_derives_realtime_origin() {
        let config = ClientConfig::from_lookup(lookup_from(&[(
            "EXPO_PUBLIC_API_BASE_URL",
            "https://pb.example.com/api/secretnotes/",
        )]))
        .unwrap();
        assert_eq!(config.api_base_url, "https://pb.example.com/api/secretnotes");
        assert_eq!(config.realtime_url, "https://pb.example.com");
        assert_eq!(config.realtime_scope, FeedScope::Collection);
    }

    #[test]
    fn client_config_parses_scope_and_rejects_bad_urls() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("NOTEZ_API_BASE_URL", "http://localhost:8090/api"),
            ("NOTEZ_REALTIME_SCOPE", "Record"),
        ]))
        .unwrap();
        assert_eq!(config.realtime_scope, FeedScope::Record);

        let error = ClientConfig::from_lookup(lookup_from(&[(
            "NOTEZ_API_BASE_URL",
            "localhost:8090/api",
        )]))
        .unwrap_err();
        assert!(error.to_string().contains("http://"));
    }
}
