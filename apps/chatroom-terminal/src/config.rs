//! Environment-backed runtime configuration for `chatroom-terminal`.

use std::{env, error::Error, fmt, path::PathBuf, time::Duration};

use backend_core::RetryPolicy;
use backend_supabase::{DEFAULT_MESSAGES_TABLE, SupabaseConfig};
use chrono::FixedOffset;

const DEFAULT_DATA_DIR: &str = "./.chatroom-terminal-store";
const IDENTITY_FILENAME: &str = "identity.json";
const DEFAULT_TERMINAL_WIDTH: usize = 72;
const MIN_TERMINAL_WIDTH: usize = 32;
const DEFAULT_VIEWPORT_MESSAGES: usize = 20;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_RETRY_MAX_MS: u64 = 30_000;
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// Where messages are stored.
#[derive(Debug, Clone)]
pub enum BackendMode {
    /// Hosted Supabase project.
    Supabase(SupabaseConfig),
    /// In-process store; nothing leaves this process.
    Offline,
}

/// Runtime configuration used by the terminal app.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub backend: BackendMode,
    /// Directory holding the identity file.
    pub data_dir: PathBuf,
    /// Rendered frame width in columns.
    pub terminal_width: usize,
    /// Messages shown per frame.
    pub viewport_messages: usize,
    /// Offset used for `HH:mm` time labels.
    pub utc_offset: FixedOffset,
    /// Startup delay before a bulk load proceeds without a confirmed subscription.
    pub subscription_ready_timeout: Duration,
}

impl TerminalConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let offline = parse_optional_bool("CHATROOM_OFFLINE", false, &mut lookup)?;
        let retry_base_ms = parse_optional_u64_with_default(
            "CHATROOM_SUBSCRIPTION_RETRY_BASE_MS",
            DEFAULT_RETRY_BASE_MS,
            &mut lookup,
        )?;
        let retry_max_ms = parse_optional_u64_with_default(
            "CHATROOM_SUBSCRIPTION_RETRY_MAX_MS",
            DEFAULT_RETRY_MAX_MS,
            &mut lookup,
        )?;
        if retry_base_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHATROOM_SUBSCRIPTION_RETRY_BASE_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if retry_max_ms < retry_base_ms {
            return Err(ConfigError::InvalidValue {
                key: "CHATROOM_SUBSCRIPTION_RETRY_MAX_MS",
                value: retry_max_ms.to_string(),
                reason: format!("must be at least the base delay ({retry_base_ms})"),
            });
        }

        let backend = if offline {
            BackendMode::Offline
        } else {
            let url = optional_trimmed_env("CHATROOM_SUPABASE_URL", &mut lookup).ok_or(
                ConfigError::Missing {
                    key: "CHATROOM_SUPABASE_URL",
                },
            )?;
            let anon_key = optional_trimmed_env("CHATROOM_SUPABASE_ANON_KEY", &mut lookup)
                .ok_or(ConfigError::Missing {
                    key: "CHATROOM_SUPABASE_ANON_KEY",
                })?;
            let table = optional_trimmed_env("CHATROOM_MESSAGES_TABLE", &mut lookup)
                .unwrap_or_else(|| DEFAULT_MESSAGES_TABLE.to_owned());

            let mut supabase =
                SupabaseConfig::new(&url, &anon_key).map_err(|err| ConfigError::InvalidValue {
                    key: "CHATROOM_SUPABASE_URL",
                    value: url.clone(),
                    reason: err.message,
                })?;
            supabase = supabase
                .with_table(&table)
                .map_err(|err| ConfigError::InvalidValue {
                    key: "CHATROOM_MESSAGES_TABLE",
                    value: table.clone(),
                    reason: err.message,
                })?;
            supabase.reconnect_policy = RetryPolicy::new(retry_base_ms, retry_max_ms);
            BackendMode::Supabase(supabase)
        };

        let data_dir = optional_trimmed_env("CHATROOM_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let terminal_width = parse_optional_usize(
            "CHATROOM_TERMINAL_WIDTH",
            DEFAULT_TERMINAL_WIDTH,
            &mut lookup,
        )?;
        if terminal_width < MIN_TERMINAL_WIDTH {
            return Err(ConfigError::InvalidValue {
                key: "CHATROOM_TERMINAL_WIDTH",
                value: terminal_width.to_string(),
                reason: format!("must be at least {MIN_TERMINAL_WIDTH}"),
            });
        }

        let viewport_messages = parse_optional_usize(
            "CHATROOM_VIEWPORT_MESSAGES",
            DEFAULT_VIEWPORT_MESSAGES,
            &mut lookup,
        )?;
        if viewport_messages == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHATROOM_VIEWPORT_MESSAGES",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let offset_minutes = parse_optional_i32("CHATROOM_UTC_OFFSET_MINUTES", 0, &mut lookup)?;
        let utc_offset = (offset_minutes.abs() <= MAX_UTC_OFFSET_MINUTES)
            .then(|| FixedOffset::east_opt(offset_minutes * 60))
            .flatten()
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "CHATROOM_UTC_OFFSET_MINUTES",
                value: offset_minutes.to_string(),
                reason: format!("must be within +/-{MAX_UTC_OFFSET_MINUTES}"),
            })?;

        Ok(Self {
            backend,
            data_dir,
            terminal_width,
            viewport_messages,
            utc_offset,
            subscription_ready_timeout: Duration::from_secs(3),
        })
    }

    /// Location of the persisted identity file.
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join(IDENTITY_FILENAME)
    }

    pub fn is_offline(&self) -> bool {
        matches!(self.backend, BackendMode::Offline)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => {
                write!(f, "missing {key} (set CHATROOM_OFFLINE=1 to run without a backend)")
            }
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_bool<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected one of 1/0, true/false, yes/no, on/off".to_owned(),
        }),
    }
}

fn parse_optional_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_usize<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_i32<F>(key: &'static str, default: i32, lookup: &mut F) -> Result<i32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<i32>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, path::Path};

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<TerminalConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        TerminalConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_supabase_settings_and_defaults() {
        let cfg = config_from_pairs(&[
            ("CHATROOM_SUPABASE_URL", "xyz.supabase.co"),
            ("CHATROOM_SUPABASE_ANON_KEY", "anon"),
        ])
        .expect("config should parse");

        match &cfg.backend {
            BackendMode::Supabase(supabase) => {
                assert_eq!(supabase.rest_url(), "https://xyz.supabase.co/rest/v1/messages");
                assert_eq!(supabase.reconnect_policy, RetryPolicy::new(500, 30_000));
            }
            BackendMode::Offline => panic!("expected supabase backend"),
        }
        assert_eq!(cfg.terminal_width, DEFAULT_TERMINAL_WIDTH);
        assert_eq!(cfg.viewport_messages, DEFAULT_VIEWPORT_MESSAGES);
        assert_eq!(cfg.utc_offset.local_minus_utc(), 0);
        assert_eq!(
            cfg.identity_path(),
            Path::new("./.chatroom-terminal-store/identity.json")
        );
    }

    #[test]
    fn offline_mode_needs_no_credentials() {
        let cfg = config_from_pairs(&[("CHATROOM_OFFLINE", "yes"), ("CHATROOM_DATA_DIR", "/tmp/chat")])
            .expect("offline config should parse");
        assert!(cfg.is_offline());
        assert_eq!(cfg.identity_path(), Path::new("/tmp/chat/identity.json"));
    }

    #[test]
    fn missing_credentials_are_reported() {
        let err = config_from_pairs(&[("CHATROOM_SUPABASE_URL", "xyz.supabase.co")])
            .expect_err("missing key should fail");
        assert_eq!(
            err,
            ConfigError::Missing {
                key: "CHATROOM_SUPABASE_ANON_KEY"
            }
        );
    }

    #[test]
    fn applies_retry_width_and_offset_overrides() {
        let cfg = config_from_pairs(&[
            ("CHATROOM_OFFLINE", "1"),
            ("CHATROOM_TERMINAL_WIDTH", "100"),
            ("CHATROOM_UTC_OFFSET_MINUTES", "-300"),
        ])
        .expect("config should parse");
        assert_eq!(cfg.terminal_width, 100);
        assert_eq!(cfg.utc_offset.local_minus_utc(), -300 * 60);

        let cfg = config_from_pairs(&[
            ("CHATROOM_SUPABASE_URL", "xyz.supabase.co"),
            ("CHATROOM_SUPABASE_ANON_KEY", "anon"),
            ("CHATROOM_SUBSCRIPTION_RETRY_BASE_MS", "250"),
            ("CHATROOM_SUBSCRIPTION_RETRY_MAX_MS", "4000"),
        ])
        .expect("config should parse");
        match cfg.backend {
            BackendMode::Supabase(supabase) => {
                assert_eq!(supabase.reconnect_policy, RetryPolicy::new(250, 4_000));
            }
            BackendMode::Offline => panic!("expected supabase backend"),
        }
    }

    #[test]
    fn rejects_invalid_values() {
        let cases: &[(&[(&str, &str)], &str)] = &[
            (&[("CHATROOM_OFFLINE", "maybe")], "CHATROOM_OFFLINE"),
            (
                &[("CHATROOM_OFFLINE", "1"), ("CHATROOM_TERMINAL_WIDTH", "10")],
                "CHATROOM_TERMINAL_WIDTH",
            ),
            (
                &[("CHATROOM_OFFLINE", "1"), ("CHATROOM_UTC_OFFSET_MINUTES", "abc")],
                "CHATROOM_UTC_OFFSET_MINUTES",
            ),
            (
                &[("CHATROOM_OFFLINE", "1"), ("CHATROOM_UTC_OFFSET_MINUTES", "5000")],
                "CHATROOM_UTC_OFFSET_MINUTES",
            ),
            (
                &[
                    ("CHATROOM_OFFLINE", "1"),
                    ("CHATROOM_SUBSCRIPTION_RETRY_BASE_MS", "900"),
                    ("CHATROOM_SUBSCRIPTION_RETRY_MAX_MS", "100"),
                ],
                "CHATROOM_SUBSCRIPTION_RETRY_MAX_MS",
            ),
            (
                &[
                    ("CHATROOM_SUPABASE_URL", "ftp://xyz.supabase.co"),
                    ("CHATROOM_SUPABASE_ANON_KEY", "anon"),
                ],
                "CHATROOM_SUPABASE_URL",
            ),
            (
                &[
                    ("CHATROOM_SUPABASE_URL", "xyz.supabase.co"),
                    ("CHATROOM_SUPABASE_ANON_KEY", "anon"),
                    ("CHATROOM_MESSAGES_TABLE", "messages; drop"),
                ],
                "CHATROOM_MESSAGES_TABLE",
            ),
        ];

        for (pairs, expected_key) in cases {
            match config_from_pairs(pairs) {
                Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, *expected_key),
                other => panic!("expected invalid {expected_key}, got {other:?}"),
            }
        }
    }
}
