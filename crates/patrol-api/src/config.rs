use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    /// Create placeholder locations for unknown tags instead of rejecting them.
    pub auto_provision: bool,
    /// How far back an incident report looks for the operator's last check-in.
    pub report_locate_window: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            db_path: PathBuf::from("patrol-api.db"),
            auto_provision: true,
            report_locate_window: Duration::from_secs(900),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "PATROL_API_BIND_ADDR", "127.0.0.1:8080");
        let db_path = PathBuf::from(value_or_default(
            &lookup,
            "PATROL_API_DB_PATH",
            "patrol-api.db",
        ));

        let auto_provision = match value_or_default(&lookup, "PATROL_API_AUTO_PROVISION", "true")
            .to_ascii_lowercase()
            .as_str()
        {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(ConfigError::Invalid(
                    "PATROL_API_AUTO_PROVISION must be true or false".to_string(),
                ))
            }
        };

        let locate_window_secs =
            value_or_default(&lookup, "PATROL_API_REPORT_LOCATE_WINDOW_SECS", "900")
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "PATROL_API_REPORT_LOCATE_WINDOW_SECS must be an integer in [0, 86400]"
                            .to_string(),
                    )
                })?;
        if locate_window_secs > 86_400 {
            return Err(ConfigError::Invalid(
                "PATROL_API_REPORT_LOCATE_WINDOW_SECS must be in [0, 86400]".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            db_path,
            auto_provision,
            report_locate_window: Duration::from_secs(locate_window_secs),
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
