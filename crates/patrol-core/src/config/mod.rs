//! Device-side runtime configuration.
//!
//! Values come from `PATROL_*` environment variables. Parsing goes through an
//! injectable lookup so it can be tested without touching the process
//! environment.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::OperatorId;
use crate::util::{normalize_base_url, normalize_text_option};

pub const API_BASE_URL_VAR: &str = "PATROL_API_BASE_URL";
pub const OPERATOR_ID_VAR: &str = "PATROL_OPERATOR_ID";
pub const SYNC_INTERVAL_VAR: &str = "PATROL_SYNC_INTERVAL_SECS";
pub const SUBMIT_TIMEOUT_VAR: &str = "PATROL_SUBMIT_TIMEOUT_SECS";
pub const PROBE_INTERVAL_VAR: &str = "PATROL_PROBE_INTERVAL_SECS";
pub const DB_PATH_VAR: &str = "PATROL_DB_PATH";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for capture and background sync on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Ingestion endpoint base URL. Capture works without it; sync does not.
    pub api_base_url: Option<String>,
    /// Stamped on each record at capture time.
    pub operator: OperatorId,
    pub sync_interval: Duration,
    pub submit_timeout: Duration,
    pub probe_interval: Duration,
    pub db_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            operator: OperatorId::guest(),
            sync_interval: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(15),
            probe_interval: Duration::from_secs(10),
            db_path: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_base_url = match optional_trimmed(&lookup, API_BASE_URL_VAR) {
            Some(raw) => Some(normalize_base_url(&raw).map_err(|_| {
                ConfigError::Invalid(format!(
                    "{API_BASE_URL_VAR} must start with http:// or https://"
                ))
            })?),
            None => None,
        };

        let operator = optional_trimmed(&lookup, OPERATOR_ID_VAR)
            .map_or_else(OperatorId::guest, OperatorId::new);

        let sync_interval = seconds_in_range(&lookup, SYNC_INTERVAL_VAR, 30, 5, 3_600)?;
        let submit_timeout = seconds_in_range(&lookup, SUBMIT_TIMEOUT_VAR, 15, 1, 300)?;
        let probe_interval = seconds_in_range(&lookup, PROBE_INTERVAL_VAR, 10, 1, 600)?;
        let db_path = optional_trimmed(&lookup, DB_PATH_VAR).map(PathBuf::from);

        Ok(Self {
            api_base_url,
            operator,
            sync_interval,
            submit_timeout,
            probe_interval,
            db_path,
        })
    }

    /// Base URL, or an error naming the variable to set.
    pub fn require_api_base_url(&self) -> Result<&str, ConfigError> {
        self.api_base_url
            .as_deref()
            .ok_or(ConfigError::MissingVar(API_BASE_URL_VAR))
    }
}

fn seconds_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<Duration, ConfigError> {
    let secs = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]"))
        })?,
        None => default,
    };
    if !(min..=max).contains(&secs) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}
