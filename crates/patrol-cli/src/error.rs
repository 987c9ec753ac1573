use patrol_core::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] patrol_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Tag id cannot be empty")]
    EmptyTag,
    #[error("No incident description provided")]
    EmptyDescription,
    #[error("Sync is not configured. Set PATROL_API_BASE_URL to enable `patrol sync`.")]
    SyncNotConfigured,
    #[error("Sync finished with {0} record(s) still pending")]
    SyncIncomplete(u64),
}
