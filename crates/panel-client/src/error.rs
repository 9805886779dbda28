use thiserror::Error;

/// Problems that mean the deployment itself is misconfigured.
///
/// These are never retried: the process logs the cause and exits.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid panel url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("invalid two-factor secret: {0}")]
    InvalidOtpSecret(String),
    #[error("missing required setting {0}")]
    MissingSetting(&'static str),
    #[error("invalid setting {setting}: {reason}")]
    InvalidSetting {
        setting: &'static str,
        reason: &'static str,
    },
    #[error("panel at {url} is unreachable before any successful connection: {reason}")]
    Unreachable { url: String, reason: String },
}
