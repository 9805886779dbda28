use std::time::Duration;

use panel_client::transport::parse_base_url;
use panel_client::{ConfigurationError, Credentials, OtpSecret, RetryPolicy};
use serde::Deserialize;

/// Raw settings as read from the environment (`FLEET_*`, optionally via `.env`).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub panel_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub otp_secret: Option<String>,
    #[serde(default)]
    pub elevated: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_message_budget")]
    pub message_budget: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_discovery_failure_limit")]
    pub discovery_failure_limit: u32,
    #[serde(default = "default_discovery_retry_secs")]
    pub discovery_retry_secs: u64,
    #[serde(default = "default_network_backoff_secs")]
    pub network_backoff_secs: u64,
    #[serde(default = "default_empty_body_backoff_secs")]
    pub empty_body_backoff_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_role_name")]
    pub role_name: String,
    #[serde(default = "default_super_admin_role_name")]
    pub super_admin_role_name: String,
    #[serde(default = "default_template_marker")]
    pub template_marker: String,
    #[serde(default = "default_management_module")]
    pub management_module: String,
    #[serde(default = "default_true")]
    pub mirror_chat_to_console: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

/// Engine knobs that survive validation.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub elevated: bool,
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    pub message_budget: usize,
    pub queue_capacity: usize,
    pub discovery_failure_limit: u32,
    pub discovery_retry: Duration,
    pub role_name: String,
    pub super_admin_role_name: String,
    pub template_marker: String,
    pub management_module: String,
    pub mirror_chat_to_console: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            elevated: false,
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            reconcile_interval: Duration::from_secs(default_reconcile_interval_secs()),
            message_budget: default_message_budget(),
            queue_capacity: default_queue_capacity(),
            discovery_failure_limit: default_discovery_failure_limit(),
            discovery_retry: Duration::from_secs(default_discovery_retry_secs()),
            role_name: default_role_name(),
            super_admin_role_name: default_super_admin_role_name(),
            template_marker: default_template_marker(),
            management_module: default_management_module(),
            mirror_chat_to_console: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub panel_url: String,
    pub credentials: Credentials,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub engine: EngineSettings,
    pub bind_addr: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("FLEET")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.panel_url = Self::normalize_opt(self.panel_url.take());
        self.username = Self::normalize_opt(self.username.take());
        self.otp_secret = Self::normalize_opt(self.otp_secret.take());
        if self.password.as_deref().map(str::is_empty).unwrap_or(false) {
            self.password = None;
        }
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    /// Checks everything that must be right before the first network call. A
    /// failure here is a configuration error and stops the process.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigurationError> {
        let panel_url = self
            .panel_url
            .clone()
            .ok_or(ConfigurationError::MissingSetting("FLEET_PANEL_URL"))?;
        parse_base_url(&panel_url)?;
        let username = self
            .username
            .clone()
            .ok_or(ConfigurationError::MissingSetting("FLEET_USERNAME"))?;
        let password = self
            .password
            .clone()
            .ok_or(ConfigurationError::MissingSetting("FLEET_PASSWORD"))?;
        let otp = self.otp_secret.as_deref().map(OtpSecret::parse).transpose()?;
        for (setting, value) in [
            ("FLEET_POLL_INTERVAL_MS", self.poll_interval_ms),
            ("FLEET_RECONCILE_INTERVAL_SECS", self.reconcile_interval_secs),
            ("FLEET_DISCOVERY_RETRY_SECS", self.discovery_retry_secs),
            ("FLEET_MESSAGE_BUDGET", self.message_budget as u64),
            ("FLEET_QUEUE_CAPACITY", self.queue_capacity as u64),
        ] {
            if value == 0 {
                return Err(ConfigurationError::InvalidSetting {
                    setting,
                    reason: "must be greater than zero",
                });
            }
        }

        Ok(ValidatedConfig {
            panel_url,
            credentials: Credentials {
                username,
                password,
                otp,
            },
            retry: RetryPolicy {
                network_backoff: Duration::from_secs(self.network_backoff_secs),
                empty_body_backoff: Duration::from_secs(self.empty_body_backoff_secs),
                max_attempts: None,
            },
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            engine: EngineSettings {
                elevated: self.elevated,
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
                message_budget: self.message_budget,
                queue_capacity: self.queue_capacity,
                discovery_failure_limit: self.discovery_failure_limit.max(1),
                discovery_retry: Duration::from_secs(self.discovery_retry_secs),
                role_name: self.role_name.clone(),
                super_admin_role_name: self.super_admin_role_name.clone(),
                template_marker: self.template_marker.to_lowercase(),
                management_module: self.management_module.clone(),
                mirror_chat_to_console: self.mirror_chat_to_console,
            },
            bind_addr: self.bind_addr.clone(),
        })
    }
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_message_budget() -> usize {
    1_500
}

fn default_queue_capacity() -> usize {
    256
}

fn default_discovery_failure_limit() -> u32 {
    5
}

fn default_discovery_retry_secs() -> u64 {
    30
}

fn default_network_backoff_secs() -> u64 {
    30
}

fn default_empty_body_backoff_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_role_name() -> String {
    "Fleet Warden".to_string()
}

fn default_super_admin_role_name() -> String {
    "Super Admins".to_string()
}

fn default_template_marker() -> String {
    "template".to_string()
}

fn default_management_module() -> String {
    "ADS".to_string()
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_log_filter() -> String {
    "info,fleet_manager=debug,panel_client=info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AppConfig {
        serde_json::from_value(serde_json::json!({
            "panel_url": "https://panel.example.net",
            "username": "warden",
            "password": "hunter2",
        }))
        .expect("config")
    }

    #[test]
    fn defaults_follow_panel_limits() {
        let validated = base().validate().expect("valid");
        assert_eq!(validated.engine.message_budget, 1_500);
        assert_eq!(validated.engine.reconcile_interval, Duration::from_secs(30));
        assert_eq!(validated.engine.discovery_failure_limit, 5);
        assert_eq!(validated.retry.network_backoff, Duration::from_secs(30));
        assert_eq!(validated.retry.empty_body_backoff, Duration::from_secs(5));
        assert!(validated.credentials.otp.is_none());
    }

    #[test]
    fn malformed_secret_is_a_configuration_error() {
        let mut cfg = base();
        cfg.otp_secret = Some("!!not base32!!".into());
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigurationError::InvalidOtpSecret(_)
        ));
    }

    #[test]
    fn malformed_url_is_a_configuration_error() {
        let mut cfg = base();
        cfg.panel_url = Some("panel without scheme".into());
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigurationError::InvalidBaseUrl { .. }
        ));
    }

    fn rejected_setting(cfg: AppConfig) -> &'static str {
        match cfg.validate().unwrap_err() {
            ConfigurationError::InvalidSetting { setting, .. } => setting,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_reconcile_interval_is_rejected() {
        let cfg = AppConfig {
            reconcile_interval_secs: 0,
            ..base()
        };
        assert_eq!(rejected_setting(cfg), "FLEET_RECONCILE_INTERVAL_SECS");
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let cfg = AppConfig {
            poll_interval_ms: 0,
            ..base()
        };
        assert_eq!(rejected_setting(cfg), "FLEET_POLL_INTERVAL_MS");
    }

    #[test]
    fn zero_discovery_retry_is_rejected() {
        let cfg = AppConfig {
            discovery_retry_secs: 0,
            ..base()
        };
        assert_eq!(rejected_setting(cfg), "FLEET_DISCOVERY_RETRY_SECS");
    }

    #[test]
    fn zero_budget_and_queue_capacity_are_rejected() {
        let cfg = AppConfig {
            message_budget: 0,
            ..base()
        };
        assert_eq!(rejected_setting(cfg), "FLEET_MESSAGE_BUDGET");
        let cfg = AppConfig {
            queue_capacity: 0,
            ..base()
        };
        assert_eq!(rejected_setting(cfg), "FLEET_QUEUE_CAPACITY");
    }

    #[test]
    fn blank_values_count_as_missing() {
        let cfg = AppConfig {
            username: Some("   ".into()),
            ..base()
        }
        .normalize();
        assert_eq!(
            cfg.validate().unwrap_err(),
            ConfigurationError::MissingSetting("FLEET_USERNAME")
        );
    }
}
