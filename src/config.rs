use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::sanitizer::SanitizerBackend;

pub const SYSTEM_CONFIG: &str = "/etc/sanitd/config.toml";
pub const LOCAL_CONFIG: &str = "sanitd.toml";
pub const ENV_PREFIX: &str = "SANITD_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub http_bind: String,
    pub rpc_bind: String,
    pub simulation: bool,
    pub backend: SanitizerBackend,
    pub progress_interval_ms: u64,
    pub ata_password: String,
    pub verbose: bool,
    pub log_json: bool,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_webhook: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Slack,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/sanitd"),
            http_bind: "127.0.0.1:8080".to_string(),
            rpc_bind: "127.0.0.1:9848".to_string(),
            simulation: false,
            backend: SanitizerBackend::Native,
            progress_interval_ms: 2000,
            ata_password: "sanitd".to_string(),
            verbose: false,
            log_json: false,
            notifications: NotificationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults, then config files, then `SANITD_*` variables, then CLI flags.
    pub fn new<T: Serialize>(cli_overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG))
            .merge(Toml::file(LOCAL_CONFIG))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = cli_overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract().context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ata_password.is_empty() {
            anyhow::bail!("ata_password must not be empty");
        }
        if self.http_bind == self.rpc_bind {
            anyhow::bail!("http_bind and rpc_bind must differ ({})", self.http_bind);
        }
        Ok(())
    }

    /// A simulated inventory never drives real hardware.
    pub fn effective_backend(&self) -> SanitizerBackend {
        if self.simulation {
            SanitizerBackend::Simulated
        } else {
            self.backend
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        simulation: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        http_bind: Option<String>,
    }

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::extract(Figment::from(Serialized::defaults(AppConfig::default())))
            .unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.effective_backend(), SanitizerBackend::Native);
        assert_eq!(config.progress_interval(), Duration::from_secs(2));
    }

    #[test]
    fn layers_override_in_order() {
        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(
                r#"
                rpc_bind = "0.0.0.0:9000"
                backend = "simulated"

                [notifications]
                channel = "slack"
                slack_webhook = "https://hooks.slack.com/services/T/B/X"
                "#,
            ))
            .merge(Serialized::defaults(Overrides {
                simulation: Some(true),
                http_bind: None,
            }));

        let config = AppConfig::extract(figment).unwrap();
        assert_eq!(config.rpc_bind, "0.0.0.0:9000");
        assert_eq!(config.http_bind, "127.0.0.1:8080");
        assert!(config.simulation);
        assert_eq!(config.notifications.channel, NotificationChannelType::Slack);
    }

    #[test]
    fn simulation_forces_simulated_backend() {
        let config = AppConfig {
            simulation: true,
            backend: SanitizerBackend::Native,
            ..AppConfig::default()
        };
        assert_eq!(config.effective_backend(), SanitizerBackend::Simulated);
    }

    #[test]
    fn colliding_binds_are_rejected() {
        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(r#"rpc_bind = "127.0.0.1:8080""#));
        assert!(AppConfig::extract(figment).is_err());
    }

    #[test]
    fn renders_as_toml() {
        let rendered = AppConfig::default().to_toml().unwrap();
        assert!(rendered.contains("data_dir = \"/var/lib/sanitd\""));
        assert!(rendered.contains("[notifications]"));
    }
}
