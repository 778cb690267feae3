//! Configuration module for Gantry
//!
//! Provides layered configuration loading from files, environment variables, and defaults.

pub mod admin;
pub mod auth;
pub mod budget;
pub mod control_plane;
pub mod error;
pub mod logging;
pub mod rate_limit;
pub mod server;
pub mod upstream;
pub mod usage;

pub use admin::AdminConfig;
pub use auth::AuthConfig;
pub use budget::BudgetConfig;
pub use control_plane::ControlPlaneConfig;
pub use error::ConfigError;
pub use logging::{LogFormat, LoggingConfig};
pub use rate_limit::RateLimitConfig;
pub use server::ServerConfig;
pub use upstream::UpstreamConfig;
pub use usage::UsageConfig;

// Re-export HealthConfig from the health module
pub use crate::health::HealthConfig;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration struct that holds all sub-configurations
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub admin: AdminConfig,
    pub control_plane: ControlPlaneConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub budget: BudgetConfig,
    pub health: HealthConfig,
    pub upstream: UpstreamConfig,
    pub usage: UsageConfig,
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    ///
    /// If path is None, returns default configuration.
    /// If path doesn't exist, returns NotFound error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supports GANTRY_* environment variables for common settings.
    /// Invalid values are silently ignored (defaults are kept).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var("GANTRY_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(host) = std::env::var("GANTRY_HOST") {
            self.server.host = host;
        }
        if let Ok(url) = std::env::var("GANTRY_CONTROL_PLANE_URL") {
            self.control_plane.url = url;
        }
        if let Ok(url) = std::env::var("GANTRY_AUTH_URL") {
            self.auth.url = url;
        }
        if let Ok(url) = std::env::var("GANTRY_BUDGET_URL") {
            self.budget.url = url;
        }
        if let Ok(url) = std::env::var("GANTRY_RATE_LIMIT_STORE_URL") {
            self.rate_limit.store_url = url;
        }
        if let Ok(brokers) = std::env::var("GANTRY_BUS_BROKERS") {
            self.usage.bus_brokers = brokers;
        }
        if let Ok(token) = std::env::var("GANTRY_ADMIN_TOKEN") {
            self.admin.token = token;
        }

        // Logging settings
        if let Ok(level) = std::env::var("GANTRY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("GANTRY_LOG_FORMAT") {
            if let Ok(f) = format.parse() {
                self.logging.format = f;
            }
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation {
                field: "server.port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }
        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::Validation {
                field: "server.max_body_bytes".to_string(),
                message: "payload cap must be non-zero".to_string(),
            });
        }
        if self.admin.enabled && self.admin.port == self.server.port {
            return Err(ConfigError::Validation {
                field: "admin.port".to_string(),
                message: "admin listener cannot share the ingress port".to_string(),
            });
        }
        if self.control_plane.url.is_empty() {
            return Err(ConfigError::Validation {
                field: "control_plane.url".to_string(),
                message: "control plane URL cannot be empty".to_string(),
            });
        }
        if self.rate_limit.default_rate_per_second < 0.0 {
            return Err(ConfigError::Validation {
                field: "rate_limit.default_rate_per_second".to_string(),
                message: "refill rate cannot be negative".to_string(),
            });
        }
        if self.usage.batch_size == 0 {
            return Err(ConfigError::Validation {
                field: "usage.batch_size".to_string(),
                message: "batch size must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_gateway_config_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.admin.port, 9090);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_parse_minimal_toml() {
        let toml = r#"
        [server]
        port = 9000
        "#;

        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0"); // Default
    }

    #[test]
    fn test_config_parse_full_toml() {
        let toml = include_str!("../../gantry.example.toml");
        let config: GatewayConfig = toml::from_str(toml).unwrap();
        assert!(config.server.port > 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_from_file() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), "[server]\nport = 8081").unwrap();

        let config = GatewayConfig::load(Some(temp.path())).unwrap();
        assert_eq!(config.server.port, 8081);
    }

    #[test]
    fn test_config_missing_file_error() {
        let result = GatewayConfig::load(Some(Path::new("/nonexistent/config.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_config_env_override_port() {
        std::env::set_var("GANTRY_PORT", "9999");
        let config = GatewayConfig::default().with_env_overrides();
        std::env::remove_var("GANTRY_PORT");

        assert_eq!(config.server.port, 9999);
    }

    #[test]
    fn test_config_rejects_shared_admin_port() {
        let mut config = GatewayConfig::default();
        config.admin.port = config.server.port;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn test_config_rejects_zero_body_cap() {
        let mut config = GatewayConfig::default();
        config.server.max_body_bytes = 0;
        assert!(config.validate().is_err());
    }
}
