use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::ssh::line_reader::{EchoPolicy, MAX_LINE_LEN};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid bind address: {0}")]
    InvalidBindAddress(String),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub payments: PaymentsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host clients are told to connect to
    pub external_addr: String,
    pub bind_addr: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            external_addr: "127.0.0.1".to_string(),
            bind_addr: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PaymentsConfig {
    /// How long an ephemeral server keeps accepting connections
    pub budget_secs: u64,
    pub accept_timeout_ms: u64,
    /// Idle SSH connections are dropped after this long (null disables)
    pub inactivity_timeout_secs: Option<u64>,
    pub username_prefix: String,
    pub client_command: String,
    /// Finished servers stay visible under /servers for this long
    pub retain_finished_secs: u64,
    /// What the client sees while typing the card number
    pub echo: EchoPolicy,
    pub max_line_len: usize,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            budget_secs: 600,
            accept_timeout_ms: 5000,
            inactivity_timeout_secs: Some(300),
            username_prefix: "payme".to_string(),
            client_command: "ssh".to_string(),
            retain_finished_secs: 600,
            echo: EchoPolicy::Verbatim,
            max_line_len: MAX_LINE_LEN,
        }
    }
}

impl PaymentsConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout_secs.map(Duration::from_secs)
    }

    pub fn retain_finished(&self) -> Duration {
        Duration::from_secs(self.retain_finished_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(config)
    }

    /// Positional command line arguments win over the config file
    pub fn apply_overrides(
        &mut self,
        external_addr: Option<String>,
        bind_addr: Option<String>,
        port: Option<u16>,
    ) {
        if let Some(external_addr) = external_addr {
            self.server.external_addr = external_addr;
        }
        if let Some(bind_addr) = bind_addr {
            self.server.bind_addr = bind_addr;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
    }

    /// Check the config and return the parsed bind address.
    pub fn validate(&self) -> Result<IpAddr, ConfigError> {
        let bind_ip: IpAddr = self
            .server
            .bind_addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.server.bind_addr.clone()))?;

        if self.server.external_addr.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "server.external_addr",
                reason: "must not be empty".to_string(),
            });
        }
        if self.payments.budget_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "payments.budget_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.payments.max_line_len == 0 {
            return Err(ConfigError::Invalid {
                field: "payments.max_line_len",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.payments.accept_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "payments.accept_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(bind_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.external_addr, "127.0.0.1");
        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.payments.budget(), Duration::from_secs(600));
        assert_eq!(config.payments.accept_timeout(), Duration::from_secs(5));
        assert_eq!(config.payments.username_prefix, "payme");
        assert_eq!(config.payments.client_command, "ssh");
        assert_eq!(config.payments.echo, EchoPolicy::Verbatim);
        assert_eq!(config.payments.max_line_len, 256);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let path = std::env::temp_dir().join(format!("payd-config-{}.json", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"payments": {{"budget_secs": 30, "inactivity_timeout_secs": null, "echo": {{"masked": 42}}}}}}"#
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.payments.budget_secs, 30);
        assert_eq!(config.payments.inactivity_timeout(), None);
        assert_eq!(config.payments.echo, EchoPolicy::Masked(b'*'));
        assert_eq!(config.payments.accept_timeout_ms, 5000);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/payd.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_overrides_apply_in_order() {
        let mut config = Config::default();
        config.apply_overrides(
            Some("pay.example.com".to_string()),
            Some("0.0.0.0".to_string()),
            Some(9000),
        );
        assert_eq!(config.server.external_addr, "pay.example.com");
        assert_eq!(config.server.bind_addr, "0.0.0.0");
        assert_eq!(config.server.port, 9000);

        config.apply_overrides(None, None, None);
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_reject_unparseable_bind_address() {
        let mut config = Config::default();
        config.server.bind_addr = "localhost".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBindAddress(_))));
    }

    #[test]
    fn test_reject_zero_timeouts() {
        let mut config = Config::default();
        config.payments.accept_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.payments.budget_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_returns_bind_ip() {
        let config = Config::default();
        assert_eq!(config.validate().unwrap(), "127.0.0.1".parse::<IpAddr>().unwrap());
    }
}
