//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `GSMCTL_API_KEY`, `GSMCTL_LISTEN`,
//!    `GSMCTL_MODEM_PORT`
//! 2. **Config file** — path via `--config <path>`, or `gsmctl.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:7000"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [modem]
//! port = "auto"                    # or a fixed device path e.g. "/dev/ttyUSB2"
//! baud_rate = 115200
//! command_timeout_secs = 10
//! preferred_ports = ["/dev/ttyUSB2", "/dev/ttyUSB0"]
//! # sim_pin = "1234"
//! # smsc = "+25884080020"          # detected from the SIM when omitted
//! country_prefix = "+258"
//! probe_attempts = 2
//! health_check_interval_secs = 30
//! inbox_poll_interval_secs = 30
//! delete_after_read = true
//!
//! # Optional — omit entirely to disable failure alerts
//! [alert]
//! webhook_url = "https://hooks.example.com/gsm-gateway"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::probe::SerialEndpoint;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:7000`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `GSMCTL_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Modem and discovery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ModemConfig {
    /// Serial device path, or `"auto"` for discovery (default `auto`).
    /// Override with `GSMCTL_MODEM_PORT`.
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate (default 115200 — the Qualcomm/Huawei USB default).
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Default per-command timeout in seconds (default 10).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Ports tried first, in order, before the keyword scan.
    #[serde(default)]
    pub preferred_ports: Vec<String>,
    /// SIM PIN, submitted when the SIM asks for one.
    pub sim_pin: Option<String>,
    /// SMS service-center address. Read from the SIM when omitted.
    pub smsc: Option<String>,
    /// Country code prepended to 9-digit local numbers (default `+258`).
    #[serde(default = "default_country_prefix")]
    pub country_prefix: String,
    /// Probe attempts per preferred port during discovery (default 2).
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    /// Seconds between connection health checks (default 30).
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Seconds between inbox polls (default 30).
    #[serde(default = "default_inbox_poll_interval_secs")]
    pub inbox_poll_interval_secs: u64,
    /// Delete messages from the SIM after a successful read (default true).
    #[serde(default = "default_delete_after_read")]
    pub delete_after_read: bool,
}

impl ModemConfig {
    /// Default per-command timeout.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// The fixed device path, unless discovery is requested.
    #[must_use]
    pub fn fixed_port(&self) -> Option<&str> {
        if self.port.eq_ignore_ascii_case("auto") {
            None
        } else {
            Some(&self.port)
        }
    }

    /// Build a probe/connect endpoint for a device path.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> SerialEndpoint {
        SerialEndpoint::new(path, self.baud_rate, Duration::from_secs(2))
    }
}

/// Failure alert side-channel. Delivery failures are logged, never surfaced.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertConfig {
    /// Webhook POSTed `{"text": "..."}` when discovery exhausts all ports.
    pub webhook_url: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:7000".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_port() -> String {
    "auto".to_string()
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_command_timeout_secs() -> u64 {
    10
}
fn default_country_prefix() -> String {
    "+258".to_string()
}
fn default_probe_attempts() -> u32 {
    2
}
fn default_health_check_interval_secs() -> u64 {
    30
}
fn default_inbox_poll_interval_secs() -> u64 {
    30
}
fn default_delete_after_read() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            command_timeout_secs: default_command_timeout_secs(),
            preferred_ports: Vec::new(),
            sim_pin: None,
            smsc: None,
            country_prefix: default_country_prefix(),
            probe_attempts: default_probe_attempts(),
            health_check_interval_secs: default_health_check_interval_secs(),
            inbox_poll_interval_secs: default_inbox_poll_interval_secs(),
            delete_after_read: default_delete_after_read(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `gsmctl.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("gsmctl.toml").exists() {
            let content =
                std::fs::read_to_string("gsmctl.toml").expect("Failed to read gsmctl.toml");
            toml::from_str(&content).expect("Failed to parse gsmctl.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                modem: ModemConfig::default(),
                alert: AlertConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(key) = std::env::var("GSMCTL_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("GSMCTL_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(port) = std::env::var("GSMCTL_MODEM_PORT") {
            config.modem.port = port;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7000");
        assert_eq!(config.modem.port, "auto");
        assert_eq!(config.modem.baud_rate, 115_200);
        assert!(config.modem.delete_after_read);
        assert!(config.alert.webhook_url.is_none());
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [modem]
            port = "/dev/ttyUSB2"
            preferred_ports = ["/dev/ttyUSB2", "/dev/ttyUSB0"]
            sim_pin = "1234"
            "#,
        )
        .unwrap();
        assert_eq!(config.modem.fixed_port(), Some("/dev/ttyUSB2"));
        assert_eq!(config.modem.preferred_ports.len(), 2);
        assert_eq!(config.modem.sim_pin.as_deref(), Some("1234"));
        // Untouched sections keep their defaults
        assert_eq!(config.auth.api_key, "change-me");
    }

    #[test]
    fn test_auto_port() {
        let config: Config = toml::from_str("[modem]\nport = \"AUTO\"\n").unwrap();
        assert!(config.modem.fixed_port().is_none());
    }
}
