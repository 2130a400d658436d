//! Configuration for the session and gateway layer
//!
//! Configuration is loaded in order of precedence:
//! 1. CLI flags (highest priority)
//! 2. Environment variables (`MCPGW_*`)
//! 3. Config file (~/.config/mcp-gateway/config.toml)
//! 4. Built-in defaults (lowest priority)
//!
//! Every option maps 1:1 onto a `SessionManager` or gateway construction
//! parameter; values are consumed verbatim. Absence of `proxy_prefix` is
//! itself the signal that selects direct mode over gateway mode.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::Deserialize;

use crate::session::{ManagerConfig, PortRange};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Deployment mode, derived from configuration presence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Clients connect straight to the per-session backend port
    Direct,
    /// All traffic enters through the fixed-port reverse proxy
    Gateway,
}

/// Effective application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the gateway binds to
    pub bind_addr: SocketAddr,

    /// Path prefix for proxied routes; absence selects direct mode
    pub proxy_prefix: Option<String>,

    /// Inclusive backend port allocation range
    pub port_min: u16,
    pub port_max: u16,

    /// Ports never handed out even when inside the range
    pub blocked_ports: Vec<u16>,

    /// Host the per-session UI servers are reachable on
    pub backend_host: String,

    /// Sliding session expiry window
    pub session_timeout_minutes: i64,

    /// Redis URL; presence selects the distributed store backing
    pub store_url: Option<String>,

    /// Shared secret for signed tokens; required in gateway mode
    pub signing_secret: Option<String>,

    /// Default logical tool server for sessions created without one
    pub server_name: Option<String>,

    /// Public host used when constructing gateway-mode URLs
    pub base_url: String,

    /// "http" or "https" in constructed URLs and X-Forwarded-Proto
    pub protocol: String,

    /// Couple session activity to mutating proxied API calls
    pub extend_on_api_traffic: bool,

    /// Per-request timeout on the forwarding leg
    pub forward_timeout_secs: u64,

    /// Interval of the expired-session sweep
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().unwrap(),
            proxy_prefix: None,
            port_min: 11000,
            port_max: 12000,
            blocked_ports: Vec::new(),
            backend_host: "127.0.0.1".to_string(),
            session_timeout_minutes: 30,
            store_url: None,
            signing_secret: None,
            server_name: None,
            base_url: "localhost:8080".to_string(),
            protocol: "http".to_string(),
            extend_on_api_traffic: false,
            forward_timeout_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

/// On-disk representation; every field optional so a partial file works
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub bind_addr: Option<SocketAddr>,
    pub proxy_prefix: Option<String>,
    pub port_min: Option<u16>,
    pub port_max: Option<u16>,
    pub blocked_ports: Option<Vec<u16>>,
    pub backend_host: Option<String>,
    pub session_timeout_minutes: Option<i64>,
    pub store_url: Option<String>,
    pub signing_secret: Option<String>,
    pub server_name: Option<String>,
    pub base_url: Option<String>,
    pub protocol: Option<String>,
    pub extend_on_api_traffic: Option<bool>,
    pub forward_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

impl Config {
    /// Default config file location: ~/.config/mcp-gateway/config.toml
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mcp-gateway")
            .join("config.toml")
    }

    /// Load configuration: defaults, then file, then environment
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        let path = Self::config_path();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let file: FileConfig = toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.apply_file(file);
        }

        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.bind_addr {
            self.bind_addr = v;
        }
        if file.proxy_prefix.is_some() {
            self.proxy_prefix = file.proxy_prefix;
        }
        if let Some(v) = file.port_min {
            self.port_min = v;
        }
        if let Some(v) = file.port_max {
            self.port_max = v;
        }
        if let Some(v) = file.blocked_ports {
            self.blocked_ports = v;
        }
        if let Some(v) = file.backend_host {
            self.backend_host = v;
        }
        if let Some(v) = file.session_timeout_minutes {
            self.session_timeout_minutes = v;
        }
        if file.store_url.is_some() {
            self.store_url = file.store_url;
        }
        if file.signing_secret.is_some() {
            self.signing_secret = file.signing_secret;
        }
        if file.server_name.is_some() {
            self.server_name = file.server_name;
        }
        if let Some(v) = file.base_url {
            self.base_url = v;
        }
        if let Some(v) = file.protocol {
            self.protocol = v;
        }
        if let Some(v) = file.extend_on_api_traffic {
            self.extend_on_api_traffic = v;
        }
        if let Some(v) = file.forward_timeout_secs {
            self.forward_timeout_secs = v;
        }
        if let Some(v) = file.sweep_interval_secs {
            self.sweep_interval_secs = v;
        }
    }

    /// Environment overrides, `MCPGW_` prefixed
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("MCPGW_BIND_ADDR") {
            self.bind_addr = v.parse().context("Invalid MCPGW_BIND_ADDR")?;
        }
        if let Ok(v) = std::env::var("MCPGW_PROXY_PREFIX") {
            self.proxy_prefix = Some(v);
        }
        if let Ok(v) = std::env::var("MCPGW_PORT_MIN") {
            self.port_min = v.parse().context("Invalid MCPGW_PORT_MIN")?;
        }
        if let Ok(v) = std::env::var("MCPGW_PORT_MAX") {
            self.port_max = v.parse().context("Invalid MCPGW_PORT_MAX")?;
        }
        if let Ok(v) = std::env::var("MCPGW_BLOCKED_PORTS") {
            self.blocked_ports = parse_port_list(&v).context("Invalid MCPGW_BLOCKED_PORTS")?;
        }
        if let Ok(v) = std::env::var("MCPGW_BACKEND_HOST") {
            self.backend_host = v;
        }
        if let Ok(v) = std::env::var("MCPGW_SESSION_TIMEOUT_MINUTES") {
            self.session_timeout_minutes =
                v.parse().context("Invalid MCPGW_SESSION_TIMEOUT_MINUTES")?;
        }
        if let Ok(v) = std::env::var("MCPGW_STORE_URL") {
            self.store_url = Some(v);
        }
        if let Ok(v) = std::env::var("MCPGW_SIGNING_SECRET") {
            self.signing_secret = Some(v);
        }
        if let Ok(v) = std::env::var("MCPGW_SERVER_NAME") {
            self.server_name = Some(v);
        }
        if let Ok(v) = std::env::var("MCPGW_BASE_URL") {
            self.base_url = v;
        }
        if let Ok(v) = std::env::var("MCPGW_PROTOCOL") {
            self.protocol = v;
        }
        if let Ok(v) = std::env::var("MCPGW_EXTEND_ON_API_TRAFFIC") {
            self.extend_on_api_traffic = v == "1" || v.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    /// Reject configurations that cannot produce a working deployment
    pub fn validate(&self) -> Result<()> {
        if self.port_min > self.port_max {
            bail!(
                "port range is empty: port_min {} > port_max {}",
                self.port_min,
                self.port_max
            );
        }
        if self.session_timeout_minutes < 1 {
            bail!("session_timeout_minutes must be at least 1");
        }
        if self.proxy_prefix.is_some() && self.signing_secret.is_none() {
            bail!("gateway mode (proxy_prefix set) requires a signing_secret");
        }
        if let Some(prefix) = &self.proxy_prefix {
            if prefix.is_empty() || prefix.contains('/') {
                bail!("proxy_prefix must be a single non-empty path segment");
            }
            // These segments are taken by the admin surface
            if matches!(prefix.as_str(), "health" | "stats" | "create-session" | "session") {
                bail!("proxy_prefix {prefix:?} collides with an administrative route");
            }
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        if self.proxy_prefix.is_some() {
            Mode::Gateway
        } else {
            Mode::Direct
        }
    }

    pub fn port_range(&self) -> PortRange {
        PortRange::new(self.port_min, self.port_max)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::minutes(self.session_timeout_minutes)
    }

    /// Construction parameters for the session manager
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            protocol: self.protocol.clone(),
            base_url: self.base_url.clone(),
            proxy_prefix: self.proxy_prefix.clone(),
            backend_host: self.backend_host.clone(),
            session_timeout: self.session_timeout(),
        }
    }
}

/// Parse a comma-separated port list, e.g. "8080,9090"
pub fn parse_port_list(raw: &str) -> Result<Vec<u16>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u16>().with_context(|| format!("bad port {s:?}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_select_direct_mode() {
        let config = Config::default();
        assert_eq!(config.mode(), Mode::Direct);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file: FileConfig = toml::from_str(
            r#"
            proxy_prefix = "mcp"
            port_min = 11000
            port_max = 11002
            blocked_ports = [11001]
            signing_secret = "s3cret"
            base_url = "dash.example.com"
            protocol = "https"
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_file(file);

        assert_eq!(config.mode(), Mode::Gateway);
        assert_eq!(config.proxy_prefix.as_deref(), Some("mcp"));
        assert_eq!(config.blocked_ports, vec![11001]);
        assert_eq!(config.protocol, "https");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_gateway_mode_requires_secret() {
        let mut config = Config::default();
        config.proxy_prefix = Some("mcp".to_string());
        assert!(config.validate().is_err());

        config.signing_secret = Some("s3cret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_port_range_rejected() {
        let mut config = Config::default();
        config.port_min = 12000;
        config.port_max = 11000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_port_list() {
        assert_eq!(parse_port_list("8080, 9090").unwrap(), vec![8080, 9090]);
        assert_eq!(parse_port_list("").unwrap(), Vec::<u16>::new());
        assert!(parse_port_list("8080,nope").is_err());
    }

    #[test]
    fn test_reserved_prefix_rejected() {
        let mut config = Config::default();
        config.proxy_prefix = Some("session".to_string());
        config.signing_secret = Some("s".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_slash_in_prefix_rejected() {
        let mut config = Config::default();
        config.proxy_prefix = Some("mcp/v1".to_string());
        config.signing_secret = Some("s".to_string());
        assert!(config.validate().is_err());
    }
}
