// CLI module - command-line argument parsing and handlers
//
// Serve flags map 1:1 onto configuration options and take precedence over
// the config file and environment. The `config` subcommand inspects the
// effective configuration without starting the server.

use clap::{Args, Parser, Subcommand};

use crate::config::{parse_port_list, Config, VERSION};

/// Session gateway for ephemeral MCP web dashboards
#[derive(Parser)]
#[command(name = "mcp-gateway")]
#[command(version = VERSION)]
#[command(about = "Session and gateway layer for ephemeral MCP web dashboards", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Flags for the default serve command; each maps directly onto a
/// `SessionManager` or gateway construction parameter
#[derive(Args)]
pub struct ServeArgs {
    /// Address to bind the gateway to
    #[arg(long)]
    pub bind_addr: Option<std::net::SocketAddr>,

    /// Path prefix for proxied routes; omitting it selects direct mode
    #[arg(long)]
    pub proxy_prefix: Option<String>,

    /// Lowest backend port to allocate
    #[arg(long)]
    pub port_min: Option<u16>,

    /// Highest backend port to allocate
    #[arg(long)]
    pub port_max: Option<u16>,

    /// Comma-separated ports excluded from allocation
    #[arg(long)]
    pub blocked_ports: Option<String>,

    /// Host the per-session UI servers are reachable on
    #[arg(long)]
    pub backend_host: Option<String>,

    /// Sliding session expiry window, in minutes
    #[arg(long)]
    pub session_timeout: Option<i64>,

    /// Redis URL for the shared session store (gateway deployments)
    #[arg(long)]
    pub store_url: Option<String>,

    /// Shared secret for signed tokens (required with --proxy-prefix)
    #[arg(long)]
    pub signing_secret: Option<String>,

    /// Default logical tool server name for created sessions
    #[arg(long)]
    pub server_name: Option<String>,

    /// Public host used in constructed gateway URLs
    #[arg(long)]
    pub base_url: Option<String>,

    /// URL scheme: http or https
    #[arg(long)]
    pub protocol: Option<String>,

    /// Extend sessions on mutating proxied API calls
    #[arg(long)]
    pub extend_on_api_traffic: bool,
}

impl ServeArgs {
    /// Apply CLI flags on top of a loaded configuration
    pub fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(v) = self.bind_addr {
            config.bind_addr = v;
        }
        if self.proxy_prefix.is_some() {
            config.proxy_prefix = self.proxy_prefix.clone();
        }
        if let Some(v) = self.port_min {
            config.port_min = v;
        }
        if let Some(v) = self.port_max {
            config.port_max = v;
        }
        if let Some(raw) = &self.blocked_ports {
            config.blocked_ports = parse_port_list(raw)?;
        }
        if let Some(v) = &self.backend_host {
            config.backend_host = v.clone();
        }
        if let Some(v) = self.session_timeout {
            config.session_timeout_minutes = v;
        }
        if self.store_url.is_some() {
            config.store_url = self.store_url.clone();
        }
        if self.signing_secret.is_some() {
            config.signing_secret = self.signing_secret.clone();
        }
        if self.server_name.is_some() {
            config.server_name = self.server_name.clone();
        }
        if let Some(v) = &self.base_url {
            config.base_url = v.clone();
        }
        if let Some(v) = &self.protocol {
            config.protocol = v.clone();
        }
        if self.extend_on_api_traffic {
            config.extend_on_api_traffic = true;
        }
        Ok(())
    }
}

/// Handle CLI subcommands. Returns true if a command was handled (exit after).
pub fn handle_subcommand(cli: &Cli) -> bool {
    match &cli.command {
        Some(Commands::Config { show, path }) => {
            if *path {
                println!("{}", Config::config_path().display());
            } else if *show {
                match Config::load() {
                    Ok(mut config) => {
                        // Never print the signing secret
                        if config.signing_secret.is_some() {
                            config.signing_secret = Some("<redacted>".to_string());
                        }
                        println!("{config:#?}");
                    }
                    Err(e) => eprintln!("Failed to load config: {e:#}"),
                }
            } else {
                println!("Usage: mcp-gateway config [--show|--path]");
            }
            true
        }
        None => false,
    }
}
