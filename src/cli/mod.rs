//! CLI module for asyncwinrm
//!
//! Argument parsing and subcommand dispatch.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use asyncwinrm::auth::Mechanism;
use asyncwinrm::config::Config;

/// asyncwinrm - an async WinRM client
///
/// Run commands on Windows machines over WS-Management and manage a
/// Vagrant test matrix of Windows Server targets.
#[derive(Parser, Debug, Clone)]
#[command(name = "asyncwinrm")]
#[command(author = "asyncwinrm Contributors")]
#[command(version)]
#[command(about = "An async WinRM client", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true, env = "ASYNCWINRM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output with colors
    #[default]
    Human,
    /// JSON output for scripting
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Query WS-Management identity information
    Identify(commands::identify::IdentifyArgs),

    /// Run a command in a remote shell
    Run(commands::run::RunArgs),

    /// Manage the Windows test matrix
    Matrix(commands::matrix::MatrixArgs),
}

/// Connection flags shared by subcommands that talk to one endpoint
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Endpoint (host, host:port or full URL)
    #[arg(short = 'e', long)]
    pub endpoint: Option<String>,

    /// Authentication mechanism
    #[arg(short = 'a', long, value_parser = parse_mechanism)]
    pub auth: Option<Mechanism>,

    /// User name, DOMAIN\user or user@REALM
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Request timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Skip TLS certificate verification
    #[arg(short = 'k', long)]
    pub insecure: bool,
}

impl ConnectionArgs {
    /// Layer the flags over the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(endpoint) = &self.endpoint {
            config.connection.endpoint = Some(endpoint.clone());
        }
        if let Some(mechanism) = self.auth {
            config.auth.method = mechanism;
        }
        if let Some(username) = &self.username {
            config.auth.username = Some(username.clone());
        }
        if let Some(secs) = self.timeout {
            config
                .connection
                .set_request_timeout(std::time::Duration::from_secs(secs));
        }
        if self.insecure {
            config.connection.verify_tls = false;
        }
    }
}

fn parse_mechanism(s: &str) -> Result<Mechanism, String> {
    s.parse::<Mechanism>().map_err(|e| e.to_string())
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        self.verbose
    }

    /// Check if JSON output is requested
    pub fn is_json(&self) -> bool {
        self.output == OutputFormat::Json
    }
}
