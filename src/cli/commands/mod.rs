//! Subcommands module for the asyncwinrm CLI
//!
//! This module contains all the subcommand implementations.

pub mod identify;
pub mod matrix;
pub mod run;

use std::sync::Arc;

use anyhow::{Context, Result};

use asyncwinrm::config::Config;
use asyncwinrm::registry::AuthProviderRegistry;
use asyncwinrm::session::WinRmSession;

use crate::cli::output::OutputFormatter;
use crate::cli::ConnectionArgs;

/// Common context shared between commands
pub struct CommandContext {
    /// Configuration
    pub config: Config,
    /// Output formatter
    pub output: OutputFormatter,
    /// Verbosity level
    pub verbosity: u8,
    /// Authentication providers, shared by every session this run opens
    pub registry: Arc<AuthProviderRegistry>,
}

impl CommandContext {
    /// Create a new command context from CLI arguments
    pub fn new(cli: &crate::cli::Cli, config: Config) -> Self {
        let output = OutputFormatter::new(!cli.no_color, cli.is_json(), cli.verbosity());

        Self {
            config,
            output,
            verbosity: cli.verbosity(),
            registry: Arc::new(AuthProviderRegistry::new()),
        }
    }

    /// Build a session for the endpoint selected by `args` and the config.
    pub fn session(&self, args: &ConnectionArgs) -> Result<WinRmSession> {
        let mut config = self.config.clone();
        args.apply(&mut config);
        let session_config = config.session_config(None)?;
        self.output.debug(&format!(
            "Connecting to {} with {}",
            session_config.endpoint,
            session_config.credential.mechanism()
        ));
        WinRmSession::new(session_config, Arc::clone(&self.registry))
            .context("Failed to create session")
    }
}

/// Trait for runnable commands
#[async_trait::async_trait]
pub trait Runnable {
    /// Execute the command
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32>;
}
