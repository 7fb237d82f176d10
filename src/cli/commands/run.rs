//! Run command
//!
//! Opens a shell, runs one command to completion, prints its output and
//! exits with the remote exit code.

use anyhow::{bail, Result};
use clap::Args;
use tracing::warn;

use super::{CommandContext, Runnable};
use crate::cli::ConnectionArgs;

/// Arguments for the run command
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Treat the command as a PowerShell script
    #[arg(long, short = 'p')]
    pub powershell: bool,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

#[async_trait::async_trait]
impl Runnable for RunArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        let Some((program, args)) = self.command.split_first() else {
            bail!("No command given");
        };

        let mut session = ctx.session(&self.connection)?;
        session.open().await?;

        let result = if self.powershell {
            session.run_powershell(&self.command.join(" ")).await
        } else {
            session.run_to_completion(program, args).await
        };

        if let Err(e) = session.close().await {
            warn!(host = %session.host(), error = %e, "Failed to close shell");
        }
        let output = result?;

        if ctx.output.is_json() {
            ctx.output.json(&output)?;
        } else {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            ctx.output.debug(&format!("exit code {}", output.exit_code));
        }

        ctx.output.elapsed();
        Ok(output.exit_code)
    }
}
