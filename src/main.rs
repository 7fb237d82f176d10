//! asyncwinrm - An async WinRM client
//!
//! This is the main entry point for the asyncwinrm CLI.

mod cli;

use anyhow::Result;
use asyncwinrm::config::Config;
use cli::commands::{CommandContext, Runnable};
use cli::{Cli, Commands};
use colored::Colorize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application version information
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    init_logging(cli.verbosity(), cli.log_json);

    if cli.verbosity() >= 2 {
        eprintln!("asyncwinrm v{VERSION}");
    }

    let exit_code = match execute(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            1
        }
    };

    std::process::exit(exit_code);
}

async fn execute(cli: &Cli) -> Result<i32> {
    let config = Config::load(cli.config.as_ref())?;
    let mut ctx = CommandContext::new(cli, config);

    match &cli.command {
        Commands::Identify(args) => args.run(&mut ctx).await,
        Commands::Run(args) => args.run(&mut ctx).await,
        Commands::Matrix(args) => args.run(&mut ctx).await,
    }
}

/// Initialize logging based on verbosity level. Logs go to stderr so stdout
/// carries only command output.
fn init_logging(verbosity: u8, json: bool) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(verbosity >= 3)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
