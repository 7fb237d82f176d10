//! Matrix command
//!
//! Lists the Windows test matrix, renders its Vagrantfile, brings targets
//! up or down, and runs smoke checks against them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use asyncwinrm::error::WinRmError;
use asyncwinrm::matrix::{check_targets, TestMatrix, Vagrant};

use super::{CommandContext, Runnable};

/// Arguments for the matrix command
#[derive(Args, Debug, Clone)]
pub struct MatrixArgs {
    #[command(subcommand)]
    pub action: MatrixAction,

    /// Path to the vagrant executable
    #[arg(long, global = true, env = "ASYNCWINRM_VAGRANT", default_value = "vagrant")]
    pub vagrant: PathBuf,
}

#[derive(Subcommand, Debug, Clone)]
pub enum MatrixAction {
    /// List the targets
    List,

    /// Print the generated Vagrantfile
    Vagrantfile {
        /// Write to this file instead of stdout
        #[arg(short = 'o', long = "file", value_name = "PATH")]
        path: Option<PathBuf>,
    },

    /// Bring targets up (all when none are named)
    Up {
        /// Target names
        names: Vec<String>,
    },

    /// Destroy targets (all when none are named)
    Down {
        /// Target names
        names: Vec<String>,
    },

    /// Identify each target and run `hostname` in a shell
    Check {
        /// Target names
        names: Vec<String>,
    },
}

#[async_trait::async_trait]
impl Runnable for MatrixArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        let matrix = ctx.config.test_matrix()?;

        match &self.action {
            MatrixAction::List => list(ctx, &matrix),
            MatrixAction::Vagrantfile { path } => {
                let rendered = matrix.vagrantfile();
                match path {
                    Some(path) => {
                        std::fs::write(path, rendered)
                            .with_context(|| format!("Failed to write {}", path.display()))?;
                        ctx.output.line(&format!("Wrote {}", path.display()));
                    }
                    None => print!("{rendered}"),
                }
                Ok(0)
            }
            MatrixAction::Up { names } => {
                self.vagrant(ctx).up(&matrix, names).await?;
                ctx.output.elapsed();
                Ok(0)
            }
            MatrixAction::Down { names } => {
                self.vagrant(ctx).destroy(&matrix, names).await?;
                ctx.output.elapsed();
                Ok(0)
            }
            MatrixAction::Check { names } => check(ctx, &matrix, names).await,
        }
    }
}

impl MatrixArgs {
    fn vagrant(&self, ctx: &CommandContext) -> Vagrant {
        Vagrant::new(&ctx.config.matrix.vagrant_dir).with_program(&self.vagrant)
    }
}

fn list(ctx: &CommandContext, matrix: &TestMatrix) -> Result<i32> {
    if ctx.output.is_json() {
        ctx.output.json(&matrix.targets())?;
        return Ok(0);
    }

    ctx.output.section(&format!("network {}", matrix.network()));
    for target in matrix.targets() {
        ctx.output.line(&format!(
            "{:<14} {:<16} {:<16} {}",
            target.name, target.ip, target.hostname, target.box_image
        ));
    }
    Ok(0)
}

async fn check(ctx: &CommandContext, matrix: &TestMatrix, names: &[String]) -> Result<i32> {
    let targets = matrix.select(names)?;
    let config = &ctx.config;
    let reports = check_targets(&targets, ctx.registry.clone(), |target| {
        config
            .target_session_config(target)
            .map_err(|e| WinRmError::InvalidConfig(format!("{e:#}")))
    })
    .await;

    let failed = reports.iter().filter(|r| !r.is_ok()).count();

    if ctx.output.is_json() {
        ctx.output.json(&reports)?;
    } else {
        for report in &reports {
            let detail = match &report.error {
                Some(error) => error.clone(),
                None => format!(
                    "{} ({})",
                    report.hostname.as_deref().unwrap_or("-"),
                    report.product_version.as_deref().unwrap_or("-")
                ),
            };
            ctx.output.status(&report.name, report.is_ok(), &detail);
        }
        if failed > 0 {
            ctx.output
                .warning(&format!("{failed} of {} targets failed", reports.len()));
        }
        ctx.output.elapsed();
    }

    Ok(i32::from(failed > 0))
}
