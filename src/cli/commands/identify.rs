//! Identify command
//!
//! Sends WS-Man Identify and, optionally, reads `Win32_OperatingSystem` or a
//! `Win32_Service` instance.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use asyncwinrm::protocol::{CimObject, CimValue, IdentifyResponse};

use super::{CommandContext, Runnable};
use crate::cli::ConnectionArgs;

/// Arguments for the identify command
#[derive(Args, Debug, Clone)]
pub struct IdentifyArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Also read Win32_OperatingSystem
    #[arg(long)]
    pub os: bool,

    /// Also read the Win32_Service with this name
    #[arg(long, value_name = "NAME")]
    pub service: Option<String>,
}

#[derive(Debug, Serialize)]
struct IdentifyReport {
    identify: IdentifyResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    operating_system: Option<CimObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<CimObject>,
}

#[async_trait::async_trait]
impl Runnable for IdentifyArgs {
    async fn run(&self, ctx: &mut CommandContext) -> Result<i32> {
        let mut session = ctx.session(&self.connection)?;

        let identify = session.identify().await?;
        let operating_system = if self.os {
            Some(session.get_operating_system().await?)
        } else {
            None
        };
        let service = match &self.service {
            Some(name) => Some(session.get_service(name).await?),
            None => None,
        };
        session.close().await?;

        let report = IdentifyReport {
            identify,
            operating_system,
            service,
        };

        if ctx.output.is_json() {
            ctx.output.json(&report)?;
            return Ok(0);
        }

        ctx.output.section(session.host());
        ctx.output.field("vendor", &report.identify.product_vendor);
        ctx.output.field("version", &report.identify.product_version);
        ctx.output.field("protocol", &report.identify.protocol_version);
        if !report.identify.security_profiles.is_empty() {
            ctx.output
                .field("profiles", report.identify.security_profiles.join(", "));
        }

        if let Some(os) = &report.operating_system {
            ctx.output.section("Win32_OperatingSystem");
            print_object(ctx, os, &["Caption", "Version", "BuildNumber", "CSName", "OSArchitecture"]);
        }
        if let Some(service) = &report.service {
            ctx.output.section("Win32_Service");
            print_object(ctx, service, &["Name", "DisplayName", "State", "StartMode"]);
        }

        ctx.output.elapsed();
        Ok(0)
    }
}

fn print_object(ctx: &CommandContext, object: &CimObject, keys: &[&str]) {
    for key in keys {
        if let Some(value) = object.get(*key) {
            ctx.output.field(key, render(value));
        }
    }
}

fn render(value: &CimValue) -> String {
    match value {
        CimValue::Null => "-".to_string(),
        CimValue::Text(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
