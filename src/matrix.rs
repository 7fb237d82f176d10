//! Test matrix of Windows target machines.
//!
//! A [`TestMatrix`] is a validated table of [`TargetMachine`]s sharing one
//! isolated private network. It renders a multi-machine Vagrantfile, drives
//! `vagrant up` / `vagrant destroy` for all targets or a named subset, and
//! runs concurrent smoke-test sessions against them.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Result, WinRmError};
use crate::registry::AuthProviderRegistry;
use crate::session::{SessionConfig, WinRmSession};

/// Default private network of the matrix
pub const DEFAULT_NETWORK: &str = "172.28.128.0/24";

/// Windows computer names are limited to 15 characters.
const MAX_HOSTNAME_LEN: usize = 15;

/// Provisioning applied identically to every target: let the test client
/// use Basic auth over plain HTTP on the private network.
const PROVISION_SCRIPT: &str = r#"Set-Item -Path WSMan:\localhost\Service\Auth\Basic -Value $true
Set-Item -Path WSMan:\localhost\Service\AllowUnencrypted -Value $true
Set-Item -Path WSMan:\localhost\MaxTimeoutms -Value 1800000
Enable-NetFirewallRule -DisplayGroup 'Windows Remote Management'"#;

// ============================================================================
// Network
// ============================================================================

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PrivateNetwork {
    address: Ipv4Addr,
    prefix: u8,
}

impl PrivateNetwork {
    /// Network with `prefix` bits; host bits of `address` are cleared.
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if !(8..=30).contains(&prefix) {
            return Err(WinRmError::InvalidConfig(format!(
                "network prefix /{prefix} must be between /8 and /30"
            )));
        }
        if !address.is_private() {
            return Err(WinRmError::InvalidConfig(format!(
                "network {address}/{prefix} is not a private range"
            )));
        }
        let address = Ipv4Addr::from(u32::from(address) & mask(prefix));
        Ok(Self { address, prefix })
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `ip` is a usable host address in this network.
    pub fn contains_host(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        let network = u32::from(self.address);
        let broadcast = network | !mask(self.prefix);
        ip & mask(self.prefix) == network && ip != network && ip != broadcast
    }
}

fn mask(prefix: u8) -> u32 {
    u32::MAX << (32 - u32::from(prefix))
}

impl Default for PrivateNetwork {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(172, 28, 128, 0),
            prefix: 24,
        }
    }
}

impl fmt::Display for PrivateNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for PrivateNetwork {
    type Err = WinRmError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || WinRmError::InvalidConfig(format!("invalid network '{s}', expected a.b.c.d/nn"));
        let (address, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let address = address.parse().map_err(|_| invalid())?;
        let prefix = prefix.parse().map_err(|_| invalid())?;
        Self::new(address, prefix)
    }
}

impl TryFrom<String> for PrivateNetwork {
    type Error = WinRmError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PrivateNetwork> for String {
    fn from(network: PrivateNetwork) -> Self {
        network.to_string()
    }
}

// ============================================================================
// Targets
// ============================================================================

/// Windows Server generation of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsGeneration {
    Server2012,
    Server2012r2,
    Server2016,
    Server2019,
    Server2022,
}

impl OsGeneration {
    pub const ALL: [OsGeneration; 5] = [
        OsGeneration::Server2012,
        OsGeneration::Server2012r2,
        OsGeneration::Server2016,
        OsGeneration::Server2019,
        OsGeneration::Server2022,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OsGeneration::Server2012 => "server2012",
            OsGeneration::Server2012r2 => "server2012r2",
            OsGeneration::Server2016 => "server2016",
            OsGeneration::Server2019 => "server2019",
            OsGeneration::Server2022 => "server2022",
        }
    }

    /// Vagrant box used when a target does not name one.
    pub fn default_box(&self) -> &'static str {
        match self {
            OsGeneration::Server2012 => "jborean93/WindowsServer2012",
            OsGeneration::Server2012r2 => "jborean93/WindowsServer2012R2",
            OsGeneration::Server2016 => "jborean93/WindowsServer2016",
            OsGeneration::Server2019 => "jborean93/WindowsServer2019",
            OsGeneration::Server2022 => "jborean93/WindowsServer2022",
        }
    }
}

impl fmt::Display for OsGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provisioned Windows machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMachine {
    /// Vagrant machine name
    pub name: String,
    /// Windows Server generation
    pub os_generation: OsGeneration,
    /// Vagrant box image
    pub box_image: String,
    /// Static address on the private network
    pub ip: Ipv4Addr,
    /// Guest computer name
    pub hostname: String,
    /// Virtual CPUs
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    /// Memory in MiB
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
}

fn default_cpus() -> u32 {
    2
}

fn default_memory_mb() -> u32 {
    2048
}

impl TargetMachine {
    /// Target for `generation` at `ip`, named after the generation.
    pub fn new(os_generation: OsGeneration, ip: Ipv4Addr) -> Self {
        Self {
            name: os_generation.as_str().to_string(),
            os_generation,
            box_image: os_generation.default_box().to_string(),
            ip,
            hostname: os_generation.as_str().to_string(),
            cpus: default_cpus(),
            memory_mb: default_memory_mb(),
        }
    }

    /// WinRM HTTP endpoint of the target.
    pub fn endpoint(&self) -> String {
        format!("http://{}:5985/wsman", self.ip)
    }
}

// ============================================================================
// Matrix
// ============================================================================

/// A validated set of targets on one private network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestMatrix {
    network: PrivateNetwork,
    targets: Vec<TargetMachine>,
}

#[derive(Deserialize)]
struct MatrixFile {
    #[serde(default)]
    network: PrivateNetwork,
    #[serde(default, rename = "target")]
    targets: Vec<TargetMachine>,
}

impl Default for TestMatrix {
    /// Five Windows Server generations at `.11` through `.15`.
    fn default() -> Self {
        let targets = OsGeneration::ALL
            .iter()
            .zip(11u8..)
            .map(|(generation, host)| TargetMachine::new(*generation, Ipv4Addr::new(172, 28, 128, host)))
            .collect();
        Self {
            network: PrivateNetwork::default(),
            targets,
        }
    }
}

impl TestMatrix {
    /// Validate and build a matrix.
    pub fn new(network: PrivateNetwork, targets: Vec<TargetMachine>) -> Result<Self> {
        let matrix = Self { network, targets };
        matrix.validate()?;
        Ok(matrix)
    }

    /// Parse a `matrix.toml` document: a `network` key plus `[[target]]`
    /// tables. Without targets the default table is used.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: MatrixFile = toml::from_str(content)
            .map_err(|e| WinRmError::InvalidConfig(format!("invalid matrix file: {e}")))?;
        if file.targets.is_empty() {
            return Ok(Self::default());
        }
        Self::new(file.network, file.targets)
    }

    /// Load a `matrix.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn network(&self) -> PrivateNetwork {
        self.network
    }

    pub fn targets(&self) -> &[TargetMachine] {
        &self.targets
    }

    /// Check names, addresses and resources.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(WinRmError::InvalidConfig("test matrix has no targets".into()));
        }

        let mut names = HashSet::new();
        let mut ips = HashSet::new();
        for target in &self.targets {
            let valid_name = !target.name.is_empty()
                && target
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid_name {
                return Err(WinRmError::InvalidConfig(format!(
                    "invalid target name '{}'",
                    target.name
                )));
            }
            if !names.insert(target.name.as_str()) {
                return Err(WinRmError::InvalidConfig(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
            if !ips.insert(target.ip) {
                return Err(WinRmError::InvalidConfig(format!(
                    "duplicate address {} (target '{}')",
                    target.ip, target.name
                )));
            }
            if !self.network.contains_host(target.ip) {
                return Err(WinRmError::InvalidConfig(format!(
                    "target '{}' address {} is not a host address in {}",
                    target.name, target.ip, self.network
                )));
            }
            if target.hostname.is_empty()
                || target.hostname.len() > MAX_HOSTNAME_LEN
                || !target.hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                return Err(WinRmError::InvalidConfig(format!(
                    "target '{}' hostname '{}' is not a valid computer name",
                    target.name, target.hostname
                )));
            }
            if target.cpus == 0 || target.memory_mb < 1024 {
                return Err(WinRmError::InvalidConfig(format!(
                    "target '{}' needs at least 1 CPU and 1024 MiB",
                    target.name
                )));
            }
            if target.box_image.trim().is_empty() {
                return Err(WinRmError::InvalidConfig(format!(
                    "target '{}' has no box image",
                    target.name
                )));
            }
            if !target.box_image.chars().all(is_box_char) {
                return Err(WinRmError::InvalidConfig(format!(
                    "target '{}' box image '{}' may only use letters, digits and . _ - / :",
                    target.name, target.box_image
                )));
            }
        }
        Ok(())
    }

    /// Targets named in `names`, in matrix order; all targets when empty.
    pub fn select(&self, names: &[String]) -> Result<Vec<&TargetMachine>> {
        if names.is_empty() {
            return Ok(self.targets.iter().collect());
        }
        if let Some(unknown) = names
            .iter()
            .find(|name| !self.targets.iter().any(|t| &t.name == *name))
        {
            return Err(WinRmError::InvalidConfig(format!(
                "unknown target '{unknown}'"
            )));
        }
        Ok(self
            .targets
            .iter()
            .filter(|t| names.contains(&t.name))
            .collect())
    }

    /// Multi-machine Vagrantfile for the whole matrix.
    pub fn vagrantfile(&self) -> String {
        let mut out = String::new();
        out.push_str("# -*- mode: ruby -*-\n");
        out.push_str("# vi: set ft=ruby :\n");
        out.push_str("# Generated by asyncwinrm; edit matrix.toml instead.\n\n");
        out.push_str("PROVISION = <<~'SCRIPT'\n");
        for line in PROVISION_SCRIPT.lines() {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("SCRIPT\n\n");
        out.push_str("Vagrant.configure(\"2\") do |config|\n");
        out.push_str("  config.vm.communicator = \"winrm\"\n");
        out.push_str("  config.vm.guest = :windows\n");
        out.push_str("  config.vm.boot_timeout = 600\n");

        for target in &self.targets {
            out.push('\n');
            out.push_str(&format!("  config.vm.define {} do |node|\n", ruby_string(&target.name)));
            out.push_str(&format!("    node.vm.box = {}\n", ruby_string(&target.box_image)));
            out.push_str(&format!("    node.vm.hostname = {}\n", ruby_string(&target.hostname)));
            out.push_str(&format!(
                "    node.vm.network \"private_network\", ip: \"{}\"\n",
                target.ip
            ));
            out.push_str("    node.vm.provider \"virtualbox\" do |vb|\n");
            out.push_str(&format!("      vb.cpus = {}\n", target.cpus));
            out.push_str(&format!("      vb.memory = {}\n", target.memory_mb));
            out.push_str("    end\n");
            out.push_str("    node.vm.provision \"shell\", inline: PROVISION\n");
            out.push_str("  end\n");
        }
        out.push_str("end\n");
        out
    }
}

fn is_box_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':')
}

/// Double-quoted Ruby literal with interpolation disabled.
fn ruby_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '#') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

// ============================================================================
// Vagrant driver
// ============================================================================

/// Runs the `vagrant` executable in a working directory.
#[derive(Debug, Clone)]
pub struct Vagrant {
    program: PathBuf,
    workdir: PathBuf,
}

impl Vagrant {
    /// Driver using `vagrant` from `PATH`.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("vagrant"),
            workdir: workdir.into(),
        }
    }

    /// Use a specific executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Write the matrix's Vagrantfile into the working directory.
    pub async fn write_vagrantfile(&self, matrix: &TestMatrix) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.workdir).await?;
        let path = self.workdir.join("Vagrantfile");
        tokio::fs::write(&path, matrix.vagrantfile()).await?;
        debug!(path = %path.display(), "Wrote Vagrantfile");
        Ok(path)
    }

    /// Bring up the selected targets (all when `names` is empty).
    pub async fn up(&self, matrix: &TestMatrix, names: &[String]) -> Result<()> {
        let targets = matrix.select(names)?;
        self.write_vagrantfile(matrix).await?;
        let mut args = vec!["up".to_string(), "--provision".to_string()];
        args.extend(targets.iter().map(|t| t.name.clone()));
        info!(targets = targets.len(), "Starting targets");
        self.run(&args).await
    }

    /// Destroy the selected targets (all when `names` is empty).
    pub async fn destroy(&self, matrix: &TestMatrix, names: &[String]) -> Result<()> {
        let targets = matrix.select(names)?;
        self.write_vagrantfile(matrix).await?;
        let mut args = vec!["destroy".to_string(), "--force".to_string()];
        args.extend(targets.iter().map(|t| t.name.clone()));
        info!(targets = targets.len(), "Destroying targets");
        self.run(&args).await
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        debug!(program = %self.program.display(), args = ?args, "Running provisioning tool");
        let status = Command::new(&self.program)
            .args(args)
            .current_dir(&self.workdir)
            .kill_on_drop(true)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(WinRmError::Io(std::io::Error::other(format!(
                "{} {} exited with {status}",
                self.program.display(),
                args.first().map(String::as_str).unwrap_or_default()
            ))))
        }
    }
}

// ============================================================================
// Smoke checks
// ============================================================================

/// Result of checking one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    /// Target name
    pub name: String,
    /// Target address
    pub ip: Ipv4Addr,
    /// `ProductVersion` from Identify
    pub product_version: Option<String>,
    /// Output of `hostname` on the target
    pub hostname: Option<String>,
    /// Failure, if any step failed
    pub error: Option<String>,
}

impl TargetReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Check every target concurrently: identify, open a shell, run `hostname`,
/// close. Each target gets its own session and task; only `registry` is
/// shared.
pub async fn check_targets<F>(
    targets: &[&TargetMachine],
    registry: Arc<AuthProviderRegistry>,
    configure: F,
) -> Vec<TargetReport>
where
    F: Fn(&TargetMachine) -> Result<SessionConfig>,
{
    let handles: Vec<_> = targets
        .iter()
        .map(|target| {
            let name = target.name.clone();
            let ip = target.ip;
            let config = configure(target);
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let mut report = TargetReport {
                    name,
                    ip,
                    product_version: None,
                    hostname: None,
                    error: None,
                };
                match config {
                    Ok(config) => {
                        if let Err(e) = check_one(config, registry, &mut report).await {
                            warn!(target = %report.name, error = %e, "Target check failed");
                            report.error = Some(e.to_string());
                        }
                    }
                    Err(e) => report.error = Some(e.to_string()),
                }
                report
            })
        })
        .collect();

    let names: Vec<(String, Ipv4Addr)> = targets.iter().map(|t| (t.name.clone(), t.ip)).collect();
    join_all(handles)
        .await
        .into_iter()
        .zip(names)
        .map(|(joined, (name, ip))| {
            joined.unwrap_or_else(|e| TargetReport {
                name,
                ip,
                product_version: None,
                hostname: None,
                error: Some(format!("check task failed: {e}")),
            })
        })
        .collect()
}

async fn check_one(
    config: SessionConfig,
    registry: Arc<AuthProviderRegistry>,
    report: &mut TargetReport,
) -> Result<()> {
    let mut session = WinRmSession::new(config, registry)?;
    report.product_version = Some(session.identify().await?.product_version);

    session.open().await?;
    let ran = session.run_to_completion("hostname", &[] as &[&str]).await;
    let closed = session.close().await;

    let output = ran?;
    closed?;
    report.hostname = Some(output.stdout.trim().to_string());
    info!(target = %report.name, hostname = ?report.hostname, "Target check passed");
    Ok(())
}
