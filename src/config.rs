//! Configuration for the asyncwinrm CLI.
//!
//! Handles loading and merging configuration from multiple sources, later
//! ones winning:
//! - Default values
//! - System configuration (/etc/asyncwinrm/config.toml)
//! - User configuration (~/.config/asyncwinrm/config.toml)
//! - Project configuration (./asyncwinrm.toml)
//! - `--config` / `ASYNCWINRM_CONFIG`
//! - Environment variables
//!
//! Files are merged key by key, so a project file can override a single
//! timeout without repeating the rest of its section.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{Credential, Mechanism, ProviderFeatures};
use crate::matrix::{PrivateNetwork, TargetMachine, TestMatrix};
use crate::retry::RetryPolicy;
use crate::session::{
    SessionConfig, ShellOptions, DEFAULT_LOCALE, DEFAULT_MAX_ENVELOPE_SIZE,
    DEFAULT_OPERATION_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
use crate::transport::Endpoint;

/// Environment variable naming an extra config file
pub const CONFIG_ENV: &str = "ASYNCWINRM_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Endpoint and transport settings
    pub connection: ConnectionConfig,

    /// Credentials and provider knobs
    pub auth: AuthConfig,

    /// Retry policy for idempotent requests
    pub retry: RetryPolicy,

    /// Remote shell options
    pub shell: ShellOptions,

    /// Test matrix settings
    pub matrix: MatrixConfig,
}

/// `[connection]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Default endpoint when none is given on the command line
    pub endpoint: Option<String>,

    /// Verify server certificates
    pub verify_tls: bool,

    /// Extra CA certificate (PEM)
    pub ca_cert: Option<PathBuf>,

    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// WS-Man `OperationTimeout`
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Client-side deadline per exchange
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Message locale
    pub locale: String,

    /// `MaxEnvelopeSize` in bytes
    pub max_envelope_size: u32,

    /// Redirects followed
    pub max_redirects: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            verify_tls: true,
            ca_cert: None,
            connect_timeout: Duration::from_secs(30),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            locale: DEFAULT_LOCALE.to_string(),
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            max_redirects: 5,
        }
    }
}

impl ConnectionConfig {
    /// Largest gap kept between the request and operation timeouts when the
    /// latter has to be derived.
    const OPERATION_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

    /// Set the request timeout from a single user-facing value. The
    /// operation timeout is pulled below it when it would no longer fit.
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
        if self.operation_timeout >= timeout {
            let margin = Self::OPERATION_TIMEOUT_MARGIN.min(timeout / 2);
            self.operation_timeout = timeout - margin;
        }
    }
}

/// `[auth]`
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// basic, ntlm or kerberos
    pub method: Mechanism,

    /// User name or principal
    pub username: Option<String>,

    /// Password; prefer `ASYNCWINRM_PASSWORD` over writing it to a file
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Kerberos realm appended to bare user names
    pub realm: Option<String>,

    /// SPN service class
    pub service: String,

    /// SPN host when it differs from the endpoint host
    pub hostname: Option<String>,

    /// Require Kerberos mutual authentication
    pub mutual_auth: bool,

    /// NTLM workstation name
    pub workstation: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: Mechanism::Ntlm,
            username: None,
            password: None,
            realm: None,
            service: "HTTP".to_string(),
            hostname: None,
            mutual_auth: true,
            workstation: None,
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("method", &self.method)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("realm", &self.realm)
            .field("service", &self.service)
            .field("hostname", &self.hostname)
            .field("mutual_auth", &self.mutual_auth)
            .field("workstation", &self.workstation)
            .finish()
    }
}

/// `[matrix]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// A `matrix.toml` file; takes precedence over inline targets
    pub file: Option<PathBuf>,

    /// Private network of inline targets
    pub network: PrivateNetwork,

    /// Inline targets; the built-in table is used when empty
    #[serde(rename = "target")]
    pub targets: Vec<TargetMachine>,

    /// Directory holding the generated Vagrantfile
    pub vagrant_dir: PathBuf,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            file: None,
            network: PrivateNetwork::default(),
            targets: Vec::new(),
            vagrant_dir: PathBuf::from(".vagrant-matrix"),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut merged = toml::Table::new();
        for path in Self::config_paths(config_path) {
            if path.exists() {
                debug!(path = %path.display(), "Loading config file");
                merge_tables(&mut merged, read_table(&path)?);
            } else if config_path == Some(&path) {
                bail!("Config file not found: {}", path.display());
            }
        }

        let mut config: Config = toml::Value::Table(merged)
            .try_into()
            .context("Invalid configuration")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load a single file over the defaults, ignoring the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let table = read_table(path.as_ref())?;
        toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Invalid configuration in {}", path.as_ref().display()))
    }

    /// Files consulted, lowest precedence first.
    fn config_paths(explicit_path: Option<&PathBuf>) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/asyncwinrm/config.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("asyncwinrm").join("config.toml"));
        }

        paths.push(PathBuf::from("asyncwinrm.toml"));

        match explicit_path {
            Some(path) => paths.push(path.clone()),
            None => {
                if let Ok(env_config) = std::env::var(CONFIG_ENV) {
                    paths.push(PathBuf::from(env_config));
                }
            }
        }

        paths
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("ASYNCWINRM_ENDPOINT") {
            self.connection.endpoint = Some(endpoint);
        }

        if let Ok(method) = std::env::var("ASYNCWINRM_AUTH_METHOD") {
            self.auth.method = method
                .parse()
                .with_context(|| format!("Invalid ASYNCWINRM_AUTH_METHOD '{method}'"))?;
        }

        if let Ok(username) = std::env::var("ASYNCWINRM_USERNAME") {
            self.auth.username = Some(username);
        }

        if let Ok(password) = std::env::var("ASYNCWINRM_PASSWORD") {
            self.auth.password = Some(password);
        }

        if let Ok(realm) = std::env::var("ASYNCWINRM_REALM") {
            self.auth.realm = Some(realm);
        }

        // Whole seconds, like the `--timeout` flag.
        if let Ok(timeout) = std::env::var("ASYNCWINRM_TIMEOUT") {
            let secs: u64 = timeout
                .parse()
                .with_context(|| format!("Invalid ASYNCWINRM_TIMEOUT '{timeout}'"))?;
            self.connection.set_request_timeout(Duration::from_secs(secs));
        }

        if let Ok(verify) = std::env::var("ASYNCWINRM_VERIFY_TLS") {
            self.connection.verify_tls = match verify.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => bail!("Invalid ASYNCWINRM_VERIFY_TLS '{other}'"),
            };
        }

        Ok(())
    }

    /// Session settings for `endpoint`, or the configured endpoint.
    pub fn session_config(&self, endpoint: Option<&str>) -> Result<SessionConfig> {
        let endpoint = endpoint
            .or(self.connection.endpoint.as_deref())
            .context("No endpoint given; pass one or set connection.endpoint")?;
        let endpoint = Endpoint::parse(endpoint)?;

        let username = self
            .auth
            .username
            .clone()
            .context("No username configured; set auth.username or ASYNCWINRM_USERNAME")?;
        let credential = Credential::for_mechanism(
            self.auth.method,
            username,
            self.auth.password.clone(),
            self.auth.realm.as_deref(),
        )?;

        let features = ProviderFeatures {
            service: self.auth.service.clone(),
            target_host: Some(
                self.auth
                    .hostname
                    .clone()
                    .unwrap_or_else(|| endpoint.host().to_string()),
            ),
            mutual_auth: self.auth.mutual_auth,
            workstation: self.auth.workstation.clone(),
        };

        let mut session = SessionConfig::new(endpoint, credential)
            .with_features(features)
            .with_verify_tls(self.connection.verify_tls)
            .with_operation_timeout(self.connection.operation_timeout)
            .with_request_timeout(self.connection.request_timeout)
            .with_retry(self.retry.clone())
            .with_shell(self.shell.clone());
        session.ca_cert = self.connection.ca_cert.clone();
        session.connect_timeout = self.connection.connect_timeout;
        session.max_redirects = self.connection.max_redirects;
        session.locale = self.connection.locale.clone();
        session.max_envelope_size = self.connection.max_envelope_size;

        session.validate()?;
        Ok(session)
    }

    /// Session settings for a matrix target. The SPN host is the target's
    /// computer name.
    pub fn target_session_config(&self, target: &TargetMachine) -> Result<SessionConfig> {
        let mut config = self.clone();
        if config.auth.hostname.is_none() {
            config.auth.hostname = Some(target.hostname.clone());
        }
        config.session_config(Some(&target.endpoint()))
    }

    /// The configured test matrix.
    pub fn test_matrix(&self) -> Result<TestMatrix> {
        if let Some(file) = &self.matrix.file {
            return TestMatrix::load(file)
                .with_context(|| format!("Failed to load matrix file {}", file.display()));
        }
        if self.matrix.targets.is_empty() {
            return Ok(TestMatrix::default());
        }
        Ok(TestMatrix::new(
            self.matrix.network,
            self.matrix.targets.clone(),
        )?)
    }
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Recursively merge `overlay` into `base`; tables merge, other values
/// replace.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
