//! Session configuration and state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{Credential, ProviderFeatures};
use crate::error::{Result, WinRmError};
use crate::retry::RetryPolicy;
use crate::transport::{Endpoint, TransportOptions};

/// Default `Locale` / `DataLocale`
pub const DEFAULT_LOCALE: &str = "en-US";

/// Default `MaxEnvelopeSize` (512 KiB)
pub const DEFAULT_MAX_ENVELOPE_SIZE: u32 = 512 * 1024;

/// Default server-side operation timeout
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Default caller-side request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time the HTTP client waits beyond the request timeout, so the
/// caller-side deadline is always the one that fires.
const CLIENT_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Shell options
// ============================================================================

/// Options for the remote `cmd` shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellOptions {
    /// Initial working directory
    pub working_directory: Option<String>,
    /// Environment variables set in the shell
    pub environment: BTreeMap<String, String>,
    /// Input streams requested at creation
    pub input_streams: Vec<String>,
    /// Output streams requested at creation and on every Receive
    pub output_streams: Vec<String>,
    /// Idle lifetime of the shell on the server
    #[serde(with = "humantime_serde")]
    pub lifetime: Option<Duration>,
    /// Skip loading the user profile
    pub no_profile: bool,
    /// Console code page (437, 65001, ...)
    pub codepage: Option<u32>,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            working_directory: None,
            environment: BTreeMap::new(),
            input_streams: vec!["stdin".to_string()],
            output_streams: vec!["stdout".to_string(), "stderr".to_string()],
            lifetime: None,
            no_profile: false,
            codepage: None,
        }
    }
}

// ============================================================================
// Session configuration
// ============================================================================

/// Everything needed to open a session against one endpoint.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Target endpoint
    pub endpoint: Endpoint,
    /// Credential, shared with replacement providers
    pub credential: Arc<Credential>,
    /// Provider knobs (SPN, mutual auth, workstation)
    pub features: ProviderFeatures,
    /// TLS verification
    pub verify_tls: bool,
    /// Extra CA certificate
    pub ca_cert: Option<std::path::PathBuf>,
    /// HTTP connect timeout
    pub connect_timeout: Duration,
    /// Redirects followed
    pub max_redirects: usize,
    /// `Locale` header
    pub locale: String,
    /// WS-Man `OperationTimeout` header
    pub operation_timeout: Duration,
    /// Deadline for each exchange, enforced on the client
    pub request_timeout: Duration,
    /// `MaxEnvelopeSize` header
    pub max_envelope_size: u32,
    /// Shell creation options
    pub shell: ShellOptions,
    /// Retry policy for idempotent requests
    pub retry: RetryPolicy,
}

impl SessionConfig {
    /// Defaults for `endpoint` with `credential`. The SPN host defaults to
    /// the endpoint host.
    pub fn new(endpoint: Endpoint, credential: Credential) -> Self {
        let features = ProviderFeatures::for_host(endpoint.host());
        Self {
            endpoint,
            credential: Arc::new(credential),
            features,
            verify_tls: true,
            ca_cert: None,
            connect_timeout: Duration::from_secs(30),
            max_redirects: 5,
            locale: DEFAULT_LOCALE.to_string(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            shell: ShellOptions::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the caller-side request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the server-side operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the shell options.
    pub fn with_shell(mut self, shell: ShellOptions) -> Self {
        self.shell = shell;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set provider features.
    pub fn with_features(mut self, features: ProviderFeatures) -> Self {
        self.features = features;
        self
    }

    /// Enable or disable certificate verification.
    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Check timeouts and sizes.
    ///
    /// A Receive may legitimately block for the whole operation timeout, so
    /// the request timeout has to be longer.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() || self.operation_timeout.is_zero() {
            return Err(WinRmError::InvalidConfig("timeouts must be non-zero".into()));
        }
        if self.request_timeout <= self.operation_timeout {
            return Err(WinRmError::InvalidConfig(format!(
                "request timeout ({:?}) must exceed operation timeout ({:?})",
                self.request_timeout, self.operation_timeout
            )));
        }
        if self.max_envelope_size < 8192 {
            return Err(WinRmError::InvalidConfig(format!(
                "max envelope size {} is too small",
                self.max_envelope_size
            )));
        }
        if self.shell.output_streams.is_empty() {
            return Err(WinRmError::InvalidConfig(
                "at least one output stream is required".into(),
            ));
        }
        Ok(())
    }

    /// Options for the HTTP client.
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            verify_tls: self.verify_tls,
            ca_cert: self.ca_cert.clone(),
            connect_timeout: self.connect_timeout,
            timeout: self.request_timeout + CLIENT_TIMEOUT_GRACE,
            max_redirects: self.max_redirects,
        }
    }
}

// ============================================================================
// Session state
// ============================================================================

/// Lifecycle of a [`WinRmSession`](super::WinRmSession).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No shell yet
    Closed,
    /// Create in flight
    Opening,
    /// Shell available
    Open,
    /// Finished for good; the transport is gone
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Closed => "closed",
            SessionState::Opening => "opening",
            SessionState::Open => "open",
            SessionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}
