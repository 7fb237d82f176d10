//! WinRM endpoint URLs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, WinRmError};

/// Default WinRM HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 5985;

/// Default WinRM HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 5986;

/// Default WS-Management path
pub const DEFAULT_PATH: &str = "/wsman";

/// A normalized `http(s)://host:port/path` WinRM endpoint.
///
/// Parsing fills in what a user typically leaves out:
/// - a bare host gets `http://`,
/// - a missing port becomes 5985 for http and 5986 for https (an explicit
///   `:80` or `:443` is kept),
/// - a missing path becomes `/wsman`, while a trailing `/` keeps the root.
///
/// Credentials embedded in the URL are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Parse and normalize an endpoint string.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(WinRmError::InvalidConfig("endpoint is empty".into()));
        }

        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("http://{input}")
        };

        let mut url = Url::parse(&with_scheme)
            .map_err(|e| WinRmError::InvalidConfig(format!("invalid endpoint '{input}': {e}")))?;

        let default_port = match url.scheme() {
            "http" => DEFAULT_HTTP_PORT,
            "https" => DEFAULT_HTTPS_PORT,
            other => {
                return Err(WinRmError::InvalidConfig(format!(
                    "unsupported endpoint scheme '{other}'"
                )))
            }
        };

        if url.host_str().map_or(true, str::is_empty) {
            return Err(WinRmError::InvalidConfig(format!(
                "endpoint '{input}' has no host"
            )));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(WinRmError::InvalidConfig(
                "credentials must not be embedded in the endpoint".into(),
            ));
        }

        // Url drops ports equal to the scheme default, so look at the input
        // to tell `host` from `host:80`.
        let explicit_default_port = url.port().is_none()
            && (with_scheme.contains(":80/")
                || with_scheme.ends_with(":80")
                || with_scheme.contains(":443/")
                || with_scheme.ends_with(":443"));
        if url.port().is_none() && !explicit_default_port {
            url.set_port(Some(default_port)).map_err(|_| {
                WinRmError::InvalidConfig(format!("cannot set a port on '{input}'"))
            })?;
        }

        let explicit_root = with_scheme.ends_with('/');
        if url.path() == "/" && !explicit_root {
            url.set_path(DEFAULT_PATH);
        }

        Ok(Self { url })
    }

    /// Endpoint for a host on the default HTTP port.
    pub fn http(host: &str) -> Result<Self> {
        Self::parse(&format!("http://{host}:{DEFAULT_HTTP_PORT}{DEFAULT_PATH}"))
    }

    /// Full URL.
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Parsed URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Port, including scheme defaults.
    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(DEFAULT_HTTP_PORT)
    }

    /// `http` or `https`.
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Whether TLS is used.
    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl FromStr for Endpoint {
    type Err = WinRmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = WinRmError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.url.into()
    }
}
