//! Pluggable HTTP authentication for WinRM.
//!
//! Every mechanism implements [`AuthProvider`], a small state machine driven
//! by the transport: it is stepped once with no input to produce the first
//! token and then once per server challenge until it reports completion.
//! The transport never inspects the mechanism; it only moves tokens between
//! the provider and the `Authorization` / `WWW-Authenticate` headers.
//!
//! Providers are built by [`AuthProviderRegistry`](crate::registry::AuthProviderRegistry)
//! from a [`Credential`] and a set of [`ProviderFeatures`].

use std::fmt;
use std::str::FromStr;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WinRmError};

pub mod basic;
pub mod kerberos;
#[cfg(feature = "ntlm")]
pub mod ntlm;

pub use basic::BasicProvider;
pub use kerberos::{ContextStep, KerberosProvider, SecurityContext};
#[cfg(feature = "ntlm")]
pub use ntlm::NtlmProvider;

// ============================================================================
// Mechanism
// ============================================================================

/// Authentication mechanisms understood by the client.
///
/// Selection is always explicit. There is no `negotiate` pseudo-mechanism
/// and no fallback from one mechanism to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mechanism {
    /// HTTP Basic (username and password in every request)
    Basic,
    /// NTLMv2 challenge-response
    Ntlm,
    /// Kerberos through the system GSSAPI library
    Kerberos,
}

impl Mechanism {
    /// All mechanisms, in a stable order.
    pub const ALL: [Mechanism; 3] = [Mechanism::Basic, Mechanism::Ntlm, Mechanism::Kerberos];

    /// Lowercase name used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::Basic => "basic",
            Mechanism::Ntlm => "ntlm",
            Mechanism::Kerberos => "kerberos",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mechanism {
    type Err = WinRmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Mechanism::Basic),
            "ntlm" => Ok(Mechanism::Ntlm),
            "kerberos" => Ok(Mechanism::Kerberos),
            other => Err(WinRmError::UnsupportedMechanism {
                mechanism: other.to_string(),
                reason: "expected one of basic, ntlm, kerberos".to_string(),
            }),
        }
    }
}

// ============================================================================
// Credential
// ============================================================================

/// Credentials for one target.
///
/// The secret is held in a [`SecretString`] and is wiped when the credential
/// is dropped. `Debug` output never contains it.
pub struct Credential {
    mechanism: Mechanism,
    principal: String,
    domain: Option<String>,
    secret: Option<SecretString>,
}

impl Credential {
    /// Username and password sent with HTTP Basic.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            mechanism: Mechanism::Basic,
            principal: username.into(),
            domain: None,
            secret: Some(SecretString::from(password.into())),
        }
    }

    /// NTLM credentials.
    ///
    /// Accepts `DOMAIN\user`, `user@domain` and bare `user` principals.
    pub fn ntlm(principal: impl Into<String>, password: impl Into<String>) -> Self {
        let principal = principal.into();
        let (domain, user) = if let Some((domain, user)) = principal.split_once('\\') {
            (Some(domain.to_string()), user.to_string())
        } else if let Some((user, domain)) = principal.split_once('@') {
            (Some(domain.to_string()), user.to_string())
        } else {
            (None, principal)
        };

        Self {
            mechanism: Mechanism::Ntlm,
            principal: user,
            domain,
            secret: Some(SecretString::from(password.into())),
        }
    }

    /// Kerberos principal whose ticket is taken from the default credential cache.
    pub fn kerberos(principal: impl Into<String>) -> Self {
        Self {
            mechanism: Mechanism::Kerberos,
            principal: principal.into(),
            domain: None,
            secret: None,
        }
    }

    /// Kerberos principal whose ticket is requested with `password` before
    /// the first exchange.
    pub fn kerberos_with_password(principal: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            secret: Some(SecretString::from(password.into())),
            ..Self::kerberos(principal)
        }
    }

    /// Build a credential for an arbitrary mechanism.
    ///
    /// Used by configuration loading, where the mechanism is only known at
    /// runtime. A `realm` is appended to Kerberos principals that lack one.
    pub fn for_mechanism(
        mechanism: Mechanism,
        username: impl Into<String>,
        password: Option<String>,
        realm: Option<&str>,
    ) -> Result<Self> {
        let username = username.into();
        match mechanism {
            Mechanism::Basic => {
                let password = password.ok_or_else(|| {
                    WinRmError::InvalidConfig("basic authentication requires a password".into())
                })?;
                Ok(Self::basic(username, password))
            }
            Mechanism::Ntlm => {
                let password = password.ok_or_else(|| {
                    WinRmError::InvalidConfig("NTLM authentication requires a password".into())
                })?;
                Ok(Self::ntlm(username, password))
            }
            Mechanism::Kerberos => {
                let principal = match realm {
                    Some(realm) if !username.contains('@') && !username.is_empty() => {
                        format!("{username}@{}", realm.to_uppercase())
                    }
                    _ => username,
                };
                let mut credential = Self::kerberos(principal);
                credential.secret = password.map(SecretString::from);
                Ok(credential)
            }
        }
    }

    /// Mechanism this credential is meant for.
    pub fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// Username or Kerberos principal, without the NTLM domain.
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// NTLM domain, if one was given.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// The secret, if any.
    pub fn secret(&self) -> Option<&SecretString> {
        self.secret.as_ref()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("mechanism", &self.mechanism)
            .field("principal", &self.principal)
            .field("domain", &self.domain)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

// ============================================================================
// Handshake model
// ============================================================================

/// Progress of one provider's negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// No token produced yet
    NotStarted,
    /// Waiting for a server challenge or mutual-auth token
    Negotiating,
    /// Negotiation finished successfully
    Established,
    /// Negotiation failed; the provider cannot be reused
    Failed,
}

impl HandshakeState {
    /// Whether no further `step` calls are allowed.
    pub fn is_final(&self) -> bool {
        matches!(self, HandshakeState::Established | HandshakeState::Failed)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::NotStarted => "not started",
            HandshakeState::Negotiating => "negotiating",
            HandshakeState::Established => "established",
            HandshakeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a single negotiation step.
#[derive(Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Send this token and expect a challenge back.
    Continue(Vec<u8>),
    /// Negotiation is complete. The token, if any, goes out with the real payload.
    Done(Option<Vec<u8>>),
    /// The provider gave up.
    Failed(String),
}

// Tokens can carry credentials (Basic), so only their sizes are printed.
impl fmt::Debug for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Continue(token) => write!(f, "Continue({} bytes)", token.len()),
            StepOutcome::Done(Some(token)) => write!(f, "Done({} bytes)", token.len()),
            StepOutcome::Done(None) => f.write_str("Done"),
            StepOutcome::Failed(reason) => write!(f, "Failed({reason:?})"),
        }
    }
}

/// Optional knobs handed to providers at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFeatures {
    /// SPN service class (Kerberos)
    pub service: String,
    /// Host part of the SPN (Kerberos). Defaults to the endpoint host.
    pub target_host: Option<String>,
    /// Require the server to prove its identity (Kerberos)
    pub mutual_auth: bool,
    /// Workstation name sent in NTLM messages. Defaults to the local hostname.
    pub workstation: Option<String>,
}

impl Default for ProviderFeatures {
    fn default() -> Self {
        Self {
            service: "HTTP".to_string(),
            target_host: None,
            mutual_auth: true,
            workstation: None,
        }
    }
}

impl ProviderFeatures {
    /// Features targeting a specific host.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            target_host: Some(host.into()),
            ..Default::default()
        }
    }
}

// ============================================================================
// AuthProvider trait
// ============================================================================

/// One authentication mechanism's negotiation state machine.
///
/// A provider belongs to exactly one [`TransportClient`](crate::transport::TransportClient)
/// and is dropped with it, taking any derived key material along.
pub trait AuthProvider: Send + fmt::Debug {
    /// Mechanism implemented by this provider.
    fn mechanism(&self) -> Mechanism;

    /// Current handshake state.
    fn state(&self) -> HandshakeState;

    /// Upper bound on `step` calls for one negotiation.
    fn max_rounds(&self) -> usize;

    /// Scheme used in the `Authorization` header.
    fn scheme(&self) -> &'static str;

    /// Whether a `WWW-Authenticate` scheme carries this provider's challenge.
    fn accepts_scheme(&self, scheme: &str) -> bool {
        scheme.eq_ignore_ascii_case(self.scheme())
    }

    /// Advance the negotiation with an optional server token.
    ///
    /// Returns `Err(InvalidState)` once the provider is established or failed.
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<StepOutcome>;

    /// Header value repeated on every request once established.
    fn persistent_authorization(&self) -> Option<String> {
        None
    }
}

/// Reject `step` calls on a provider that already finished.
pub(crate) fn ensure_steppable(state: HandshakeState) -> Result<()> {
    if state.is_final() {
        return Err(WinRmError::invalid_state("step authentication", state));
    }
    Ok(())
}
