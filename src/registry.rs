//! Authentication provider registry.
//!
//! The availability table is computed once from the compiled cargo features
//! and can only be narrowed afterwards. Resolution is a pure factory: every
//! call returns a fresh provider of the concrete type fixed by the mechanism.

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::auth::{AuthProvider, BasicProvider, Credential, Mechanism, ProviderFeatures};
use crate::error::{Result, WinRmError};

/// Which mechanisms may be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    basic: bool,
    ntlm: bool,
    kerberos: bool,
}

impl Capabilities {
    /// Everything this build was compiled with.
    pub fn compiled() -> Self {
        Self {
            basic: true,
            ntlm: cfg!(feature = "ntlm"),
            kerberos: cfg!(feature = "kerberos"),
        }
    }

    /// Only the listed mechanisms.
    pub fn only(mechanisms: &[Mechanism]) -> Self {
        let mut caps = Self {
            basic: false,
            ntlm: false,
            kerberos: false,
        };
        for mechanism in mechanisms {
            caps.set(*mechanism, true);
        }
        caps
    }

    /// Whether `mechanism` is enabled.
    pub fn supports(&self, mechanism: Mechanism) -> bool {
        match mechanism {
            Mechanism::Basic => self.basic,
            Mechanism::Ntlm => self.ntlm,
            Mechanism::Kerberos => self.kerberos,
        }
    }

    fn set(&mut self, mechanism: Mechanism, enabled: bool) {
        match mechanism {
            Mechanism::Basic => self.basic = enabled,
            Mechanism::Ntlm => self.ntlm = enabled,
            Mechanism::Kerberos => self.kerberos = enabled,
        }
    }

    fn intersect(self, other: Capabilities) -> Self {
        Self {
            basic: self.basic && other.basic,
            ntlm: self.ntlm && other.ntlm,
            kerberos: self.kerberos && other.kerberos,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::compiled()
    }
}

/// Builds [`AuthProvider`]s for credentials.
///
/// Immutable after construction; share it between sessions with an `Arc`.
#[derive(Debug, Clone)]
pub struct AuthProviderRegistry {
    capabilities: Capabilities,
}

impl AuthProviderRegistry {
    /// Registry offering every compiled-in mechanism.
    pub fn new() -> Self {
        let capabilities = Capabilities::compiled();
        debug!(?capabilities, "Built authentication registry");
        Self { capabilities }
    }

    /// Restrict the registry to `allowed`. Mechanisms that were not compiled
    /// in stay unavailable.
    pub fn with_capabilities(mut self, allowed: Capabilities) -> Self {
        self.capabilities = self.capabilities.intersect(allowed);
        self
    }

    /// Current availability table.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Whether `mechanism` can be resolved.
    pub fn is_available(&self, mechanism: Mechanism) -> bool {
        self.capabilities.supports(mechanism)
    }

    /// Mechanisms that can be resolved, in a stable order.
    pub fn available(&self) -> Vec<Mechanism> {
        Mechanism::ALL
            .into_iter()
            .filter(|m| self.is_available(*m))
            .collect()
    }

    /// Build a fresh provider for `credential`.
    pub fn resolve(
        &self,
        credential: &Credential,
        features: &ProviderFeatures,
    ) -> Result<Box<dyn AuthProvider>> {
        let mechanism = credential.mechanism();
        if !self.is_available(mechanism) {
            let reason = if Capabilities::compiled().supports(mechanism) {
                "disabled for this registry".to_string()
            } else {
                format!("not compiled in; enable the `{mechanism}` cargo feature")
            };
            return Err(WinRmError::UnsupportedMechanism {
                mechanism: mechanism.to_string(),
                reason,
            });
        }

        debug!(mechanism = %mechanism, principal = %credential.principal(), "Resolving authentication provider");

        match mechanism {
            Mechanism::Basic => Ok(Box::new(BasicProvider::new(
                credential.principal(),
                required_secret(credential)?,
            ))),
            Mechanism::Ntlm => self.ntlm(credential, features),
            Mechanism::Kerberos => self.kerberos(credential, features),
        }
    }

    #[cfg(feature = "ntlm")]
    fn ntlm(
        &self,
        credential: &Credential,
        features: &ProviderFeatures,
    ) -> Result<Box<dyn AuthProvider>> {
        Ok(Box::new(crate::auth::NtlmProvider::new(
            credential.principal(),
            credential.domain().map(str::to_string),
            required_secret(credential)?,
            features.workstation.clone(),
        )))
    }

    #[cfg(not(feature = "ntlm"))]
    fn ntlm(
        &self,
        _credential: &Credential,
        _features: &ProviderFeatures,
    ) -> Result<Box<dyn AuthProvider>> {
        Err(not_compiled(Mechanism::Ntlm))
    }

    fn kerberos(
        &self,
        credential: &Credential,
        features: &ProviderFeatures,
    ) -> Result<Box<dyn AuthProvider>> {
        let host = features.target_host.as_deref().ok_or_else(|| {
            WinRmError::InvalidConfig("Kerberos needs a target host to build the SPN".into())
        })?;
        let spn = format!("{}@{}", features.service, host);
        self.kerberos_provider(credential, spn, features.mutual_auth)
    }

    #[cfg(feature = "kerberos")]
    fn kerberos_provider(
        &self,
        credential: &Credential,
        spn: String,
        mutual_auth: bool,
    ) -> Result<Box<dyn AuthProvider>> {
        let password = credential
            .secret()
            .map(|s| SecretString::from(s.expose_secret().to_string()));
        Ok(Box::new(crate::auth::KerberosProvider::system(
            credential.principal(),
            password,
            spn,
            mutual_auth,
        )))
    }

    #[cfg(not(feature = "kerberos"))]
    fn kerberos_provider(
        &self,
        _credential: &Credential,
        _spn: String,
        _mutual_auth: bool,
    ) -> Result<Box<dyn AuthProvider>> {
        Err(not_compiled(Mechanism::Kerberos))
    }
}

impl Default for AuthProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
fn not_compiled(mechanism: Mechanism) -> WinRmError {
    WinRmError::UnsupportedMechanism {
        mechanism: mechanism.to_string(),
        reason: format!("not compiled in; enable the `{mechanism}` cargo feature"),
    }
}

/// Copy the credential's secret for a provider that owns it.
fn required_secret(credential: &Credential) -> Result<SecretString> {
    credential
        .secret()
        .map(|s| SecretString::from(s.expose_secret().to_string()))
        .ok_or_else(|| {
            WinRmError::InvalidConfig(format!(
                "{} authentication requires a password",
                credential.mechanism()
            ))
        })
}
