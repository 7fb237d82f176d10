//! HTTP Basic authentication.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use secrecy::{ExposeSecret, SecretString};
use tracing::trace;

use super::{ensure_steppable, AuthProvider, HandshakeState, Mechanism, StepOutcome};
use crate::error::Result;

/// Sends `username:password` with every request.
///
/// WinRM only accepts Basic for local accounts and, by default, only over
/// HTTPS; `AllowUnencrypted` must be enabled on the server for plain HTTP.
pub struct BasicProvider {
    username: String,
    password: SecretString,
    state: HandshakeState,
}

impl BasicProvider {
    /// Create a provider for a local account.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
            state: HandshakeState::NotStarted,
        }
    }

    fn token(&self) -> Vec<u8> {
        format!("{}:{}", self.username, self.password.expose_secret()).into_bytes()
    }
}

impl std::fmt::Debug for BasicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicProvider")
            .field("username", &self.username)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl AuthProvider for BasicProvider {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Basic
    }

    fn state(&self) -> HandshakeState {
        self.state
    }

    fn max_rounds(&self) -> usize {
        1
    }

    fn scheme(&self) -> &'static str {
        "Basic"
    }

    fn step(&mut self, _challenge: Option<&[u8]>) -> Result<StepOutcome> {
        ensure_steppable(self.state)?;
        trace!(username = %self.username, "Producing basic credentials");
        self.state = HandshakeState::Established;
        Ok(StepOutcome::Done(Some(self.token())))
    }

    fn persistent_authorization(&self) -> Option<String> {
        (self.state == HandshakeState::Established)
            .then(|| format!("Basic {}", BASE64_STANDARD.encode(self.token())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WinRmError;

    fn provider() -> BasicProvider {
        BasicProvider::new("vagrant", SecretString::from("vagrant".to_string()))
    }

    #[test]
    fn test_single_step() {
        let mut p = provider();
        assert_eq!(p.state(), HandshakeState::NotStarted);
        assert!(p.persistent_authorization().is_none());

        let outcome = p.step(None).unwrap();
        assert_eq!(outcome, StepOutcome::Done(Some(b"vagrant:vagrant".to_vec())));
        assert_eq!(p.state(), HandshakeState::Established);
    }

    #[test]
    fn test_header_encoding() {
        let mut p = provider();
        p.step(None).unwrap();
        assert_eq!(
            p.persistent_authorization().as_deref(),
            Some("Basic dmFncmFudDp2YWdyYW50")
        );
    }

    #[test]
    fn test_step_after_established_is_invalid() {
        let mut p = provider();
        p.step(None).unwrap();
        assert!(matches!(p.step(None), Err(WinRmError::InvalidState { .. })));
        assert!(matches!(
            p.step(Some(b"again")),
            Err(WinRmError::InvalidState { .. })
        ));
        assert_eq!(p.state(), HandshakeState::Established);
    }

    #[test]
    fn test_debug_omits_password() {
        let p = BasicProvider::new("admin", SecretString::from("s3cret".to_string()));
        assert!(!format!("{p:?}").contains("s3cret"));
    }
}
