//! Kerberos authentication.
//!
//! The ticket handling itself lives behind [`SecurityContext`]. With the
//! `kerberos` cargo feature, [`GssapiContext`] drives the system GSSAPI
//! library for the configured principal. Its ticket comes from the default
//! credential cache, or is requested with `kinit` first when the credential
//! carries a password. Without the feature the registry refuses to build
//! Kerberos providers, but a custom context can still be injected through
//! [`KerberosProvider::with_context`].

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use super::{ensure_steppable, AuthProvider, HandshakeState, Mechanism, StepOutcome};
use crate::error::Result;

/// Output of one security-context step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextStep {
    /// The context needs a reply token before it is complete.
    Continue(Vec<u8>),
    /// The context is complete; the token, if any, goes to the server.
    Complete(Option<Vec<u8>>),
}

/// A client-side GSS-style security context.
///
/// `init(None)` starts the exchange; later calls feed the server's tokens.
/// Errors are human readable reasons such as a missing ticket or an unknown
/// service principal.
pub trait SecurityContext: Send + fmt::Debug {
    /// Advance the context.
    fn init(&mut self, input: Option<&[u8]>) -> std::result::Result<ContextStep, String>;
}

/// Kerberos provider targeting one service principal.
#[derive(Debug)]
pub struct KerberosProvider {
    principal: String,
    spn: String,
    context: Box<dyn SecurityContext>,
    state: HandshakeState,
}

impl KerberosProvider {
    /// Provider backed by an arbitrary security context.
    pub fn with_context(
        principal: impl Into<String>,
        spn: impl Into<String>,
        context: Box<dyn SecurityContext>,
    ) -> Self {
        Self {
            principal: principal.into(),
            spn: spn.into(),
            context,
            state: HandshakeState::NotStarted,
        }
    }

    /// Provider using the system GSSAPI library. With a `password` a fresh
    /// ticket for `principal` is requested before the context starts.
    #[cfg(feature = "kerberos")]
    pub fn system(
        principal: impl Into<String>,
        password: Option<SecretString>,
        spn: impl Into<String>,
        mutual_auth: bool,
    ) -> Self {
        let principal = principal.into();
        let spn = spn.into();
        let context = GssapiContext::new(principal.clone(), password, spn.clone(), mutual_auth);
        Self::with_context(principal, spn, Box::new(context))
    }

    /// Service principal in `service@host` form.
    pub fn spn(&self) -> &str {
        &self.spn
    }
}

impl AuthProvider for KerberosProvider {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Kerberos
    }

    fn state(&self) -> HandshakeState {
        self.state
    }

    fn max_rounds(&self) -> usize {
        2
    }

    fn scheme(&self) -> &'static str {
        "Kerberos"
    }

    fn accepts_scheme(&self, scheme: &str) -> bool {
        scheme.eq_ignore_ascii_case("Kerberos") || scheme.eq_ignore_ascii_case("Negotiate")
    }

    fn step(&mut self, challenge: Option<&[u8]>) -> Result<StepOutcome> {
        ensure_steppable(self.state)?;

        if self.state == HandshakeState::Negotiating && challenge.is_none() {
            self.state = HandshakeState::Failed;
            return Ok(StepOutcome::Failed(format!(
                "server did not return a Kerberos token for {}",
                self.spn
            )));
        }

        match self.context.init(challenge) {
            Ok(ContextStep::Continue(token)) => {
                debug!(spn = %self.spn, token_len = token.len(), "Kerberos context needs a reply");
                self.state = HandshakeState::Negotiating;
                Ok(StepOutcome::Continue(token))
            }
            Ok(ContextStep::Complete(token)) => {
                debug!(spn = %self.spn, principal = %self.principal, "Kerberos context established");
                self.state = HandshakeState::Established;
                Ok(StepOutcome::Done(token))
            }
            Err(reason) => {
                warn!(spn = %self.spn, reason = %reason, "Kerberos context failed");
                self.state = HandshakeState::Failed;
                Ok(StepOutcome::Failed(reason))
            }
        }
    }
}

// ============================================================================
// System GSSAPI context
// ============================================================================

/// Put a ticket for `principal` into the default credential cache by
/// feeding `password` to `program` (normally `kinit`) on stdin.
#[cfg_attr(not(feature = "kerberos"), allow(dead_code))]
pub(crate) fn request_ticket(
    program: &Path,
    principal: &str,
    password: &SecretString,
) -> std::result::Result<(), String> {
    let mut child = Command::new(program)
        .arg(principal)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("cannot run {}: {e}", program.display()))?;

    if let Some(mut stdin) = child.stdin.take() {
        let written = stdin
            .write_all(password.expose_secret().as_bytes())
            .and_then(|()| stdin.write_all(b"\n"));
        if let Err(e) = written {
            debug!(principal, error = %e, "Password not fully written to kinit");
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| format!("{} did not finish: {e}", program.display()))?;
    if output.status.success() {
        debug!(principal, "Kerberos ticket obtained");
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!(
            "{} for {principal} failed ({}): {}",
            program.display(),
            output.status,
            stderr.trim()
        ))
    }
}

#[cfg(feature = "kerberos")]
pub use gssapi::GssapiContext;

#[cfg(feature = "kerberos")]
mod gssapi {
    use std::fmt;
    use std::path::Path;

    use libgssapi::{
        context::{ClientCtx, CtxFlags, SecurityContext as _},
        credential::{Cred, CredUsage},
        name::Name,
        oid::{OidSet, GSS_MECH_KRB5, GSS_NT_HOSTBASED_SERVICE, GSS_NT_KRB5_PRINCIPAL},
    };
    use secrecy::SecretString;

    use super::{request_ticket, ContextStep, SecurityContext};

    /// GSSAPI client context for one principal.
    pub struct GssapiContext {
        principal: String,
        password: Option<SecretString>,
        spn: String,
        mutual_auth: bool,
        ctx: Option<ClientCtx>,
    }

    impl GssapiContext {
        /// Context for `principal` against `spn` (`HTTP@host`).
        pub fn new(
            principal: String,
            password: Option<SecretString>,
            spn: String,
            mutual_auth: bool,
        ) -> Self {
            Self {
                principal,
                password,
                spn,
                mutual_auth,
                ctx: None,
            }
        }

        fn start(&self) -> Result<ClientCtx, String> {
            if let Some(password) = &self.password {
                request_ticket(Path::new("kinit"), &self.principal, password)?;
            }
            self.client_context().map_err(|e| {
                format!(
                    "cannot acquire a ticket for {} to reach {}: {e}",
                    self.principal, self.spn
                )
            })
        }

        fn client_context(&self) -> Result<ClientCtx, libgssapi::error::Error> {
            let target = Name::new(self.spn.as_bytes(), Some(&GSS_NT_HOSTBASED_SERVICE))?
                .canonicalize(Some(&GSS_MECH_KRB5))?;
            let mut mechs = OidSet::new()?;
            mechs.add(&GSS_MECH_KRB5)?;
            let cred = if self.principal.is_empty() {
                Cred::acquire(None, None, CredUsage::Initiate, Some(&mechs))?
            } else {
                let client = Name::new(self.principal.as_bytes(), Some(&GSS_NT_KRB5_PRINCIPAL))?;
                Cred::acquire(Some(&client), None, CredUsage::Initiate, Some(&mechs))?
            };
            let flags = if self.mutual_auth {
                CtxFlags::GSS_C_MUTUAL_FLAG
            } else {
                CtxFlags::empty()
            };
            Ok(ClientCtx::new(Some(cred), target, flags, Some(&GSS_MECH_KRB5)))
        }
    }

    impl fmt::Debug for GssapiContext {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("GssapiContext")
                .field("principal", &self.principal)
                .field("password", &self.password.as_ref().map(|_| "***"))
                .field("spn", &self.spn)
                .field("mutual_auth", &self.mutual_auth)
                .field("started", &self.ctx.is_some())
                .finish()
        }
    }

    impl SecurityContext for GssapiContext {
        fn init(&mut self, input: Option<&[u8]>) -> Result<ContextStep, String> {
            if self.ctx.is_none() {
                self.ctx = Some(self.start()?);
            }
            let Some(ctx) = self.ctx.as_mut() else {
                return Err("GSSAPI context unavailable".to_string());
            };

            let token = ctx
                .step(input, None)
                .map_err(|e| format!("GSSAPI step for {} failed: {e}", self.spn))?
                .map(|buf| buf.to_vec());

            if ctx.is_complete() {
                Ok(ContextStep::Complete(token))
            } else {
                Ok(ContextStep::Continue(token.unwrap_or_default()))
            }
        }
    }
}
