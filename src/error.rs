//! Error types for asyncwinrm.
//!
//! Every failure surfaced by the library is a [`WinRmError`]. Variants carry the
//! target host where it is known so callers can decide on retries without
//! keeping extra bookkeeping around.

use std::time::Duration;
use thiserror::Error;

use crate::session::SessionState;

/// Result type alias for asyncwinrm operations.
pub type Result<T> = std::result::Result<T, WinRmError>;

/// Boxed source error for wrapped transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The main error type for asyncwinrm.
#[derive(Error, Debug)]
pub enum WinRmError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// The requested mechanism was not compiled in or was disabled.
    #[error("Authentication mechanism '{mechanism}' is not available: {reason}")]
    UnsupportedMechanism {
        /// Mechanism name as requested
        mechanism: String,
        /// Why it cannot be used
        reason: String,
    },

    /// Configuration is invalid or incomplete.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A caller-supplied value cannot be sent (bad service name, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ========================================================================
    // State Errors
    // ========================================================================
    /// An operation was attempted in a state that does not allow it.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the object was in
        state: String,
    },

    // ========================================================================
    // Authentication Errors
    // ========================================================================
    /// Negotiation did not complete within the mechanism's round limit.
    #[error("Authentication to '{host}' exhausted after {rounds} negotiation rounds")]
    AuthenticationExhausted {
        /// Target host
        host: String,
        /// Rounds attempted
        rounds: usize,
    },

    /// The provider gave up (malformed challenge, missing ticket, ...).
    #[error("Authentication to '{host}' failed: {message}")]
    AuthenticationFailed {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Network-level failure: refused, TLS, HTTP status, connection reset.
    #[error("Transport error talking to '{host}': {message}")]
    Transport {
        /// Target host
        host: String,
        /// Error message
        message: String,
        /// Session state when the exchange was issued, if it went through one
        state: Option<SessionState>,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// A caller-supplied deadline expired.
    #[error("{operation} on '{host}' timed out after {after:?} (session {state})")]
    Timeout {
        /// Target host
        host: String,
        /// Operation that was running
        operation: &'static str,
        /// Deadline that expired
        after: Duration,
        /// Session state when the exchange was issued
        state: SessionState,
    },

    // ========================================================================
    // Remote Shell Errors
    // ========================================================================
    /// The server refused to create a shell.
    #[error("Failed to open shell on '{host}' (session {state})")]
    OpenFailed {
        /// Target host
        host: String,
        /// Session state when the request was issued
        state: SessionState,
        /// Fault or parse failure behind it
        #[source]
        source: Box<WinRmError>,
    },

    /// The server refused to start a command.
    #[error("Failed to run command on '{host}' (session {state})")]
    RunFailed {
        /// Target host
        host: String,
        /// Session state when the request was issued
        state: SessionState,
        /// Fault or parse failure behind it
        #[source]
        source: Box<WinRmError>,
    },

    /// Receiving command output failed.
    #[error("Failed to poll command output on '{host}' (session {state})")]
    PollFailed {
        /// Target host
        host: String,
        /// Session state when the request was issued
        state: SessionState,
        /// Fault or parse failure behind it
        #[source]
        source: Box<WinRmError>,
    },

    // ========================================================================
    // WMI Errors
    // ========================================================================
    /// A WMI method ran but reported failure in its `ReturnValue`.
    #[error("{method} on '{host}' returned {return_value}")]
    MethodFailed {
        /// Target host
        host: String,
        /// Method name
        method: String,
        /// Non-zero `ReturnValue`
        return_value: i64,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed or unexpected WS-Management response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// SOAP fault returned by the server.
    #[error("SOAP fault: {reason}{}", fault_suffix(.code, .wsman_code))]
    SoapFault {
        /// SOAP fault code value (e.g. `s:Receiver`)
        code: Option<String>,
        /// Human readable reason text
        reason: String,
        /// WS-Management fault code from the fault detail
        wsman_code: Option<String>,
    },

    /// I/O error (config files, provisioning tool).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn fault_suffix(code: &Option<String>, wsman_code: &Option<String>) -> String {
    match (code.as_deref(), wsman_code.as_deref()) {
        (Some(c), Some(w)) => format!(" ({c}, wsman {w})"),
        (Some(c), None) => format!(" ({c})"),
        (None, Some(w)) => format!(" (wsman {w})"),
        (None, None) => String::new(),
    }
}

impl WinRmError {
    /// Create a transport error without an underlying source.
    pub fn transport(host: impl Into<String>, message: impl Into<String>) -> Self {
        WinRmError::Transport {
            host: host.into(),
            message: message.into(),
            state: None,
            source: None,
        }
    }

    /// Record the session state on errors that came out of an exchange.
    pub fn in_state(mut self, session: SessionState) -> Self {
        if let WinRmError::Transport { state, .. } = &mut self {
            state.get_or_insert(session);
        }
        self
    }

    /// Create an invalid-state error.
    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        WinRmError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Whether the caller may reasonably retry the failed operation.
    ///
    /// Only network-level failures qualify. Everything else is either a
    /// configuration mismatch, a programming error or a definite answer from
    /// the server.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WinRmError::Transport { .. } | WinRmError::Timeout { .. })
    }

    /// Whether this error leaves a session unusable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WinRmError::Timeout { .. } | WinRmError::AuthenticationExhausted { .. }
        )
    }

    /// The host this error refers to, if known.
    pub fn host(&self) -> Option<&str> {
        match self {
            WinRmError::AuthenticationExhausted { host, .. }
            | WinRmError::AuthenticationFailed { host, .. }
            | WinRmError::Transport { host, .. }
            | WinRmError::Timeout { host, .. }
            | WinRmError::OpenFailed { host, .. }
            | WinRmError::RunFailed { host, .. }
            | WinRmError::PollFailed { host, .. }
            | WinRmError::MethodFailed { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Session state recorded with the error, if any.
    pub fn session_state(&self) -> Option<SessionState> {
        match self {
            WinRmError::Transport { state, .. } => *state,
            WinRmError::Timeout { state, .. }
            | WinRmError::OpenFailed { state, .. }
            | WinRmError::RunFailed { state, .. }
            | WinRmError::PollFailed { state, .. } => Some(*state),
            _ => None,
        }
    }

    /// Server-provided diagnostic text for SOAP faults, looking through
    /// shell failures to the fault behind them.
    pub fn fault_reason(&self) -> Option<&str> {
        match self {
            WinRmError::SoapFault { reason, .. } => Some(reason),
            WinRmError::OpenFailed { source, .. }
            | WinRmError::RunFailed { source, .. }
            | WinRmError::PollFailed { source, .. } => source.fault_reason(),
            _ => None,
        }
    }

    /// WS-Management fault code, looking through shell failures.
    pub fn wsman_code(&self) -> Option<&str> {
        match self {
            WinRmError::SoapFault { wsman_code, .. } => wsman_code.as_deref(),
            WinRmError::OpenFailed { source, .. }
            | WinRmError::RunFailed { source, .. }
            | WinRmError::PollFailed { source, .. } => source.wsman_code(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soap_fault_display() {
        let err = WinRmError::SoapFault {
            code: Some("s:Sender".to_string()),
            reason: "Access is denied.".to_string(),
            wsman_code: Some("5".to_string()),
        };
        assert_eq!(err.to_string(), "SOAP fault: Access is denied. (s:Sender, wsman 5)");

        let bare = WinRmError::SoapFault {
            code: None,
            reason: "oops".to_string(),
            wsman_code: None,
        };
        assert_eq!(bare.to_string(), "SOAP fault: oops");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(WinRmError::transport("h", "refused").is_retryable());
        assert!(WinRmError::Timeout {
            host: "h".into(),
            operation: "poll",
            after: Duration::from_secs(1),
            state: SessionState::Open,
        }
        .is_retryable());
        assert!(!WinRmError::invalid_state("run", "closed").is_retryable());
        assert!(!WinRmError::AuthenticationExhausted {
            host: "h".into(),
            rounds: 2
        }
        .is_retryable());
    }

    #[test]
    fn test_host_context() {
        let err = WinRmError::RunFailed {
            host: "server2016".into(),
            state: SessionState::Open,
            source: Box::new(WinRmError::Protocol("bad".into())),
        };
        assert_eq!(err.host(), Some("server2016"));
        assert_eq!(WinRmError::Protocol("x".into()).host(), None);

        let failed = WinRmError::MethodFailed {
            host: "server2019".into(),
            method: "StopService".into(),
            return_value: 5,
        };
        assert_eq!(failed.to_string(), "StopService on 'server2019' returned 5");
        assert_eq!(failed.host(), Some("server2019"));
        assert!(!failed.is_retryable());
    }

    #[test]
    fn test_shell_failure_keeps_fault() {
        let err = WinRmError::PollFailed {
            host: "server2016".into(),
            state: SessionState::Open,
            source: Box::new(WinRmError::SoapFault {
                code: Some("s:Receiver".into()),
                reason: "The shell was not found.".into(),
                wsman_code: Some("2150858843".into()),
            }),
        };
        assert_eq!(
            err.to_string(),
            "Failed to poll command output on 'server2016' (session open)"
        );
        assert_eq!(err.wsman_code(), Some("2150858843"));
        assert_eq!(err.fault_reason(), Some("The shell was not found."));
        assert_eq!(err.session_state(), Some(SessionState::Open));

        let source = std::error::Error::source(&err).expect("fault is the source");
        assert!(source.to_string().contains("wsman 2150858843"));
    }

    #[test]
    fn test_in_state_fills_transport_only() {
        let err = WinRmError::transport("h", "HTTP 503").in_state(SessionState::Open);
        assert_eq!(err.session_state(), Some(SessionState::Open));

        let kept = err.in_state(SessionState::Closed);
        assert_eq!(kept.session_state(), Some(SessionState::Open));

        assert_eq!(
            WinRmError::Protocol("x".into()).in_state(SessionState::Open).session_state(),
            None
        );
    }
}
