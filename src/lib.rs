//! # asyncwinrm - An async Windows Remote Management client
//!
//! asyncwinrm speaks WS-Management over HTTP(S) to Windows hosts. It opens
//! remote `cmd` shells, runs commands and streams their output, reads and
//! enumerates CIM objects and invokes WMI methods, with authentication
//! pluggable per target.
//!
//! ## Core Concepts
//!
//! - **Authentication providers**: one [`AuthProvider`](auth::AuthProvider)
//!   per connection, driving a Basic, NTLM or Kerberos handshake
//! - **Registry**: [`AuthProviderRegistry`] maps a credential's mechanism to
//!   a fresh provider
//! - **Transport**: [`TransportClient`](transport::TransportClient) posts SOAP
//!   envelopes and runs the `401` negotiation loop
//! - **Sessions**: [`WinRmSession`] owns one transport and one remote shell
//! - **WMI**: [`RemoteRegistry`](wmi::RemoteRegistry) and
//!   [`Services`](wmi::Services) borrow a session for `StdRegProv` and
//!   `Win32_Service`
//! - **Test matrix**: [`TestMatrix`] describes Windows Server targets for
//!   Vagrant
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                 WinRmSession                       │
//! │   open / run / poll / close, identify, CIM get,    │
//! │   invoke, enumerate  (registry / services on top)  │
//! └────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌────────────────────────────────────────────────────┐
//! │                TransportClient                     │
//! │      HTTP POST, 401 negotiation, re-auth           │
//! └────────────────────────────────────────────────────┘
//!            │                            │
//!            ▼                            ▼
//! ┌─────────────────────┐     ┌──────────────────────┐
//! │    AuthProvider     │     │     HttpBackend      │
//! │ Basic/NTLM/Kerberos │     │      (reqwest)       │
//! └─────────────────────┘     └──────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use asyncwinrm::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let registry = Arc::new(AuthProviderRegistry::new());
//!     let config = SessionConfig::new(
//!         Endpoint::parse("http://172.28.128.13:5985/wsman")?,
//!         Credential::ntlm("vagrant", "vagrant"),
//!     );
//!
//!     let mut session = WinRmSession::new(config, registry)?;
//!     session.open().await?;
//!     let output = session.run_to_completion("ipconfig", &["/all"]).await?;
//!     session.close().await?;
//!
//!     println!("{}", output.stdout);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `ntlm` (default): NTLMv2 in pure Rust
//! - `kerberos`: Kerberos through the system GSSAPI library

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod prelude {
    //! Convenient re-exports of commonly used types.

    pub use crate::auth::{AuthProvider, Credential, Mechanism, ProviderFeatures};
    pub use crate::error::{Result, WinRmError};
    pub use crate::matrix::{TargetMachine, TestMatrix};
    pub use crate::protocol::{CimObject, CimValue, IdentifyResponse, MethodCall, Signal};
    pub use crate::registry::AuthProviderRegistry;
    pub use crate::retry::{BackoffStrategy, RetryPolicy};
    pub use crate::session::{
        CommandInvocation, CommandOutput, SessionConfig, SessionState, ShellOptions,
        WinRmSession,
    };
    pub use crate::transport::Endpoint;
    pub use crate::wmi::{
        RegistryHive, RegistryKey, RegistryValue, RegistryValueType, RemoteRegistry, Service,
        ServiceStartType, ServiceState, Services,
    };
}

// ============================================================================
// Core Modules
// ============================================================================

/// Error types and the crate-wide result alias.
pub mod error;

/// Authentication providers and credentials.
///
/// Each provider is a small state machine that turns server challenges
/// into `Authorization` header values.
pub mod auth;

/// Maps mechanisms to provider constructors.
pub mod registry;

/// Backoff and retry for idempotent requests.
pub mod retry;

// ============================================================================
// Protocol
// ============================================================================

/// WS-Management envelopes and response decoding.
pub mod protocol;

/// HTTP transport and the authentication negotiation loop.
pub mod transport;

/// Remote shell sessions.
pub mod session;

/// Registry and service management over WMI.
pub mod wmi;

// ============================================================================
// Tooling
// ============================================================================

/// Layered TOML configuration.
pub mod config;

/// Windows test matrix and Vagrant driver.
pub mod matrix;

pub use error::{Result, WinRmError};
pub use matrix::TestMatrix;
pub use registry::AuthProviderRegistry;
pub use session::{SessionConfig, WinRmSession};
