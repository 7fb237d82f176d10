//! WMI management over an open [`WinRmSession`].
//!
//! Both helpers borrow the session mutably for as long as they live and
//! only use WS-Man Invoke, Get and Enumerate, so no shell is needed:
//!
//! ```rust,ignore
//! let mut session = WinRmSession::new(config, registry)?;
//!
//! let key = RegistryKey::new(RegistryHive::LocalMachine, r"SOFTWARE\Microsoft\Windows NT\CurrentVersion");
//! let build = session.registry().get_string(&key, Some("CurrentBuild")).await?;
//!
//! session.services().restart("Spooler").await?;
//! ```

mod registry;
mod services;

pub use registry::{
    RegistryHive, RegistryKey, RegistryValue, RegistryValueInfo, RegistryValueType,
    RemoteRegistry, STDREGPROV_NAMESPACE,
};
pub use services::{validate_service_name, Service, ServiceStartType, ServiceState, Services};

use crate::error::{Result, WinRmError};
use crate::protocol::{MethodCall, MethodOutput};
use crate::session::WinRmSession;

impl WinRmSession {
    /// `StdRegProv` access through this session.
    pub fn registry(&mut self) -> RemoteRegistry<'_> {
        RemoteRegistry::new(self)
    }

    /// `Win32_Service` control through this session.
    pub fn services(&mut self) -> Services<'_> {
        Services::new(self)
    }
}

/// Invoke `call` and turn a non-zero `ReturnValue` into
/// [`WinRmError::MethodFailed`].
pub(crate) async fn invoke_checked(
    session: &mut WinRmSession,
    resource_uri: &str,
    call: &MethodCall,
    selectors: &[(&'static str, &str)],
) -> Result<MethodOutput> {
    let output = session.invoke(resource_uri, call, selectors).await?;
    check_return_value(session.host(), call.method(), output)
}

fn check_return_value(host: &str, method: &str, output: MethodOutput) -> Result<MethodOutput> {
    match output.return_value() {
        None | Some(0) => Ok(output),
        Some(return_value) => Err(WinRmError::MethodFailed {
            host: host.to_string(),
            method: method.to_string(),
            return_value,
        }),
    }
}
