//! WS-Management wire format.
//!
//! Requests are rendered with `format!` into fixed templates; responses are
//! read with a small prefix-agnostic element scanner, since servers are free
//! to pick their own namespace prefixes.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod response;

pub use envelope::{xml_escape, MethodCall, WsManRequest};
pub use response::{
    CimObject, CimValue, EnumerationBatch, IdentifyResponse, MethodOutput, ReceiveChunk,
};

// ============================================================================
// Namespaces
// ============================================================================

pub(crate) const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
pub(crate) const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
pub(crate) const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
pub(crate) const NS_WSMAN_MS: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd";
pub(crate) const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
pub(crate) const NS_IDENTITY: &str =
    "http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd";
pub(crate) const NS_ENUMERATION: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration";

/// Anonymous reply-to address
pub(crate) const ANONYMOUS: &str =
    "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

// ============================================================================
// Actions and resources
// ============================================================================

/// WS-Transfer Get
pub const ACTION_GET: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Get";
/// WS-Transfer Create
pub const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
/// WS-Transfer Delete
pub const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
/// Shell Command
pub const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
/// Shell Receive
pub const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
/// Shell Send
pub const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
/// Shell Signal
pub const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
/// WS-Enumeration Enumerate
pub const ACTION_ENUMERATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Enumerate";
/// WS-Enumeration Pull
pub const ACTION_PULL: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Pull";
/// WS-Enumeration Release
pub const ACTION_RELEASE: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Release";
/// Pseudo action used to label Identify requests in logs
pub const ACTION_IDENTIFY: &str = "Identify";

/// The `cmd.exe` shell resource
pub const RESOURCE_CMD_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

/// WS-Man fault code reported when a Receive finds no output before the
/// operation timeout.
pub const WSMAN_TIMED_OUT: &str = "2150858793";

/// Resource URI of a WMI class in `namespace` (e.g. `root/default`).
pub fn wmi_resource(namespace: &str, class: &str) -> String {
    format!(
        "http://schemas.microsoft.com/wbem/wsman/1/wmi/{}/{class}",
        namespace.trim_matches('/')
    )
}

/// Resource URI of a CIM class in `root/cimv2`.
pub fn cim_resource(class: &str) -> String {
    wmi_resource("root/cimv2", class)
}

/// Action URI invoking `method` on `resource_uri`.
pub fn method_action(resource_uri: &str, method: &str) -> String {
    format!("{resource_uri}/{method}")
}

// ============================================================================
// Shell enums
// ============================================================================

/// Signals that can be sent to a running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// Ctrl+C
    CtrlC,
    /// Terminate the command and release its resources
    Terminate,
}

impl Signal {
    /// Signal code URI.
    pub fn uri(&self) -> &'static str {
        match self {
            Signal::CtrlC => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/ctrl_c",
            Signal::Terminate => {
                "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/Terminate"
            }
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::CtrlC => f.write_str("ctrl_c"),
            Signal::Terminate => f.write_str("terminate"),
        }
    }
}

/// Command state reported in Receive responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommandState {
    /// Still producing output
    Running,
    /// Finished; the exit code is final
    Done,
    /// Waiting for input
    Pending,
}

impl RemoteCommandState {
    /// Parse a `CommandState/State` URI.
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri.rsplit('/').next()? {
            "Running" => Some(Self::Running),
            "Done" => Some(Self::Done),
            "Pending" => Some(Self::Pending),
            _ => None,
        }
    }
}
