//! Windows service control through `Win32_Service`.

use std::fmt;

use serde::Serialize;
use tracing::info;

use super::invoke_checked;
use crate::error::{Result, WinRmError};
use crate::protocol::{cim_resource, CimObject, CimValue, MethodCall};
use crate::session::WinRmSession;

/// Windows caps service names at this many characters.
const MAX_SERVICE_NAME: usize = 256;

/// Validates a service name before it is sent as a selector.
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(WinRmError::InvalidArgument(
            "Service name cannot be empty".to_string(),
        ));
    }

    if name.chars().count() > MAX_SERVICE_NAME {
        return Err(WinRmError::InvalidArgument(format!(
            "Service name is longer than {} characters",
            MAX_SERVICE_NAME
        )));
    }

    // Instance services such as MSSQL$SQLEXPRESS use '$'
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '$'))
    {
        return Err(WinRmError::InvalidArgument(format!(
            "Invalid service name '{}': must contain only alphanumeric characters, underscores, hyphens, dots and '$'",
            name
        )));
    }

    Ok(())
}

// ============================================================================
// State and start mode
// ============================================================================

/// `Win32_Service.State`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

impl ServiceState {
    /// Parse the text WMI reports; `None` for `Unknown` and anything new.
    pub fn from_wmi(s: &str) -> Option<Self> {
        match s {
            "Stopped" => Some(ServiceState::Stopped),
            "Start Pending" => Some(ServiceState::StartPending),
            "Stop Pending" => Some(ServiceState::StopPending),
            "Running" => Some(ServiceState::Running),
            "Continue Pending" => Some(ServiceState::ContinuePending),
            "Pause Pending" => Some(ServiceState::PausePending),
            "Paused" => Some(ServiceState::Paused),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "Stopped",
            ServiceState::StartPending => "Start Pending",
            ServiceState::StopPending => "Stop Pending",
            ServiceState::Running => "Running",
            ServiceState::ContinuePending => "Continue Pending",
            ServiceState::PausePending => "Pause Pending",
            ServiceState::Paused => "Paused",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start modes accepted by `ChangeStartMode`. `Boot` and `System` only
/// apply to drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ServiceStartType {
    Boot,
    System,
    Automatic,
    Manual,
    Disabled,
}

impl ServiceStartType {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "boot" => Ok(ServiceStartType::Boot),
            "system" => Ok(ServiceStartType::System),
            "auto" | "automatic" => Ok(ServiceStartType::Automatic),
            "manual" => Ok(ServiceStartType::Manual),
            "disabled" => Ok(ServiceStartType::Disabled),
            _ => Err(WinRmError::InvalidArgument(format!(
                "Invalid start mode '{}'. Valid modes: boot, system, automatic, manual, disabled",
                s
            ))),
        }
    }

    /// Value of the `StartMode` parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStartType::Boot => "Boot",
            ServiceStartType::System => "System",
            ServiceStartType::Automatic => "Automatic",
            ServiceStartType::Manual => "Manual",
            ServiceStartType::Disabled => "Disabled",
        }
    }
}

impl fmt::Display for ServiceStartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Service snapshot
// ============================================================================

/// A `Win32_Service` instance as read at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Service {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub state: Option<ServiceState>,
    /// `StartMode` as reported (`Auto`, `Manual`, `Disabled`, ...)
    pub start_mode: Option<String>,
    pub started: Option<bool>,
    pub accept_stop: Option<bool>,
    pub accept_pause: Option<bool>,
    pub process_id: Option<i64>,
    pub exit_code: Option<i64>,
    pub path_name: Option<String>,
    pub start_name: Option<String>,
    pub dependencies: Vec<String>,
    /// Every property, including the ones above
    #[serde(skip)]
    pub properties: CimObject,
}

impl Service {
    /// Build from a `Win32_Service` CIM object. Fails without a `Name`.
    pub fn from_cim(properties: CimObject) -> Result<Self> {
        let text = |key: &str| properties.get(key).and_then(cim_text);
        let int = |key: &str| properties.get(key).and_then(CimValue::as_i64);
        let flag = |key: &str| properties.get(key).and_then(CimValue::as_bool);

        let name = text("Name").ok_or_else(|| {
            WinRmError::Protocol("Win32_Service instance without a Name".to_string())
        })?;
        let dependencies = match properties.get("Dependencies") {
            Some(CimValue::List(items)) => items.iter().filter_map(cim_text).collect(),
            Some(value) => cim_text(value).into_iter().collect(),
            None => Vec::new(),
        };

        Ok(Self {
            display_name: text("DisplayName"),
            description: text("Description"),
            state: text("State").as_deref().and_then(ServiceState::from_wmi),
            start_mode: text("StartMode"),
            started: flag("Started"),
            accept_stop: flag("AcceptStop"),
            accept_pause: flag("AcceptPause"),
            process_id: int("ProcessId"),
            exit_code: int("ExitCode"),
            path_name: text("PathName"),
            start_name: text("StartName"),
            dependencies,
            name,
            properties,
        })
    }
}

/// Any scalar as text; values such as `Name` may have been coerced to numbers.
fn cim_text(value: &CimValue) -> Option<String> {
    match value {
        CimValue::Text(s) => Some(s.clone()),
        CimValue::Int(n) => Some(n.to_string()),
        CimValue::Bool(b) => Some(b.to_string()),
        CimValue::Null | CimValue::List(_) => None,
    }
}

// ============================================================================
// Service control
// ============================================================================

/// `Win32_Service` queries and methods against one session.
///
/// Every method that changes a service checks its `ReturnValue`; the
/// codes are the ones documented for `Win32_Service` (2 access denied,
/// 5 cannot accept control, 10 already running, ...).
#[derive(Debug)]
pub struct Services<'a> {
    session: &'a mut WinRmSession,
    resource: String,
}

impl<'a> Services<'a> {
    pub fn new(session: &'a mut WinRmSession) -> Self {
        Self {
            session,
            resource: cim_resource("Win32_Service"),
        }
    }

    /// Current snapshot of service `name`.
    pub async fn get(&mut self, name: &str) -> Result<Service> {
        validate_service_name(name)?;
        let properties = self.session.get_service(name).await?;
        Service::from_cim(properties)
    }

    /// Every service on the host.
    pub async fn get_all(&mut self) -> Result<Vec<Service>> {
        self.session
            .enumerate(&self.resource, &[])
            .await?
            .into_iter()
            .map(Service::from_cim)
            .collect()
    }

    /// Current state of service `name`.
    pub async fn state(&mut self, name: &str) -> Result<Option<ServiceState>> {
        Ok(self.get(name).await?.state)
    }

    pub async fn start(&mut self, name: &str) -> Result<()> {
        self.control(name, MethodCall::new("StartService")).await
    }

    pub async fn stop(&mut self, name: &str) -> Result<()> {
        self.control(name, MethodCall::new("StopService")).await
    }

    /// Stop, then start. The start is not attempted if the stop fails.
    pub async fn restart(&mut self, name: &str) -> Result<()> {
        self.stop(name).await?;
        self.start(name).await
    }

    pub async fn pause(&mut self, name: &str) -> Result<()> {
        self.control(name, MethodCall::new("PauseService")).await
    }

    pub async fn resume(&mut self, name: &str) -> Result<()> {
        self.control(name, MethodCall::new("ResumeService")).await
    }

    /// Mark service `name` for deletion.
    pub async fn delete(&mut self, name: &str) -> Result<()> {
        self.control(name, MethodCall::new("Delete")).await
    }

    pub async fn set_start_type(&mut self, name: &str, start_type: ServiceStartType) -> Result<()> {
        self.control(
            name,
            MethodCall::new("ChangeStartMode").arg("StartMode", start_type.as_str()),
        )
        .await
    }

    pub async fn disable(&mut self, name: &str) -> Result<()> {
        self.set_start_type(name, ServiceStartType::Disabled).await
    }

    async fn control(&mut self, name: &str, call: MethodCall) -> Result<()> {
        validate_service_name(name)?;
        info!(host = %self.session.host(), service = name, method = call.method(), "Controlling service");
        invoke_checked(self.session, &self.resource, &call, &[("Name", name)])
            .await
            .map(drop)
    }
}
