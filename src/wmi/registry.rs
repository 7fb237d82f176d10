//! Remote registry through the `StdRegProv` WMI class.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use super::invoke_checked;
use crate::error::{Result, WinRmError};
use crate::protocol::{wmi_resource, MethodCall, MethodOutput};
use crate::session::WinRmSession;

/// WMI namespace hosting `StdRegProv`
pub const STDREGPROV_NAMESPACE: &str = "root/default";

/// `ReturnValue` codes meaning the value or key does not exist.
const NOT_FOUND: [i64; 2] = [1, 2];

// ============================================================================
// Hives and value types
// ============================================================================

/// Registry roots reachable through `StdRegProv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegistryHive {
    ClassesRoot,
    CurrentUser,
    LocalMachine,
    Users,
    CurrentConfig,
}

impl RegistryHive {
    /// `hDefKey` value of the hive.
    pub fn handle(&self) -> u32 {
        match self {
            RegistryHive::ClassesRoot => 0x8000_0000,
            RegistryHive::CurrentUser => 0x8000_0001,
            RegistryHive::LocalMachine => 0x8000_0002,
            RegistryHive::Users => 0x8000_0003,
            RegistryHive::CurrentConfig => 0x8000_0005,
        }
    }

    /// Parse `HKLM`, `HKEY_LOCAL_MACHINE` and friends.
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "HKCR" | "HKEY_CLASSES_ROOT" => Ok(RegistryHive::ClassesRoot),
            "HKCU" | "HKEY_CURRENT_USER" => Ok(RegistryHive::CurrentUser),
            "HKLM" | "HKEY_LOCAL_MACHINE" => Ok(RegistryHive::LocalMachine),
            "HKU" | "HKEY_USERS" => Ok(RegistryHive::Users),
            "HKCC" | "HKEY_CURRENT_CONFIG" => Ok(RegistryHive::CurrentConfig),
            _ => Err(WinRmError::InvalidArgument(format!(
                "Invalid registry hive '{}'. Valid hives: HKCR, HKCU, HKLM, HKU, HKCC",
                s
            ))),
        }
    }
}

impl fmt::Display for RegistryHive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistryHive::ClassesRoot => "HKEY_CLASSES_ROOT",
            RegistryHive::CurrentUser => "HKEY_CURRENT_USER",
            RegistryHive::LocalMachine => "HKEY_LOCAL_MACHINE",
            RegistryHive::Users => "HKEY_USERS",
            RegistryHive::CurrentConfig => "HKEY_CURRENT_CONFIG",
        };
        f.write_str(s)
    }
}

/// Value types `StdRegProv` can read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryValueType {
    String,
    ExpandString,
    Binary,
    DWord,
    MultiString,
    QWord,
}

impl RegistryValueType {
    /// Type from the code `EnumValues` reports; `None` for types with no
    /// accessor (`REG_LINK`, `REG_RESOURCE_LIST`, ...).
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(RegistryValueType::String),
            2 => Some(RegistryValueType::ExpandString),
            3 => Some(RegistryValueType::Binary),
            4 => Some(RegistryValueType::DWord),
            7 => Some(RegistryValueType::MultiString),
            11 => Some(RegistryValueType::QWord),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            RegistryValueType::String => 1,
            RegistryValueType::ExpandString => 2,
            RegistryValueType::Binary => 3,
            RegistryValueType::DWord => 4,
            RegistryValueType::MultiString => 7,
            RegistryValueType::QWord => 11,
        }
    }
}

/// A typed registry value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RegistryValue {
    String(String),
    ExpandString(String),
    Binary(Vec<u8>),
    DWord(u32),
    MultiString(Vec<String>),
    QWord(u64),
}

impl RegistryValue {
    pub fn value_type(&self) -> RegistryValueType {
        match self {
            RegistryValue::String(_) => RegistryValueType::String,
            RegistryValue::ExpandString(_) => RegistryValueType::ExpandString,
            RegistryValue::Binary(_) => RegistryValueType::Binary,
            RegistryValue::DWord(_) => RegistryValueType::DWord,
            RegistryValue::MultiString(_) => RegistryValueType::MultiString,
            RegistryValue::QWord(_) => RegistryValueType::QWord,
        }
    }
}

/// One entry of `EnumValues`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryValueInfo {
    /// Value name; empty for the default value
    pub name: String,
    /// Type, when it is one `StdRegProv` can read
    pub value_type: Option<RegistryValueType>,
}

// ============================================================================
// Keys
// ============================================================================

/// A key path under a hive. The key need not exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RegistryKey {
    pub hive: RegistryHive,
    pub path: String,
}

impl RegistryKey {
    pub fn new(hive: RegistryHive, path: impl Into<String>) -> Self {
        Self {
            hive,
            path: path.into(),
        }
    }

    /// Parse `HKLM\SOFTWARE\Vendor` into a hive and a path.
    pub fn parse(full: &str) -> Result<Self> {
        let (hive, path) = full.split_once('\\').unwrap_or((full, ""));
        Ok(Self::new(RegistryHive::from_str(hive)?, path.trim_matches('\\')))
    }

    /// The subkey `name` of this key.
    pub fn child(&self, name: &str) -> Self {
        let path = match (self.path.is_empty(), name.is_empty()) {
            (true, _) => name.to_string(),
            (_, true) => self.path.clone(),
            _ => format!("{}\\{}", self.path, name),
        };
        Self::new(self.hive, path)
    }

    fn call(&self, method: &str) -> MethodCall {
        MethodCall::new(method)
            .arg("hDefKey", self.hive.handle())
            .arg("sSubKeyName", &self.path)
    }

    fn value_call(&self, method: &str, name: Option<&str>) -> MethodCall {
        self.call(method).arg("sValueName", name.unwrap_or(""))
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.hive)
        } else {
            write!(f, "{}\\{}", self.hive, self.path)
        }
    }
}

// ============================================================================
// Remote registry
// ============================================================================

/// `StdRegProv` methods against one session.
///
/// Getters return `None` (or an empty collection) when the key or value
/// does not exist. Every other non-zero `ReturnValue` is a
/// [`WinRmError::MethodFailed`].
#[derive(Debug)]
pub struct RemoteRegistry<'a> {
    session: &'a mut WinRmSession,
    resource: String,
}

impl<'a> RemoteRegistry<'a> {
    pub fn new(session: &'a mut WinRmSession) -> Self {
        Self {
            session,
            resource: wmi_resource(STDREGPROV_NAMESPACE, "StdRegProv"),
        }
    }

    /// Create `key` and any missing parents.
    pub async fn create_key(&mut self, key: &RegistryKey) -> Result<()> {
        debug!(key = %key, "Creating registry key");
        self.invoke(&key.call("CreateKey")).await.map(drop)
    }

    /// Delete `key`. It must have no subkeys.
    pub async fn delete_key(&mut self, key: &RegistryKey) -> Result<()> {
        debug!(key = %key, "Deleting registry key");
        self.invoke(&key.call("DeleteKey")).await.map(drop)
    }

    /// Delete value `name`, or the default value for `None`.
    pub async fn delete_value(&mut self, key: &RegistryKey, name: Option<&str>) -> Result<()> {
        self.invoke(&key.value_call("DeleteValue", name))
            .await
            .map(drop)
    }

    /// Names and types of the values in `key`.
    pub async fn list_values(&mut self, key: &RegistryKey) -> Result<Vec<RegistryValueInfo>> {
        let Some(output) = self.lookup(&key.call("EnumValues")).await? else {
            return Ok(Vec::new());
        };
        let types = output.texts("Types");
        output
            .texts("sNames")
            .into_iter()
            .enumerate()
            .map(|(i, name)| -> Result<RegistryValueInfo> {
                let value_type = match types.get(i) {
                    Some(code) => RegistryValueType::from_code(parse_number(code, "Types")?),
                    None => None,
                };
                Ok(RegistryValueInfo {
                    name: name.to_string(),
                    value_type,
                })
            })
            .collect()
    }

    /// Names of the subkeys of `key`.
    pub async fn list_subkeys(&mut self, key: &RegistryKey) -> Result<Vec<String>> {
        Ok(self
            .lookup(&key.call("EnumKey"))
            .await?
            .map(|output| output.texts("sNames").into_iter().map(String::from).collect())
            .unwrap_or_default())
    }

    pub async fn get_string(&mut self, key: &RegistryKey, name: Option<&str>) -> Result<Option<String>> {
        self.get_text(key.value_call("GetStringValue", name)).await
    }

    pub async fn get_expand_string(
        &mut self,
        key: &RegistryKey,
        name: Option<&str>,
    ) -> Result<Option<String>> {
        self.get_text(key.value_call("GetExpandedStringValue", name))
            .await
    }

    pub async fn get_multi_string(&mut self, key: &RegistryKey, name: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .lookup(&key.value_call("GetMultiStringValue", name))
            .await?
            .map(|output| output.texts("sValue").into_iter().map(String::from).collect())
            .unwrap_or_default())
    }

    pub async fn get_binary(&mut self, key: &RegistryKey, name: Option<&str>) -> Result<Vec<u8>> {
        match self.lookup(&key.value_call("GetBinaryValue", name)).await? {
            Some(output) => output
                .texts("uValue")
                .into_iter()
                .map(|byte| parse_number(byte, "uValue"))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_dword(&mut self, key: &RegistryKey, name: Option<&str>) -> Result<Option<u32>> {
        self.get_number(key.value_call("GetDWORDValue", name)).await
    }

    pub async fn get_qword(&mut self, key: &RegistryKey, name: Option<&str>) -> Result<Option<u64>> {
        self.get_number(key.value_call("GetQWORDValue", name)).await
    }

    /// Read value `name` as `value_type`.
    pub async fn get_value(
        &mut self,
        key: &RegistryKey,
        name: Option<&str>,
        value_type: RegistryValueType,
    ) -> Result<Option<RegistryValue>> {
        let value = match value_type {
            RegistryValueType::String => self.get_string(key, name).await?.map(RegistryValue::String),
            RegistryValueType::ExpandString => self
                .get_expand_string(key, name)
                .await?
                .map(RegistryValue::ExpandString),
            RegistryValueType::Binary => Some(RegistryValue::Binary(self.get_binary(key, name).await?)),
            RegistryValueType::DWord => self.get_dword(key, name).await?.map(RegistryValue::DWord),
            RegistryValueType::MultiString => Some(RegistryValue::MultiString(
                self.get_multi_string(key, name).await?,
            )),
            RegistryValueType::QWord => self.get_qword(key, name).await?.map(RegistryValue::QWord),
        };
        Ok(value)
    }

    /// Every value in `key`, read with its reported type. Values of types
    /// `StdRegProv` cannot read map to `None`.
    pub async fn values(&mut self, key: &RegistryKey) -> Result<BTreeMap<String, Option<RegistryValue>>> {
        let mut values = BTreeMap::new();
        for info in self.list_values(key).await? {
            let value = match info.value_type {
                Some(value_type) => self.get_value(key, Some(&info.name), value_type).await?,
                None => None,
            };
            values.insert(info.name, value);
        }
        Ok(values)
    }

    pub async fn set_string(&mut self, key: &RegistryKey, name: Option<&str>, value: &str) -> Result<()> {
        self.set(key.value_call("SetStringValue", name).arg("sValue", value))
            .await
    }

    pub async fn set_expand_string(
        &mut self,
        key: &RegistryKey,
        name: Option<&str>,
        value: &str,
    ) -> Result<()> {
        self.set(
            key.value_call("SetExpandedStringValue", name)
                .arg("sValue", value),
        )
        .await
    }

    pub async fn set_multi_string<S: AsRef<str>>(
        &mut self,
        key: &RegistryKey,
        name: Option<&str>,
        value: &[S],
    ) -> Result<()> {
        self.set(
            key.value_call("SetMultiStringValue", name)
                .array("sValue", value.iter().map(|s| s.as_ref())),
        )
        .await
    }

    pub async fn set_binary(&mut self, key: &RegistryKey, name: Option<&str>, value: &[u8]) -> Result<()> {
        self.set(key.value_call("SetBinaryValue", name).array("uValue", value))
            .await
    }

    pub async fn set_dword(&mut self, key: &RegistryKey, name: Option<&str>, value: u32) -> Result<()> {
        self.set(key.value_call("SetDWORDValue", name).arg("uValue", value))
            .await
    }

    pub async fn set_qword(&mut self, key: &RegistryKey, name: Option<&str>, value: u64) -> Result<()> {
        self.set(key.value_call("SetQWORDValue", name).arg("uValue", value))
            .await
    }

    /// Write `value` with the type it carries.
    pub async fn set_value(
        &mut self,
        key: &RegistryKey,
        name: Option<&str>,
        value: &RegistryValue,
    ) -> Result<()> {
        match value {
            RegistryValue::String(s) => self.set_string(key, name, s).await,
            RegistryValue::ExpandString(s) => self.set_expand_string(key, name, s).await,
            RegistryValue::Binary(bytes) => self.set_binary(key, name, bytes).await,
            RegistryValue::DWord(n) => self.set_dword(key, name, *n).await,
            RegistryValue::MultiString(items) => self.set_multi_string(key, name, items).await,
            RegistryValue::QWord(n) => self.set_qword(key, name, *n).await,
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn invoke(&mut self, call: &MethodCall) -> Result<MethodOutput> {
        invoke_checked(self.session, &self.resource, call, &[]).await
    }

    async fn set(&mut self, call: MethodCall) -> Result<()> {
        debug!(method = call.method(), "Writing registry value");
        self.invoke(&call).await.map(drop)
    }

    /// Like `invoke`, but a missing key or value is `Ok(None)`.
    async fn lookup(&mut self, call: &MethodCall) -> Result<Option<MethodOutput>> {
        match self.invoke(call).await {
            Ok(output) => Ok(Some(output)),
            Err(WinRmError::MethodFailed { return_value, .. }) if NOT_FOUND.contains(&return_value) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_text(&mut self, call: MethodCall) -> Result<Option<String>> {
        Ok(self
            .lookup(&call)
            .await?
            .and_then(|output| output.text("sValue").map(String::from)))
    }

    async fn get_number<T: std::str::FromStr>(&mut self, call: MethodCall) -> Result<Option<T>> {
        match self.lookup(&call).await? {
            Some(output) => output
                .text("uValue")
                .map(|text| parse_number(text, "uValue"))
                .transpose(),
            None => Ok(None),
        }
    }
}

fn parse_number<T: std::str::FromStr>(text: &str, param: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| WinRmError::Protocol(format!("{param} is not a valid number: '{text}'")))
}
