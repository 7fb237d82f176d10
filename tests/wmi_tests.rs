//! Integration tests for WMI registry and service management
//!
//! A `wiremock` server stands in for the WinRM listener:
//! - StdRegProv reads, writes and enumeration of keys and values
//! - Missing keys and values, and other non-zero return values
//! - Win32_Service control methods and their selectors
//! - WS-Enumeration of every service across Pull batches

mod common;

use pretty_assertions::assert_eq;
use wiremock::MockServer;

use asyncwinrm::error::WinRmError;
use asyncwinrm::session::SessionState;
use asyncwinrm::wmi::{
    RegistryHive, RegistryKey, RegistryValue, RegistryValueType, ServiceStartType, ServiceState,
};

use common::*;

const STDREGPROV: &str = "wmi/root/default/StdRegProv";

fn current_version() -> RegistryKey {
    RegistryKey::new(
        RegistryHive::LocalMachine,
        r"SOFTWARE\Microsoft\Windows NT\CurrentVersion",
    )
}

/// Bodies of the requests whose body contains `marker`.
async fn bodies(server: &MockServer, marker: &str) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .filter(|body| body.contains(marker))
        .collect()
}

// ============================================================================
// Registry Tests
// ============================================================================

#[tokio::test]
async fn test_registry_string_is_read_verbatim() {
    let server = MockServer::start().await;
    mount(
        &server,
        "StdRegProv/GetStringValue",
        xml(200, method_output("GetStringValue", 0, &[("sValue", "0014393")])),
    )
    .await;

    let mut session = session(basic_config(&server));
    let value = session
        .registry()
        .get_string(&current_version(), Some("CurrentBuild"))
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("0014393"));

    let sent = bodies(&server, "StdRegProv/GetStringValue").await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains(&format!("{STDREGPROV}/GetStringValue</a:Action>")));
    assert!(sent[0].contains("<m:hDefKey>2147483650</m:hDefKey>"));
    assert!(sent[0].contains(r"<m:sSubKeyName>SOFTWARE\Microsoft\Windows NT\CurrentVersion</m:sSubKeyName>"));
    assert!(sent[0].contains("<m:sValueName>CurrentBuild</m:sValueName>"));

    // No shell is needed for WMI calls
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_missing_registry_value_is_none() {
    let server = MockServer::start().await;
    mount(
        &server,
        "StdRegProv/GetDWORDValue",
        xml(200, method_output("GetDWORDValue", 1, &[])),
    )
    .await;
    mount(
        &server,
        "StdRegProv/EnumKey",
        xml(200, method_output("EnumKey", 2, &[])),
    )
    .await;

    let mut session = session(basic_config(&server));
    let key = current_version().child("Missing");
    let mut registry = session.registry();
    assert_eq!(registry.get_dword(&key, Some("Flag")).await.unwrap(), None);
    assert!(registry.list_subkeys(&key).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_registry_write_failure_is_method_failed() {
    let server = MockServer::start().await;
    mount(
        &server,
        "StdRegProv/SetDWORDValue",
        xml(200, method_output("SetDWORDValue", 5, &[])),
    )
    .await;

    let mut session = session(basic_config(&server));
    let key = RegistryKey::new(RegistryHive::LocalMachine, r"SYSTEM\CurrentControlSet");
    let err = session
        .registry()
        .set_dword(&key, Some("Locked"), 1)
        .await
        .unwrap_err();

    match err {
        WinRmError::MethodFailed {
            method,
            return_value,
            ..
        } => {
            assert_eq!(method, "SetDWORDValue");
            assert_eq!(return_value, 5);
        }
        other => panic!("expected MethodFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_registry_values_are_read_by_type() {
    let server = MockServer::start().await;
    mount(
        &server,
        "StdRegProv/EnumValues",
        xml(
            200,
            method_output(
                "EnumValues",
                0,
                &[
                    ("sNames", "ProductName"),
                    ("sNames", "InstallDate"),
                    ("sNames", "DigitalProductId"),
                    ("sNames", "Paths"),
                    ("Types", "1"),
                    ("Types", "4"),
                    ("Types", "3"),
                    ("Types", "7"),
                ],
            ),
        ),
    )
    .await;
    mount(
        &server,
        "StdRegProv/GetStringValue",
        xml(200, method_output("GetStringValue", 0, &[("sValue", "Windows Server 2016 Standard")])),
    )
    .await;
    mount(
        &server,
        "StdRegProv/GetDWORDValue",
        xml(200, method_output("GetDWORDValue", 0, &[("uValue", "1470000000")])),
    )
    .await;
    mount(
        &server,
        "StdRegProv/GetBinaryValue",
        xml(
            200,
            method_output("GetBinaryValue", 0, &[("uValue", "164"), ("uValue", "0"), ("uValue", "255")]),
        ),
    )
    .await;
    mount(
        &server,
        "StdRegProv/GetMultiStringValue",
        xml(
            200,
            method_output("GetMultiStringValue", 0, &[("sValue", r"C:\a"), ("sValue", r"C:\b")]),
        ),
    )
    .await;

    let mut session = session(basic_config(&server));
    let mut registry = session.registry();

    let infos = registry.list_values(&current_version()).await.unwrap();
    assert_eq!(infos.len(), 4);
    assert_eq!(infos[1].name, "InstallDate");
    assert_eq!(infos[1].value_type, Some(RegistryValueType::DWord));

    let values = registry.values(&current_version()).await.unwrap();
    assert_eq!(
        values["ProductName"],
        Some(RegistryValue::String("Windows Server 2016 Standard".into()))
    );
    assert_eq!(values["InstallDate"], Some(RegistryValue::DWord(1_470_000_000)));
    assert_eq!(values["DigitalProductId"], Some(RegistryValue::Binary(vec![164, 0, 255])));
    assert_eq!(
        values["Paths"],
        Some(RegistryValue::MultiString(vec![r"C:\a".into(), r"C:\b".into()]))
    );
}

#[tokio::test]
async fn test_registry_writes_send_typed_parameters() {
    let server = MockServer::start().await;
    mount(&server, "StdRegProv/CreateKey", xml(200, method_output("CreateKey", 0, &[]))).await;
    mount(
        &server,
        "StdRegProv/SetMultiStringValue",
        xml(200, method_output("SetMultiStringValue", 0, &[])),
    )
    .await;
    mount(
        &server,
        "StdRegProv/SetBinaryValue",
        xml(200, method_output("SetBinaryValue", 0, &[])),
    )
    .await;

    let mut session = session(basic_config(&server));
    let key = RegistryKey::parse(r"HKCU\Software\asyncwinrm").unwrap();
    let mut registry = session.registry();
    registry.create_key(&key).await.unwrap();
    registry
        .set_value(&key, Some("Targets"), &RegistryValue::MultiString(vec!["a&b".into(), "c".into()]))
        .await
        .unwrap();
    registry.set_binary(&key, None, &[1, 2]).await.unwrap();

    let create = bodies(&server, "StdRegProv/CreateKey").await;
    assert!(create[0].contains("<m:hDefKey>2147483649</m:hDefKey>"));
    assert!(create[0].contains(r"<m:sSubKeyName>Software\asyncwinrm</m:sSubKeyName>"));

    let multi = bodies(&server, "StdRegProv/SetMultiStringValue").await;
    assert!(multi[0].contains("<m:sValue>a&amp;b</m:sValue><m:sValue>c</m:sValue>"));

    let binary = bodies(&server, "StdRegProv/SetBinaryValue").await;
    assert!(binary[0].contains("<m:sValueName></m:sValueName>"));
    assert!(binary[0].contains("<m:uValue>1</m:uValue><m:uValue>2</m:uValue>"));
}

// ============================================================================
// Service Tests
// ============================================================================

#[tokio::test]
async fn test_restart_stops_then_starts() {
    let server = MockServer::start().await;
    mount(
        &server,
        "Win32_Service/StopService",
        xml(200, method_output("StopService", 0, &[])),
    )
    .await;
    mount(
        &server,
        "Win32_Service/StartService",
        xml(200, method_output("StartService", 0, &[])),
    )
    .await;

    let mut session = session(basic_config(&server));
    session.services().restart("Spooler").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let first = String::from_utf8_lossy(&requests[0].body).into_owned();
    let second = String::from_utf8_lossy(&requests[1].body).into_owned();
    assert!(first.contains("Win32_Service/StopService"));
    assert!(second.contains("Win32_Service/StartService"));
    assert!(second.contains(r#"<w:Selector Name="Name">Spooler</w:Selector>"#));
}

#[tokio::test]
async fn test_failed_stop_skips_start() {
    let server = MockServer::start().await;
    mount(
        &server,
        "Win32_Service/StopService",
        xml(200, method_output("StopService", 3, &[])),
    )
    .await;

    let mut session = session(basic_config(&server));
    let err = session.services().restart("WinRM").await.unwrap_err();
    assert!(matches!(err, WinRmError::MethodFailed { return_value: 3, .. }));
    assert_eq!(received(&server, "Win32_Service/StartService").await, 0);
}

#[tokio::test]
async fn test_set_start_type_sends_start_mode() {
    let server = MockServer::start().await;
    mount(
        &server,
        "Win32_Service/ChangeStartMode",
        xml(200, method_output("ChangeStartMode", 0, &[])),
    )
    .await;

    let mut session = session(basic_config(&server));
    let mut services = session.services();
    services
        .set_start_type("wuauserv", ServiceStartType::Manual)
        .await
        .unwrap();
    services.disable("wuauserv").await.unwrap();

    let sent = bodies(&server, "Win32_Service/ChangeStartMode").await;
    assert_eq!(sent.len(), 2);
    assert!(sent[0].contains("<m:StartMode>Manual</m:StartMode>"));
    assert!(sent[1].contains("<m:StartMode>Disabled</m:StartMode>"));
}

#[tokio::test]
async fn test_invalid_service_name_is_not_sent() {
    let server = MockServer::start().await;

    let mut session = session(basic_config(&server));
    let err = session.services().stop("Spooler\"/><x").await.unwrap_err();
    assert!(matches!(err, WinRmError::InvalidArgument(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_service_snapshot() {
    let server = MockServer::start().await;
    mount(&server, "transfer/Get", xml(200, service_instance())).await;

    let mut session = session(basic_config(&server));
    let service = session.services().get("WinRM").await.unwrap();
    assert_eq!(service.name, "WinRM");
    assert_eq!(service.state, Some(ServiceState::Running));
    assert_eq!(service.process_id, Some(1024));
    assert_eq!(service.accept_pause, Some(false));
    assert_eq!(service.description, None);
}

// ============================================================================
// Enumeration Tests
// ============================================================================

#[tokio::test]
async fn test_get_all_services_follows_pull() {
    let server = MockServer::start().await;
    mount(
        &server,
        ENUMERATE,
        xml(200, enumerate_response("uuid:CTX-1", &service_items(&["WinRM", "Spooler"]))),
    )
    .await;
    mount(
        &server,
        "uuid:CTX-1",
        xml(200, pull_response(Some("uuid:CTX-2"), &service_items(&["W32Time"]))),
    )
    .await;
    mount(
        &server,
        "uuid:CTX-2",
        xml(200, pull_response(None, &service_items(&["Dnscache"]))),
    )
    .await;

    let mut session = session(basic_config(&server));
    let services = session.services().get_all().await.unwrap();
    let names: Vec<_> = services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["WinRM", "Spooler", "W32Time", "Dnscache"]);
    assert!(services
        .iter()
        .all(|s| s.start_mode.as_deref() == Some("Auto")));

    assert_eq!(received(&server, ENUMERATE).await, 1);
    assert_eq!(received(&server, PULL).await, 2);
    assert_eq!(received(&server, RELEASE).await, 0);
}

#[tokio::test]
async fn test_pull_fault_releases_enumeration_context() {
    let server = MockServer::start().await;
    mount(
        &server,
        ENUMERATE,
        xml(200, enumerate_response("uuid:CTX-9", &service_items(&["WinRM"]))),
    )
    .await;
    mount(&server, RELEASE, xml(200, empty_response())).await;
    mount(
        &server,
        PULL,
        xml(500, fault("2150858776", "The enumeration context is not valid.")),
    )
    .await;

    let mut session = session(basic_config(&server));
    let err = session.services().get_all().await.unwrap_err();
    assert_eq!(err.wsman_code(), Some("2150858776"));

    let released = bodies(&server, RELEASE).await;
    assert_eq!(released.len(), 1);
    assert!(released[0].contains("<n:EnumerationContext>uuid:CTX-9</n:EnumerationContext>"));
    assert_eq!(session.state(), SessionState::Closed);
}
