//! Shared test utilities for the asyncwinrm integration tests.
//!
//! Provides canned WS-Management responses and helpers that mount them on a
//! `wiremock` server standing in for a WinRM listener.
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use asyncwinrm::auth::Credential;
use asyncwinrm::retry::RetryPolicy;
use asyncwinrm::transport::Endpoint;
use asyncwinrm::{AuthProviderRegistry, SessionConfig, WinRmSession};

pub const NS: &str = r#"xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd""#;

pub const CREATE: &str = "transfer/Create";
pub const DELETE: &str = "transfer/Delete";
pub const COMMAND: &str = "shell/Command";
pub const RECEIVE: &str = "shell/Receive";
pub const SIGNAL: &str = "shell/Signal";
pub const IDENTIFY: &str = "<wsmid:Identify/>";
pub const ENUMERATE: &str = "enumeration/Enumerate";
pub const PULL: &str = "enumeration/Pull";
pub const RELEASE: &str = "enumeration/Release";

// ============================================================================
// Canned responses
// ============================================================================

pub fn shell_created(shell_id: &str) -> String {
    format!(
        r#"<s:Envelope {NS}><s:Body><rsp:Shell><rsp:ShellId>{shell_id}</rsp:ShellId><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell></s:Body></s:Envelope>"#
    )
}

pub fn command_started(command_id: &str) -> String {
    format!(
        r#"<s:Envelope {NS}><s:Body><rsp:CommandResponse><rsp:CommandId>{command_id}</rsp:CommandId></rsp:CommandResponse></s:Body></s:Envelope>"#
    )
}

pub fn receive_running(stdout: &str) -> String {
    format!(
        r#"<s:Envelope {NS}><s:Body><rsp:ReceiveResponse><rsp:Stream Name="stdout" CommandId="C-1">{}</rsp:Stream><rsp:CommandState CommandId="C-1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running"/></rsp:ReceiveResponse></s:Body></s:Envelope>"#,
        BASE64_STANDARD.encode(stdout)
    )
}

pub fn receive_done(stdout: &str, stderr: &str, exit_code: i32) -> String {
    format!(
        r#"<s:Envelope {NS}><s:Body><rsp:ReceiveResponse><rsp:Stream Name="stdout" CommandId="C-1" End="true">{}</rsp:Stream><rsp:Stream Name="stderr" CommandId="C-1" End="true">{}</rsp:Stream><rsp:CommandState CommandId="C-1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done"><rsp:ExitCode>{exit_code}</rsp:ExitCode></rsp:CommandState></rsp:ReceiveResponse></s:Body></s:Envelope>"#,
        BASE64_STANDARD.encode(stdout),
        BASE64_STANDARD.encode(stderr)
    )
}

pub fn empty_response() -> String {
    format!(r#"<s:Envelope {NS}><s:Header/><s:Body/></s:Envelope>"#)
}

pub fn identify_response() -> String {
    r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Header/><s:Body><wsmid:IdentifyResponse xmlns:wsmid="http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd"><wsmid:ProtocolVersion>http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd</wsmid:ProtocolVersion><wsmid:ProductVendor>Microsoft Corporation</wsmid:ProductVendor><wsmid:ProductVersion>OS: 10.0.14393 SP: 0.0 Stack: 3.0</wsmid:ProductVersion><wsmid:SecurityProfiles><wsmid:SecurityProfileName>http://schemas.dmtf.org/wbem/wsman/1/wsman/secprofile/http/basic</wsmid:SecurityProfileName><wsmid:SecurityProfileName>http://schemas.dmtf.org/wbem/wsman/1/wsman/secprofile/http/spnego-kerberos</wsmid:SecurityProfileName></wsmid:SecurityProfiles></wsmid:IdentifyResponse></s:Body></s:Envelope>"#.to_string()
}

pub fn service_instance() -> String {
    r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"><s:Header/><s:Body><p:Win32_Service xmlns:p="http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/Win32_Service"><p:AcceptPause>false</p:AcceptPause><p:Name>WinRM</p:Name><p:ProcessId>1024</p:ProcessId><p:State>Running</p:State><p:Description xsi:nil="true"/></p:Win32_Service></s:Body></s:Envelope>"#.to_string()
}

/// `<{method}_OUTPUT>` with `ReturnValue` and the given parameters.
pub fn method_output(method: &str, return_value: i64, params: &[(&str, &str)]) -> String {
    let params: String = params
        .iter()
        .map(|(name, value)| format!("<p:{name}>{value}</p:{name}>"))
        .collect();
    format!(
        r#"<s:Envelope {NS}><s:Header/><s:Body><p:{method}_OUTPUT xmlns:p="http://schemas.microsoft.com/wbem/wsman/1/wmi/root/default/StdRegProv"><p:ReturnValue>{return_value}</p:ReturnValue>{params}</p:{method}_OUTPUT></s:Body></s:Envelope>"#
    )
}

/// `Win32_Service` items for an enumeration batch.
pub fn service_items(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| {
            format!(
                r#"<p:Win32_Service xmlns:p="http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/Win32_Service"><p:Name>{name}</p:Name><p:State>Running</p:State><p:StartMode>Auto</p:StartMode></p:Win32_Service>"#
            )
        })
        .collect()
}

pub fn enumerate_response(context: &str, items: &str) -> String {
    format!(
        r#"<s:Envelope {NS} xmlns:n="http://schemas.xmlsoap.org/ws/2004/09/enumeration"><s:Header/><s:Body><n:EnumerateResponse><n:EnumerationContext>{context}</n:EnumerationContext><w:Items>{items}</w:Items></n:EnumerateResponse></s:Body></s:Envelope>"#
    )
}

pub fn pull_response(context: Option<&str>, items: &str) -> String {
    let tail = match context {
        Some(context) => format!("<n:EnumerationContext>{context}</n:EnumerationContext>"),
        None => "<n:EndOfSequence/>".to_string(),
    };
    format!(
        r#"<s:Envelope {NS} xmlns:n="http://schemas.xmlsoap.org/ws/2004/09/enumeration"><s:Header/><s:Body><n:PullResponse><n:Items>{items}</n:Items>{tail}</n:PullResponse></s:Body></s:Envelope>"#
    )
}

pub fn fault(code: &str, message: &str) -> String {
    format!(
        r#"<s:Envelope {NS}><s:Body><s:Fault><s:Code><s:Value>s:Receiver</s:Value></s:Code><s:Reason><s:Text xml:lang="en-US">{message}</s:Text></s:Reason><s:Detail><f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="{code}" Machine="server2016"><f:Message>{message}</f:Message></f:WSManFault></s:Detail></s:Fault></s:Body></s:Envelope>"#
    )
}

/// An NTLM Type 2 message with a NetBIOS domain pair and no timestamp.
pub fn ntlm_challenge() -> Vec<u8> {
    let mut target_info = Vec::new();
    let domain: Vec<u8> = "VAGRANT".encode_utf16().flat_map(u16::to_le_bytes).collect();
    target_info.extend_from_slice(&2u16.to_le_bytes());
    target_info.extend_from_slice(&(domain.len() as u16).to_le_bytes());
    target_info.extend_from_slice(&domain);
    target_info.extend_from_slice(&[0u8; 4]);

    let mut msg = b"NTLMSSP\0".to_vec();
    msg.extend_from_slice(&2u32.to_le_bytes());
    // target name: empty, at offset 56
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&56u32.to_le_bytes());
    msg.extend_from_slice(&0x0289_0215u32.to_le_bytes());
    msg.extend_from_slice(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
    msg.extend_from_slice(&[0u8; 8]);
    msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&56u32.to_le_bytes());
    msg.extend_from_slice(&[0u8; 8]);
    msg.extend_from_slice(&target_info);
    msg
}

pub fn xml(status: u16, body: String) -> ResponseTemplate {
    ResponseTemplate::new(status)
        .insert_header("Content-Type", "application/soap+xml;charset=UTF-8")
        .set_body_string(body)
}

// ============================================================================
// Server and session helpers
// ============================================================================

/// Answer requests whose body contains `marker` with `response`.
pub async fn mount(server: &MockServer, marker: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains(marker))
        .respond_with(response)
        .mount(server)
        .await;
}

/// Like [`mount`], but only for the first `times` matching requests.
pub async fn mount_times(server: &MockServer, marker: &str, times: u64, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/wsman"))
        .and(body_string_contains(marker))
        .respond_with(response)
        .up_to_n_times(times)
        .mount(server)
        .await;
}

/// Mount a full shell: create, one command, delete and signal.
pub async fn mount_shell(server: &MockServer, stdout: &str, exit_code: i32) {
    mount(server, CREATE, xml(200, shell_created("SHELL-1"))).await;
    mount(server, COMMAND, xml(200, command_started("C-1"))).await;
    mount(server, RECEIVE, xml(200, receive_done(stdout, "", exit_code))).await;
    mount(server, SIGNAL, xml(200, empty_response())).await;
    mount(server, DELETE, xml(200, empty_response())).await;
}

pub fn endpoint(server: &MockServer) -> Endpoint {
    Endpoint::parse(&format!("{}/wsman", server.uri())).unwrap()
}

/// Basic-auth session config with short timeouts and no retries.
pub fn basic_config(server: &MockServer) -> SessionConfig {
    SessionConfig::new(endpoint(server), Credential::basic("vagrant", "vagrant"))
        .with_operation_timeout(Duration::from_secs(1))
        .with_request_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy::no_retry())
}

pub fn session(config: SessionConfig) -> WinRmSession {
    WinRmSession::new(config, Arc::new(AuthProviderRegistry::new())).unwrap()
}

/// Requests received so far whose body contains `marker`.
pub async fn received(server: &MockServer, marker: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| String::from_utf8_lossy(&r.body).contains(marker))
        .count()
}
