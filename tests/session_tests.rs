//! Integration tests for WinRmSession against a mock WinRM listener
//!
//! These tests drive a real `reqwest` transport against a `wiremock` server:
//! - Shell lifecycle (open, run, poll, close)
//! - Output accumulation across Receive rounds
//! - SOAP faults during open, receive and close
//! - Request timeouts terminating the session
//! - Identify and CIM Get with retries
//! - Independent concurrent sessions

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use wiremock::MockServer;

use asyncwinrm::error::WinRmError;
use asyncwinrm::protocol::{CimValue, Signal};
use asyncwinrm::retry::{BackoffStrategy, RetryPolicy};
use asyncwinrm::session::{encode_powershell, InvocationState, SessionState};

use common::*;

// ============================================================================
// Shell Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_whoami_runs_to_completion() {
    let server = MockServer::start().await;
    mount_shell(&server, "server2016\\vagrant\r\n", 0).await;

    let mut session = session(basic_config(&server));
    session.open().await.unwrap();
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(session.shell_id(), Some("SHELL-1"));

    let output = session
        .run_to_completion("whoami", &[] as &[&str])
        .await
        .unwrap();
    assert_eq!(output.stdout, "server2016\\vagrant\r\n");
    assert_eq!(output.exit_code, 0);
    assert!(output.success);

    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Terminated);

    assert_eq!(received(&server, CREATE).await, 1);
    assert_eq!(received(&server, SIGNAL).await, 1);
    assert_eq!(received(&server, DELETE).await, 1);
}

#[tokio::test]
async fn test_basic_credentials_sent_with_every_request() {
    let server = MockServer::start().await;
    mount_shell(&server, "", 0).await;

    let mut session = session(basic_config(&server));
    session.open().await.unwrap();
    session.close().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        let authorization = request.headers.get("authorization").unwrap();
        assert_eq!(authorization.to_str().unwrap(), "Basic dmFncmFudDp2YWdyYW50");
    }
}

#[tokio::test]
async fn test_output_accumulates_across_receive_rounds() {
    let server = MockServer::start().await;
    mount(&server, CREATE, xml(200, shell_created("SHELL-1"))).await;
    mount(&server, COMMAND, xml(200, command_started("C-1"))).await;
    mount_times(&server, RECEIVE, 1, xml(200, receive_running("Volume in drive C "))).await;
    mount(&server, RECEIVE, xml(200, receive_done("has no label.", "", 0))).await;

    let mut session = session(basic_config(&server));
    session.open().await.unwrap();

    let mut invocation = session.run("cmd", &["/c", "vol"]).await.unwrap();
    assert_eq!(invocation.command_id(), "C-1");
    assert_eq!(invocation.command(), "cmd /c vol");

    let first = session.poll(&mut invocation).await.unwrap();
    assert_eq!(first.stdout, b"Volume in drive C ".to_vec());
    assert!(!first.done);
    assert!(invocation.is_running());

    let second = session.poll(&mut invocation).await.unwrap();
    assert!(second.done);
    assert_eq!(invocation.state(), InvocationState::Completed);
    assert_eq!(invocation.exit_code(), Some(0));
    assert_eq!(invocation.stdout(), b"Volume in drive C has no label.");
}

#[tokio::test]
async fn test_nonzero_exit_code_and_stderr() {
    let server = MockServer::start().await;
    mount(&server, CREATE, xml(200, shell_created("SHELL-1"))).await;
    mount(&server, COMMAND, xml(200, command_started("C-1"))).await;
    mount(&server, RECEIVE, xml(200, receive_done("", "File Not Found\r\n", 2))).await;
    mount(&server, SIGNAL, xml(200, empty_response())).await;

    let mut session = session(basic_config(&server));
    session.open().await.unwrap();
    let output = session
        .run_to_completion("dir", &["C:\\missing"])
        .await
        .unwrap();

    assert_eq!(output.exit_code, 2);
    assert!(!output.success);
    assert_eq!(output.stderr, "File Not Found\r\n");
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_operation_timeout_fault_is_an_empty_round() {
    let server = MockServer::start().await;
    mount(&server, CREATE, xml(200, shell_created("SHELL-1"))).await;
    mount(&server, COMMAND, xml(200, command_started("C-1"))).await;
    mount_times(&server, RECEIVE, 1, xml(500, fault("2150858793", "timed out"))).await;
    mount(&server, RECEIVE, xml(200, receive_done("done", "", 0))).await;
    mount(&server, SIGNAL, xml(200, empty_response())).await;

    let mut session = session(basic_config(&server));
    session.open().await.unwrap();
    let output = session
        .run_to_completion("ping", &["-n", "30", "127.0.0.1"])
        .await
        .unwrap();

    assert_eq!(output.stdout, "done");
    assert_eq!(received(&server, RECEIVE).await, 2);
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_run_before_open_is_rejected() {
    let server = MockServer::start().await;
    let mut session = session(basic_config(&server));

    let err = session.run("whoami", &[] as &[&str]).await.unwrap_err();
    assert!(matches!(err, WinRmError::InvalidState { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_open_twice_is_rejected() {
    let server = MockServer::start().await;
    mount_shell(&server, "", 0).await;

    let mut session = session(basic_config(&server));
    session.open().await.unwrap();
    assert!(matches!(
        session.open().await,
        Err(WinRmError::InvalidState { .. })
    ));
    assert_eq!(session.shell_id(), Some("SHELL-1"));
}

#[tokio::test]
async fn test_open_fault_terminates_session() {
    let server = MockServer::start().await;
    mount(&server, CREATE, xml(500, fault("5", "Access is denied."))).await;

    let mut session = session(basic_config(&server));
    let err = session.open().await.unwrap_err();

    assert!(matches!(err, WinRmError::OpenFailed { state: SessionState::Opening, .. }));
    assert_eq!(err.fault_reason(), Some("Access is denied."));
    assert_eq!(err.wsman_code(), Some("5"));
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(session.shell_id(), None);
}

#[tokio::test]
async fn test_command_fault_is_run_failed() {
    let server = MockServer::start().await;
    mount(&server, CREATE, xml(200, shell_created("SHELL-1"))).await;
    mount(&server, COMMAND, xml(500, fault("2147942402", "The system cannot find the file specified."))).await;

    let mut session = session(basic_config(&server));
    session.open().await.unwrap();
    let err = session.run("nosuch.exe", &[] as &[&str]).await.unwrap_err();

    assert!(matches!(err, WinRmError::RunFailed { state: SessionState::Open, .. }));
    assert_eq!(err.wsman_code(), Some("2147942402"));
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_rejected_credentials_terminate_session() {
    let server = MockServer::start().await;
    mount(&server, CREATE, xml(401, String::new())).await;

    let mut session = session(basic_config(&server));
    let err = session.open().await.unwrap_err();

    assert!(matches!(err, WinRmError::AuthenticationExhausted { .. }));
    assert_eq!(session.state(), SessionState::Terminated);
}

#[cfg(feature = "ntlm")]
#[tokio::test]
async fn test_ntlm_open_negotiates_then_creates_shell() {
    use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
    use wiremock::matchers::method;
    use wiremock::{Mock, Request, ResponseTemplate};

    use asyncwinrm::auth::Credential;

    let server = MockServer::start().await;
    let challenge = format!("Negotiate {}", BASE64_STANDARD.encode(ntlm_challenge()));
    Mock::given(method("POST"))
        .and(|r: &Request| r.body.is_empty())
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()))
        .mount(&server)
        .await;
    mount(&server, CREATE, xml(200, shell_created("SHELL-NTLM"))).await;

    let config = basic_config(&server);
    let config = asyncwinrm::SessionConfig {
        credential: std::sync::Arc::new(Credential::ntlm("VAGRANT\\vagrant", "vagrant")),
        ..config
    };
    let mut session = session(config);
    session.open().await.unwrap();

    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(session.shell_id(), Some("SHELL-NTLM"));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_close_fault_still_terminates() {
    let server = MockServer::start().await;
    mount(&server, CREATE, xml(200, shell_created("SHELL-1"))).await;
    mount(&server, DELETE, xml(500, fault("2150858843", "The shell was not found."))).await;

    let mut session = session(basic_config(&server));
    session.open().await.unwrap();
    assert!(session.close().await.is_err());
    assert_eq!(session.state(), SessionState::Terminated);

    // A terminated session stays terminated and sends nothing more.
    session.close().await.unwrap();
    assert_eq!(received(&server, DELETE).await, 1);
}

#[tokio::test]
async fn test_close_without_open_is_local() {
    let server = MockServer::start().await;
    let mut session = session(basic_config(&server));

    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

// ============================================================================
// Timeout Tests
// ============================================================================

#[tokio::test]
async fn test_request_timeout_terminates_session() {
    let server = MockServer::start().await;
    mount(
        &server,
        CREATE,
        xml(200, shell_created("SHELL-1")).set_delay(Duration::from_secs(5)),
    )
    .await;

    let config = basic_config(&server)
        .with_operation_timeout(Duration::from_millis(100))
        .with_request_timeout(Duration::from_millis(300));
    let mut session = session(config);

    let err = session.open().await.unwrap_err();
    assert!(matches!(err, WinRmError::Timeout { operation: "open", .. }));
    assert_eq!(session.state(), SessionState::Terminated);

    // Nothing can be sent on a terminated session.
    assert!(matches!(
        session.identify().await,
        Err(WinRmError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_receive_timeout_discards_output() {
    let server = MockServer::start().await;
    mount(&server, CREATE, xml(200, shell_created("SHELL-1"))).await;
    mount(&server, COMMAND, xml(200, command_started("C-1"))).await;
    mount_times(&server, RECEIVE, 1, xml(200, receive_running("partial"))).await;
    mount(
        &server,
        RECEIVE,
        xml(200, receive_done("rest", "", 0)).set_delay(Duration::from_secs(5)),
    )
    .await;

    let config = basic_config(&server)
        .with_operation_timeout(Duration::from_millis(100))
        .with_request_timeout(Duration::from_millis(300));
    let mut session = session(config);
    session.open().await.unwrap();

    let mut invocation = session.run("type", &["big.log"]).await.unwrap();
    session.poll(&mut invocation).await.unwrap();
    assert_eq!(invocation.stdout(), b"partial");

    let err = session.poll(&mut invocation).await.unwrap_err();
    assert!(matches!(err, WinRmError::Timeout { .. }));
    assert_eq!(invocation.state(), InvocationState::Failed);
    assert!(invocation.stdout().is_empty());
    assert_eq!(session.state(), SessionState::Terminated);
}

// ============================================================================
// Input, Signal and PowerShell Tests
// ============================================================================

#[tokio::test]
async fn test_send_input_and_signal() {
    let server = MockServer::start().await;
    mount(&server, CREATE, xml(200, shell_created("SHELL-1"))).await;
    mount(&server, COMMAND, xml(200, command_started("C-1"))).await;
    mount(&server, "shell/Send", xml(200, empty_response())).await;
    mount(&server, SIGNAL, xml(200, empty_response())).await;

    let mut session = session(basic_config(&server));
    session.open().await.unwrap();
    let invocation = session.run("findstr", &["x"]).await.unwrap();

    session.send_input(&invocation, b"xyz\r\n", true).await.unwrap();
    session.signal(&invocation, Signal::CtrlC).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let send = requests
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .find(|b| b.contains("shell/Send"))
        .unwrap();
    assert!(send.contains("eHl6DQo="));
    assert!(send.contains(r#"End="true""#));
    assert_eq!(received(&server, "signal/ctrl_c").await, 1);
}

#[tokio::test]
async fn test_run_powershell_uses_encoded_command() {
    let server = MockServer::start().await;
    mount_shell(&server, "Running\r\n", 0).await;

    let mut session = session(basic_config(&server));
    session.open().await.unwrap();
    let script = "(Get-Service WinRM).Status";
    let output = session.run_powershell(script).await.unwrap();
    assert_eq!(output.stdout, "Running\r\n");

    let encoded = encode_powershell(script);
    assert_eq!(received(&server, "<rsp:Command>powershell.exe</rsp:Command>").await, 1);
    assert_eq!(received(&server, &encoded).await, 1);
}

// ============================================================================
// Identify and CIM Tests
// ============================================================================

#[tokio::test]
async fn test_identify_without_shell() {
    let server = MockServer::start().await;
    mount(&server, IDENTIFY, xml(200, identify_response())).await;

    let mut session = session(basic_config(&server));
    let identity = session.identify().await.unwrap();

    assert_eq!(identity.product_vendor, "Microsoft Corporation");
    assert_eq!(identity.product_version, "OS: 10.0.14393 SP: 0.0 Stack: 3.0");
    assert_eq!(identity.security_profiles.len(), 2);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_get_service_instance() {
    let server = MockServer::start().await;
    mount(&server, "transfer/Get", xml(200, service_instance())).await;

    let mut session = session(basic_config(&server));
    let service = session.get_service("WinRM").await.unwrap();

    assert_eq!(service.get("Name"), Some(&CimValue::Text("WinRM".into())));
    assert_eq!(service.get("ProcessId"), Some(&CimValue::Int(1024)));
    assert_eq!(service.get("AcceptPause"), Some(&CimValue::Bool(false)));
    assert_eq!(service.get("Description"), Some(&CimValue::Null));

    assert_eq!(received(&server, "root/cimv2/Win32_Service").await, 1);
    assert_eq!(received(&server, r#"Name="Name">WinRM<"#).await, 1);
}

#[tokio::test]
async fn test_identify_retries_transient_failures() {
    let server = MockServer::start().await;
    mount_times(&server, IDENTIFY, 2, xml(503, String::new())).await;
    mount(&server, IDENTIFY, xml(200, identify_response())).await;

    let retry = RetryPolicy::new()
        .with_max_retries(2)
        .with_initial_delay(Duration::from_millis(10))
        .with_strategy(BackoffStrategy::Fixed);
    let mut session = session(basic_config(&server).with_retry(retry));

    let identity = session.identify().await.unwrap();
    assert_eq!(identity.product_vendor, "Microsoft Corporation");
    assert_eq!(received(&server, IDENTIFY).await, 3);
}

#[tokio::test]
async fn test_identify_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    mount(&server, IDENTIFY, xml(503, String::new())).await;

    let retry = RetryPolicy::new()
        .with_max_retries(1)
        .with_initial_delay(Duration::from_millis(10))
        .with_strategy(BackoffStrategy::Fixed);
    let mut session = session(basic_config(&server).with_retry(retry));

    let err = session.identify().await.unwrap_err();
    assert!(matches!(err, WinRmError::Transport { .. }));
    assert_eq!(received(&server, IDENTIFY).await, 2);
}

#[tokio::test]
async fn test_identify_retries_after_timeout_when_allowed() {
    let server = MockServer::start().await;
    mount_times(
        &server,
        IDENTIFY,
        1,
        xml(200, identify_response()).set_delay(Duration::from_secs(5)),
    )
    .await;
    mount(&server, IDENTIFY, xml(200, identify_response())).await;

    let retry = RetryPolicy::new()
        .with_max_retries(3)
        .with_initial_delay(Duration::from_millis(10))
        .with_strategy(BackoffStrategy::Fixed)
        .with_retry_on_timeout(true);
    let config = basic_config(&server)
        .with_operation_timeout(Duration::from_millis(100))
        .with_request_timeout(Duration::from_millis(300))
        .with_retry(retry);
    let mut session = session(config);

    let identity = session.identify().await.unwrap();
    assert_eq!(identity.product_vendor, "Microsoft Corporation");
    assert_eq!(received(&server, IDENTIFY).await, 2);
    assert_eq!(session.state(), SessionState::Closed);

    // The reset transport still carries a shell.
    mount_shell(&server, "ok", 0).await;
    session.open().await.unwrap();
    assert_eq!(session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_shell_commands_are_not_retried() {
    let server = MockServer::start().await;
    mount(&server, CREATE, xml(200, shell_created("SHELL-1"))).await;
    mount(&server, COMMAND, xml(503, String::new())).await;

    let retry = RetryPolicy::new()
        .with_max_retries(3)
        .with_initial_delay(Duration::from_millis(10));
    let mut session = session(basic_config(&server).with_retry(retry));
    session.open().await.unwrap();

    assert!(session.run("whoami", &[] as &[&str]).await.is_err());
    assert_eq!(received(&server, COMMAND).await, 1);
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[tokio::test]
async fn test_concurrent_sessions_are_independent() {
    let server = MockServer::start().await;
    mount_shell(&server, "ok", 0).await;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let config = basic_config(&server);
            tokio::spawn(async move {
                let mut session = session(config);
                session.open().await?;
                let output = session.run_to_completion("hostname", &[] as &[&str]).await?;
                session.close().await?;
                Ok::<_, WinRmError>(output.stdout)
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "ok");
    }
    assert_eq!(received(&server, CREATE).await, 4);
    assert_eq!(received(&server, DELETE).await, 4);
}
