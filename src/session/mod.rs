//! Remote shell sessions.
//!
//! A [`WinRmSession`] owns one [`TransportClient`] and walks the
//! `Closed → Opening → Open → Terminated` lifecycle of a `cmd` shell:
//!
//! ```rust,ignore
//! let registry = Arc::new(AuthProviderRegistry::new());
//! let config = SessionConfig::new(Endpoint::parse("server2016")?, Credential::ntlm("vagrant", "vagrant"));
//! let mut session = WinRmSession::new(config, registry)?;
//!
//! session.open().await?;
//! let output = session.run_to_completion("whoami", &[] as &[&str]).await?;
//! session.close().await?;
//! ```
//!
//! Every exchange runs under the configured request timeout. When it
//! expires the session is terminated on the spot and the transport, along
//! with its authentication state, is dropped.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use once_cell::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, WinRmError};
use crate::protocol::envelope::{
    command_body, enumerate_body, identify_envelope, pull_body, receive_body, release_body,
    send_body, shell_body, signal_body,
};
use crate::protocol::response::{
    parse_cim_object, parse_command_id, parse_enumeration, parse_fault, parse_identify,
    parse_method_output, parse_receive, parse_shell_id,
};
use crate::protocol::{
    cim_resource, method_action, CimObject, IdentifyResponse, MethodCall, MethodOutput, Signal,
    WsManRequest, ACTION_COMMAND, ACTION_CREATE, ACTION_DELETE, ACTION_ENUMERATE, ACTION_GET,
    ACTION_IDENTIFY, ACTION_PULL, ACTION_RECEIVE, ACTION_RELEASE, ACTION_SEND, ACTION_SIGNAL,
    RESOURCE_CMD_SHELL, WSMAN_TIMED_OUT,
};
use crate::registry::AuthProviderRegistry;
use crate::transport::{ProviderFactory, SoapRequest, TransportClient};

mod invocation;
mod options;

pub use invocation::{CommandInvocation, CommandOutput, InvocationState, OutputChunk};
pub use options::{
    SessionConfig, SessionState, ShellOptions, DEFAULT_LOCALE, DEFAULT_MAX_ENVELOPE_SIZE,
    DEFAULT_OPERATION_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};

/// `MaxElements` for Enumerate and Pull
pub const DEFAULT_MAX_ELEMENTS: u32 = 100;

/// A WinRM shell session against one endpoint.
#[derive(Debug)]
pub struct WinRmSession {
    config: SessionConfig,
    transport: Option<TransportClient>,
    state: SessionState,
    shell_id: OnceCell<String>,
}

impl WinRmSession {
    /// Resolve a provider for the configured credential and bind it to a new
    /// HTTP transport. No network traffic happens until the first exchange.
    ///
    /// Messages are not encrypted at the WS-Man layer. Over plain HTTP a
    /// Windows listener with its default `AllowUnencrypted=false` rejects
    /// every mechanism, so use HTTPS unless the listener has been opened up.
    pub fn new(config: SessionConfig, registry: Arc<AuthProviderRegistry>) -> Result<Self> {
        config.validate()?;
        if !config.endpoint.is_tls() {
            warn!(
                host = %config.endpoint.host(),
                mechanism = %config.credential.mechanism(),
                "Plain HTTP endpoint; the listener must allow unencrypted traffic"
            );
        }
        let provider = registry.resolve(&config.credential, &config.features)?;
        let factory = ProviderFactory::new(
            registry,
            Arc::clone(&config.credential),
            config.features.clone(),
        );
        let transport = TransportClient::new(
            config.endpoint.clone(),
            &config.transport_options(),
            provider,
        )?
        .with_reauthentication(factory);

        Ok(Self::with_transport(config, transport))
    }

    /// Session over an already built transport.
    pub fn with_transport(config: SessionConfig, transport: TransportClient) -> Self {
        Self {
            config,
            transport: Some(transport),
            state: SessionState::Closed,
            shell_id: OnceCell::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Shell id, once opened.
    pub fn shell_id(&self) -> Option<&str> {
        self.shell_id.get().map(String::as_str)
    }

    /// Target host.
    pub fn host(&self) -> &str {
        self.config.endpoint.host()
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ========================================================================
    // Shell lifecycle
    // ========================================================================

    /// Create the remote shell.
    pub async fn open(&mut self) -> Result<()> {
        if self.state != SessionState::Closed {
            return Err(WinRmError::invalid_state("open a shell", self.state));
        }
        self.state = SessionState::Opening;
        debug!(host = %self.host(), "Opening shell");

        let shell = &self.config.shell;
        let mut request = self
            .request(ACTION_CREATE)
            .option("WINRS_NOPROFILE", if shell.no_profile { "TRUE" } else { "FALSE" });
        if let Some(codepage) = shell.codepage {
            request = request.option("WINRS_CODEPAGE", codepage.to_string());
        }
        let envelope = request.build(&shell_body(shell));

        let opened = self
            .exchange("open", SoapRequest::new(ACTION_CREATE, envelope))
            .await
            .and_then(|xml| parse_shell_id(&xml));

        match opened {
            Ok(id) => {
                let shell_id = self.shell_id.get_or_init(|| id);
                info!(host = %self.config.endpoint.host(), shell_id = %shell_id, "Shell opened");
                self.state = SessionState::Open;
                Ok(())
            }
            Err(e) => {
                warn!(host = %self.host(), error = %e, "Failed to open shell");
                self.terminate();
                Err(match e {
                    WinRmError::SoapFault { .. } | WinRmError::Protocol(_) => {
                        WinRmError::OpenFailed {
                            host: self.host().to_string(),
                            state: SessionState::Opening,
                            source: Box::new(e),
                        }
                    }
                    other => other,
                })
            }
        }
    }

    /// Delete the remote shell and drop the transport.
    ///
    /// The session is `Terminated` afterwards whatever the server says; a
    /// failed delete is reported but not retried.
    pub async fn close(&mut self) -> Result<()> {
        match self.state {
            SessionState::Terminated => Ok(()),
            SessionState::Open => {
                let shell_id = self.require_shell("close a shell")?;
                let envelope = self
                    .request(ACTION_DELETE)
                    .selector("ShellId", shell_id.clone())
                    .build("");
                let result = self
                    .exchange("close", SoapRequest::new(ACTION_DELETE, envelope))
                    .await
                    .map(drop);
                if let Err(e) = &result {
                    warn!(host = %self.host(), shell_id = %shell_id, error = %e, "Shell delete failed");
                } else {
                    info!(host = %self.host(), shell_id = %shell_id, "Shell closed");
                }
                self.terminate();
                result
            }
            SessionState::Closed | SessionState::Opening => {
                self.terminate();
                Ok(())
            }
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Start `command` with `args` in the shell.
    pub async fn run<S: AsRef<str>>(
        &mut self,
        command: &str,
        args: &[S],
    ) -> Result<CommandInvocation> {
        let shell_id = self.require_shell("run a command")?;
        let envelope = self
            .request(ACTION_COMMAND)
            .selector("ShellId", shell_id.clone())
            .option("WINRS_CONSOLEMODE_STDIN", "TRUE")
            .option("WINRS_SKIP_CMD_SHELL", "FALSE")
            .build(&command_body(command, args));

        let started = self
            .exchange("run", SoapRequest::new(ACTION_COMMAND, envelope))
            .await
            .and_then(|xml| parse_command_id(&xml));

        let command_id = match started {
            Ok(id) => id,
            Err(e @ (WinRmError::SoapFault { .. } | WinRmError::Protocol(_))) => {
                return Err(WinRmError::RunFailed {
                    host: self.host().to_string(),
                    state: self.state,
                    source: Box::new(e),
                })
            }
            Err(e) => return Err(e),
        };

        let mut command_line = command.to_string();
        for arg in args {
            command_line.push(' ');
            command_line.push_str(arg.as_ref());
        }
        debug!(host = %self.host(), shell_id = %shell_id, command_id = %command_id, "Command started");
        Ok(CommandInvocation::new(command_id, command_line))
    }

    /// Receive the next batch of output for `invocation`.
    ///
    /// A server-side operation timeout just means nothing was produced yet
    /// and yields an empty chunk.
    pub async fn poll(&mut self, invocation: &mut CommandInvocation) -> Result<OutputChunk> {
        let shell_id = self.require_shell("poll a command")?;
        if !invocation.is_running() {
            return Err(WinRmError::invalid_state(
                "poll a command",
                format!("the command is {}", invocation.state()),
            ));
        }

        let envelope = self
            .request(ACTION_RECEIVE)
            .selector("ShellId", shell_id)
            .option("WSMAN_CMDSHELL_OPTION_KEEPALIVE", "TRUE")
            .build(&receive_body(
                invocation.command_id(),
                &self.config.shell.output_streams,
            ));

        let received = self
            .exchange("poll", SoapRequest::new(ACTION_RECEIVE, envelope))
            .await
            .and_then(|xml| parse_receive(&xml));

        let chunk = match received {
            Ok(chunk) => chunk,
            Err(WinRmError::SoapFault { wsman_code, .. })
                if wsman_code.as_deref() == Some(WSMAN_TIMED_OUT) =>
            {
                trace!(host = %self.host(), command_id = %invocation.command_id(), "No output yet");
                return Ok(OutputChunk::default());
            }
            Err(e @ WinRmError::Timeout { .. }) => {
                invocation.fail(true);
                return Err(e);
            }
            Err(e @ (WinRmError::SoapFault { .. } | WinRmError::Protocol(_))) => {
                invocation.fail(false);
                return Err(WinRmError::PollFailed {
                    host: self.host().to_string(),
                    state: self.state,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                invocation.fail(false);
                return Err(e);
            }
        };

        invocation.stdout.extend_from_slice(&chunk.stdout);
        invocation.stderr.extend_from_slice(&chunk.stderr);
        let done = chunk.is_done();
        if done {
            let exit_code = chunk.exit_code.unwrap_or_default();
            invocation.exit_code = Some(exit_code);
            invocation.state = InvocationState::Completed;
            debug!(
                host = %self.host(),
                command_id = %invocation.command_id(),
                exit_code,
                "Command completed"
            );
        }

        Ok(OutputChunk {
            stdout: chunk.stdout,
            stderr: chunk.stderr,
            done,
        })
    }

    /// Write `data` to the command's stdin; `end` closes the stream.
    pub async fn send_input(
        &mut self,
        invocation: &CommandInvocation,
        data: &[u8],
        end: bool,
    ) -> Result<()> {
        let shell_id = self.require_shell("send input")?;
        if !invocation.is_running() {
            return Err(WinRmError::invalid_state(
                "send input",
                format!("the command is {}", invocation.state()),
            ));
        }
        let envelope = self
            .request(ACTION_SEND)
            .selector("ShellId", shell_id)
            .build(&send_body(invocation.command_id(), data, end));
        self.exchange("send input", SoapRequest::new(ACTION_SEND, envelope))
            .await
            .map(drop)
    }

    /// Send a signal to the command.
    pub async fn signal(&mut self, invocation: &CommandInvocation, signal: Signal) -> Result<()> {
        let shell_id = self.require_shell("signal a command")?;
        let envelope = self
            .request(ACTION_SIGNAL)
            .selector("ShellId", shell_id)
            .build(&signal_body(invocation.command_id(), signal));
        debug!(host = %self.host(), command_id = %invocation.command_id(), signal = %signal, "Signalling command");
        self.exchange("signal", SoapRequest::new(ACTION_SIGNAL, envelope))
            .await
            .map(drop)
    }

    /// Run a command, poll it until it finishes and release it.
    pub async fn run_to_completion<S: AsRef<str>>(
        &mut self,
        command: &str,
        args: &[S],
    ) -> Result<CommandOutput> {
        let mut invocation = self.run(command, args).await?;

        let mut polled = Ok(());
        while invocation.is_running() {
            if let Err(e) = self.poll(&mut invocation).await {
                polled = Err(e);
                break;
            }
        }

        if self.state == SessionState::Open {
            if let Err(e) = self.signal(&invocation, Signal::Terminate).await {
                debug!(host = %self.host(), command_id = %invocation.command_id(), error = %e, "Failed to release command");
            }
        }

        polled?;
        Ok(CommandOutput::from_invocation(&invocation))
    }

    /// Run a PowerShell script through `-EncodedCommand`.
    pub async fn run_powershell(&mut self, script: &str) -> Result<CommandOutput> {
        let encoded = encode_powershell(script);
        self.run_to_completion(
            "powershell.exe",
            &[
                "-NoProfile",
                "-NonInteractive",
                "-EncodedCommand",
                encoded.as_str(),
            ],
        )
        .await
    }

    // ========================================================================
    // Idempotent requests
    // ========================================================================

    /// WS-Man Identify. Works with or without an open shell.
    pub async fn identify(&mut self) -> Result<IdentifyResponse> {
        let xml = self
            .exchange_idempotent("identify", |_| {
                SoapRequest::new(ACTION_IDENTIFY, identify_envelope())
            })
            .await?;
        parse_identify(&xml)
    }

    /// WS-Transfer Get of a `root/cimv2` instance.
    pub async fn get_cim_object(
        &mut self,
        class: &str,
        selectors: &[(&'static str, &str)],
    ) -> Result<CimObject> {
        let resource = cim_resource(class);
        let xml = self
            .exchange_idempotent("get", |session| {
                let request = session.resource_request(ACTION_GET, &resource, selectors);
                SoapRequest::new(ACTION_GET, request.build(""))
            })
            .await?;
        parse_cim_object(&xml)
    }

    /// `Win32_OperatingSystem` of the target.
    pub async fn get_operating_system(&mut self) -> Result<CimObject> {
        self.get_cim_object("Win32_OperatingSystem", &[]).await
    }

    /// `Win32_Service` named `name`.
    pub async fn get_service(&mut self, name: &str) -> Result<CimObject> {
        self.get_cim_object("Win32_Service", &[("Name", name)]).await
    }

    // ========================================================================
    // WMI methods and enumeration
    // ========================================================================

    /// Invoke a WMI method on the instance or class at `resource_uri`.
    ///
    /// Methods change remote state, so the call is never retried. A
    /// non-zero `ReturnValue` is returned as data; see
    /// [`crate::wmi`] for wrappers that check it.
    pub async fn invoke(
        &mut self,
        resource_uri: &str,
        call: &MethodCall,
        selectors: &[(&'static str, &str)],
    ) -> Result<MethodOutput> {
        let action = method_action(resource_uri, call.method());
        let envelope = self
            .resource_request(&action, resource_uri, selectors)
            .build(&call.body(resource_uri));
        debug!(host = %self.host(), method = call.method(), "Invoking WMI method");

        let xml = self
            .exchange("invoke", SoapRequest::new(action.as_str(), envelope))
            .await?;
        parse_method_output(&xml, call.method())
    }

    /// Every instance under `resource_uri`, following Pull until the
    /// server reports the end of the sequence.
    ///
    /// Only the opening Enumerate is retried. If a Pull fails the context
    /// is released on a best-effort basis before the error is returned.
    pub async fn enumerate(
        &mut self,
        resource_uri: &str,
        selectors: &[(&'static str, &str)],
    ) -> Result<Vec<CimObject>> {
        let xml = self
            .exchange_idempotent("enumerate", |session| {
                let request = session.resource_request(ACTION_ENUMERATE, resource_uri, selectors);
                SoapRequest::new(
                    ACTION_ENUMERATE,
                    request.build(&enumerate_body(DEFAULT_MAX_ELEMENTS)),
                )
            })
            .await?;
        let mut batch = parse_enumeration(&xml)?;
        let mut items = std::mem::take(&mut batch.items);

        while !batch.end_of_sequence {
            let Some(context) = batch.context.take() else {
                break;
            };
            let envelope = self
                .resource_request(ACTION_PULL, resource_uri, &[])
                .build(&pull_body(&context, DEFAULT_MAX_ELEMENTS));
            let pulled = self
                .exchange("pull", SoapRequest::new(ACTION_PULL, envelope))
                .await
                .and_then(|xml| parse_enumeration(&xml));
            batch = match pulled {
                Ok(batch) => batch,
                Err(e) => {
                    self.release_enumeration(resource_uri, &context).await;
                    return Err(e);
                }
            };
            items.append(&mut batch.items);
        }

        debug!(host = %self.host(), resource = resource_uri, count = items.len(), "Enumeration complete");
        Ok(items)
    }

    /// Every `root/cimv2` instance of `class`.
    pub async fn enumerate_cim_objects(&mut self, class: &str) -> Result<Vec<CimObject>> {
        self.enumerate(&cim_resource(class), &[]).await
    }

    async fn release_enumeration(&mut self, resource_uri: &str, context: &str) {
        if self.state == SessionState::Terminated {
            return;
        }
        let envelope = self
            .resource_request(ACTION_RELEASE, resource_uri, &[])
            .build(&release_body(context));
        if let Err(e) = self
            .exchange("release", SoapRequest::new(ACTION_RELEASE, envelope))
            .await
        {
            debug!(host = %self.host(), error = %e, "Releasing enumeration context failed");
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn request(&self, action: &'static str) -> WsManRequest<'_> {
        self.resource_request(action, RESOURCE_CMD_SHELL, &[])
    }

    fn resource_request<'a>(
        &'a self,
        action: &'a str,
        resource_uri: &'a str,
        selectors: &[(&'static str, &str)],
    ) -> WsManRequest<'a> {
        let mut request = WsManRequest::new(self.config.endpoint.as_str(), action, resource_uri)
            .locale(&self.config.locale)
            .operation_timeout(self.config.operation_timeout)
            .max_envelope_size(self.config.max_envelope_size);
        for (name, value) in selectors {
            request = request.selector(*name, *value);
        }
        request
    }

    fn require_shell(&self, operation: &'static str) -> Result<String> {
        if self.state != SessionState::Open {
            return Err(WinRmError::invalid_state(operation, self.state));
        }
        self.shell_id
            .get()
            .cloned()
            .ok_or_else(|| WinRmError::invalid_state(operation, "no shell id is set"))
    }

    /// Post one envelope under the request timeout and return the body of a
    /// successful, fault-free response. Errors that leave the session
    /// unusable terminate it.
    async fn exchange(&mut self, operation: &'static str, request: SoapRequest) -> Result<String> {
        let result = self.exchange_once(operation, request).await;
        if let Err(e) = &result {
            if e.is_terminal() {
                warn!(host = %self.host(), operation, error = %e, "Terminating session");
                self.terminate();
            }
        }
        result
    }

    async fn exchange_once(&mut self, operation: &'static str, request: SoapRequest) -> Result<String> {
        let host = self.host().to_string();
        let after = self.config.request_timeout;
        let state = self.state;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| WinRmError::invalid_state(operation, state))?;

        let response = match tokio::time::timeout(after, transport.send(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(e.in_state(state)),
            Err(_) => {
                warn!(host = %host, operation, timeout_ms = after.as_millis() as u64, "Request timed out");
                return Err(WinRmError::Timeout {
                    host,
                    operation,
                    after,
                    state,
                });
            }
        };

        if let Some(fault) = parse_fault(&response.body) {
            debug!(host = %host, operation, status = response.status, error = %fault, "SOAP fault");
            return Err(fault);
        }
        if !response.is_success() {
            return Err(
                WinRmError::transport(host, format!("HTTP {}", response.status)).in_state(state),
            );
        }
        Ok(response.body)
    }

    /// [`exchange`](Self::exchange) with the retry policy. `build` is called
    /// per attempt so each one carries a fresh message id.
    ///
    /// A timed-out attempt leaves the connection and any handshake in an
    /// unknown state, so the transport is reset before it is retried. The
    /// session is terminated only once the policy gives up.
    async fn exchange_idempotent<F>(&mut self, operation: &'static str, build: F) -> Result<String>
    where
        F: Fn(&Self) -> SoapRequest,
    {
        let mut attempt = 0u32;
        loop {
            let request = build(self);
            let error = match self.exchange_once(operation, request).await {
                Ok(xml) => return Ok(xml),
                Err(e) => e,
            };

            let mut retry = self.config.retry.should_retry(attempt, &error);
            if retry && matches!(error, WinRmError::Timeout { .. }) {
                if let Some(Err(reset)) = self.transport.as_mut().map(TransportClient::reset) {
                    warn!(host = %self.host(), operation, error = %reset, "Cannot reset transport after timeout");
                    retry = false;
                }
            }

            if !retry {
                if error.is_terminal() {
                    warn!(host = %self.host(), operation, error = %error, "Terminating session");
                    self.terminate();
                }
                return Err(error);
            }

            let delay = self.config.retry.delay_for_attempt(attempt);
            attempt += 1;
            warn!(
                host = %self.host(),
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying idempotent request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn terminate(&mut self) {
        self.state = SessionState::Terminated;
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
    }
}

/// Base64 of the script's UTF-16LE bytes, as `-EncodedCommand` expects.
pub fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    BASE64_STANDARD.encode(bytes)
}
