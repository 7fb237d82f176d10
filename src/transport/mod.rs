//! HTTP transport with authentication negotiation.
//!
//! [`TransportClient`] posts SOAP envelopes to one endpoint and drives the
//! bound [`AuthProvider`] through as many 401 round trips as its mechanism
//! allows. It never looks at which mechanism it is talking to: tokens go out
//! as `Authorization: <scheme> <base64>` and challenges come back in
//! `WWW-Authenticate` headers whose scheme the provider accepts.
//!
//! Network failures are reported as [`WinRmError::Transport`] and are not
//! retried here.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use tracing::{debug, trace, warn};
use url::Url;

use crate::auth::{AuthProvider, Credential, HandshakeState, ProviderFeatures, StepOutcome};
use crate::error::{Result, WinRmError};
use crate::registry::AuthProviderRegistry;

mod backend;
mod endpoint;

pub use backend::ReqwestBackend;
pub use endpoint::{Endpoint, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT, DEFAULT_PATH};

/// Content type of WS-Management requests.
pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

// ============================================================================
// Options and wire types
// ============================================================================

/// HTTP client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Verify the server certificate
    pub verify_tls: bool,
    /// Extra PEM CA certificate to trust
    pub ca_cert: Option<PathBuf>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout of the HTTP client
    pub timeout: Duration,
    /// Redirects followed before giving up
    pub max_redirects: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            verify_tls: true,
            ca_cert: None,
            connect_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            max_redirects: 5,
        }
    }
}

/// A SOAP envelope ready to post.
#[derive(Debug, Clone)]
pub struct SoapRequest {
    /// WS-Addressing action, for logging
    pub action: String,
    /// Serialized envelope
    pub body: String,
}

impl SoapRequest {
    /// Wrap an envelope.
    pub fn new(action: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            body: body.into(),
        }
    }
}

/// Response as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Header name/value pairs, in arrival order
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: String,
}

impl HttpResponse {
    /// Response with a status and body and no headers.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Values of a header, matched case-insensitively.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The HTTP engine under the transport.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    /// POST `body` to `url` with an optional `Authorization` header value.
    async fn post(&self, url: &Url, authorization: Option<&str>, body: &str)
        -> Result<HttpResponse>;
}

// ============================================================================
// Provider factory
// ============================================================================

/// Builds replacement providers when the server drops an authenticated
/// connection.
#[derive(Debug, Clone)]
pub struct ProviderFactory {
    registry: Arc<AuthProviderRegistry>,
    credential: Arc<Credential>,
    features: ProviderFeatures,
}

impl ProviderFactory {
    /// Factory resolving `credential` through `registry`.
    pub fn new(
        registry: Arc<AuthProviderRegistry>,
        credential: Arc<Credential>,
        features: ProviderFeatures,
    ) -> Self {
        Self {
            registry,
            credential,
            features,
        }
    }

    /// A fresh provider.
    pub fn create(&self) -> Result<Box<dyn AuthProvider>> {
        self.registry.resolve(&self.credential, &self.features)
    }
}

// ============================================================================
// TransportClient
// ============================================================================

/// One authenticated HTTP connection to a WinRM endpoint.
pub struct TransportClient {
    endpoint: Endpoint,
    backend: Box<dyn HttpBackend>,
    provider: Box<dyn AuthProvider>,
    factory: Option<ProviderFactory>,
}

impl TransportClient {
    /// Client over `reqwest` bound to `provider`.
    pub fn new(
        endpoint: Endpoint,
        options: &TransportOptions,
        provider: Box<dyn AuthProvider>,
    ) -> Result<Self> {
        let backend = ReqwestBackend::new(&endpoint, options)?;
        Ok(Self::with_backend(endpoint, Box::new(backend), provider))
    }

    /// Client over an arbitrary HTTP backend.
    pub fn with_backend(
        endpoint: Endpoint,
        backend: Box<dyn HttpBackend>,
        provider: Box<dyn AuthProvider>,
    ) -> Self {
        Self {
            endpoint,
            backend,
            provider,
            factory: None,
        }
    }

    /// Allow renegotiation with a fresh provider after the server drops an
    /// established connection.
    pub fn with_reauthentication(mut self, factory: ProviderFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Target endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Handshake state of the bound provider.
    pub fn provider_state(&self) -> HandshakeState {
        self.provider.state()
    }

    /// Post `request`, negotiating authentication as needed.
    pub async fn send(&mut self, request: &SoapRequest) -> Result<HttpResponse> {
        let mut rounds = 0usize;
        let mut negotiated_here = false;
        let mut renewed = false;

        let (mut authorization, mut preflight) = match self.provider.state() {
            HandshakeState::Established => (self.provider.persistent_authorization(), false),
            HandshakeState::NotStarted => {
                negotiated_here = true;
                self.advance(None, &mut rounds)?
            }
            // A previous exchange died mid-negotiation.
            HandshakeState::Negotiating | HandshakeState::Failed => {
                self.renew_provider()?;
                renewed = true;
                negotiated_here = true;
                self.advance(None, &mut rounds)?
            }
        };

        loop {
            let sent_preflight = preflight;
            let body = if sent_preflight { "" } else { request.body.as_str() };
            trace!(
                host = %self.endpoint.host(),
                action = %request.action,
                body_len = body.len(),
                authorized = authorization.is_some(),
                "Posting WS-Management request"
            );

            let response = self
                .backend
                .post(self.endpoint.url(), authorization.as_deref(), body)
                .await?;

            if response.status == 401 {
                match self.provider.state() {
                    HandshakeState::Negotiating => {
                        let challenge = self.challenge(&response)?;
                        (authorization, preflight) = self.advance(challenge.as_deref(), &mut rounds)?;
                    }
                    HandshakeState::Established if !negotiated_here && !renewed => {
                        debug!(host = %self.endpoint.host(), "Authenticated connection dropped, renegotiating");
                        self.renew_provider()?;
                        renewed = true;
                        negotiated_here = true;
                        rounds = 0;
                        (authorization, preflight) = self.advance(None, &mut rounds)?;
                    }
                    _ => {
                        warn!(
                            host = %self.endpoint.host(),
                            mechanism = %self.provider.mechanism(),
                            rounds,
                            "Server rejected credentials"
                        );
                        return Err(WinRmError::AuthenticationExhausted {
                            host: self.endpoint.host().to_string(),
                            rounds,
                        });
                    }
                }
                continue;
            }

            if self.provider.state() == HandshakeState::Negotiating {
                // The token that completes the context (mutual auth) rides on
                // the success response.
                let token = self.challenge(&response)?;
                (authorization, preflight) = self.advance(token.as_deref(), &mut rounds)?;
                if preflight || sent_preflight {
                    continue;
                }
            }

            return Ok(response);
        }
    }

    /// Start over with a fresh provider after an exchange was abandoned
    /// midway. Without a factory the current provider is kept unless it was
    /// caught in the middle of a handshake.
    pub fn reset(&mut self) -> Result<()> {
        if self.factory.is_some() {
            debug!(host = %self.endpoint.host(), "Resetting authentication");
            return self.renew_provider();
        }
        match self.provider.state() {
            HandshakeState::NotStarted | HandshakeState::Established => Ok(()),
            HandshakeState::Negotiating | HandshakeState::Failed => self.renew_provider(),
        }
    }

    /// Drop the provider and the HTTP client.
    pub fn close(self) {
        debug!(host = %self.endpoint.host(), "Closing transport");
    }

    fn renew_provider(&mut self) -> Result<()> {
        let factory = self.factory.as_ref().ok_or_else(|| WinRmError::AuthenticationFailed {
            host: self.endpoint.host().to_string(),
            message: "authentication must be renegotiated but no provider factory is set".into(),
        })?;
        self.provider = factory.create()?;
        Ok(())
    }

    /// Run one provider step and turn its outcome into the next request's
    /// `Authorization` value plus whether the body must be held back.
    fn advance(
        &mut self,
        challenge: Option<&[u8]>,
        rounds: &mut usize,
    ) -> Result<(Option<String>, bool)> {
        let host = self.endpoint.host().to_string();
        if *rounds >= self.provider.max_rounds() {
            return Err(WinRmError::AuthenticationExhausted {
                host,
                rounds: *rounds,
            });
        }
        *rounds += 1;

        let scheme = self.provider.scheme();
        debug!(
            host = %host,
            mechanism = %self.provider.mechanism(),
            round = *rounds,
            challenge_len = challenge.map_or(0, <[u8]>::len),
            "Authentication round"
        );

        match self.provider.step(challenge)? {
            StepOutcome::Continue(token) => Ok((Some(authorization_header(scheme, &token)), true)),
            StepOutcome::Done(Some(token)) => Ok((Some(authorization_header(scheme, &token)), false)),
            StepOutcome::Done(None) => Ok((self.provider.persistent_authorization(), false)),
            StepOutcome::Failed(message) => {
                warn!(host = %host, mechanism = %self.provider.mechanism(), reason = %message, "Authentication failed");
                Err(WinRmError::AuthenticationFailed { host, message })
            }
        }
    }

    /// First challenge token in a scheme the provider accepts.
    fn challenge(&self, response: &HttpResponse) -> Result<Option<Vec<u8>>> {
        for value in response.header_values("www-authenticate") {
            for offer in value.split(',') {
                let offer = offer.trim();
                let (scheme, token) = offer
                    .split_once(' ')
                    .map_or((offer, ""), |(s, t)| (s, t.trim()));
                if token.is_empty() || !self.provider.accepts_scheme(scheme) {
                    continue;
                }
                let decoded = BASE64_STANDARD.decode(token).map_err(|e| {
                    WinRmError::AuthenticationFailed {
                        host: self.endpoint.host().to_string(),
                        message: format!("invalid {scheme} challenge encoding: {e}"),
                    }
                })?;
                return Ok(Some(decoded));
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("provider", &self.provider)
            .field("reauthenticate", &self.factory.is_some())
            .finish()
    }
}

fn authorization_header(scheme: &str, token: &[u8]) -> String {
    format!("{scheme} {}", BASE64_STANDARD.encode(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ContextStep, KerberosProvider, Mechanism, SecurityContext};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Sent {
        authorization: Option<String>,
        body: String,
    }

    /// Replays canned responses and records what was posted.
    #[derive(Clone, Default)]
    struct ScriptedBackend {
        responses: Arc<Mutex<VecDeque<HttpResponse>>>,
        sent: Arc<Mutex<Vec<Sent>>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<HttpResponse>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses.into())),
                sent: Arc::default(),
            }
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpBackend for ScriptedBackend {
        async fn post(
            &self,
            _url: &Url,
            authorization: Option<&str>,
            body: &str,
        ) -> Result<HttpResponse> {
            self.sent.lock().unwrap().push(Sent {
                authorization: authorization.map(str::to_string),
                body: body.to_string(),
            });
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| WinRmError::transport("test", "connection refused"))
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::parse("172.28.128.13").unwrap()
    }

    fn basic_client(backend: &ScriptedBackend) -> TransportClient {
        let provider = AuthProviderRegistry::new()
            .resolve(&Credential::basic("vagrant", "vagrant"), &ProviderFeatures::default())
            .unwrap();
        TransportClient::with_backend(endpoint(), Box::new(backend.clone()), provider)
    }

    fn request() -> SoapRequest {
        SoapRequest::new("Create", "<s:Envelope/>")
    }

    #[tokio::test]
    async fn test_basic_sends_body_with_first_request() {
        let backend = ScriptedBackend::new(vec![
            HttpResponse::new(200, "first"),
            HttpResponse::new(200, "second"),
        ]);
        let mut client = basic_client(&backend);

        assert_eq!(client.send(&request()).await.unwrap().body, "first");
        assert_eq!(client.send(&request()).await.unwrap().body, "second");

        let sent = backend.sent();
        assert_eq!(sent.len(), 2);
        for s in &sent {
            assert_eq!(s.authorization.as_deref(), Some("Basic dmFncmFudDp2YWdyYW50"));
            assert_eq!(s.body, "<s:Envelope/>");
        }
    }

    #[tokio::test]
    async fn test_rejected_credentials_exhaust_rounds() {
        let backend = ScriptedBackend::new(vec![HttpResponse::new(401, "")]);
        let mut client = basic_client(&backend);

        let err = client.send(&request()).await.unwrap_err();
        assert!(matches!(err, WinRmError::AuthenticationExhausted { rounds: 1, .. }));
        assert_eq!(backend.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_renegotiates_once() {
        let backend = ScriptedBackend::new(vec![
            HttpResponse::new(200, "ok"),
            HttpResponse::new(401, ""),
            HttpResponse::new(200, "again"),
        ]);
        let factory = ProviderFactory::new(
            Arc::new(AuthProviderRegistry::new()),
            Arc::new(Credential::basic("vagrant", "vagrant")),
            ProviderFeatures::default(),
        );
        let mut client = basic_client(&backend).with_reauthentication(factory);

        client.send(&request()).await.unwrap();
        assert_eq!(client.send(&request()).await.unwrap().body, "again");
        assert_eq!(backend.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_dropped_connection_without_factory_fails() {
        let backend = ScriptedBackend::new(vec![
            HttpResponse::new(200, "ok"),
            HttpResponse::new(401, ""),
        ]);
        let mut client = basic_client(&backend);

        client.send(&request()).await.unwrap();
        assert!(matches!(
            client.send(&request()).await,
            Err(WinRmError::AuthenticationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_starts_a_fresh_handshake() {
        let backend = ScriptedBackend::new(vec![HttpResponse::new(200, "ok")]);
        let factory = ProviderFactory::new(
            Arc::new(AuthProviderRegistry::new()),
            Arc::new(Credential::basic("vagrant", "vagrant")),
            ProviderFeatures::default(),
        );
        let mut client = basic_client(&backend).with_reauthentication(factory);
        client.send(&request()).await.unwrap();
        assert_eq!(client.provider_state(), HandshakeState::Established);

        client.reset().unwrap();
        assert_eq!(client.provider_state(), HandshakeState::NotStarted);
    }

    #[tokio::test]
    async fn test_reset_without_factory() {
        let backend = ScriptedBackend::new(vec![HttpResponse::new(200, "ok")]);
        let mut client = basic_client(&backend);
        client.send(&request()).await.unwrap();
        client.reset().unwrap();
        assert_eq!(client.provider_state(), HandshakeState::Established);

        let mut provider = KerberosProvider::with_context(
            "alice@CORP",
            "HTTP@server2016",
            Box::new(TwoStepContext { calls: 0 }),
        );
        provider.step(None).unwrap();
        let mut stuck =
            TransportClient::with_backend(endpoint(), Box::new(backend), Box::new(provider));
        assert_eq!(stuck.provider_state(), HandshakeState::Negotiating);
        assert!(matches!(
            stuck.reset(),
            Err(WinRmError::AuthenticationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_network_errors_are_not_retried() {
        let backend = ScriptedBackend::new(vec![]);
        let mut client = basic_client(&backend);

        let err = client.send(&request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(backend.sent().len(), 1);
    }

    #[derive(Debug)]
    struct TwoStepContext {
        calls: usize,
    }

    impl SecurityContext for TwoStepContext {
        fn init(&mut self, input: Option<&[u8]>) -> std::result::Result<ContextStep, String> {
            self.calls += 1;
            match (self.calls, input) {
                (1, None) => Ok(ContextStep::Continue(b"ap-req".to_vec())),
                (2, Some(b"ap-rep")) => Ok(ContextStep::Complete(None)),
                _ => Err("unexpected token".to_string()),
            }
        }
    }

    #[tokio::test]
    async fn test_mutual_auth_token_on_success_response() {
        let backend = ScriptedBackend::new(vec![
            HttpResponse::new(200, "").with_header(
                "WWW-Authenticate",
                format!("Kerberos {}", BASE64_STANDARD.encode(b"ap-rep")),
            ),
            HttpResponse::new(200, "payload"),
        ]);
        let provider = KerberosProvider::with_context(
            "alice@CORP",
            "HTTP@server2016",
            Box::new(TwoStepContext { calls: 0 }),
        );
        let mut client =
            TransportClient::with_backend(endpoint(), Box::new(backend.clone()), Box::new(provider));

        let response = client.send(&request()).await.unwrap();
        assert_eq!(response.body, "payload");
        assert_eq!(client.provider_state(), HandshakeState::Established);

        let sent = backend.sent();
        assert_eq!(sent[0].body, "");
        assert_eq!(
            sent[0].authorization.as_deref(),
            Some(format!("Kerberos {}", BASE64_STANDARD.encode(b"ap-req")).as_str())
        );
        assert_eq!(sent[1].body, "<s:Envelope/>");
        assert_eq!(sent[1].authorization, None);
    }

    #[tokio::test]
    async fn test_provider_failure_is_authentication_failed() {
        let backend = ScriptedBackend::new(vec![HttpResponse::new(401, "")
            .with_header("WWW-Authenticate", "Kerberos")]);
        let provider = KerberosProvider::with_context(
            "alice@CORP",
            "HTTP@server2016",
            Box::new(TwoStepContext { calls: 0 }),
        );
        assert_eq!(provider.mechanism(), Mechanism::Kerberos);
        let mut client =
            TransportClient::with_backend(endpoint(), Box::new(backend), Box::new(provider));

        assert!(matches!(
            client.send(&request()).await,
            Err(WinRmError::AuthenticationFailed { .. })
        ));
    }

    #[test]
    fn test_header_values_case_insensitive() {
        let response = HttpResponse::new(401, "")
            .with_header("www-authenticate", "Negotiate")
            .with_header("WWW-Authenticate", "Kerberos");
        assert_eq!(
            response.header_values("WWW-AUTHENTICATE").collect::<Vec<_>>(),
            vec!["Negotiate", "Kerberos"]
        );
    }
}
