//! `reqwest`-based HTTP backend.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{redirect, Certificate, Client};
use tracing::{trace, warn};
use url::Url;

use super::{Endpoint, HttpBackend, HttpResponse, TransportOptions, SOAP_CONTENT_TYPE};
use crate::error::{Result, WinRmError};

/// HTTP client keeping a single idle connection to the endpoint.
///
/// NTLM and Kerberos authenticate the TCP connection rather than the
/// request, so every exchange of a session must reuse the same socket.
#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    client: Client,
    host: String,
}

impl ReqwestBackend {
    /// Build a client for `endpoint`.
    pub fn new(endpoint: &Endpoint, options: &TransportOptions) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .pool_max_idle_per_host(1)
            .redirect(redirect::Policy::limited(options.max_redirects))
            .danger_accept_invalid_certs(!options.verify_tls);

        if endpoint.is_tls() && !options.verify_tls {
            warn!(host = %endpoint.host(), "TLS certificate verification is disabled");
        }

        if let Some(ca_path) = &options.ca_cert {
            let pem = std::fs::read(ca_path).map_err(|e| {
                WinRmError::InvalidConfig(format!(
                    "failed to read CA certificate {}: {e}",
                    ca_path.display()
                ))
            })?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                WinRmError::InvalidConfig(format!("invalid CA certificate: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder.build().map_err(|e| {
            WinRmError::InvalidConfig(format!("failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            client,
            host: endpoint.host().to_string(),
        })
    }

    fn error(&self, e: reqwest::Error) -> WinRmError {
        let kind = if e.is_timeout() {
            "request timed out"
        } else if e.is_connect() {
            "connection failed"
        } else if e.is_redirect() {
            "redirect limit reached"
        } else {
            "HTTP request failed"
        };
        WinRmError::Transport {
            host: self.host.clone(),
            message: kind.to_string(),
            state: None,
            source: Some(Box::new(e)),
        }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn post(
        &self,
        url: &Url,
        authorization: Option<&str>,
        body: &str,
    ) -> Result<HttpResponse> {
        let mut request = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(body.to_string());
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }

        let response = request.send().await.map_err(|e| self.error(e))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(|e| self.error(e))?;

        trace!(host = %self.host, status, body_len = body.len(), "Received response");
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
