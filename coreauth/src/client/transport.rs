use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::ClientBuilder;
use thiserror::Error;

use crate::client::pin;
use crate::wire::SignedRequest;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw provider reply before any verification
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("provider call timed out")]
    Timeout,
    #[error("could not connect to provider: {0}")]
    Connect(String),
    #[error("provider call failed: {0}")]
    Other(String),
}

/// Carries signed requests to the provider.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn send(&self, url: &str, request: &SignedRequest) -> Result<TransportReply, TransportError>;
}

/// HTTP transport with a hard timeout on every provider call
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = builder(timeout)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }

    /// Same as `new`, but only the provider certificate in `cert_pem` is accepted
    pub fn pinned(cert_pem: &[u8], timeout: Duration) -> Result<Self, TransportError> {
        let tls = pin::pinned_rustls_config(cert_pem).map_err(|e| TransportError::Other(e.to_string()))?;

        let client = builder(timeout)
            .use_preconfigured_tls(Arc::unwrap_or_clone(tls))
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }
}

fn builder(timeout: Duration) -> ClientBuilder {
    // redirects are the browser's business, never the API client's
    ClientBuilder::new()
        .timeout(timeout)
        .connect_timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .gzip(true)
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn send(&self, url: &str, request: &SignedRequest) -> Result<TransportReply, TransportError> {
        let resp = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(map_reqwest_error)?;

        tracing::debug!("Provider replied with status {} ({} bytes)", status, body.len());
        Ok(TransportReply {
            status,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SignedRequest {
        SignedRequest {
            identity: "app".into(),
            capability: "core.info".into(),
            nonce: "n".into(),
            timestamp: 0,
            payload: "{}".into(),
            signature: String::new(),
        }
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        // port 9 (discard) is not listening on loopback in test environments
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();

        let err = transport
            .send("http://127.0.0.1:9/api/core/info", &request())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_) | TransportError::Timeout));
    }

    #[tokio::test]
    async fn silent_provider_times_out() {
        // accepted by the kernel backlog, never answered
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/core/info", listener.local_addr().unwrap());

        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();
        let err = transport.send(&url, &request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout), "got {:?}", err);
        drop(listener);
    }
}
