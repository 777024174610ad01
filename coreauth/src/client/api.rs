use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::client::transport::ProviderTransport;
use crate::error::ClientError;
use crate::keys::{Application, Provider, SigningKey, ValidatedSettings, VerifyingKey};
use crate::wire::{
    self, AuthorizeGrant, AuthorizeParams, Capability, IdentityInfo, InfoParams, SignedRequest,
    SignedResponse,
};

/// Signed API client for the provider.
///
/// Holds the application's signing key and the provider's verifying key. Every request is
/// signed before it leaves; no reply payload is returned unless its signature verifies under
/// the provider key.
pub struct SignedApiClient {
    endpoint: String,                    // provider API base, no trailing slash
    identity: String,                    // application ID issued by the provider
    signing_key: SigningKey<Application>,
    provider_key: VerifyingKey<Provider>,
    transport: Arc<dyn ProviderTransport>,
}

impl SignedApiClient {
    pub fn new(
        endpoint: impl Into<String>,
        identity: impl Into<String>,
        signing_key: SigningKey<Application>,
        provider_key: VerifyingKey<Provider>,
        transport: Arc<dyn ProviderTransport>,
    ) -> Self {
        let endpoint: String = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            identity: identity.into(),
            signing_key,
            provider_key,
            transport,
        }
    }

    pub fn from_settings(settings: ValidatedSettings, transport: Arc<dyn ProviderTransport>) -> Self {
        Self::new(
            settings.endpoint,
            settings.identity,
            settings.signing_key,
            settings.provider_key,
            transport,
        )
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Ask the provider to start an authorization; returns the URL the browser must visit
    pub async fn initiate_authorization(&self, success_url: &str, failure_url: &str) -> Result<String, ClientError> {
        let params = AuthorizeParams {
            success: success_url.to_string(),
            failure: failure_url.to_string(),
        };

        let payload = self.call(Capability::Authorize, &params).await?;
        let grant: AuthorizeGrant = serde_json::from_str(&payload)
            .map_err(|_| ClientError::ProviderRejected("authorize reply has no location".to_string()))?;

        if grant.location.trim().is_empty() {
            return Err(ClientError::ProviderRejected("authorize reply has an empty location".to_string()));
        }

        tracing::info!("Provider issued authorization location");
        Ok(grant.location)
    }

    /// Exchange an authorization token for identity info.
    ///
    /// An empty token fails with `MissingToken` before anything is sent.
    pub async fn fetch_identity_info(&self, token: &str) -> Result<IdentityInfo, ClientError> {
        if token.is_empty() {
            return Err(ClientError::MissingToken);
        }

        let params = InfoParams {
            token: token.to_string(),
        };
        let payload = self.call(Capability::Info, &params).await?;

        match serde_json::from_str(&payload) {
            Ok(serde_json::Value::Object(info)) => Ok(info),
            _ => Err(ClientError::ProviderRejected("info reply is not an object".to_string())),
        }
    }

    /// Build and sign a request for `capability`
    pub fn sign_request<T: Serialize>(&self, capability: Capability, params: &T) -> Result<SignedRequest, ClientError> {
        let mut request = SignedRequest {
            identity: self.identity.clone(),
            capability: capability.name().to_string(),
            nonce: Uuid::new_v4().simple().to_string(),
            timestamp: wire::now(),
            payload: serde_json::to_string(params)?,
            signature: String::new(),
        };
        request.signature = self.signing_key.sign_hex(&request.signing_message());
        Ok(request)
    }

    /// Verify a raw 2xx reply body against the request it answers and return the payload
    pub fn verify_response(&self, request: &SignedRequest, body: &[u8]) -> Result<String, ClientError> {
        let response: SignedResponse = serde_json::from_slice(body)
            .map_err(|_| ClientError::VerificationFailed("reply is not a signed envelope"))?;

        // nothing else in the envelope is looked at until the signature holds
        self.provider_key
            .verify_hex(&response.signing_message(), &response.signature)
            .map_err(|_| ClientError::VerificationFailed("reply signature invalid"))?;
        tracing::debug!("✅ Provider reply signature verified");

        if response.nonce != request.nonce {
            return Err(ClientError::VerificationFailed("reply nonce does not match request"));
        }

        if !wire::is_fresh(response.timestamp, wire::now()) {
            return Err(ClientError::VerificationFailed("reply timestamp outside freshness window"));
        }

        Ok(response.payload)
    }

    async fn call<T: Serialize + Sync>(&self, capability: Capability, params: &T) -> Result<String, ClientError> {
        let request = self.sign_request(capability, params)?;
        let url = format!("{}/{}", self.endpoint, capability.path());

        tracing::debug!(capability = capability.name(), nonce = %request.nonce, "Sending signed provider request");

        let reply = self
            .transport
            .send(&url, &request)
            .await
            .map_err(|e| ClientError::ProviderUnreachable(e.to_string()))?;

        match reply.status {
            200..=299 => self.verify_response(&request, &reply.body),
            500..=599 => Err(ClientError::ProviderUnreachable(format!(
                "provider returned status {}",
                reply.status
            ))),
            status => Err(match capability {
                Capability::Info => ClientError::InvalidToken,
                Capability::Authorize => ClientError::ProviderRejected(format!("status {}", status)),
            }),
        }
    }
}

impl std::fmt::Debug for SignedApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedApiClient")
            .field("endpoint", &self.endpoint)
            .field("identity", &self.identity)
            .field("provider_key", &self.provider_key)
            .finish()
    }
}
