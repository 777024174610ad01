use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::keys::{Application, Provider, SigningKey, VerifyingKey};
use crate::wire::{self, Capability, SignedRequest, SignedResponse, FRESHNESS_WINDOW_SECS};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown application identity")]
    UnknownIdentity,
    #[error("invalid request signature")]
    InvalidSignature,
    #[error("request timestamp outside freshness window")]
    StaleRequest,
    #[error("request nonce already used")]
    ReplayedNonce,
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
    #[error("malformed request payload")]
    MalformedPayload,
    #[error("authorization token unknown or expired")]
    InvalidToken,
    #[error("failed to encode reply: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl ProviderError {
    pub fn status_code(&self) -> u16 {
        match self {
            ProviderError::UnknownIdentity
            | ProviderError::StaleRequest
            | ProviderError::ReplayedNonce
            | ProviderError::InvalidToken => 401, // Unauthorized
            ProviderError::InvalidSignature => 403, // Forbidden - authentication failed
            ProviderError::UnknownCapability(_) | ProviderError::MalformedPayload => 400, // Bad Request
            ProviderError::Encoding(_) => 500,
        }
    }

    /// Log the error with appropriate security context
    pub fn log_security_event(&self) {
        match self {
            ProviderError::InvalidSignature => {
                tracing::warn!("⚠️  SECURITY: Invalid request signature - possible forgery or wrong registered key!");
            }
            ProviderError::ReplayedNonce => {
                tracing::warn!("⚠️  SECURITY: Request nonce reused - possible replay attack!");
            }
            ProviderError::StaleRequest => {
                tracing::warn!("Request timestamp outside freshness window");
            }
            ProviderError::UnknownIdentity => {
                tracing::debug!("Request from unknown application identity");
            }
            _ => {
                tracing::debug!("Provider error: {}", self);
            }
        }
    }
}

/// A request whose signature, freshness and nonce have been checked
#[derive(Debug, Clone)]
pub struct VerifiedRequest {
    pub identity: String,
    pub capability: Capability,
    pub nonce: String,
    payload: String,
}

impl VerifiedRequest {
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, ProviderError> {
        serde_json::from_str(&self.payload).map_err(|_| ProviderError::MalformedPayload)
    }
}

/// Provider side of the signed protocol: checks application requests against their
/// registered public keys and signs replies with the provider key.
pub struct ProviderSigner {
    signing_key: SigningKey<Provider>,
    applications: HashMap<String, VerifyingKey<Application>>, // identity -> registered public key
    seen_nonces: RwLock<HashMap<String, i64>>,                // nonce -> request timestamp
}

impl ProviderSigner {
    pub fn new(signing_key: SigningKey<Provider>) -> Self {
        Self {
            signing_key,
            applications: HashMap::new(),
            seen_nonces: RwLock::new(HashMap::new()),
        }
    }

    /// Register an application's public key under its identity
    pub fn with_application(mut self, identity: impl Into<String>, key: VerifyingKey<Application>) -> Self {
        let identity = identity.into();
        tracing::info!("Registered application {} ({})", identity, key.to_hex());
        self.applications.insert(identity, key);
        self
    }

    pub fn verifying_key(&self) -> VerifyingKey<Provider> {
        self.signing_key.verifying_key()
    }

    pub fn verify_request(&self, request: &SignedRequest) -> Result<VerifiedRequest, ProviderError> {
        let key = self
            .applications
            .get(&request.identity)
            .ok_or(ProviderError::UnknownIdentity)?;

        key.verify_hex(&request.signing_message(), &request.signature)
            .map_err(|_| ProviderError::InvalidSignature)?;

        let now = wire::now();
        if !wire::is_fresh(request.timestamp, now) {
            tracing::warn!(
                "Request timestamp outside TTL window (timestamp: {}, now: {}, ttl: {})",
                request.timestamp,
                now,
                FRESHNESS_WINDOW_SECS
            );
            return Err(ProviderError::StaleRequest);
        }

        self.remember_nonce(&request.nonce, request.timestamp, now)?;

        let capability = Capability::from_name(&request.capability)
            .ok_or_else(|| ProviderError::UnknownCapability(request.capability.clone()))?;

        tracing::debug!("Request from {} for {} verified", request.identity, request.capability);
        Ok(VerifiedRequest {
            identity: request.identity.clone(),
            capability,
            nonce: request.nonce.clone(),
            payload: request.payload.clone(),
        })
    }

    /// Sign `payload` as the reply to `request`
    pub fn sign_response<T: Serialize>(&self, request: &VerifiedRequest, payload: &T) -> Result<SignedResponse, ProviderError> {
        self.sign_response_at(&request.nonce, payload, wire::now())
    }

    pub(crate) fn sign_response_at<T: Serialize>(
        &self,
        nonce: &str,
        payload: &T,
        timestamp: i64,
    ) -> Result<SignedResponse, ProviderError> {
        let mut response = SignedResponse {
            nonce: nonce.to_string(),
            timestamp,
            payload: serde_json::to_string(payload)?,
            signature: String::new(),
        };
        response.signature = self.signing_key.sign_hex(&response.signing_message());
        Ok(response)
    }

    fn remember_nonce(&self, nonce: &str, timestamp: i64, now: i64) -> Result<(), ProviderError> {
        let mut seen = self.seen_nonces.write().unwrap_or_else(PoisonError::into_inner);

        // a nonce only has to outlive the freshness window
        seen.retain(|_, ts| now.abs_diff(*ts) <= (FRESHNESS_WINDOW_SECS * 2) as u64);

        if seen.contains_key(nonce) {
            return Err(ProviderError::ReplayedNonce);
        }
        seen.insert(nonce.to_string(), timestamp);
        Ok(())
    }
}
