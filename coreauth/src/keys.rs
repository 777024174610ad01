//! Key material loader.
//!
//! Turns the hex-encoded key strings from configuration into P-256 / SHA-256 key objects.
//! Keys are tagged with the party that owns them, so the application's signing key and the
//! provider's verifying key cannot be swapped for one another.

use std::fmt;
use std::marker::PhantomData;

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{self, Signature};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::error::{ConfigError, ConfigField};

pub const PRIVATE_KEY_LEN: usize = 32; // P-256 scalar
pub const PUBLIC_KEY_LEN: usize = 64; // affine x || y, no SEC1 tag
pub const SIGNATURE_LEN: usize = 64; // r || s

const SEC1_UNCOMPRESSED_TAG: u8 = 0x04;

/// A party that owns a key pair in the handshake.
pub trait Party: Send + Sync + 'static {
    const NAME: &'static str;
}

/// The relying application.
#[derive(Debug, Clone, Copy)]
pub struct Application;

/// The remote identity provider.
#[derive(Debug, Clone, Copy)]
pub struct Provider;

impl Party for Application {
    const NAME: &'static str = "application";
}

impl Party for Provider {
    const NAME: &'static str = "provider";
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is not valid hex")]
    BadHex,
    #[error("signature has {0} bytes, expected {SIGNATURE_LEN}")]
    WrongLength(usize),
    #[error("signature is malformed")]
    Malformed,
    #[error("signature does not match")]
    Mismatch,
}

/// Private P-256 key owned by party `P`. Never leaves the process.
pub struct SigningKey<P: Party> {
    inner: ecdsa::SigningKey,
    _party: PhantomData<P>,
}

impl<P: Party> SigningKey<P> {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        Self::wrap(ecdsa::SigningKey::random(&mut OsRng))
    }

    pub fn from_hex(field: ConfigField, hex_str: &str) -> Result<Self, ConfigError> {
        let bytes = Zeroizing::new(decode_fixed(field, hex_str, PRIVATE_KEY_LEN)?);
        let inner =
            ecdsa::SigningKey::from_slice(&bytes).map_err(|_| ConfigError::InvalidKey { field })?;
        Ok(Self::wrap(inner))
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.inner.to_bytes()))
    }

    /// Public half of this key pair, still owned by `P`.
    pub fn verifying_key(&self) -> VerifyingKey<P> {
        VerifyingKey::wrap(*self.inner.verifying_key())
    }

    /// Sign `message` (SHA-256 digest, fixed-size r || s) and return the signature as hex
    pub fn sign_hex(&self, message: &[u8]) -> String {
        let signature: Signature = self.inner.sign(message);
        hex::encode(signature.to_bytes())
    }

    fn wrap(inner: ecdsa::SigningKey) -> Self {
        Self {
            inner,
            _party: PhantomData,
        }
    }
}

impl<P: Party> Clone for SigningKey<P> {
    fn clone(&self) -> Self {
        Self::wrap(self.inner.clone())
    }
}

impl<P: Party> fmt::Debug for SigningKey<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey<{}>(..)", P::NAME)
    }
}

/// Public P-256 key of party `P`, used only to check signatures made by `P`.
pub struct VerifyingKey<P: Party> {
    inner: ecdsa::VerifyingKey,
    _party: PhantomData<P>,
}

impl<P: Party> VerifyingKey<P> {
    pub fn from_hex(field: ConfigField, hex_str: &str) -> Result<Self, ConfigError> {
        let raw = decode_fixed(field, hex_str, PUBLIC_KEY_LEN)?;

        let mut sec1 = Vec::with_capacity(PUBLIC_KEY_LEN + 1);
        sec1.push(SEC1_UNCOMPRESSED_TAG);
        sec1.extend_from_slice(&raw);

        let inner = ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
            .map_err(|_| ConfigError::InvalidKey { field })?;
        Ok(Self::wrap(inner))
    }

    pub fn to_hex(&self) -> String {
        let point = self.inner.to_encoded_point(false);
        hex::encode(&point.as_bytes()[1..])
    }

    /// Check a hex r || s signature over `message`.
    pub fn verify_hex(&self, message: &[u8], signature_hex: &str) -> Result<(), SignatureError> {
        let bytes = hex::decode(signature_hex).map_err(|_| SignatureError::BadHex)?;
        if bytes.len() != SIGNATURE_LEN {
            return Err(SignatureError::WrongLength(bytes.len()));
        }

        let signature = Signature::from_slice(&bytes).map_err(|_| SignatureError::Malformed)?;
        self.inner
            .verify(message, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }

    fn wrap(inner: ecdsa::VerifyingKey) -> Self {
        Self {
            inner,
            _party: PhantomData,
        }
    }
}

impl<P: Party> Clone for VerifyingKey<P> {
    fn clone(&self) -> Self {
        Self::wrap(self.inner)
    }
}

impl<P: Party> PartialEq for VerifyingKey<P> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<P: Party> fmt::Debug for VerifyingKey<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyingKey<{}>({})", P::NAME, self.to_hex())
    }
}

fn decode_fixed(field: ConfigField, hex_str: &str, expected: usize) -> Result<Vec<u8>, ConfigError> {
    let trimmed = hex_str.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Missing(field));
    }

    let bytes = hex::decode(trimmed).map_err(|source| ConfigError::BadHex { field, source })?;
    if bytes.len() != expected {
        return Err(ConfigError::WrongLength {
            field,
            expected,
            actual: bytes.len(),
        });
    }

    Ok(bytes)
}

/// Provider configuration exactly as the operator supplied it.
#[derive(Clone, Default)]
pub struct ProviderSettings {
    pub endpoint: String,              // provider API base, e.g. https://core.example/api
    pub identity: String,              // application ID issued by the provider
    pub private_key: Zeroizing<String>, // our P-256 private key (hex)
    pub provider_public_key: String,   // the PROVIDER's public key (hex), not ours
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("endpoint", &self.endpoint)
            .field("identity", &self.identity)
            .field("private_key", &"<redacted>")
            .field("provider_public_key", &self.provider_public_key)
            .finish()
    }
}

impl ProviderSettings {
    /// Decode and validate every field. Nothing is mutated; the result is a separate,
    /// immutable record holding key objects only.
    pub fn validate(&self) -> Result<ValidatedSettings, ConfigError> {
        let endpoint = normalize_endpoint(&self.endpoint)?;

        let identity = self.identity.trim();
        if identity.is_empty() {
            return Err(ConfigError::Missing(ConfigField::Identity));
        }

        let signing_key = SigningKey::<Application>::from_hex(ConfigField::PrivateKey, &self.private_key)?;
        let provider_key =
            VerifyingKey::<Provider>::from_hex(ConfigField::ProviderPublicKey, &self.provider_public_key)?;

        Ok(ValidatedSettings {
            endpoint,
            identity: identity.to_string(),
            signing_key,
            provider_key,
        })
    }
}

fn normalize_endpoint(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::Missing(ConfigField::Endpoint));
    }

    let url = reqwest::Url::parse(trimmed).map_err(|_| ConfigError::BadEndpoint)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::BadEndpoint);
    }

    Ok(trimmed.to_string())
}

/// Configuration record after validation: built once at startup, shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct ValidatedSettings {
    pub endpoint: String,
    pub identity: String,
    pub signing_key: SigningKey<Application>,
    pub provider_key: VerifyingKey<Provider>,
}

/// First-run / misconfiguration recovery: why loading failed plus a freshly generated,
/// unregistered key pair the operator can adopt.
pub struct SetupDiagnostic {
    reason: ConfigError,
    generated: SigningKey<Application>,
}

impl SetupDiagnostic {
    pub fn generate(reason: ConfigError) -> Self {
        Self {
            reason,
            generated: SigningKey::generate(),
        }
    }

    pub fn reason(&self) -> &ConfigError {
        &self.reason
    }

    pub fn private_key_hex(&self) -> Zeroizing<String> {
        self.generated.to_hex()
    }

    pub fn public_key_hex(&self) -> String {
        self.generated.verifying_key().to_hex()
    }

    /// Plain-text setup instructions, including the generated key pair.
    pub fn message(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "Core Service API identity, public, or private key missing ({reason}).\n\n\
             Here's a new private key; store it as the application private key:\n{private}\n\n\
             Here's that key's public key; this is what you register with Core:\n{public}\n\n\
             After registering, save the server's public key as the provider public key \
             and your service's ID as the application identity.\n",
            reason = self.reason,
            private = self.private_key_hex().as_str(),
            public = self.public_key_hex(),
        ))
    }
}

impl fmt::Debug for SetupDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupDiagnostic")
            .field("reason", &self.reason)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Result of loading provider configuration. Never an error: a bad configuration becomes a
/// setup diagnostic instead.
#[derive(Debug)]
pub enum LoadOutcome {
    Ready(ValidatedSettings),
    Setup(SetupDiagnostic),
}

pub fn load(settings: &ProviderSettings) -> LoadOutcome {
    match settings.validate() {
        Ok(validated) => {
            tracing::info!(
                identity = %validated.identity,
                endpoint = %validated.endpoint,
                "✅ Provider configuration validated"
            );
            tracing::info!("Application public key: {}", validated.signing_key.verifying_key().to_hex());
            LoadOutcome::Ready(validated)
        }
        Err(reason) => {
            tracing::warn!(field = %reason.field(), "Provider configuration invalid: {}", reason);
            LoadOutcome::Setup(SetupDiagnostic::generate(reason))
        }
    }
}
