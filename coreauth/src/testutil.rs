//! In-process provider for tests.
//!
//! [`FakeProvider`] implements [`ProviderTransport`] on top of the real [`ProviderSigner`], so
//! requests are signature-checked and replies are genuinely signed. It counts calls, records
//! requested URLs and can be switched into failure modes (wrong signing key, offline, fixed
//! HTTP status).
//!
//! Enabled for this crate's own tests and, for dependants, behind the `testutil` feature:
//!
//! ```toml
//! [dev-dependencies]
//! coreauth = { path = "../coreauth", features = ["testutil"] }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;

use crate::client::transport::{ProviderTransport, TransportError, TransportReply};
use crate::keys::{Application, Provider, SigningKey, ValidatedSettings};
use crate::server::provider::{ProviderError, ProviderSigner};
use crate::wire::{self, AuthorizeGrant, AuthorizeParams, Capability, IdentityInfo, InfoParams, SignedRequest};

pub const FAKE_ENDPOINT: &str = "https://core.test/api";
pub const FAKE_LOCATION: &str = "https://core.test/approve?grant=fake-grant";

enum Mode {
    Honest,
    WrongKey(ProviderSigner), // replies signed by a key the client does not trust
    Offline,
    Status(u16), // every call answered with this status and an empty body
}

pub struct FakeProvider {
    signer: ProviderSigner,
    mode: Mode,
    location: String,
    identity_info: IdentityInfo,
    accepted_tokens: Vec<String>,
    calls: AtomicUsize,
    requested_urls: Mutex<Vec<String>>,
    last_authorize: Mutex<Option<AuthorizeParams>>,
}

impl FakeProvider {
    /// Fresh provider with `identity` registered, plus matching client settings.
    ///
    /// Both key pairs are generated; the settings carry the application's signing key and the
    /// provider's verifying key, exactly as a validated configuration would.
    pub fn new(identity: &str) -> (Self, ValidatedSettings) {
        let app_key = SigningKey::<Application>::generate();
        let provider_key = SigningKey::<Provider>::generate();

        let settings = ValidatedSettings {
            endpoint: FAKE_ENDPOINT.to_string(),
            identity: identity.to_string(),
            signing_key: app_key.clone(),
            provider_key: provider_key.verifying_key(),
        };

        let mut identity_info = IdentityInfo::new();
        identity_info.insert("identity".into(), serde_json::json!("user-0001"));
        identity_info.insert("name".into(), serde_json::json!("Test User"));

        let provider = Self {
            signer: ProviderSigner::new(provider_key).with_application(identity, app_key.verifying_key()),
            mode: Mode::Honest,
            location: FAKE_LOCATION.to_string(),
            identity_info,
            accepted_tokens: Vec::new(),
            calls: AtomicUsize::new(0),
            requested_urls: Mutex::new(Vec::new()),
            last_authorize: Mutex::new(None),
        };
        (provider, settings)
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = location.to_string();
        self
    }

    pub fn with_identity_info(mut self, info: IdentityInfo) -> Self {
        self.identity_info = info;
        self
    }

    pub fn accepting(mut self, token: &str) -> Self {
        self.accepted_tokens.push(token.to_string());
        self
    }

    pub fn signing_with_wrong_key(mut self) -> Self {
        let impostor = ProviderSigner::new(SigningKey::generate());
        self.mode = Mode::WrongKey(impostor);
        self
    }

    pub fn offline(mut self) -> Self {
        self.mode = Mode::Offline;
        self
    }

    pub fn replying_with_status(mut self, status: u16) -> Self {
        self.mode = Mode::Status(status);
        self
    }

    pub fn identity_info(&self) -> &IdentityInfo {
        &self.identity_info
    }

    /// Number of requests that reached the provider
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.requested_urls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn last_authorize_params(&self) -> Option<AuthorizeParams> {
        self.last_authorize.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// A correctly signed reply body to `request`, timestamped `offset_secs` from now
    pub fn signed_reply<T: Serialize>(&self, request: &SignedRequest, payload: &T, offset_secs: i64) -> Vec<u8> {
        let reply = self
            .signer
            .sign_response_at(&request.nonce, payload, wire::now().saturating_add(offset_secs))
            .expect("fake reply encodes");
        serde_json::to_vec(&reply).expect("fake reply serializes")
    }

    fn reply_signer(&self) -> &ProviderSigner {
        match &self.mode {
            Mode::WrongKey(impostor) => impostor,
            _ => &self.signer,
        }
    }

    fn handle(&self, request: &SignedRequest) -> Result<TransportReply, ProviderError> {
        let verified = self.signer.verify_request(request)?;

        let payload = match verified.capability {
            Capability::Authorize => {
                let params: AuthorizeParams = verified.params()?;
                *self.last_authorize.lock().unwrap_or_else(PoisonError::into_inner) = Some(params);
                serde_json::to_value(AuthorizeGrant {
                    location: self.location.clone(),
                })?
            }
            Capability::Info => {
                let params: InfoParams = verified.params()?;
                if !self.accepted_tokens.contains(&params.token) {
                    return Err(ProviderError::InvalidToken);
                }
                serde_json::Value::Object(self.identity_info.clone())
            }
        };

        let reply = self.reply_signer().sign_response(&verified, &payload)?;
        Ok(TransportReply {
            status: 200,
            body: serde_json::to_vec(&reply)?,
        })
    }
}

fn empty_reply(status: u16) -> TransportReply {
    TransportReply {
        status,
        body: Vec::new(),
    }
}

#[async_trait]
impl ProviderTransport for FakeProvider {
    async fn send(&self, url: &str, request: &SignedRequest) -> Result<TransportReply, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested_urls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_string());

        match self.mode {
            Mode::Offline => return Err(TransportError::Connect("fake provider offline".to_string())),
            Mode::Status(status) => return Ok(empty_reply(status)),
            Mode::Honest | Mode::WrongKey(_) => {}
        }

        match self.handle(request) {
            Ok(reply) => Ok(reply),
            Err(err) => Ok(empty_reply(err.status_code())),
        }
    }
}
