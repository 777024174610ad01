//! Three-step browser-redirect handshake: initiate, redirect back with a token, exchange the
//! token for identity info.
//!
//! No per-user state is kept between HTTP requests. The token travels through the browser, so
//! each step starts from the state the previous step must have left the attempt in and logs
//! the transition it makes.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::client::api::SignedApiClient;
use crate::client::transport::ProviderTransport;
use crate::error::ClientError;
use crate::keys::{LoadOutcome, SetupDiagnostic};
use crate::wire::IdentityInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unconfigured,
    Configured,
    AuthorizationPending,
    Authorized, // terminal
    Failed,     // terminal
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    ConfigurationValidated,
    ConfigurationRejected,
    AuthorizationStarted,
    TokenExchanged,
    Denied,
    Error,
}

impl HandshakeState {
    /// Apply `event`. Denial and errors fail from any state; an event that does not belong
    /// to the current state also fails the attempt. Terminal states never change.
    pub fn advance(self, event: HandshakeEvent) -> HandshakeState {
        use HandshakeEvent as E;
        use HandshakeState as S;

        match (self, event) {
            (S::Authorized, _) | (S::Failed, _) => self,
            (_, E::Denied) | (_, E::Error) => S::Failed,
            (S::Unconfigured, E::ConfigurationValidated) => S::Configured,
            (S::Unconfigured, E::ConfigurationRejected) => S::Unconfigured,
            (S::Configured, E::AuthorizationStarted) => S::AuthorizationPending,
            (S::AuthorizationPending, E::TokenExchanged) => S::Authorized,
            _ => S::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Authorized | HandshakeState::Failed)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Unconfigured => "unconfigured",
            HandshakeState::Configured => "configured",
            HandshakeState::AuthorizationPending => "authorization_pending",
            HandshakeState::Authorized => "authorized",
            HandshakeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("provider configuration is not usable")]
    Unconfigured,

    #[error("provider reported the authorization as denied")]
    Denied,

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl HandshakeError {
    pub fn status_code(&self) -> u16 {
        match self {
            HandshakeError::Unconfigured => 503, // Service Unavailable
            HandshakeError::Denied => 401,
            HandshakeError::Client(e) => e.status_code(),
        }
    }

    /// Log the error with appropriate security context
    pub fn log_security_event(&self) {
        match self {
            HandshakeError::Unconfigured => {
                tracing::warn!("Handshake requested while provider configuration is invalid");
            }
            HandshakeError::Denied => {
                tracing::info!("Provider reported authorization denied");
            }
            HandshakeError::Client(e) => e.log_security_event(),
        }
    }
}

/// Callback targets handed to the provider, built from our externally visible base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackUrls {
    pub success: String,
    pub failure: String,
}

impl CallbackUrls {
    pub fn from_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            success: format!("{}/authorized", base),
            failure: format!("{}/fail", base),
        }
    }
}

/// Drives handshake attempts against one shared, already validated client.
#[derive(Debug, Clone)]
pub struct Handshake {
    client: Arc<SignedApiClient>,
    callbacks: CallbackUrls,
}

impl Handshake {
    pub fn new(client: Arc<SignedApiClient>, callbacks: CallbackUrls) -> Self {
        Self { client, callbacks }
    }

    pub fn client(&self) -> &SignedApiClient {
        &self.client
    }

    pub fn callbacks(&self) -> &CallbackUrls {
        &self.callbacks
    }

    /// Step one: returns the provider URL to redirect the browser to
    pub async fn begin(&self) -> Result<String, HandshakeError> {
        let state = HandshakeState::Configured;

        match self
            .client
            .initiate_authorization(&self.callbacks.success, &self.callbacks.failure)
            .await
        {
            Ok(location) => {
                transition(state, HandshakeEvent::AuthorizationStarted);
                Ok(location)
            }
            Err(e) => {
                transition(state, HandshakeEvent::Error);
                Err(e.into())
            }
        }
    }

    /// Steps two and three: the browser came back with `token`, exchange it for identity info.
    ///
    /// A missing or empty token fails before the provider is contacted.
    pub async fn complete(&self, token: Option<&str>) -> Result<IdentityInfo, HandshakeError> {
        let state = HandshakeState::AuthorizationPending;

        match self.client.fetch_identity_info(token.unwrap_or_default()).await {
            Ok(info) => {
                transition(state, HandshakeEvent::TokenExchanged);
                Ok(info)
            }
            Err(e) => {
                transition(state, HandshakeEvent::Error);
                Err(e.into())
            }
        }
    }

    /// Failure callback: the provider sent the browser back after a denial
    pub fn deny(&self) -> HandshakeError {
        transition(HandshakeState::AuthorizationPending, HandshakeEvent::Denied);
        HandshakeError::Denied
    }
}

fn transition(from: HandshakeState, event: HandshakeEvent) -> HandshakeState {
    let to = from.advance(event);
    tracing::debug!(from = %from, to = %to, ?event, "Handshake transition");
    to
}

/// Whether the application can run handshakes, decided once at startup.
#[derive(Debug)]
pub enum Readiness {
    Ready(Handshake),
    Setup(SetupDiagnostic),
}

impl Readiness {
    /// Build the shared client from a load outcome. Invalid configuration stays unconfigured
    /// and keeps its diagnostic for the index page.
    pub fn from_outcome(outcome: LoadOutcome, public_url: &str, transport: Arc<dyn ProviderTransport>) -> Self {
        match outcome {
            LoadOutcome::Ready(settings) => {
                transition(HandshakeState::Unconfigured, HandshakeEvent::ConfigurationValidated);
                let client = Arc::new(SignedApiClient::from_settings(settings, transport));
                Readiness::Ready(Handshake::new(client, CallbackUrls::from_base(public_url)))
            }
            LoadOutcome::Setup(diagnostic) => {
                transition(HandshakeState::Unconfigured, HandshakeEvent::ConfigurationRejected);
                Readiness::Setup(diagnostic)
            }
        }
    }

    pub fn state(&self) -> HandshakeState {
        match self {
            Readiness::Ready(_) => HandshakeState::Configured,
            Readiness::Setup(_) => HandshakeState::Unconfigured,
        }
    }

    pub fn handshake(&self) -> Result<&Handshake, HandshakeError> {
        match self {
            Readiness::Ready(handshake) => Ok(handshake),
            Readiness::Setup(_) => Err(HandshakeError::Unconfigured),
        }
    }
}
