use actix_web::error::{InternalError, QueryPayloadError};
use actix_web::{http::header, http::StatusCode, web, HttpRequest, HttpResponse};

use coreauth::handshake::{HandshakeError, Readiness};
use coreauth::keys::SetupDiagnostic;

/// Shared across all workers; built once at startup and never mutated.
pub struct AppState {
    pub readiness: Readiness,
    pub setup_mode: bool, // allow / to reveal a generated private key
}

const AUTH_LINK: &str = r#"<a href="/authorize">Click here to auth</a>"#;
const ENV_HINT: &str = "<br /><br />Settings: COREAUTH_ENDPOINT, COREAUTH_IDENTITY, COREAUTH_PRIVATE_KEY, \
                        COREAUTH_PROVIDER_PUBLIC_KEY";

pub async fn index(state: web::Data<AppState>) -> HttpResponse {
    match &state.readiness {
        Readiness::Ready(_) => HttpResponse::Ok().content_type("text/html; charset=utf-8").body(AUTH_LINK),
        Readiness::Setup(diagnostic) => {
            let page = if state.setup_mode {
                tracing::warn!("⚠️  Serving setup diagnostic with a generated private key (COREAUTH_SETUP_MODE=true)");
                setup_page(diagnostic)
            } else {
                locked_setup_page(diagnostic)
            };
            HttpResponse::Ok().content_type("text/html; charset=utf-8").body(page)
        }
    }
}

/// Start the handshake: redirect the browser to the provider's approval page
pub async fn authorize(state: web::Data<AppState>) -> HttpResponse {
    let handshake = match state.readiness.handshake() {
        Ok(handshake) => handshake,
        Err(e) => return error_response(e),
    };

    match handshake.begin().await {
        Ok(location) => HttpResponse::Found()
            .insert_header((header::LOCATION, location))
            .finish(),
        Err(e) => error_response(e),
    }
}

/// Success callback: `?token=` from the provider is exchanged for identity info.
///
/// The query is taken as raw pairs so a repeated `token` uses the first value.
pub async fn authorized(state: web::Data<AppState>, query: web::Query<Vec<(String, String)>>) -> HttpResponse {
    let handshake = match state.readiness.handshake() {
        Ok(handshake) => handshake,
        Err(e) => return error_response(e),
    };

    match handshake.complete(first_token(&query)).await {
        Ok(info) => {
            tracing::info!("✅ Handshake complete for {}", handshake.client().identity());
            HttpResponse::Ok().json(info)
        }
        Err(e) => error_response(e),
    }
}

/// Failure callback; always unauthorized
pub async fn fail(state: web::Data<AppState>) -> HttpResponse {
    let err = match state.readiness.handshake() {
        Ok(handshake) => handshake.deny(),
        Err(_) => HandshakeError::Denied,
    };
    error_response(err)
}

/// Unparseable callback queries are a missing credential, not a bad request
pub fn query_error(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    tracing::debug!("Rejected callback query: {}", err);
    let response = HttpResponse::Unauthorized()
        .content_type("text/plain; charset=utf-8")
        .body("authorization failed");
    InternalError::from_response(err, response).into()
}

fn first_token(pairs: &[(String, String)]) -> Option<&str> {
    pairs
        .iter()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.as_str())
}

fn error_response(err: HandshakeError) -> HttpResponse {
    err.log_security_event();

    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::UNAUTHORIZED);
    let body = match err {
        HandshakeError::Unconfigured => "provider configuration unavailable",
        _ => "authorization failed",
    };
    HttpResponse::build(status).content_type("text/plain; charset=utf-8").body(body)
}

fn setup_page(diagnostic: &SetupDiagnostic) -> String {
    let mut page = diagnostic.message().replace('\n', "<br />");
    page.push_str(ENV_HINT);
    page
}

fn locked_setup_page(diagnostic: &SetupDiagnostic) -> String {
    format!(
        "Core Service API configuration is not usable ({}).<br /><br />\
         Restart with COREAUTH_SETUP_MODE=true to have a new key pair generated on this page.{}",
        diagnostic.reason(),
        ENV_HINT
    )
}
