use actix_web::{http::header, http::StatusCode, web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use coreauth::server::provider::{ProviderError, VerifiedRequest};
use coreauth::wire::{AuthorizeGrant, AuthorizeParams, Capability, InfoParams, SignedRequest};

use crate::state::ProviderState;

#[derive(Debug, Deserialize)]
pub struct GrantQuery {
    pub grant: String,
}

/// POST /api/core/authorize
pub async fn core_authorize(state: web::Data<ProviderState>, body: web::Bytes) -> HttpResponse {
    signed_call(&state, &body, Capability::Authorize, |verified| {
        let callbacks: AuthorizeParams = verified.params()?;
        let grant_id = state.open_grant(&verified.identity, callbacks);

        Ok(serde_json::to_value(AuthorizeGrant {
            location: state.approval_location(&grant_id),
        })?)
    })
}

/// POST /api/core/info
pub async fn core_info(state: web::Data<ProviderState>, body: web::Bytes) -> HttpResponse {
    signed_call(&state, &body, Capability::Info, |verified| {
        let params: InfoParams = verified.params()?;
        if !state.redeem_token(&params.token, &verified.identity) {
            return Err(ProviderError::InvalidToken);
        }

        Ok(json!({
            "identity": "developer",
            "name": "Local Developer",
            "application": verified.identity,
            "authorized_at": chrono::Utc::now().to_rfc3339(),
        }))
    })
}

/// Verify, run `handler`, sign its result. Errors carry no body beyond their status.
fn signed_call<F>(state: &ProviderState, body: &[u8], expected: Capability, handler: F) -> HttpResponse
where
    F: FnOnce(&VerifiedRequest) -> Result<serde_json::Value, ProviderError>,
{
    let request: SignedRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!("Failed to deserialize SignedRequest: {}", e);
            return HttpResponse::BadRequest().body("Invalid request format");
        }
    };

    let result = state.signer.verify_request(&request).and_then(|verified| {
        if verified.capability != expected {
            return Err(ProviderError::UnknownCapability(request.capability.clone()));
        }
        let payload = handler(&verified)?;
        state.signer.sign_response(&verified, &payload)
    });

    match result {
        Ok(response) => {
            tracing::info!("✅ {} served for {}", expected.name(), request.identity);
            HttpResponse::Ok().json(response)
        }
        Err(e) => {
            e.log_security_event();
            let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
            HttpResponse::build(status).body(e.to_string())
        }
    }
}

/// GET /approve?grant=
pub async fn approve_page(state: web::Data<ProviderState>, query: web::Query<GrantQuery>) -> HttpResponse {
    match state.peek_grant(&query.grant) {
        Some(grant) => HttpResponse::Ok().content_type("text/html; charset=utf-8").body(format!(
            "Application <b>{identity}</b> wants to confirm who you are.<br /><br />\
             <a href=\"/approve/accept?grant={id}\">Approve</a> | \
             <a href=\"/approve/deny?grant={id}\">Deny</a>",
            identity = grant.identity,
            id = query.grant,
        )),
        None => unknown_grant(),
    }
}

/// GET /approve/accept?grant=
pub async fn approve_accept(state: web::Data<ProviderState>, query: web::Query<GrantQuery>) -> HttpResponse {
    let Some(grant) = state.take_grant(&query.grant) else {
        return unknown_grant();
    };

    let token = state.issue_token(&grant.identity);
    tracing::info!("Grant approved for {}", grant.identity);
    redirect(&with_query(&grant.callbacks.success, "token", &token))
}

/// GET /approve/deny?grant=
pub async fn approve_deny(state: web::Data<ProviderState>, query: web::Query<GrantQuery>) -> HttpResponse {
    let Some(grant) = state.take_grant(&query.grant) else {
        return unknown_grant();
    };

    tracing::info!("Grant denied for {}", grant.identity);
    redirect(&grant.callbacks.failure)
}

fn unknown_grant() -> HttpResponse {
    HttpResponse::NotFound().body("unknown or expired grant")
}

fn redirect(location: &str) -> HttpResponse {
    HttpResponse::Found()
        .insert_header((header::LOCATION, location))
        .finish()
}

// tokens are uuid hex, so no escaping is needed; the pair goes before any #fragment
fn with_query(url: &str, key: &str, value: &str) -> String {
    let (base, fragment) = match url.find('#') {
        Some(at) => url.split_at(at),
        None => (url, ""),
    };
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}{}", base, separator, key, value, fragment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_added_to_the_query() {
        assert_eq!(with_query("http://app.test/authorized", "token", "t1"), "http://app.test/authorized?token=t1");
        assert_eq!(
            with_query("http://app.test/authorized?lang=en", "token", "t1"),
            "http://app.test/authorized?lang=en&token=t1"
        );
    }

    #[test]
    fn token_goes_before_the_fragment() {
        assert_eq!(
            with_query("http://app.test/authorized#done", "token", "t1"),
            "http://app.test/authorized?token=t1#done"
        );
        assert_eq!(
            with_query("http://app.test/authorized?lang=en#a?b", "token", "t1"),
            "http://app.test/authorized?lang=en&token=t1#a?b"
        );
    }
}
