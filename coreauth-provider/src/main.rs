mod handlers;
mod state;

use std::io;
use std::net::SocketAddr;
use std::path::Path;

use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing::info;

use coreauth::error::ConfigField;
use coreauth::keys::{Provider, SigningKey, VerifyingKey};
use coreauth::server::provider::ProviderSigner;
use coreauth::server::tls::init_rustls_config;

use crate::state::ProviderState;

const DEFAULT_BIND: &str = "0.0.0.0:9090";
const DEFAULT_PUBLIC_URL: &str = "http://127.0.0.1:9090";

pub fn configure_routes() -> impl actix_web::dev::HttpServiceFactory {
    web::scope("")
        .service(
            web::scope("/api/core")
                .route("/authorize", web::post().to(handlers::core_authorize))
                .route("/info", web::post().to(handlers::core_info)),
        )
        .service(
            web::scope("/approve")
                .route("", web::get().to(handlers::approve_page))
                .route("/accept", web::get().to(handlers::approve_accept))
                .route("/deny", web::get().to(handlers::approve_deny)),
        )
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn invalid_input(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}

/// Provider key from PROVIDER_PRIVATE_KEY, or a fresh one for this run
fn load_signing_key() -> io::Result<SigningKey<Provider>> {
    match env_var("PROVIDER_PRIVATE_KEY") {
        Some(hex_str) => SigningKey::from_hex(ConfigField::ProviderPrivateKey, &hex_str)
            .map_err(|e| invalid_input(format!("PROVIDER_PRIVATE_KEY: {}", e))),
        None => {
            tracing::warn!("⚠️  PROVIDER_PRIVATE_KEY not set, using a key generated for this run only");
            Ok(SigningKey::generate())
        }
    }
}

fn build_signer() -> io::Result<ProviderSigner> {
    let signer = ProviderSigner::new(load_signing_key()?);
    info!("Provider public key (COREAUTH_PROVIDER_PUBLIC_KEY): {}", signer.verifying_key().to_hex());

    match (env_var("PROVIDER_APP_IDENTITY"), env_var("PROVIDER_APP_PUBLIC_KEY")) {
        (Some(identity), Some(public_hex)) => {
            let key = VerifyingKey::from_hex(ConfigField::ApplicationPublicKey, &public_hex)
                .map_err(|e| invalid_input(format!("PROVIDER_APP_PUBLIC_KEY: {}", e)))?;
            Ok(signer.with_application(identity, key))
        }
        _ => {
            tracing::warn!(
                "⚠️  No application registered; set PROVIDER_APP_IDENTITY and PROVIDER_APP_PUBLIC_KEY"
            );
            Ok(signer)
        }
    }
}

fn init_tracing(log_to_file: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let timer = tracing_subscriber::fmt::time::ChronoLocal::new("%Y-%m-%dT%H:%M:%S".to_string());
    let filter = "info,actix_server=warn,actix_http::h1::dispatcher=off";

    if log_to_file {
        let file_appender = tracing_appender::rolling::RollingFileAppender::new(
            tracing_appender::rolling::Rotation::DAILY,
            "./logs",
            "coreauth-provider.log",
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::writer::MakeWriterExt::and(non_blocking, io::stdout))
            .with_file(true)
            .with_line_number(true)
            .with_env_filter(filter)
            .with_timer(timer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_writer(io::stdout)
            .with_file(true)
            .with_line_number(true)
            .with_env_filter(filter)
            .with_timer(timer)
            .init();

        None
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let _guard = init_tracing(std::env::var("SERVER_LOG").unwrap_or_default() == "true");

    let bind = env_var("PROVIDER_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
    let bind: SocketAddr = bind
        .parse()
        .map_err(|_| invalid_input(format!("PROVIDER_BIND is not a socket address: {}", bind)))?;
    let public_url = env_var("PROVIDER_PUBLIC_URL").unwrap_or_else(|| DEFAULT_PUBLIC_URL.to_string());

    let state = web::Data::new(ProviderState::new(build_signer()?, public_url));
    info!("Development provider API at {}/api", state.public_url);

    if std::env::var("USE_TLS").unwrap_or_default() == "true" {
        info!("Provider starting with TLS on https://{}/", bind);

        let tls_config = init_rustls_config(Path::new("cert.pem"), Path::new("key.pem"))?;

        HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .wrap(Logger::default())
                .service(configure_routes())
        })
        .bind_rustls_0_23(bind, tls_config)?
        .run()
        .await
    } else {
        info!("Provider starting on http://{}/", bind);

        HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .wrap(Logger::default())
                .service(configure_routes())
        })
        .bind(bind)?
        .run()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use actix_web::http::{header, StatusCode};
    use actix_web::test;
    use coreauth::client::api::SignedApiClient;
    use coreauth::client::transport::{HttpTransport, DEFAULT_TIMEOUT};
    use coreauth::keys::Application;
    use coreauth::wire::{AuthorizeGrant, AuthorizeParams, Capability, IdentityInfo, InfoParams, SignedRequest};

    fn setup() -> (web::Data<ProviderState>, SignedApiClient) {
        let app_key = SigningKey::<Application>::generate();
        let signer = ProviderSigner::new(SigningKey::generate()).with_application("app-1", app_key.verifying_key());
        let provider_key = signer.verifying_key();

        // requests are signed and verified by hand here; the transport is never used
        let transport = Arc::new(HttpTransport::new(DEFAULT_TIMEOUT).unwrap());
        let client = SignedApiClient::new("http://provider.test/api", "app-1", app_key, provider_key, transport);
        let state = web::Data::new(ProviderState::new(signer, "http://provider.test"));
        (state, client)
    }

    fn callbacks() -> AuthorizeParams {
        AuthorizeParams {
            success: "http://app.test/authorized".to_string(),
            failure: "http://app.test/fail".to_string(),
        }
    }

    fn post(uri: &str, request: &SignedRequest) -> test::TestRequest {
        test::TestRequest::post().uri(uri).set_json(request)
    }

    fn location(resp: &actix_web::dev::ServiceResponse) -> String {
        resp.headers().get(header::LOCATION).unwrap().to_str().unwrap().to_string()
    }

    #[actix_web::test]
    async fn authorize_approve_and_exchange_token() {
        let (state, client) = setup();
        let app = test::init_service(App::new().app_data(state).service(configure_routes())).await;

        let request = client.sign_request(Capability::Authorize, &callbacks()).unwrap();
        let resp = test::call_service(&app, post("/api/core/authorize", &request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = client.verify_response(&request, &test::read_body(resp).await).unwrap();
        let grant: AuthorizeGrant = serde_json::from_str(&payload).unwrap();
        let grant_id = grant.location.strip_prefix("http://provider.test/approve?grant=").unwrap().to_string();

        let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("/approve?grant={}", grant_id)).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let accept = format!("/approve/accept?grant={}", grant_id);
        let resp = test::call_service(&app, test::TestRequest::get().uri(&accept).to_request()).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        let callback = location(&resp);
        let token = callback.strip_prefix("http://app.test/authorized?token=").unwrap().to_string();

        // grants are single use
        let resp = test::call_service(&app, test::TestRequest::get().uri(&accept).to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let request = client.sign_request(Capability::Info, &InfoParams { token: token.clone() }).unwrap();
        let resp = test::call_service(&app, post("/api/core/info", &request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = client.verify_response(&request, &test::read_body(resp).await).unwrap();
        let info: IdentityInfo = serde_json::from_str(&payload).unwrap();
        assert_eq!(info["application"], "app-1");

        // and so are tokens
        let request = client.sign_request(Capability::Info, &InfoParams { token }).unwrap();
        let resp = test::call_service(&app, post("/api/core/info", &request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn deny_redirects_to_failure_callback() {
        let (state, client) = setup();
        let grant_id = state.open_grant(client.identity(), callbacks());
        let app = test::init_service(App::new().app_data(state).service(configure_routes())).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("/approve/deny?grant={}", grant_id)).to_request()).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(location(&resp), "http://app.test/fail");
    }

    #[actix_web::test]
    async fn replayed_and_mismatched_requests_are_rejected() {
        let (state, client) = setup();
        let app = test::init_service(App::new().app_data(state).service(configure_routes())).await;

        let request = client.sign_request(Capability::Authorize, &callbacks()).unwrap();
        let resp = test::call_service(&app, post("/api/core/authorize", &request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = test::call_service(&app, post("/api/core/authorize", &request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // an info request posted to the authorize route
        let request = client.sign_request(Capability::Info, &InfoParams { token: "t".into() }).unwrap();
        let resp = test::call_service(&app, post("/api/core/authorize", &request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let mut request = client.sign_request(Capability::Authorize, &callbacks()).unwrap();
        request.payload = r#"{"success":"http://evil.test","failure":"http://evil.test"}"#.to_string();
        let resp = test::call_service(&app, post("/api/core/authorize", &request).to_request()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = test::call_service(
            &app,
            test::TestRequest::post().uri("/api/core/info").set_payload("not json").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
