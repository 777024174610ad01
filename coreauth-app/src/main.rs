mod config;
mod handlers;

use std::io;
use std::path::Path;
use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use tracing::info;

use coreauth::client::transport::{HttpTransport, ProviderTransport};
use coreauth::handshake::Readiness;
use coreauth::keys;
use coreauth::server::tls::init_rustls_config;

use crate::config::AppConfig;
use crate::handlers::AppState;

pub fn configure_routes() -> impl actix_web::dev::HttpServiceFactory {
    web::scope("")
        .app_data(web::QueryConfig::default().error_handler(handlers::query_error))
        .route("/", web::get().to(handlers::index))
        .route("/authorize", web::get().to(handlers::authorize))
        .route("/authorized", web::get().to(handlers::authorized))
        .route("/fail", web::get().to(handlers::fail))
}

fn init_tracing(log_to_file: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let timer = tracing_subscriber::fmt::time::ChronoLocal::new("%Y-%m-%dT%H:%M:%S".to_string());
    let filter = "info,actix_server=warn,actix_http::h1::dispatcher=off";

    if log_to_file {
        let file_appender = tracing_appender::rolling::RollingFileAppender::new(
            tracing_appender::rolling::Rotation::DAILY,
            "./logs",
            "coreauth-app.log",
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

fn build_transport(config: &AppConfig) -> io::Result<Arc<dyn ProviderTransport>> {
    let transport = match &config.provider_cert {
        Some(path) => {
            let pem = std::fs::read(path)?;
            info!("Pinning provider certificate from {}", path.display());
            HttpTransport::pinned(&pem, config.provider_timeout)
        }
        None => HttpTransport::new(config.provider_timeout),
    }
    .map_err(io::Error::other)?;

    Ok(Arc::new(transport))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let config = AppConfig::from_env()?;
    let _guard = init_tracing(config.server_log);

    // Decode key material exactly once; handlers only ever read the result
    let outcome = keys::load(&config.provider);
    let readiness = Readiness::from_outcome(outcome, &config.public_url, build_transport(&config)?);
    if let Readiness::Setup(_) = readiness {
        tracing::warn!("⚠️  Handshake disabled until provider configuration is fixed; see / for details");
    }

    let state = web::Data::new(AppState {
        readiness,
        setup_mode: config.setup_mode,
    });

    if config.use_tls {
        info!("Server starting with TLS on https://{}/", config.bind);

        let tls_config = init_rustls_config(Path::new("cert.pem"), Path::new("key.pem"))?;

        HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .wrap(Logger::default())
                .service(configure_routes())
        })
        .bind_rustls_0_23(config.bind, tls_config)?
        .run()
        .await
    } else {
        info!("Server starting on http://{}/", config.bind);

        HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .wrap(Logger::default())
                .service(configure_routes())
        })
        .bind(config.bind)?
        .run()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::{header, StatusCode};
    use actix_web::test;
    use coreauth::keys::{LoadOutcome, ProviderSettings};
    use coreauth::testutil::FakeProvider;

    const LOCATION: &str = "https://core.test/approve?grant=g-42";

    fn configured(provider: FakeProvider, settings: keys::ValidatedSettings) -> (web::Data<AppState>, Arc<FakeProvider>) {
        let provider = Arc::new(provider);
        let readiness = Readiness::from_outcome(LoadOutcome::Ready(settings), "http://app.test", provider.clone());
        let state = web::Data::new(AppState {
            readiness,
            setup_mode: false,
        });
        (state, provider)
    }

    fn unconfigured(setup_mode: bool) -> web::Data<AppState> {
        let (provider, _) = FakeProvider::new("app-1");
        let outcome = keys::load(&ProviderSettings::default());
        web::Data::new(AppState {
            readiness: Readiness::from_outcome(outcome, "http://app.test", Arc::new(provider)),
            setup_mode,
        })
    }

    async fn body_text(resp: actix_web::dev::ServiceResponse) -> String {
        String::from_utf8(test::read_body(resp).await.to_vec()).unwrap()
    }

    #[actix_web::test]
    async fn full_handshake_against_fake_provider() {
        let (provider, settings) = FakeProvider::new("app-1");
        let (state, provider) = configured(provider.with_location(LOCATION).accepting("abc123"), settings);
        let app = test::init_service(App::new().app_data(state).service(configure_routes())).await;

        // index links into the handshake
        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains(r#"<a href="/authorize">Click here to auth</a>"#));

        // authorize redirects to the provider's location
        let resp = test::call_service(&app, test::TestRequest::get().uri("/authorize").to_request()).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers().get(header::LOCATION).unwrap(), LOCATION);
        assert_eq!(provider.last_authorize_params().unwrap().success, "http://app.test/authorized");

        // token exchange returns the provider's identity info untouched
        let resp = test::call_service(&app, test::TestRequest::get().uri("/authorized?token=abc123").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, serde_json::Value::Object(provider.identity_info().clone()));
    }

    #[actix_web::test]
    async fn missing_or_rejected_token_is_unauthorized() {
        let (provider, settings) = FakeProvider::new("app-1");
        let (state, provider) = configured(provider.accepting("abc123"), settings);
        let app = test::init_service(App::new().app_data(state).service(configure_routes())).await;

        for uri in ["/authorized", "/authorized?token="] {
            let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(body_text(resp).await, "authorization failed");
        }
        assert_eq!(provider.calls(), 0);

        let resp = test::call_service(&app, test::TestRequest::get().uri("/authorized?token=forged").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(provider.calls(), 1);
    }

    #[actix_web::test]
    async fn repeated_token_uses_the_first_value() {
        let (provider, settings) = FakeProvider::new("app-1");
        let (state, provider) = configured(provider.accepting("abc123"), settings);
        let app = test::init_service(App::new().app_data(state).service(configure_routes())).await;

        let uri = "/authorized?token=abc123&token=x";
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let uri = "/authorized?token=x&token=abc123";
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_text(resp).await, "authorization failed");
        assert_eq!(provider.calls(), 2);
    }

    #[actix_web::test]
    async fn unverifiable_provider_reply_is_unauthorized() {
        let (provider, settings) = FakeProvider::new("app-1");
        let (state, _) = configured(provider.accepting("abc123").signing_with_wrong_key(), settings);
        let app = test::init_service(App::new().app_data(state).service(configure_routes())).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/authorized?token=abc123").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_text(resp).await, "authorization failed");

        let resp = test::call_service(&app, test::TestRequest::get().uri("/authorize").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn fail_is_always_unauthorized() {
        let (provider, settings) = FakeProvider::new("app-1");
        let (state, _) = configured(provider, settings);
        let app = test::init_service(App::new().app_data(state).service(configure_routes())).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/fail").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let app = test::init_service(App::new().app_data(unconfigured(false)).service(configure_routes())).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/fail").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn setup_mode_reveals_generated_key_pair() {
        let state = unconfigured(true);
        let Readiness::Setup(diagnostic) = &state.readiness else {
            panic!("default settings must not validate");
        };
        let private_hex = diagnostic.private_key_hex().to_string();
        let public_hex = diagnostic.public_key_hex();

        let app = test::init_service(App::new().app_data(state.clone()).service(configure_routes())).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let page = body_text(resp).await;
        assert!(page.contains(&private_hex));
        assert!(page.contains(&public_hex));
        assert!(page.contains("<br />"));
        assert!(!page.contains("Click here to auth"));
    }

    #[actix_web::test]
    async fn locked_setup_page_hides_key_material() {
        let state = unconfigured(false);
        let Readiness::Setup(diagnostic) = &state.readiness else {
            panic!("default settings must not validate");
        };
        let private_hex = diagnostic.private_key_hex().to_string();

        let app = test::init_service(App::new().app_data(state.clone()).service(configure_routes())).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        let page = body_text(resp).await;
        assert!(!page.contains(&private_hex));
        assert!(page.contains("COREAUTH_SETUP_MODE=true"));
        assert!(page.contains("provider endpoint is not set"));
    }

    #[actix_web::test]
    async fn unconfigured_handshake_is_unavailable() {
        let app = test::init_service(App::new().app_data(unconfigured(false)).service(configure_routes())).await;

        for uri in ["/authorize", "/authorized?token=abc123"] {
            let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }
}
