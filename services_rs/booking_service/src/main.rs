mod booking;
mod config;
mod coupons;
mod db;
mod error;
mod gateway;
mod handlers;
mod models;
mod reconcile;
mod rows;
mod state;

use axum::extract::MatchedPath;
use axum::http::{header, header::HeaderName, Method, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use config::Config;
use gateway::GatewayConfig;
use state::AppState;
use std::net::SocketAddr;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use vexe_common::internal_auth::InternalAuthLayer;
use vexe_common::request_id::RequestIdLayer;
use vexe_common::security_headers::SecurityHeadersLayer;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let pool = match db::connect(&cfg.db_url).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "db connect failed");
            std::process::exit(2);
        }
    };
    if let Err(e) = db::ensure_schema(&pool, &cfg.db_schema).await {
        tracing::error!(error = %e, "db ensure_schema failed");
        std::process::exit(2);
    }

    let gateway = cfg.pay_gateway_url.clone().map(|base_url| GatewayConfig {
        base_url,
        merchant_code: cfg.pay_merchant_code.clone().unwrap_or_default(),
        hash_secret: cfg.pay_hash_secret.clone().unwrap_or_default(),
        return_url: cfg.pay_return_url.clone().unwrap_or_default(),
        locale: cfg.pay_locale.clone(),
    });

    let state = AppState {
        pool,
        db_schema: cfg.db_schema.clone(),
        ticket_secret: cfg.ticket_secret.clone(),
        env_name: cfg.env_name.clone(),
        gateway,
        result_page_url: cfg.pay_result_page_url.clone(),
    };

    let internal = InternalAuthLayer::new(cfg.require_internal_secret, cfg.internal_secret.clone())
        .with_allowed_callers(cfg.internal_allowed_callers.clone());

    let authed = Router::new()
        .route("/bookings", post(handlers::create_booking))
        .route("/me/tickets", get(handlers::my_tickets))
        .route("/coupons/preview", post(handlers::preview_coupon))
        .route(
            "/orders/:order_id/abandon",
            post(handlers::abandon_order),
        )
        .layer(internal);

    let cors = if cfg.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(booking_cors_allowed_headers())
            .allow_credentials(false)
    } else {
        let origins: Vec<axum::http::HeaderValue> = cfg
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(booking_cors_allowed_headers())
            .allow_credentials(false)
            .allow_origin(AllowOrigin::list(origins))
    };

    let app = Router::new()
        .route("/health", get(handlers::health))
        // Public: the gateway return and the double-factor ticket lookup.
        .route("/payments/return", get(handlers::payment_return))
        .route("/tickets/lookup", get(handlers::lookup_ticket))
        .merge(authed)
        // Unknown routes return 404, not auth middleware fallback details.
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(cfg.max_body_bytes))
        .layer(SecurityHeadersLayer::for_env(&cfg.env_name))
        // Log the matched route template, never the raw path/query: callback
        // URLs carry signatures and contact details.
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str)
                    .unwrap_or("unmatched");
                tracing::span!(
                    tracing::Level::INFO,
                    "http_request",
                    method = %req.method(),
                    path = %path
                )
            }),
        )
        .layer(RequestIdLayer::new());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));
    tracing::info!(%addr, "starting vexe_booking_service");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn booking_cors_allowed_headers() -> Vec<HeaderName> {
    vec![
        header::ACCEPT,
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        HeaderName::from_static("x-request-id"),
        HeaderName::from_static("x-customer-id"),
    ]
}

#[cfg(test)]
mod router_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    #[tokio::test]
    async fn unknown_routes_return_404_not_internal_auth_required() {
        let internal = InternalAuthLayer::new(true, Some("test-secret".to_string()));
        let authed = Router::new()
            .route("/bookings", post(ok_handler))
            .layer(internal);

        let app = Router::new()
            .route("/health", get(ok_handler))
            .merge(authed)
            .fallback(|| async { StatusCode::NOT_FOUND });

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/does_not_exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn cors_whitelist_excludes_internal_headers() {
        let headers = booking_cors_allowed_headers();
        let has = |name: &str| {
            headers
                .iter()
                .any(|h| h.as_str().eq_ignore_ascii_case(name))
        };

        assert!(has("content-type"));
        assert!(has("x-request-id"));
        assert!(has("x-customer-id"));

        assert!(!has("x-vexe-internal-secret"));
        assert!(!has("x-vexe-caller"));
        assert!(!has("x-forwarded-for"));
        assert!(!has("cookie"));
    }
}
