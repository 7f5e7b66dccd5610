use axum::http::{HeaderMap, HeaderValue, Request};
use axum::response::Response;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Static response-hardening headers. HSTS is only meaningful behind TLS, so
/// it defaults on for prod-like environments and off elsewhere.
#[derive(Clone, Debug)]
pub struct SecurityHeadersLayer {
    hsts_enabled: bool,
}

impl SecurityHeadersLayer {
    pub fn new(hsts_enabled: bool) -> Self {
        Self { hsts_enabled }
    }

    pub fn for_env(env_name: &str) -> Self {
        Self::new(crate::secret_policy::is_production_like(env_name))
    }
}

impl<S> Layer<S> for SecurityHeadersLayer {
    type Service = SecurityHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityHeadersService {
            inner,
            hsts_enabled: self.hsts_enabled,
        }
    }
}

#[derive(Clone)]
pub struct SecurityHeadersService<S> {
    inner: S,
    hsts_enabled: bool,
}

pub fn apply_security_headers(headers: &mut HeaderMap, hsts_enabled: bool) {
    let pairs: &[(&str, &str)] = &[
        ("x-content-type-options", "nosniff"),
        ("x-frame-options", "DENY"),
        ("referrer-policy", "no-referrer"),
        ("cache-control", "no-store"),
    ];
    for (name, value) in pairs {
        if !headers.contains_key(*name) {
            headers.insert(*name, HeaderValue::from_static(value));
        }
    }
    if hsts_enabled && !headers.contains_key("strict-transport-security") {
        headers.insert(
            "strict-transport-security",
            HeaderValue::from_static("max-age=63072000; includeSubDomains"),
        );
    }
}

impl<S, B> Service<Request<B>> for SecurityHeadersService<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let hsts_enabled = self.hsts_enabled;
        let mut inner = self.inner.clone();
        Box::pin(async move {
            let mut resp = inner.call(req).await?;
            apply_security_headers(resp.headers_mut(), hsts_enabled);
            Ok(resp)
        })
    }
}
