use axum::http::{header::HeaderName, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};

/// Identity of the upstream service that passed internal auth, as claimed in
/// the caller header and checked against the allowlist. Inserted into request
/// extensions so handlers can attribute writes to the calling service.
#[derive(Clone, Debug)]
pub struct CallerService(pub String);

#[derive(Clone)]
pub struct InternalAuthLayer {
    required: bool,
    secret: Option<String>,
    secret_header: HeaderName,
    caller_header: HeaderName,
    allowed_callers: Vec<String>,
}

impl InternalAuthLayer {
    pub fn new(required: bool, secret: Option<String>) -> Self {
        Self {
            required,
            secret,
            secret_header: HeaderName::from_static("x-vexe-internal-secret"),
            caller_header: HeaderName::from_static("x-vexe-caller"),
            allowed_callers: Vec::new(),
        }
    }

    pub fn with_allowed_callers(mut self, callers: Vec<String>) -> Self {
        let mut out: Vec<String> = Vec::new();
        for raw in callers {
            let caller = raw.trim().to_ascii_lowercase();
            if caller.is_empty() || out.contains(&caller) {
                continue;
            }
            out.push(caller);
        }
        self.allowed_callers = out;
        self
    }
}

impl<S> Layer<S> for InternalAuthLayer {
    type Service = InternalAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InternalAuthService {
            inner,
            required: self.required,
            secret: self.secret.clone(),
            secret_header: self.secret_header.clone(),
            caller_header: self.caller_header.clone(),
            allowed_callers: self.allowed_callers.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InternalAuthService<S> {
    inner: S,
    required: bool,
    secret: Option<String>,
    secret_header: HeaderName,
    caller_header: HeaderName,
    allowed_callers: Vec<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
}

fn reject(status: StatusCode, detail: &'static str) -> Response {
    (status, axum::Json(ErrorBody { detail })).into_response()
}

impl<S, B> Service<Request<B>> for InternalAuthService<S>
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

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let required = self.required;
        let secret = self.secret.clone();
        let secret_header = self.secret_header.clone();
        let caller_header = self.caller_header.clone();
        let allowed_callers = self.allowed_callers.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let caller = req
                .headers()
                .get(&caller_header)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();

            if !required {
                if !caller.is_empty() {
                    req.extensions_mut().insert(CallerService(caller));
                }
                return inner.call(req).await;
            }

            let Some(secret) = secret.filter(|s| !s.trim().is_empty()) else {
                return Ok(reject(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "internal auth not configured",
                ));
            };

            let provided = req
                .headers()
                .get(&secret_header)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .unwrap_or("");
            if provided.is_empty() || provided.as_bytes().ct_eq(secret.as_bytes()).unwrap_u8() != 1
            {
                return Ok(reject(StatusCode::UNAUTHORIZED, "internal auth required"));
            }

            if !allowed_callers.is_empty()
                && (caller.is_empty() || !allowed_callers.contains(&caller))
            {
                return Ok(reject(
                    StatusCode::UNAUTHORIZED,
                    "internal caller not allowed",
                ));
            }

            if !caller.is_empty() {
                req.extensions_mut().insert(CallerService(caller));
            }
            inner.call(req).await
        })
    }
}
