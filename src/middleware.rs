//! Tower middleware wiring the admission controller into an HTTP stack.
//!
//! The layer sits in front of the routed service. Denied requests are
//! answered directly with `429 Too Many Requests` plus the standard
//! `X-RateLimit-*` and `Retry-After` headers; admitted requests proceed to
//! the inner service and get the same quota headers attached to whatever
//! response comes back.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use tower_layer::Layer;
use tower_service::Service;

use crate::admission::{AdmissionController, AdmissionDecision};

/// A layer that runs every request through an [`AdmissionController`].
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    controller: Arc<AdmissionController>,
    user_header: &'static str,
}

impl AdmissionLayer {
    /// Wrap services with admission control.
    ///
    /// The authenticated user id is read from `x-user-id`, expected to be
    /// set by an upstream auth middleware; its presence marks the request
    /// authenticated.
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self { controller, user_header: "x-user-id" }
    }

    /// Read the authenticated user id from a different trusted header.
    pub fn with_user_header(mut self, header: &'static str) -> Self {
        self.user_header = header;
        self
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            controller: Arc::clone(&self.controller),
            user_header: self.user_header,
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    controller: Arc<AdmissionController>,
    user_header: &'static str,
}

impl<S, B, ResB> Service<Request<B>> for AdmissionService<S>
where
    S: Service<Request<B>, Response = Response<ResB>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
    ResB: From<String>,
{
    type Response = Response<ResB>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let user_id = req
            .headers()
            .get(self.user_header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let decision =
            self.controller
                .check(req.headers(), req.uri().path(), user_id.as_deref());

        let mut inner = self.inner.clone();
        Box::pin(async move {
            if !decision.allowed {
                return Ok(too_many_requests(&decision));
            }

            let mut response = inner.call(req).await?;
            apply_quota_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

fn apply_quota_headers(headers: &mut HeaderMap, decision: &AdmissionDecision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_at));
}

fn too_many_requests<ResB: From<String>>(decision: &AdmissionDecision) -> Response<ResB> {
    let retry_after = decision.retry_after.unwrap_or(1);
    let body = serde_json::json!({
        "error": "Too many requests",
        "message": format!("Rate limit exceeded; retry in {retry_after}s"),
        "limit": decision.limit,
        "retryAfter": retry_after,
    });

    let mut response = Response::new(ResB::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    apply_quota_headers(response.headers_mut(), decision);
    response
        .headers_mut()
        .insert("retry-after", HeaderValue::from(retry_after));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
