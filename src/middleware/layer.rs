//! Tower layer enforcing an operation's quota before the inner service runs.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::{debug, info, instrument, warn};

use crate::ratelimit::{AdmissionPolicy, AdmissionRejection, Identity};

/// Origin recorded when a request carries no usable address.
const UNKNOWN_ORIGIN: &str = "unknown";

/// Authenticated subject id, inserted into request extensions by an
/// upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSubject(pub String);

/// Layer that admits or rejects requests for one protected operation.
#[derive(Clone)]
pub struct AdmissionLayer {
    policy: Arc<AdmissionPolicy>,
    operation: Arc<str>,
}

impl AdmissionLayer {
    pub fn new(policy: Arc<AdmissionPolicy>, operation: impl Into<Arc<str>>) -> Self {
        Self {
            policy,
            operation: operation.into(),
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            policy: self.policy.clone(),
            operation: self.operation.clone(),
        }
    }
}

/// Service produced by [`AdmissionLayer`].
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    policy: Arc<AdmissionPolicy>,
    operation: Arc<str>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();
        let operation = self.operation.clone();

        Box::pin(async move {
            let identity = resolve_identity(&req);

            match admit(&policy, &operation, &identity).await {
                Some(rejection) => Ok(too_many_requests(&rejection)),
                None => inner.call(req).await,
            }
        })
    }
}

/// Runs the policy, returning the rejection when the request is denied.
#[instrument(skip(policy, identity), fields(key = %identity.resolve_key()))]
async fn admit(policy: &AdmissionPolicy, operation: &str, identity: &Identity) -> Option<AdmissionRejection> {
    let decision = policy.check_operation(operation, identity).await?;
    match decision.rejection() {
        Some(rejection) => {
            info!(
                limit = rejection.limit,
                retry_after = rejection.retry_after,
                "Request rejected by admission control"
            );
            Some(rejection)
        }
        None => {
            debug!(remaining = decision.remaining, "Request admitted");
            None
        }
    }
}

/// Build the caller's identity from request extensions and proxy headers.
pub fn resolve_identity<B>(req: &Request<B>) -> Identity {
    let origin = client_ip(req)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string());

    match req.extensions().get::<AuthenticatedSubject>() {
        Some(subject) => Identity::authenticated(subject.0.clone(), origin),
        None => Identity::anonymous(origin),
    }
}

fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(addr) = req.extensions().get::<SocketAddr>() {
        return Some(addr.ip());
    }

    // First hop of X-Forwarded-For is the original client.
    if let Some(forwarded_for) = req.headers().get("x-forwarded-for") {
        if let Some(ip) = forwarded_for
            .to_str()
            .ok()
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse().ok())
        {
            return Some(ip);
        }
    }

    req.headers()
        .get("x-real-ip")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn too_many_requests<B: From<String>>(rejection: &AdmissionRejection) -> Response<B> {
    let mut response = Response::new(B::from(rejection.body().to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (name, value) in rejection.headers() {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(e) => warn!(header = %name, error = %e, "Skipping invalid rate limit header"),
        }
    }
    response
}
