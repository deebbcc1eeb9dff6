use crate::error::LimiterError;
use crate::handlers::SharedState;
use crate::response::decorate_admitted;
use crate::throttler::Verdict;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use tracing::{info, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Admission control in front of the protected routes. Denied requests are
/// answered here with 429 and never reach the inner service.
pub async fn rate_limit_middleware(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = peer_address(&request);

    match state.throttler.check(request.headers(), peer).await {
        Verdict::Deny(rejection) => rejection.into_response(),
        Verdict::Admit(quota) => {
            let mut response = next.run(request).await;
            if state.throttler.expose_headers() {
                decorate_admitted(response.headers_mut(), &quota);
            }
            response
        }
        Verdict::Exempt | Verdict::FailOpen => next.run(request).await,
    }
}

/// Guards the admin routes with `Authorization: Bearer <token>`. Without a
/// configured token every admin request is refused.
pub async fn admin_auth_middleware(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        warn!(uri = %request.uri(), "Admin request refused, no admin token configured");
        return LimiterError::Unauthorized("admin API is disabled".to_string()).into_response();
    };

    match bearer_token(request.headers()) {
        Some(supplied) if tokens_match(supplied, expected) => next.run(request).await,
        _ => {
            warn!(uri = %request.uri(), "Admin request refused, missing or invalid token");
            LimiterError::Unauthorized("missing or invalid admin token".to_string()).into_response()
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Compares every byte so the time taken does not depend on where the
/// first mismatch is.
fn tokens_match(supplied: &str, expected: &str) -> bool {
    supplied.len() == expected.len()
        && supplied
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}

/// Logging middleware for request/response tracking. Tags every request with
/// an `x-request-id`, reusing the caller's when present.
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let supplied = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .filter(|value| !value.is_empty())
        .cloned();
    let request_id = match supplied {
        Some(existing) => existing,
        None => {
            let generated = HeaderValue::from_str(&Uuid::new_v4().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
            request
                .headers_mut()
                .insert(REQUEST_ID_HEADER, generated.clone());
            generated
        }
    };
    let request_id_log = request_id.to_str().unwrap_or("non-ascii").to_string();
    let peer = peer_address(&request)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    info!(
        target: "gatekeeper::middleware",
        request_id = %request_id_log,
        method = %method,
        uri = %uri,
        peer = %peer,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    let status = response.status();
    info!(
        target: "gatekeeper::middleware",
        request_id = %request_id_log,
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
    response
}

/// Socket address of the caller when the server was started with connect
/// info, or when a layer in front stored one.
pub fn peer_address(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .or_else(|| request.extensions().get::<SocketAddr>().map(SocketAddr::ip))
}
