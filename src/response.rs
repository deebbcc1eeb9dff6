use crate::algorithms::{whole_seconds, DenyReason, QuotaSnapshot};
use axum::{
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";

/// Body of a 429 answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    /// Seconds.
    pub retry_after: u64,
}

/// A denied request, ready to be rendered as `429 Too Many Requests`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub client_key: String,
    pub reason: DenyReason,
    pub retry_after_secs: u64,
    pub limit: u64,
    /// Unix seconds.
    pub reset_at: u64,
}

impl Rejection {
    pub fn new(client_key: &str, reason: DenyReason, retry_after: Duration, quota: &QuotaSnapshot) -> Self {
        let retry_millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
        Self {
            client_key: client_key.to_string(),
            reason,
            retry_after_secs: whole_seconds(retry_millis).as_secs(),
            limit: quota.limit,
            reset_at: reset_epoch_seconds(quota.reset_at_millis),
        }
    }

    pub fn body(&self) -> RejectionBody {
        RejectionBody {
            error: RATE_LIMIT_EXCEEDED.to_string(),
            message: format!("Too many requests from {}: {}", self.client_key, self.reason),
            retry_after: self.retry_after_secs,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(self.body())).into_response();
        let headers = response.headers_mut();
        headers.insert(header::RETRY_AFTER, HeaderValue::from(self.retry_after_secs));
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(0u64));
        headers.insert(RATE_LIMIT_RESET, HeaderValue::from(self.reset_at));
        response
    }
}

/// Attach the quota hints of an admitted request.
pub fn decorate_admitted(headers: &mut HeaderMap, quota: &QuotaSnapshot) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(
        RATE_LIMIT_RESET,
        HeaderValue::from(reset_epoch_seconds(quota.reset_at_millis)),
    );
}

/// Unix milliseconds to Unix seconds, rounded up.
pub fn reset_epoch_seconds(millis: u64) -> u64 {
    millis.div_ceil(1000)
}
