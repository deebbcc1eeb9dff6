//! Client identity resolution for rate limiting keys.

use axum::http::HeaderMap;
use std::fmt;
use std::net::IpAddr;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Key shared by all requests carrying no identity at all.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Where a client key came from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    ApiKey,
    UserId,
    TenantId,
    NetworkAddress,
}

impl IdentitySource {
    pub fn prefix(&self) -> &'static str {
        match self {
            IdentitySource::ApiKey => "api_key",
            IdentitySource::UserId => "user",
            IdentitySource::TenantId => "tenant",
            IdentitySource::NetworkAddress => "ip",
        }
    }
}

/// A resolved rate limit key such as `api_key:abc123` or `ip:10.0.0.7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    fn new(source: IdentitySource, value: &str) -> Self {
        Self(format!("{}:{}", source.prefix(), value))
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_CLIENT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives the rate limit key for a request from the identity attached by the
/// authentication layer, falling back to the caller's network address.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIdentityResolver;

impl ClientIdentityResolver {
    pub fn new() -> Self {
        Self
    }

    /// API key, then user id, then tenant id, then network address. Never
    /// empty: with no identity at all the key is `unknown`.
    pub fn resolve(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> ClientKey {
        let header_sources = [
            (IdentitySource::ApiKey, API_KEY_HEADER),
            (IdentitySource::UserId, USER_ID_HEADER),
            (IdentitySource::TenantId, TENANT_ID_HEADER),
        ];
        for (source, header) in header_sources {
            if let Some(value) = header_value(headers, header) {
                return ClientKey::new(source, value);
            }
        }

        match Self::client_address(headers, peer) {
            Some(address) => ClientKey::new(IdentitySource::NetworkAddress, &address),
            None => ClientKey::unknown(),
        }
    }

    /// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the peer socket
    /// address.
    pub fn client_address(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<String> {
        header_value(headers, FORWARDED_FOR_HEADER)
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty() && !hop.eq_ignore_ascii_case(UNKNOWN_CLIENT))
            .or_else(|| header_value(headers, REAL_IP_HEADER))
            .map(str::to_string)
            .or_else(|| peer.map(|ip| ip.to_string()))
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
