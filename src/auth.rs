//! Identity gate for relay connections.
//!
//! Extracts a bearer credential from the upgrade handshake (cookie or header
//! named `access_token`, value `Bearer <token>`) and validates it against the
//! identity store. Rejection is a plain value, never a panic; the caller is
//! responsible for closing the socket with a policy-violation code before any
//! registry admission.

use axum::http::HeaderMap;
use thiserror::Error;

/// Privilege level attached to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRole {
    User,
    Admin,
}

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Email-like subject.
    pub subject: String,
    pub role: IdentityRole,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == IdentityRole::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing access token")]
    MissingToken,
    #[error("malformed access token")]
    MalformedToken,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("insufficient privileges")]
    InsufficientRole,
}

/// Token verification boundary. Issuance, expiry, and user storage live
/// behind this trait.
pub trait IdentityStore: Send + Sync {
    fn validate(&self, token: &str) -> Option<Identity>;
}

/// Identity store backed by a static token table from configuration.
#[derive(Debug, Default)]
pub struct StaticTokenStore {
    entries: Vec<(String, Identity)>,
}

impl StaticTokenStore {
    pub fn new(entries: Vec<(String, Identity)>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdentityStore for StaticTokenStore {
    fn validate(&self, token: &str) -> Option<Identity> {
        // Compare against every entry so lookup time does not depend on
        // which token matched.
        let mut found = None;
        for (expected, identity) in &self.entries {
            if timing_safe_eq(expected, token) {
                found = Some(identity.clone());
            }
        }
        found
    }
}

/// Timing-safe string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

/// Pull the bearer token out of the handshake headers.
///
/// Accepts the `access_token` cookie or an `access_token` header, in the
/// literal two-token form `Bearer <token>`. No credential at all is
/// `MissingToken`; a credential in any other shape (wrong scheme, extra
/// parts) is `MalformedToken`.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let raw = cookie_value(headers, "access_token")
        .or_else(|| header_value(headers, "access_token"))
        .ok_or(AuthError::MissingToken)?;
    parse_bearer(&raw).ok_or(AuthError::MalformedToken)
}

fn parse_bearer(raw: &str) -> Option<String> {
    let mut parts = raw.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get("cookie").and_then(|v| v.to_str().ok())?;
    for pair in cookies.split(';') {
        let mut kv = pair.trim().splitn(2, '=');
        let key = kv.next()?.trim();
        if key == name {
            let value = kv.next().unwrap_or_default().trim();
            // Cookie values carrying a space are often URL-encoded. Only
            // `%xx` escapes are decoded; a literal `+` stays a `+` so tokens
            // containing one survive the round trip.
            let decoded = percent_decode(value);
            if !decoded.is_empty() {
                return Some(decoded);
            }
        }
    }
    None
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Gate an agent upgrade request. Agents must present a valid token bound to
/// an admin identity.
pub fn authenticate_agent(
    headers: &HeaderMap,
    store: &dyn IdentityStore,
) -> Result<Identity, AuthError> {
    let token = extract_bearer_token(headers)?;
    let identity = store.validate(&token).ok_or(AuthError::InvalidToken)?;
    if !identity.is_admin() {
        return Err(AuthError::InsufficientRole);
    }
    Ok(identity)
}

/// Gate a client upgrade request.
///
/// Clients authenticate with any valid token. When `allow_anonymous` is set
/// the gate passes connections without a credential through with no
/// identity; a credential that is present but malformed is still rejected.
pub fn authenticate_client(
    headers: &HeaderMap,
    store: &dyn IdentityStore,
    allow_anonymous: bool,
) -> Result<Option<Identity>, AuthError> {
    match extract_bearer_token(headers) {
        Ok(token) => {
            let identity = store.validate(&token).ok_or(AuthError::InvalidToken)?;
            Ok(Some(identity))
        }
        Err(AuthError::MissingToken) if allow_anonymous => Ok(None),
        Err(err) => Err(err),
    }
}
