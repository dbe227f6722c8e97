//! Handshake authentication.
//!
//! Token formats are out of scope here: an [`AuthGate`] turns whatever the
//! upgrade request carries into an authenticated identity plus an optional
//! session, or rejects it. Rejected upgrades are closed with 1008.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use tether_core::SessionId;
use thiserror::Error;

/// Header carrying the identity for [`HeaderAuthGate`].
pub const IDENTITY_HEADER: &str = "x-tether-identity";
/// Query parameter fallback for the identity.
pub const IDENTITY_QUERY: &str = "identity";
/// Query parameter carrying the initial session.
pub const SESSION_QUERY: &str = "session_id";

/// What the upgrade request carried.
#[derive(Clone, Debug, Default)]
pub struct Handshake {
    /// Request headers.
    pub headers: HeaderMap,
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
}

/// An authenticated peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    /// Authenticated identity.
    pub identity: String,
    /// Initial session, if the client asked for one.
    pub session: Option<SessionId>,
}

/// Why a handshake was refused.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AuthRejection {
    /// No identity was presented.
    #[error("missing identity")]
    MissingIdentity,
    /// Credentials were presented but are not acceptable.
    #[error("invalid credentials: {0}")]
    Invalid(String),
}

/// Resolves a handshake to a [`Principal`].
#[async_trait]
pub trait AuthGate: Send + Sync + 'static {
    /// Authenticate one upgrade request.
    async fn authenticate(&self, handshake: &Handshake) -> Result<Principal, AuthRejection>;
}

/// Trusts the `x-tether-identity` header (or `identity` query parameter).
///
/// Meant to sit behind a reverse proxy that has already authenticated the
/// caller and sets the header.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderAuthGate;

#[async_trait]
impl AuthGate for HeaderAuthGate {
    async fn authenticate(&self, handshake: &Handshake) -> Result<Principal, AuthRejection> {
        let from_header = match handshake.headers.get(IDENTITY_HEADER) {
            Some(value) => Some(
                value
                    .to_str()
                    .map_err(|_| {
                        AuthRejection::Invalid("identity header is not visible ASCII".into())
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };
        let identity = from_header
            .or_else(|| handshake.query.get(IDENTITY_QUERY).map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
            .ok_or(AuthRejection::MissingIdentity)?;

        let session = handshake
            .query
            .get(SESSION_QUERY)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(SessionId::from);

        Ok(Principal { identity, session })
    }
}
