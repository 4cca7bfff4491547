//! Partner authentication
//!
//! Two token formats authenticate calls between partners and the federation
//! service:
//!
//! - [`external`] tokens carry the signer's certificate in the `x5c` header and
//!   are verified against per-issuer trust anchors
//! - [`signed_request`] tokens bind a signature to the exact request body and a
//!   timestamp, so a captured token cannot be replayed against other content
//!
//! Trust anchors are never looked up from global state; verification takes an
//! injected [`AttributeResolver`] or [`KeyResolver`].

mod chain;
pub mod external;
mod keys;
mod request;
pub mod signed_request;
mod token_source;

use std::sync::LazyLock;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use chain::{
    AuthChain, AuthError, AuthStrategy, ExternalTokenStrategy, Principal, SignedRequestStrategy,
    StaticTokenStrategy,
};
pub use keys::{EcPublicKey, KeyError};
pub use request::{Body, HttpRequest};
pub use token_source::{
    authorization_header, ExternalTokenSource, PartnerTokenSource, SignedRequestTokenSource,
    TokenSource,
};

/// How an issuer proves its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMechanism {
    /// Stored value not recognized; always rejected
    Unknown,
    /// `authentication_id` is a base64 SubjectPublicKeyInfo
    PublicKey,
    /// `authentication_id` is a DNS name or IP the token certificate must cover
    Hostname,
}

impl From<u8> for AuthMechanism {
    fn from(value: u8) -> Self {
        match value {
            1 => AuthMechanism::PublicKey,
            2 => AuthMechanism::Hostname,
            _ => AuthMechanism::Unknown,
        }
    }
}

/// Trust anchor registered for one issuer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationAttributes {
    /// Verification strategy
    pub mechanism: AuthMechanism,
    /// Public key or expected subject name, depending on mechanism
    pub authentication_id: String,
    /// Root certificate PEM; only used by [`AuthMechanism::Hostname`]
    #[serde(default)]
    pub root_certificate_pem: String,
}

/// Issuer lookup failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No trust anchor registered for the issuer
    #[error("unknown issuer: {0}")]
    UnknownIssuer(String),

    /// Lookup itself failed
    #[error("issuer lookup failed: {0}")]
    Backend(String),
}

/// Resolves an external token issuer to its trust anchor
#[cfg_attr(test, mockall::automock)]
pub trait AttributeResolver: Send + Sync {
    /// Attributes registered for `issuer`
    fn resolve(&self, issuer: &str) -> Result<AuthenticationAttributes, ResolveError>;
}

impl<F> AttributeResolver for F
where
    F: Fn(&str) -> Result<AuthenticationAttributes, ResolveError> + Send + Sync,
{
    fn resolve(&self, issuer: &str) -> Result<AuthenticationAttributes, ResolveError> {
        self(issuer)
    }
}

/// Resolves a signed-request key id to its public key
#[cfg_attr(test, mockall::automock)]
pub trait KeyResolver: Send + Sync {
    /// Public key registered for `key_id`
    fn resolve_key(&self, key_id: &str) -> Result<EcPublicKey, ResolveError>;
}

impl<F> KeyResolver for F
where
    F: Fn(&str) -> Result<EcPublicKey, ResolveError> + Send + Sync,
{
    fn resolve_key(&self, key_id: &str) -> Result<EcPublicKey, ResolveError> {
        self(key_id)
    }
}

pub(crate) fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Decode claims without checking the signature, to learn who claims to have signed
pub(crate) fn peek_claims<T: DeserializeOwned>(
    token: &str,
) -> Result<T, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::ES256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    Ok(decode::<T>(token, &DecodingKey::from_secret(&[]), &validation)?.claims)
}

static BEARER_SPLITTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("(?i)bearer").expect("bearer pattern is valid"));

/// Extract the token from an `Authorization` header value.
///
/// The value is split once on a case-insensitive `bearer`; whatever follows,
/// trimmed, is the token. Returns `None` when nothing usable remains.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let mut parts = BEARER_SPLITTER.splitn(header_value, 2);
    let _scheme = parts.next()?;
    let token = parts.next()?.trim();
    (!token.is_empty()).then_some(token)
}
