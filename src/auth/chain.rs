//! Ordered authentication strategies
//!
//! An inbound request is offered to each strategy in turn. The first one to
//! accept it decides the principal; if none does, the caller sees the error of
//! the last strategy tried.

use thiserror::Error;
use tracing::debug;

use super::external::{self, TokenError};
use super::signed_request::{self, SignedRequestError};
use super::{bearer_token, AttributeResolver, HttpRequest, KeyResolver};
use crate::error::ErrorKind;

/// Who a request was authenticated as
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Holder of the shared internal token
    Internal,
    /// Service account identified by its signing key id
    ServiceKey {
        /// Key id from the signed request
        key_id: String,
    },
    /// Partner identified by its issuer slug
    Partner {
        /// Verified issuer slug
        slug: String,
    },
}

/// Authentication failures
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credentials in the request
    #[error("missing auth token")]
    MissingToken,

    /// Credentials present but not accepted
    #[error("invalid auth token")]
    InvalidToken,

    /// Signed request rejected
    #[error(transparent)]
    SignedRequest(#[from] SignedRequestError),

    /// External token rejected
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Chain has no strategies
    #[error("no authentication strategies configured")]
    NoStrategies,
}

impl AuthError {
    /// Failure category
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::SignedRequest(e) => e.kind(),
            AuthError::Token(e) => e.kind(),
            AuthError::NoStrategies => ErrorKind::Configuration,
            _ => ErrorKind::Authentication,
        }
    }
}

/// One way of authenticating an inbound request
pub trait AuthStrategy: Send + Sync {
    /// Authenticate `request`; strategies may buffer its body
    fn authenticate(&self, request: &mut HttpRequest) -> Result<Principal, AuthError>;
}

/// Tries strategies in order until one succeeds
#[derive(Default)]
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    /// Empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a strategy
    pub fn with(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }
}

impl AuthStrategy for AuthChain {
    fn authenticate(&self, request: &mut HttpRequest) -> Result<Principal, AuthError> {
        let mut last_error = AuthError::NoStrategies;
        for (index, strategy) in self.strategies.iter().enumerate() {
            match strategy.authenticate(request) {
                Ok(principal) => return Ok(principal),
                Err(e) => {
                    debug!(strategy = index, error = %e, "Authentication strategy rejected request");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Shared internal token compared in constant time
pub struct StaticTokenStrategy {
    token: zeroize::Zeroizing<String>,
}

impl StaticTokenStrategy {
    /// Accept requests bearing `token`
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: zeroize::Zeroizing::new(token.into()),
        }
    }
}

impl std::fmt::Debug for StaticTokenStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenStrategy")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl AuthStrategy for StaticTokenStrategy {
    #[allow(deprecated)]
    fn authenticate(&self, request: &mut HttpRequest) -> Result<Principal, AuthError> {
        let presented = request
            .authorization()
            .and_then(bearer_token)
            .ok_or(AuthError::MissingToken)?;

        aws_lc_rs::constant_time::verify_slices_are_equal(
            self.token.as_bytes(),
            presented.as_bytes(),
        )
        .map(|_| Principal::Internal)
        .map_err(|_| AuthError::InvalidToken)
    }
}

/// Detached request signatures checked against a key resolver
pub struct SignedRequestStrategy<R> {
    resolver: R,
}

impl<R: KeyResolver> SignedRequestStrategy<R> {
    /// Verify signatures with keys from `resolver`
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }
}

impl<R: KeyResolver> AuthStrategy for SignedRequestStrategy<R> {
    fn authenticate(&self, request: &mut HttpRequest) -> Result<Principal, AuthError> {
        let claims = signed_request::verify(request, &self.resolver)?;
        Ok(Principal::ServiceKey {
            key_id: claims.iss,
        })
    }
}

/// Certificate-anchored partner tokens
pub struct ExternalTokenStrategy<R> {
    resolver: R,
}

impl<R: AttributeResolver> ExternalTokenStrategy<R> {
    /// Verify tokens against anchors from `resolver`
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }
}

impl<R: AttributeResolver> AuthStrategy for ExternalTokenStrategy<R> {
    fn authenticate(&self, request: &mut HttpRequest) -> Result<Principal, AuthError> {
        let token = request
            .authorization()
            .and_then(bearer_token)
            .ok_or(AuthError::MissingToken)?;
        let slug = external::verify(token, &self.resolver)?;
        Ok(Principal::Partner { slug })
    }
}
