//! Error types for match trust and transport operations

use thiserror::Error;

use crate::auth::external::TokenError;
use crate::auth::AuthError;
use crate::auth::signed_request::SignedRequestError;
use crate::config::ConfigError;
use crate::identifiers::IdentifierError;
use crate::negotiate::NegotiationError;
use crate::network::TransportError;
use crate::orchestrator::MatchError;
use crate::pki::PkiError;
use crate::tls::{TlsError, TrustError};

/// Failure categories callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad signature, unknown issuer, unsupported algorithm, expired token
    Authentication,
    /// Untrusted chain, name mismatch, pin mismatch
    Trust,
    /// Checksum mismatch or stale timestamp
    Replay,
    /// Dial, handshake, or accept failure
    Transport,
    /// Negotiation or PSI engine failure
    Protocol,
    /// A polling or overall deadline elapsed
    OrchestrationTimeout,
    /// Invalid configuration or key material
    Configuration,
    /// Anything else
    Internal,
}

/// Main error type for match operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Certificate or key material error
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// TLS configuration error
    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    /// Peer trust decision failed
    #[error("trust error: {0}")]
    Trust(#[from] TrustError),

    /// External token issue or verification failed
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// Signed request verification failed
    #[error("signed request error: {0}")]
    SignedRequest(#[from] SignedRequestError),

    /// Inbound request rejected by every strategy
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Data channel could not be established
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Protocol negotiation failed
    #[error("negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Match orchestration failed
    #[error("match error: {0}")]
    Match(#[from] MatchError),

    /// Identifier ingestion failed
    #[error("identifier error: {0}")]
    Identifiers(#[from] IdentifierError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Category of this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Pki(_) => ErrorKind::Configuration,
            Error::Tls(_) => ErrorKind::Configuration,
            Error::Trust(_) => ErrorKind::Trust,
            Error::Token(e) => e.kind(),
            Error::SignedRequest(e) => e.kind(),
            Error::Auth(e) => e.kind(),
            Error::Transport(e) => e.kind(),
            Error::Negotiation(_) => ErrorKind::Protocol,
            Error::Match(e) => e.kind(),
            Error::Identifiers(_) => ErrorKind::Configuration,
            Error::Config(_) => ErrorKind::Configuration,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may reasonably try the whole operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::OrchestrationTimeout
        )
    }
}
