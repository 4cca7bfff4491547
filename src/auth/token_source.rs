//! Bearer tokens for outgoing RPCs
//!
//! Every call mints a fresh token: tokens expire within minutes and signed
//! request tokens are bound to the body they accompany.

use jsonwebtoken::{encode, Algorithm, Header};
use rcgen::KeyPair;
use rustls::pki_types::CertificateDer;

use super::external::{self, es256_signing_key, ExternalClaims, TokenError};
use super::signed_request::{self, SignedRequestError};
use super::unix_now;
use crate::PARTNER_TOKEN_LIFETIME;

/// Produces the bearer token for one outgoing request body
pub trait TokenSource: Send + Sync {
    /// Token authorizing a request carrying `body`
    fn token(&self, body: &[u8]) -> Result<String, TokenError>;
}

/// `Authorization` header value for a bearer token
pub fn authorization_header(token: &str) -> String {
    format!("Bearer {token}")
}

/// Certificate-anchored tokens in the name of a partner slug
pub struct ExternalTokenSource {
    slug: String,
    certificate: CertificateDer<'static>,
    key: KeyPair,
}

impl ExternalTokenSource {
    /// Sign as `slug`, embedding `certificate` in every token
    pub fn new(slug: impl Into<String>, certificate: CertificateDer<'static>, key: KeyPair) -> Self {
        Self {
            slug: slug.into(),
            certificate,
            key,
        }
    }
}

impl TokenSource for ExternalTokenSource {
    fn token(&self, _body: &[u8]) -> Result<String, TokenError> {
        external::issue(&self.slug, &self.certificate, &self.key)
    }
}

/// Partner-id tokens without an embedded certificate
pub struct PartnerTokenSource {
    partner_id: String,
    key: KeyPair,
}

impl PartnerTokenSource {
    /// Sign as `partner_id` with the partner's long-lived key
    pub fn new(partner_id: impl Into<String>, key: KeyPair) -> Self {
        Self {
            partner_id: partner_id.into(),
            key,
        }
    }
}

impl TokenSource for PartnerTokenSource {
    fn token(&self, _body: &[u8]) -> Result<String, TokenError> {
        let claims = ExternalClaims {
            iss: self.partner_id.clone(),
            exp: unix_now() + PARTNER_TOKEN_LIFETIME.as_secs() as i64,
        };
        encode(
            &Header::new(Algorithm::ES256),
            &claims,
            &es256_signing_key(&self.key)?,
        )
        .map_err(|e| TokenError::Signing(e.to_string()))
    }
}

/// Body-bound signed request tokens
pub struct SignedRequestTokenSource {
    key_id: String,
    key: KeyPair,
}

impl SignedRequestTokenSource {
    /// Sign as `key_id`
    pub fn new(key_id: impl Into<String>, key: KeyPair) -> Self {
        Self {
            key_id: key_id.into(),
            key,
        }
    }
}

impl TokenSource for SignedRequestTokenSource {
    fn token(&self, body: &[u8]) -> Result<String, TokenError> {
        signed_request::sign(&self.key_id, body, &self.key).map_err(|e| match e {
            SignedRequestError::InvalidKey(msg) => TokenError::InvalidKey(msg),
            other => TokenError::Signing(other.to_string()),
        })
    }
}
