//! Certificate-anchored bearer tokens between partners and the federation service
//!
//! An external token is an ES256 JWT with claims `{iss, exp}` whose header
//! carries the signer's DER certificate in `x5c`. The verifier learns the
//! claimed issuer from the unverified claims, resolves that issuer's trust
//! anchor, and only then checks the signature with the key the anchor yields.
//!
//! # Mechanisms
//!
//! - `PublicKey`: the anchor is a base64 SubjectPublicKeyInfo; the `x5c`
//!   certificate is ignored
//! - `Hostname`: the `x5c` certificate must chain to the anchor's root and be
//!   valid for the anchor's DNS name or IP; its key verifies the token
//!
//! Permits are a separate, non-JWT credential: a long random secret handed to
//! a partner out of band to bootstrap its first registration.

use base64::{engine::general_purpose::STANDARD, Engine};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, EncodingKey, Header, Validation};
use rcgen::{KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use zeroize::Zeroizing;

use super::{peek_claims, unix_now, AttributeResolver, AuthMechanism, EcPublicKey, KeyError, ResolveError};
use crate::error::ErrorKind;
use crate::pki::parse_certificate_pem;
use crate::tls::{verify_chain_and_name, TrustError};
use crate::EXTERNAL_TOKEN_LIFETIME;

/// Random bytes behind a permit secret
const PERMIT_SECRET_BYTES: usize = 256;

/// Token errors
#[derive(Debug, Error)]
pub enum TokenError {
    /// Token could not be decoded
    #[error("token is malformed: {0}")]
    Malformed(String),

    /// Header names an algorithm other than ES256
    #[error("unsupported signing algorithm {0}, only ES256 is accepted")]
    UnsupportedAlgorithm(String),

    /// `x5c` missing or not exactly one base64 DER certificate
    #[error("token header x5c must be an array of a single base64 encoded DER certificate")]
    BadCertificateHeader,

    /// Issuer is registered with a mechanism this verifier does not know
    #[error("unknown authentication mechanism for issuer {issuer}")]
    UnknownMechanism {
        /// Claimed issuer
        issuer: String,
    },

    /// Trust anchor lookup failed
    #[error("failed to resolve issuer: {0}")]
    Resolve(#[from] ResolveError),

    /// Token certificate rejected
    #[error("untrusted token certificate: {0}")]
    Trust(#[from] TrustError),

    /// Verification or signing key unusable
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// `exp` is in the past
    #[error("token has expired")]
    Expired,

    /// Signature does not verify under the resolved key
    #[error("token signature is invalid")]
    InvalidSignature,

    /// Serialization or signing failed
    #[error("failed to sign token: {0}")]
    Signing(String),

    /// System randomness unavailable
    #[error("failed to generate random secret")]
    Randomness,

    /// Permit window is empty or inverted
    #[error("permit must become valid before it expires")]
    InvalidPermitWindow,
}

impl TokenError {
    /// Failure category
    pub fn kind(&self) -> ErrorKind {
        match self {
            TokenError::Trust(_) => ErrorKind::Trust,
            TokenError::Signing(_) | TokenError::Randomness => ErrorKind::Internal,
            TokenError::InvalidPermitWindow => ErrorKind::Configuration,
            _ => ErrorKind::Authentication,
        }
    }
}

impl From<KeyError> for TokenError {
    fn from(e: KeyError) -> Self {
        TokenError::InvalidKey(e.0)
    }
}

pub(crate) fn classify_jwt_error(e: jsonwebtoken::errors::Error) -> TokenError {
    use jsonwebtoken::errors::ErrorKind as JwtErrorKind;

    match e.kind() {
        JwtErrorKind::ExpiredSignature => TokenError::Expired,
        JwtErrorKind::InvalidSignature => TokenError::InvalidSignature,
        JwtErrorKind::InvalidAlgorithm => {
            TokenError::UnsupportedAlgorithm("algorithm does not match key".to_string())
        }
        JwtErrorKind::InvalidEcdsaKey | JwtErrorKind::InvalidKeyFormat => {
            TokenError::InvalidKey(e.to_string())
        }
        _ => TokenError::Malformed(e.to_string()),
    }
}

/// Claims of an external token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalClaims {
    /// Issuer slug
    pub iss: String,
    /// Expiry, unix seconds
    pub exp: i64,
}

#[derive(Deserialize)]
struct ClaimedIssuer {
    #[serde(default)]
    iss: String,
}

/// ES256 signing key from a P-256 key pair
pub(crate) fn es256_signing_key(key: &KeyPair) -> Result<EncodingKey, TokenError> {
    if key.algorithm() != &PKCS_ECDSA_P256_SHA256 {
        return Err(TokenError::InvalidKey(
            "ES256 requires an ECDSA P-256 key".to_string(),
        ));
    }
    let der = Zeroizing::new(key.serialize_der());
    Ok(EncodingKey::from_ec_der(&der))
}

/// Issue a token for `issuer_slug` valid for five minutes
pub fn issue(
    issuer_slug: &str,
    certificate: &CertificateDer<'_>,
    key: &KeyPair,
) -> Result<String, TokenError> {
    issue_expiring_at(
        issuer_slug,
        certificate,
        key,
        unix_now() + EXTERNAL_TOKEN_LIFETIME.as_secs() as i64,
    )
}

/// Issue a token with an explicit expiry
pub fn issue_expiring_at(
    issuer_slug: &str,
    certificate: &CertificateDer<'_>,
    key: &KeyPair,
    expires_at: i64,
) -> Result<String, TokenError> {
    let mut header = Header::new(Algorithm::ES256);
    header.x5c = Some(vec![STANDARD.encode(certificate.as_ref())]);

    let claims = ExternalClaims {
        iss: issuer_slug.to_string(),
        exp: expires_at,
    };

    encode(&header, &claims, &es256_signing_key(key)?)
        .map_err(|e| TokenError::Signing(e.to_string()))
}

/// Verify a token and return its issuer.
///
/// The issuer is only trusted once the signature verifies under the key the
/// resolver's anchor yields, so a forged `iss` can do no more than select the
/// wrong anchor.
pub fn verify<R>(token: &str, resolver: &R) -> Result<String, TokenError>
where
    R: AttributeResolver + ?Sized,
{
    let header = decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
    if header.alg != Algorithm::ES256 {
        return Err(TokenError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
    }

    let claimed: ClaimedIssuer = peek_claims(token).map_err(classify_jwt_error)?;
    let attributes = resolver.resolve(&claimed.iss)?;

    let key = match attributes.mechanism {
        AuthMechanism::PublicKey => EcPublicKey::from_spki_base64(&attributes.authentication_id)?,
        AuthMechanism::Hostname => {
            let cert = header_certificate(&header)?;
            let root = parse_certificate_pem(&attributes.root_certificate_pem)
                .map_err(|e| TrustError::InvalidRoot(e.to_string()))?;
            verify_chain_and_name(&cert, &root, &attributes.authentication_id)?;
            EcPublicKey::from_certificate_der(&cert)?
        }
        AuthMechanism::Unknown => {
            return Err(TokenError::UnknownMechanism {
                issuer: claimed.iss,
            })
        }
    };

    let mut validation = Validation::new(Algorithm::ES256);
    validation.leeway = 0;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp"]);

    let data = decode::<ExternalClaims>(token, &key.decoding_key()?, &validation)
        .map_err(classify_jwt_error)?;

    debug!(issuer = %data.claims.iss, mechanism = ?attributes.mechanism, "External token verified");
    Ok(data.claims.iss)
}

fn header_certificate(header: &Header) -> Result<CertificateDer<'static>, TokenError> {
    let x5c = header.x5c.as_deref().ok_or(TokenError::BadCertificateHeader)?;
    let [encoded] = x5c else {
        return Err(TokenError::BadCertificateHeader);
    };
    let der = STANDARD
        .decode(encoded)
        .map_err(|_| TokenError::BadCertificateHeader)?;
    Ok(CertificateDer::from(der))
}

/// Out-of-band invitation credential bound to a slug and validity window
pub struct Permit {
    /// Partner slug the permit is for
    pub slug: String,
    /// Opaque context of the issuing organization
    pub organization_context: String,
    secret: Zeroizing<String>,
    /// Start of validity
    pub valid_from: OffsetDateTime,
    /// End of validity
    pub valid_until: OffsetDateTime,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("slug", &self.slug)
            .field("organization_context", &self.organization_context)
            .field("secret", &"[REDACTED]")
            .field("valid_from", &self.valid_from)
            .field("valid_until", &self.valid_until)
            .finish()
    }
}

impl Permit {
    /// Hex-encoded secret to hand to the partner
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Whether `at` falls inside the validity window
    pub fn is_valid_at(&self, at: OffsetDateTime) -> bool {
        self.valid_from <= at && at < self.valid_until
    }

    /// Constant-time comparison against a presented secret
    #[allow(deprecated)]
    pub fn matches(&self, presented: &str) -> bool {
        aws_lc_rs::constant_time::verify_slices_are_equal(
            self.secret.as_bytes(),
            presented.as_bytes(),
        )
        .is_ok()
    }
}

/// Create a permit with 256 random bytes of secret
pub fn create_permit(
    organization_context: &str,
    slug: &str,
    valid_from: OffsetDateTime,
    valid_until: OffsetDateTime,
) -> Result<Permit, TokenError> {
    if valid_until <= valid_from {
        return Err(TokenError::InvalidPermitWindow);
    }

    let mut raw = Zeroizing::new([0u8; PERMIT_SECRET_BYTES]);
    aws_lc_rs::rand::fill(&mut raw[..]).map_err(|_| TokenError::Randomness)?;

    Ok(Permit {
        slug: slug.to_string(),
        organization_context: organization_context.to_string(),
        secret: Zeroizing::new(hex::encode(&raw[..])),
        valid_from,
        valid_until,
    })
}
