//! Detached request signatures with replay protection
//!
//! A signed request carries an ES256 JWT in `Authorization: Bearer` whose
//! claims bind it to the body (`b`, a base64url SHA-256 of the exact bytes
//! sent) and to a moment (`ts`, unix seconds). The verifier recomputes the
//! digest over what it actually received and refuses timestamps more than
//! ten minutes away from its own clock in either direction.
//!
//! Claim checks run before the key lookup, so a replayed or tampered request
//! never reaches the resolver.

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::URL_SAFE, Engine};
use jsonwebtoken::{decode, decode_header, encode, Algorithm, Header, Validation};
use rcgen::KeyPair;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::external::es256_signing_key;
use super::{bearer_token, peek_claims, unix_now, HttpRequest, KeyError, KeyResolver, ResolveError};
use crate::error::ErrorKind;
use crate::SIGNED_REQUEST_MAX_AGE;

/// Claims of a signed request token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequestClaims {
    /// Key id of the signer
    #[serde(default)]
    pub iss: String,
    /// Optional expiry, unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// base64url SHA-256 of the request body
    #[serde(default)]
    pub b: String,
    /// When the request was signed, unix seconds
    #[serde(default, alias = "TS")]
    pub ts: i64,
}

/// Signed request errors
#[derive(Debug, Error)]
pub enum SignedRequestError {
    /// No bearer token in `Authorization`
    #[error("missing auth token")]
    MissingToken,

    /// Request body could not be read
    #[error("failed to read request body: {0}")]
    Body(#[from] std::io::Error),

    /// Header names an algorithm other than ES256
    #[error("unsupported signing algorithm {0}, only ES256 is accepted")]
    UnsupportedAlgorithm(String),

    /// Token could not be decoded
    #[error("token is malformed: {0}")]
    Malformed(String),

    /// `b`, `iss` or `ts` absent or empty
    #[error("missing issuer, checksum or timestamp claims")]
    MissingClaims,

    /// `b` does not match the received body
    #[error("checksum claim doesn't match request body")]
    ChecksumMismatch,

    /// `ts` outside the accepted window
    #[error("timestamp claim is {age_secs}s away from now, request too old or too new")]
    StaleTimestamp {
        /// Verifier time minus `ts`; negative when signed in the future
        age_secs: i64,
    },

    /// Key lookup failed
    #[error("failed to resolve signing key: {0}")]
    Resolve(#[from] ResolveError),

    /// Verification or signing key unusable
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Signature does not verify
    #[error("token signature is invalid")]
    InvalidSignature,

    /// `exp` is in the past
    #[error("token has expired")]
    Expired,

    /// Signing failed
    #[error("failed to sign request: {0}")]
    Signing(String),
}

impl SignedRequestError {
    /// Failure category
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignedRequestError::ChecksumMismatch | SignedRequestError::StaleTimestamp { .. } => {
                ErrorKind::Replay
            }
            SignedRequestError::Body(_) | SignedRequestError::Signing(_) => ErrorKind::Internal,
            _ => ErrorKind::Authentication,
        }
    }
}

impl From<KeyError> for SignedRequestError {
    fn from(e: KeyError) -> Self {
        SignedRequestError::InvalidKey(e.0)
    }
}

fn classify_jwt_error(e: jsonwebtoken::errors::Error) -> SignedRequestError {
    use jsonwebtoken::errors::ErrorKind as JwtErrorKind;

    match e.kind() {
        JwtErrorKind::ExpiredSignature => SignedRequestError::Expired,
        JwtErrorKind::InvalidSignature => SignedRequestError::InvalidSignature,
        JwtErrorKind::InvalidAlgorithm => {
            SignedRequestError::UnsupportedAlgorithm("algorithm does not match key".to_string())
        }
        JwtErrorKind::InvalidEcdsaKey | JwtErrorKind::InvalidKeyFormat => {
            SignedRequestError::InvalidKey(e.to_string())
        }
        _ => SignedRequestError::Malformed(e.to_string()),
    }
}

/// base64url (padded) SHA-256 of a request body
pub fn body_checksum(body: &[u8]) -> String {
    URL_SAFE.encode(digest(&SHA256, body).as_ref())
}

/// Sign `body` on behalf of `key_id`, timestamped now
pub fn sign(key_id: &str, body: &[u8], key: &KeyPair) -> Result<String, SignedRequestError> {
    sign_at(key_id, body, key, unix_now())
}

/// Sign `body` with an explicit timestamp
pub fn sign_at(
    key_id: &str,
    body: &[u8],
    key: &KeyPair,
    ts: i64,
) -> Result<String, SignedRequestError> {
    let claims = SignedRequestClaims {
        iss: key_id.to_string(),
        exp: None,
        b: body_checksum(body),
        ts,
    };
    let signing_key =
        es256_signing_key(key).map_err(|e| SignedRequestError::InvalidKey(e.to_string()))?;

    encode(&Header::new(Algorithm::ES256), &claims, &signing_key)
        .map_err(|e| SignedRequestError::Signing(e.to_string()))
}

/// Verify a signed request against the current time
pub fn verify<R>(
    request: &mut HttpRequest,
    resolver: &R,
) -> Result<SignedRequestClaims, SignedRequestError>
where
    R: KeyResolver + ?Sized,
{
    verify_at(request, resolver, unix_now())
}

/// Verify a signed request as of `now` (unix seconds).
///
/// The body is read in full and stays available on `request` afterwards.
pub fn verify_at<R>(
    request: &mut HttpRequest,
    resolver: &R,
    now: i64,
) -> Result<SignedRequestClaims, SignedRequestError>
where
    R: KeyResolver + ?Sized,
{
    let token = request
        .authorization()
        .and_then(bearer_token)
        .ok_or(SignedRequestError::MissingToken)?
        .to_string();

    let body = request.read_body()?;
    let checksum = body_checksum(&body);

    let header = decode_header(&token).map_err(|e| SignedRequestError::Malformed(e.to_string()))?;
    if header.alg != Algorithm::ES256 {
        return Err(SignedRequestError::UnsupportedAlgorithm(format!(
            "{:?}",
            header.alg
        )));
    }

    let claimed: SignedRequestClaims = peek_claims(&token).map_err(classify_jwt_error)?;
    if claimed.b.is_empty() || claimed.iss.is_empty() || claimed.ts == 0 {
        return Err(SignedRequestError::MissingClaims);
    }
    if claimed.b != checksum {
        warn!(key_id = %claimed.iss, "Signed request body does not match checksum claim");
        return Err(SignedRequestError::ChecksumMismatch);
    }

    let age_secs = now.saturating_sub(claimed.ts);
    if age_secs.unsigned_abs() > SIGNED_REQUEST_MAX_AGE.as_secs() {
        warn!(key_id = %claimed.iss, age_secs, "Signed request timestamp outside window");
        return Err(SignedRequestError::StaleTimestamp { age_secs });
    }

    let key = resolver.resolve_key(&claimed.iss)?;

    let mut validation = Validation::new(Algorithm::ES256);
    validation.leeway = 0;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<SignedRequestClaims>(&token, &key.decoding_key()?, &validation)
        .map_err(classify_jwt_error)?;

    debug!(key_id = %data.claims.iss, "Signed request verified");
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::PublicKeyData;
    use crate::auth::{EcPublicKey, MockKeyResolver};
    use bytes::Bytes;
    use http::header::AUTHORIZATION;
    use http::{HeaderMap, HeaderValue};

    fn request(token: &str, body: &'static [u8]) -> HttpRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        HttpRequest::streaming(headers, std::io::Cursor::new(body))
    }

    fn resolver_for(
        key: &KeyPair,
    ) -> impl Fn(&str) -> Result<EcPublicKey, ResolveError> + Send + Sync {
        let public = EcPublicKey::from_spki_der(&key.subject_public_key_info()).unwrap();
        move |key_id: &str| {
            if key_id == "key-1" {
                Ok(public.clone())
            } else {
                Err(ResolveError::UnknownIssuer(key_id.to_string()))
            }
        }
    }

    // ==========================================================================
    // Story Tests: Service Account Calls the Admin API
    // ==========================================================================

    /// Story: a fresh, untampered request passes and its body reaches the handler
    #[test]
    fn story_valid_signed_request() {
        let key = KeyPair::generate().unwrap();
        let body: &'static [u8] = b"{\"match_id\":\"m-1\"}";
        let token = sign("key-1", body, &key).unwrap();

        let mut req = request(&token, body);
        let claims = verify(&mut req, &resolver_for(&key)).unwrap();

        assert_eq!(claims.iss, "key-1");
        assert_eq!(claims.b, body_checksum(body));
        assert_eq!(req.read_body().unwrap(), Bytes::from_static(body));
    }

    /// Story: an attacker replays a captured request eleven minutes later
    #[test]
    fn story_stale_request_is_rejected() {
        let key = KeyPair::generate().unwrap();
        let body: &'static [u8] = b"{}";
        let now = unix_now();

        let old = sign_at("key-1", body, &key, now - 11 * 60).unwrap();
        let err = verify_at(&mut request(&old, body), &resolver_for(&key), now).unwrap_err();
        assert!(
            matches!(err, SignedRequestError::StaleTimestamp { age_secs: 660 }),
            "got {err:?}"
        );
        assert_eq!(err.kind(), ErrorKind::Replay);

        let future = sign_at("key-1", body, &key, now + 11 * 60).unwrap();
        let err = verify_at(&mut request(&future, body), &resolver_for(&key), now).unwrap_err();
        assert!(matches!(err, SignedRequestError::StaleTimestamp { age_secs: -660 }));

        let edge = sign_at("key-1", body, &key, now - 10 * 60).unwrap();
        assert!(verify_at(&mut request(&edge, body), &resolver_for(&key), now).is_ok());
    }

    /// Story: a forged timestamp at the ends of the integer range is just stale
    #[test]
    fn story_extreme_timestamps_are_stale() {
        let key = KeyPair::generate().unwrap();
        let body: &'static [u8] = b"{}";
        let now = 1_700_000_000;

        let mut resolver = MockKeyResolver::new();
        resolver.expect_resolve_key().never();

        for ts in [i64::MIN, i64::MAX] {
            let token = sign_at("key-1", body, &key, ts).unwrap();
            let err = verify_at(&mut request(&token, body), &resolver, now).unwrap_err();
            assert!(
                matches!(err, SignedRequestError::StaleTimestamp { .. }),
                "ts {ts}: got {err:?}"
            );
            assert_eq!(err.kind(), ErrorKind::Replay);
        }
    }

    /// Story: an attacker swaps the body under a valid signature
    #[test]
    fn story_tampered_body_is_rejected() {
        let key = KeyPair::generate().unwrap();
        let token = sign("key-1", b"{\"amount\":1}", &key).unwrap();

        let mut resolver = MockKeyResolver::new();
        resolver.expect_resolve_key().never();

        let err = verify(&mut request(&token, b"{\"amount\":1000}"), &resolver).unwrap_err();
        assert!(matches!(err, SignedRequestError::ChecksumMismatch));
        assert_eq!(err.kind(), ErrorKind::Replay);
    }

    /// Story: someone signs with a key that is not registered for the key id
    #[test]
    fn story_wrong_key_is_rejected() {
        let registered = KeyPair::generate().unwrap();
        let attacker = KeyPair::generate().unwrap();
        let body: &'static [u8] = b"{}";
        let token = sign("key-1", body, &attacker).unwrap();

        let err = verify(&mut request(&token, body), &resolver_for(&registered)).unwrap_err();
        assert!(matches!(err, SignedRequestError::InvalidSignature));
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn missing_authorization_is_rejected() {
        let mut resolver = MockKeyResolver::new();
        resolver.expect_resolve_key().never();

        let mut req = HttpRequest::new(HeaderMap::new(), "{}");
        assert!(matches!(
            verify(&mut req, &resolver),
            Err(SignedRequestError::MissingToken)
        ));
    }

    #[test]
    fn missing_claims_are_rejected() {
        let key = KeyPair::generate().unwrap();
        let signing_key = es256_signing_key(&key).unwrap();
        let claims = serde_json::json!({ "iss": "key-1", "ts": unix_now() });
        let token = encode(&Header::new(Algorithm::ES256), &claims, &signing_key).unwrap();

        let err = verify(&mut request(&token, b"{}"), &resolver_for(&key)).unwrap_err();
        assert!(matches!(err, SignedRequestError::MissingClaims));
    }

    #[test]
    fn uppercase_timestamp_claim_is_accepted() {
        let key = KeyPair::generate().unwrap();
        let signing_key = es256_signing_key(&key).unwrap();
        let body: &'static [u8] = b"payload";
        let claims = serde_json::json!({
            "iss": "key-1",
            "b": body_checksum(body),
            "TS": unix_now(),
        });
        let token = encode(&Header::new(Algorithm::ES256), &claims, &signing_key).unwrap();

        assert!(verify(&mut request(&token, body), &resolver_for(&key)).is_ok());
    }

    #[test]
    fn expired_exp_claim_is_rejected() {
        let key = KeyPair::generate().unwrap();
        let signing_key = es256_signing_key(&key).unwrap();
        let body: &'static [u8] = b"payload";
        let claims = SignedRequestClaims {
            iss: "key-1".to_string(),
            exp: Some(unix_now() - 60),
            b: body_checksum(body),
            ts: unix_now(),
        };
        let token = encode(&Header::new(Algorithm::ES256), &claims, &signing_key).unwrap();

        let err = verify(&mut request(&token, body), &resolver_for(&key)).unwrap_err();
        assert!(matches!(err, SignedRequestError::Expired));
    }

    #[test]
    fn unknown_key_id_propagates_resolver_error() {
        let key = KeyPair::generate().unwrap();
        let body: &'static [u8] = b"{}";
        let token = sign("key-2", body, &key).unwrap();

        let err = verify(&mut request(&token, body), &resolver_for(&key)).unwrap_err();
        assert!(matches!(
            err,
            SignedRequestError::Resolve(ResolveError::UnknownIssuer(_))
        ));
    }

    #[test]
    fn checksum_is_padded_base64url_sha256() {
        assert_eq!(
            body_checksum(b""),
            "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }
}
