//! P-256 public keys as verification keys for ES256 tokens

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use jsonwebtoken::DecodingKey;
use thiserror::Error;
use x509_parser::oid_registry::OID_EC_P256;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

/// Uncompressed SEC1 point length for P-256
const P256_POINT_LEN: usize = 65;

/// Public key could not be used for ES256
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid public key: {0}")]
pub struct KeyError(pub String);

/// ECDSA P-256 public key
#[derive(Clone, PartialEq, Eq)]
pub struct EcPublicKey {
    point: Vec<u8>,
}

impl std::fmt::Debug for EcPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EcPublicKey")
            .field(&hex::encode(&self.point))
            .finish()
    }
}

impl EcPublicKey {
    /// Parse a DER SubjectPublicKeyInfo
    pub fn from_spki_der(der: &[u8]) -> Result<Self, KeyError> {
        let (_, spki) = SubjectPublicKeyInfo::from_der(der)
            .map_err(|e| KeyError(format!("failed to parse SubjectPublicKeyInfo: {}", e)))?;
        Self::from_spki(&spki)
    }

    /// Parse a base64 (standard alphabet) DER SubjectPublicKeyInfo
    pub fn from_spki_base64(encoded: &str) -> Result<Self, KeyError> {
        let der = STANDARD
            .decode(encoded.trim())
            .map_err(|e| KeyError(format!("public key is not base64: {}", e)))?;
        Self::from_spki_der(&der)
    }

    /// Take the subject public key of a DER certificate
    pub fn from_certificate_der(der: &[u8]) -> Result<Self, KeyError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| KeyError(format!("failed to parse certificate: {}", e)))?;
        Self::from_spki(cert.public_key())
    }

    fn from_spki(spki: &SubjectPublicKeyInfo<'_>) -> Result<Self, KeyError> {
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|params| params.as_oid().ok());
        if curve.as_ref() != Some(&OID_EC_P256) {
            return Err(KeyError("only P-256 keys are supported".into()));
        }

        match spki.parsed() {
            Ok(PublicKey::EC(point))
                if point.data().len() == P256_POINT_LEN && point.data()[0] == 0x04 =>
            {
                Ok(Self {
                    point: point.data().to_vec(),
                })
            }
            Ok(_) => Err(KeyError("only uncompressed P-256 keys are supported".into())),
            Err(e) => Err(KeyError(format!("failed to parse public key: {}", e))),
        }
    }

    /// Verification key for jsonwebtoken
    pub fn decoding_key(&self) -> Result<DecodingKey, KeyError> {
        let x = URL_SAFE_NO_PAD.encode(&self.point[1..33]);
        let y = URL_SAFE_NO_PAD.encode(&self.point[33..P256_POINT_LEN]);
        DecodingKey::from_ec_components(&x, &y).map_err(|e| KeyError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::PublicKeyData;
    use crate::pki::EphemeralCertificate;
    use rcgen::KeyPair;

    #[test]
    fn spki_and_certificate_give_same_key() {
        let key = KeyPair::generate().unwrap();
        let cert = EphemeralCertificate::issue(&key).unwrap();

        let from_spki = EcPublicKey::from_spki_der(&key.subject_public_key_info()).unwrap();
        let from_b64 = EcPublicKey::from_spki_base64(&STANDARD.encode(key.subject_public_key_info())).unwrap();
        let from_cert = EcPublicKey::from_certificate_der(cert.certificate_der()).unwrap();

        assert_eq!(from_spki, from_b64);
        assert_eq!(from_spki, from_cert);
        assert_eq!(from_spki.point, key.public_key_raw());
        assert!(from_spki.decoding_key().is_ok());
    }

    #[test]
    fn rejects_other_curves_with_same_point_size() {
        // openssl ecparam -name secp256k1 -genkey | openssl ec -pubout
        let secp256k1 = "MFYwEAYHKoZIzj0CAQYFK4EEAAoDQgAEukE76arIA5VF4HvXNcAqrkUGCt01KwK1yv0P1z1Z0cneX75wIcP6mHa9HLvuti04CxQO9kmUGX2F6Fbi7GU78Q==";
        let err = EcPublicKey::from_spki_base64(secp256k1).unwrap_err();
        assert!(err.0.contains("P-256"), "got {err}");

        let p384 = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        assert!(EcPublicKey::from_spki_der(&p384.subject_public_key_info()).is_err());
    }

    #[test]
    fn rejects_non_keys() {
        assert!(EcPublicKey::from_spki_base64("%%%").is_err());
        assert!(EcPublicKey::from_spki_der(b"garbage").is_err());
        assert!(EcPublicKey::from_certificate_der(b"garbage").is_err());
    }
}
