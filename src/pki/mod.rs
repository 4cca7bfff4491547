//! PKI operations for match certificates
//!
//! Every match attempt presents a fresh self-signed certificate built from the
//! partner's long-lived P-256 key. The certificate never chains to a CA; the
//! other side pins its exact bytes after receiving it over the authenticated
//! federation RPC.
//!
//! # Security Model
//!
//! - The partner key is loaded once from configuration and never leaves the process
//! - Ephemeral certificates are backdated slightly and expire within the hour
//! - Serial numbers are random so two attempts never present identical certificates

use aws_lc_rs::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use rand::Rng;
use rcgen::{
    CertificateParams, DistinguishedName, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;
use ::time::OffsetDateTime;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::tls::TlsCredential;

/// How far before "now" an ephemeral certificate becomes valid
pub const EPHEMERAL_BACKDATE: ::time::Duration = ::time::Duration::minutes(30);

/// How long after "now" an ephemeral certificate stays valid
pub const EPHEMERAL_LIFETIME: ::time::Duration = ::time::Duration::minutes(60);

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Private key could not be loaded
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse a PEM certificate into DER, rejecting anything that is not X.509
pub fn parse_certificate_pem(pem_data: &str) -> Result<CertificateDer<'static>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to decode PEM block: {}", e)))?;
    if pem_obj.tag() != "CERTIFICATE" {
        return Err(PkiError::ParseError(format!(
            "expected CERTIFICATE block, found {}",
            pem_obj.tag()
        )));
    }

    let der = pem_obj.contents().to_vec();
    X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse x509 certificate: {}", e)))?;

    Ok(CertificateDer::from(der))
}

/// Encode DER certificate bytes as PEM
pub fn certificate_to_pem(der: &[u8]) -> String {
    ::pem::encode(&::pem::Pem::new("CERTIFICATE", der.to_vec()))
}

/// Load a partner private key from configuration.
///
/// Accepts PKCS#8 or SEC1 (`EC PRIVATE KEY`), either as a PEM block or as
/// base64 of the DER. Only ECDSA P-256 keys are usable for ES256 tokens and
/// match certificates.
pub fn parse_private_key(encoded: &str) -> Result<KeyPair> {
    let encoded = encoded.trim();
    let der = if encoded.starts_with("-----BEGIN") {
        let block = ::pem::parse(encoded)
            .map_err(|e| PkiError::InvalidKey(format!("failed to parse PEM key: {}", e)))?;
        match block.tag() {
            "PRIVATE KEY" | "EC PRIVATE KEY" => Zeroizing::new(block.into_contents()),
            other => {
                return Err(PkiError::InvalidKey(format!(
                    "expected PRIVATE KEY or EC PRIVATE KEY block, found {}",
                    other
                )))
            }
        }
    } else {
        Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|e| PkiError::InvalidKey(format!("key is not base64: {}", e)))?,
        )
    };

    let key = match PrivateKeyDer::try_from(der.as_slice()) {
        Ok(PrivateKeyDer::Sec1(sec1)) => sec1_key_pair(sec1.secret_sec1_der())?,
        _ => KeyPair::try_from(der.as_slice())
            .map_err(|e| PkiError::InvalidKey(format!("failed to parse PKCS#8 key: {}", e)))?,
    };

    if key.algorithm() != &PKCS_ECDSA_P256_SHA256 {
        return Err(PkiError::InvalidKey(
            "only ECDSA P-256 keys are supported".to_string(),
        ));
    }
    Ok(key)
}

/// Re-encode a SEC1 P-256 key as PKCS#8 so every consumer sees one format
fn sec1_key_pair(der: &[u8]) -> Result<KeyPair> {
    let ec = EcdsaKeyPair::from_private_key_der(&ECDSA_P256_SHA256_ASN1_SIGNING, der).map_err(|e| {
        PkiError::InvalidKey(format!("failed to parse SEC1 key: {}", e))
    })?;
    let pkcs8 = ec
        .to_pkcs8v1()
        .map_err(|_| PkiError::InvalidKey("failed to re-encode SEC1 key".to_string()))?;
    let pkcs8 = Zeroizing::new(pkcs8.as_ref().to_vec());
    KeyPair::try_from(pkcs8.as_slice())
        .map_err(|e| PkiError::InvalidKey(format!("failed to load SEC1 key: {}", e)))
}

/// Self-signed certificate minted for a single match attempt
pub struct EphemeralCertificate {
    certificate_der: CertificateDer<'static>,
    certificate_pem: String,
    /// PKCS#8 encoding of the partner key that signed the certificate
    private_key_der: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for EphemeralCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralCertificate")
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_der", &"[REDACTED]")
            .finish()
    }
}

impl EphemeralCertificate {
    /// Issue a certificate valid from 30 minutes ago until 60 minutes from now
    pub fn issue(key: &KeyPair) -> Result<Self> {
        let now = OffsetDateTime::now_utc();
        Self::issue_with_validity(key, now - EPHEMERAL_BACKDATE, now + EPHEMERAL_LIFETIME)
    }

    /// Issue a certificate with an explicit validity window
    pub fn issue_with_validity(
        key: &KeyPair,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.not_before = not_before;
        params.not_after = not_after;

        // Positive 63-bit serial
        let serial: u64 = rand::thread_rng().gen_range(1..i64::MAX as u64);
        params.serial_number = Some(SerialNumber::from(serial));

        let cert = params.self_signed(key).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to create ephemeral certificate: {}",
                e
            ))
        })?;

        Ok(Self {
            certificate_der: cert.der().clone(),
            certificate_pem: cert.pem(),
            private_key_der: Zeroizing::new(key.serialize_der()),
        })
    }

    /// DER bytes of the certificate, the value peers pin
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.certificate_der
    }

    /// PEM form of the certificate, the value sent over RPC
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Certificate plus key in the form rustls loads
    pub fn to_tls_credential(&self) -> TlsCredential {
        TlsCredential {
            chain: vec![self.certificate_der.clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key_der.to_vec())),
        }
    }
}
