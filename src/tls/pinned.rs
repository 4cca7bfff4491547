//! Pinned-certificate peer verification
//!
//! The peer's certificate was exchanged out of band, so the handshake only
//! needs to confirm that the same bytes show up again. Names, validity dates
//! and issuers are not consulted. Handshake signatures are still
//! checked, which proves the peer holds the pinned certificate's key.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, OtherError, SignatureScheme};
use tracing::{debug, warn};
use x509_parser::prelude::*;

use super::TrustError;
use crate::pki::{parse_certificate_pem, PkiError};

/// The one certificate a peer is allowed to present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedCertificate {
    der: CertificateDer<'static>,
}

impl PinnedCertificate {
    /// Pin DER bytes as-is
    pub fn new(der: CertificateDer<'static>) -> Self {
        Self { der }
    }

    /// Pin a PEM certificate received from the federation service
    pub fn from_pem(pem: &str) -> Result<Self, PkiError> {
        Ok(Self::new(parse_certificate_pem(pem)?))
    }

    /// Pinned DER bytes
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// Accept the presented certificates if any one of them is the pinned one.
    ///
    /// Certificates are examined in the order given; each must parse as X.509
    /// before it is compared.
    pub fn check<'a, I>(&self, presented: I) -> Result<(), TrustError>
    where
        I: IntoIterator<Item = &'a CertificateDer<'a>>,
    {
        let mut count = 0;
        for cert in presented {
            count += 1;
            X509Certificate::from_der(cert.as_ref())
                .map_err(|e| TrustError::MalformedPeerCertificate(e.to_string()))?;
            if cert.as_ref() == self.der.as_ref() {
                debug!(position = count, "Peer presented pinned certificate");
                return Ok(());
            }
        }

        warn!(presented = count, "Peer certificate does not match pin");
        Err(TrustError::PinMismatch { presented: count })
    }

    fn verify_presented(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<(), rustls::Error> {
        self.check(std::iter::once(end_entity).chain(intermediates.iter()))
            .map_err(|e| {
                rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(e))))
            })
    }
}

/// Client-side verifier accepting exactly the pinned server certificate
#[derive(Debug)]
pub struct PinnedServerVerifier {
    pin: PinnedCertificate,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedServerVerifier {
    /// Create a verifier using the provider's signature algorithms
    pub fn new(pin: PinnedCertificate, provider: &CryptoProvider) -> Self {
        Self {
            pin,
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.pin.verify_presented(end_entity, intermediates)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Server-side verifier requiring exactly the pinned client certificate
#[derive(Debug)]
pub struct PinnedClientVerifier {
    pin: PinnedCertificate,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedClientVerifier {
    /// Create a verifier using the provider's signature algorithms
    pub fn new(pin: PinnedCertificate, provider: &CryptoProvider) -> Self {
        Self {
            pin,
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // Pinned certificates are self-signed; there is no CA to hint at
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.pin.verify_presented(end_entity, intermediates)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::EphemeralCertificate;
    use crate::tls::crypto_provider;
    use rcgen::KeyPair;

    fn cert() -> CertificateDer<'static> {
        EphemeralCertificate::issue(&KeyPair::generate().unwrap())
            .unwrap()
            .certificate_der()
            .clone()
    }

    #[test]
    fn exact_match_is_accepted() {
        let pinned = cert();
        let pin = PinnedCertificate::new(pinned.clone());
        assert!(pin.check([&pinned]).is_ok());
    }

    #[test]
    fn match_anywhere_in_presented_list_is_accepted() {
        let pinned = cert();
        let other = cert();
        let pin = PinnedCertificate::new(pinned.clone());
        assert!(pin.check([&other, &pinned]).is_ok());
    }

    #[test]
    fn different_certificate_is_rejected() {
        let pin = PinnedCertificate::new(cert());
        let a = cert();
        let b = cert();
        assert_eq!(
            pin.check([&a, &b]),
            Err(TrustError::PinMismatch { presented: 2 })
        );
    }

    #[test]
    fn same_key_different_certificate_is_rejected() {
        let key = KeyPair::generate().unwrap();
        let first = EphemeralCertificate::issue(&key).unwrap();
        let second = EphemeralCertificate::issue(&key).unwrap();

        let pin = PinnedCertificate::new(first.certificate_der().clone());
        assert!(pin.check([second.certificate_der()]).is_err());
    }

    #[test]
    fn unparseable_certificate_is_rejected() {
        let pin = PinnedCertificate::new(cert());
        let junk = CertificateDer::from(vec![0x30, 0x03, 0x01, 0x01, 0xff]);
        assert!(matches!(
            pin.check([&junk]),
            Err(TrustError::MalformedPeerCertificate(_))
        ));
    }

    #[test]
    fn mismatch_surfaces_as_rustls_certificate_error() {
        let provider = crypto_provider();
        let verifier =
            PinnedServerVerifier::new(PinnedCertificate::new(cert()), &provider);
        let presented = cert();

        let err = verifier
            .verify_server_cert(
                &presented,
                &[],
                &ServerName::try_from("partner.example").unwrap(),
                &[],
                UnixTime::now(),
            )
            .unwrap_err();

        match err {
            rustls::Error::InvalidCertificate(CertificateError::Other(other)) => {
                assert_eq!(
                    other.0.downcast_ref::<TrustError>(),
                    Some(&TrustError::PinMismatch { presented: 1 })
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn pin_from_pem() {
        let ephemeral = EphemeralCertificate::issue(&KeyPair::generate().unwrap()).unwrap();
        let pin = PinnedCertificate::from_pem(ephemeral.certificate_pem()).unwrap();
        assert_eq!(pin.der(), ephemeral.certificate_der());
    }

    #[test]
    fn client_verifier_requires_certificate() {
        let verifier = PinnedClientVerifier::new(PinnedCertificate::new(cert()), &crypto_provider());
        assert!(verifier.offer_client_auth());
        assert!(verifier.client_auth_mandatory());
        assert!(verifier.root_hint_subjects().is_empty());
    }
}
