//! Shared certificate fixtures for unit tests

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;

/// Throwaway CA that signs leaf certificates for the given names
pub(crate) struct TestCa {
    key: KeyPair,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

impl TestCa {
    pub(crate) fn new(common_name: &str) -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        Self {
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
            key,
        }
    }

    pub(crate) fn root_der(&self) -> CertificateDer<'static> {
        self.cert_der.clone()
    }

    pub(crate) fn root_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Issue a leaf for DNS names or IP literals; returns its key and DER
    pub(crate) fn issue_leaf(&self, names: &[&str]) -> (KeyPair, CertificateDer<'static>) {
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &self.key).unwrap();

        let mut params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(names[0].to_string()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;

        let leaf_key = KeyPair::generate().unwrap();
        let leaf = params.signed_by(&leaf_key, &issuer).unwrap();
        (leaf_key, leaf.der().clone())
    }
}
