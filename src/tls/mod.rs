//! TLS configuration for the match data channel
//!
//! Configures rustls for both sides of a match. Peer verification is a
//! strategy chosen at config time:
//!
//! - [`PeerVerification::Pinned`] accepts exactly one previously exchanged
//!   certificate, compared byte-for-byte against whatever the peer presents
//! - [`PeerVerification::CaChain`] walks the usual WebPKI chain to a root
//!
//! Match channels use pinning; CA chains remain for deployments that front
//! the data channel with a conventional PKI.

mod chain;
mod pinned;

use std::net::IpAddr;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;

pub use chain::verify_chain_and_name;
pub use pinned::{PinnedCertificate, PinnedClientVerifier, PinnedServerVerifier};

/// Reasons a peer certificate is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustError {
    /// None of the presented certificates equals the pinned one
    #[error("no matching peer certificate among {presented} presented")]
    PinMismatch {
        /// Number of certificates the peer presented
        presented: usize,
    },

    /// A presented certificate could not be parsed
    #[error("failed to parse peer certificate: {0}")]
    MalformedPeerCertificate(String),

    /// Chain does not lead to the configured root
    #[error("certificate is not trusted by the configured root: {0}")]
    UntrustedChain(String),

    /// Chain is fine but the certificate does not name the expected subject
    #[error("certificate is not valid for {expected}")]
    NameMismatch {
        /// Name or address the certificate should have covered
        expected: String,
    },

    /// The configured root could not be used as a trust anchor
    #[error("invalid root certificate: {0}")]
    InvalidRoot(String),
}

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsError {
    /// rustls refused the configuration
    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),

    /// Verifier could not be built
    #[error("failed to build peer verifier: {0}")]
    Verifier(String),

    /// Endpoint host is neither a DNS name nor an IP address
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
}

/// Certificate chain and private key presented to the peer
pub struct TlsCredential {
    /// Leaf first
    pub chain: Vec<CertificateDer<'static>>,
    /// Private key matching the leaf (PKCS#8)
    pub key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for TlsCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCredential")
            .field("chain_len", &self.chain.len())
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// How the remote side's certificate is accepted
#[derive(Debug, Clone)]
pub enum PeerVerification {
    /// Accept only this exact certificate
    Pinned(PinnedCertificate),
    /// Accept certificates chaining to one of these roots
    CaChain(Arc<RootCertStore>),
}

impl PeerVerification {
    /// Build a CA-chain strategy from DER roots
    pub fn ca_chain(roots: &[CertificateDer<'static>]) -> Result<Self, TrustError> {
        let mut store = RootCertStore::empty();
        for root in roots {
            store
                .add(root.clone())
                .map_err(|e| TrustError::InvalidRoot(e.to_string()))?;
        }
        Ok(Self::CaChain(Arc::new(store)))
    }
}

/// Crypto provider used for every config and verifier in this crate
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Build the connecting side's config
pub fn client_config(
    credential: TlsCredential,
    verification: PeerVerification,
) -> Result<Arc<ClientConfig>, TlsError> {
    let provider = crypto_provider();
    let builder =
        ClientConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

    let builder = match verification {
        PeerVerification::Pinned(pin) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier::new(pin, &provider))),
        PeerVerification::CaChain(roots) => builder.with_root_certificates(roots),
    };

    let config = builder.with_client_auth_cert(credential.chain, credential.key)?;
    Ok(Arc::new(config))
}

/// Build the accepting side's config; client certificates are mandatory
pub fn server_config(
    credential: TlsCredential,
    verification: PeerVerification,
) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = crypto_provider();

    let verifier: Arc<dyn ClientCertVerifier> = match verification {
        PeerVerification::Pinned(pin) => Arc::new(PinnedClientVerifier::new(pin, &provider)),
        PeerVerification::CaChain(roots) => {
            WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
                .build()
                .map_err(|e| TlsError::Verifier(e.to_string()))?
        }
    };

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(credential.chain, credential.key)?;
    Ok(Arc::new(config))
}

/// TLS server name for a `host:port` endpoint.
///
/// Bracketed IPv6 hosts (`[::1]:443`) and bare IP literals are accepted.
pub fn server_name_for_endpoint(endpoint: &str) -> Result<ServerName<'static>, TlsError> {
    let host = if endpoint.parse::<IpAddr>().is_ok() {
        endpoint
    } else {
        match endpoint.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => endpoint,
        }
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    ServerName::try_from(host.to_string())
        .map_err(|_| TlsError::InvalidServerName(endpoint.to_string()))
}

/// Whether a handshake failure was caused by a pinned certificate mismatch
pub fn is_pin_mismatch(err: &std::io::Error) -> bool {
    trust_error_in(err).is_some_and(|e| matches!(e, TrustError::PinMismatch { .. }))
}

/// Trust decision carried inside a handshake I/O error, if any
pub fn trust_error_in(err: &std::io::Error) -> Option<&TrustError> {
    let rustls_err = err.get_ref()?.downcast_ref::<rustls::Error>()?;
    match rustls_err {
        rustls::Error::InvalidCertificate(rustls::CertificateError::Other(other)) => {
            other.0.downcast_ref::<TrustError>()
        }
        _ => None,
    }
}
