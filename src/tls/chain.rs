//! CA chain plus subject name verification for a single certificate
//!
//! Used where a certificate arrives outside a handshake, such as the `x5c`
//! header of an external token.

use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::debug;

use super::{crypto_provider, TrustError};

/// Verify that `cert` chains to `root` and is valid for `expected_name`.
///
/// `expected_name` is a DNS name or an IP literal (bare or bracketed). IP
/// literals are matched only against IP address SANs. The certificate must
/// also be usable for server authentication.
pub fn verify_chain_and_name(
    cert: &CertificateDer<'_>,
    root: &CertificateDer<'_>,
    expected_name: &str,
) -> Result<(), TrustError> {
    let end_entity = webpki::EndEntityCert::try_from(cert)
        .map_err(|e| TrustError::MalformedPeerCertificate(e.to_string()))?;
    let anchor =
        webpki::anchor_from_trusted_cert(root).map_err(|e| TrustError::InvalidRoot(e.to_string()))?;

    let algorithms = crypto_provider().signature_verification_algorithms;
    end_entity
        .verify_for_usage(
            algorithms.all,
            &[anchor],
            &[],
            UnixTime::now(),
            webpki::KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(|e| TrustError::UntrustedChain(e.to_string()))?;

    let name = subject_name(expected_name)?;
    end_entity
        .verify_is_valid_for_subject_name(&name)
        .map_err(|e| {
            debug!(expected = %expected_name, error = %e, "Certificate name check failed");
            TrustError::NameMismatch {
                expected: expected_name.to_string(),
            }
        })?;

    Ok(())
}

fn subject_name(expected_name: &str) -> Result<ServerName<'static>, TrustError> {
    let trimmed = expected_name
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(expected_name);
    ServerName::try_from(trimmed.to_string()).map_err(|_| TrustError::NameMismatch {
        expected: expected_name.to_string(),
    })
}
