//! TLS material for the encrypted observer transport.
//!
//! Certificates are PEM encoded. The acceptor is built on the `ring`
//! provider explicitly so the process never depends on a global default.

use std::sync::Arc;

use dronelink_types::RelayError;
use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use zeroize::Zeroizing;

/// Host names and addresses a generated certificate is valid for.
pub const DEFAULT_SELF_SIGNED_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// A freshly generated certificate and its private key, both PEM encoded.
pub struct SelfSigned {
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
}

/// Generate a self-signed certificate for `hosts`.
///
/// Entries that parse as IP addresses become IP subject alternative names,
/// everything else a DNS name.
pub fn generate_self_signed(hosts: &[&str]) -> Result<SelfSigned, RelayError> {
    let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)
        .map_err(|e| RelayError::Config(format!("certificate generation failed: {e}")))?;
    Ok(SelfSigned {
        cert_pem: cert.pem(),
        key_pem: Zeroizing::new(key_pair.serialize_pem()),
    })
}

/// Build a TLS acceptor from a PEM certificate chain and private key.
///
/// # Errors
///
/// [`RelayError::Config`] when either input holds no usable PEM object or
/// rustls rejects the pair.
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, RelayError> {
    let certs = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Config(format!("invalid certificate PEM: {e:?}")))?;
    if certs.is_empty() {
        return Err(RelayError::Config("no certificate found in PEM input".to_string()));
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| RelayError::Config(format!("invalid private key PEM: {e:?}")))?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| RelayError::Config(format!("TLS protocol setup failed: {e}")))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| RelayError::Config(format!("TLS certificate rejected: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_material_builds_an_acceptor() {
        let material = generate_self_signed(&DEFAULT_SELF_SIGNED_HOSTS).unwrap();
        assert!(material.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(material.key_pem.contains("PRIVATE KEY"));
        assert!(acceptor_from_pem(material.cert_pem.as_bytes(), material.key_pem.as_bytes()).is_ok());
    }

    #[test]
    fn garbage_pem_is_a_config_error() {
        let result = acceptor_from_pem(b"not a certificate", b"not a key");
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
