//! Loading (or generating) the PEM material for the `wss` hub.

use std::fs;
use std::path::Path;

use dronelink_hub::tls::DEFAULT_SELF_SIGNED_HOSTS;
use dronelink_hub::{acceptor_from_pem, generate_self_signed};
use dronelink_types::RelayError;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::write_private;

/// Build the hub's TLS acceptor from `cert_path` and `key_path`.
///
/// When either file is missing and `generate` is set, a self-signed pair is
/// written first; the key file is owner-readable only.
pub fn load_or_generate(
    cert_path: &Path,
    key_path: &Path,
    generate: bool,
) -> Result<TlsAcceptor, RelayError> {
    if !cert_path.exists() || !key_path.exists() {
        if !generate {
            return Err(RelayError::Config(format!(
                "TLS material not found at {} / {}",
                cert_path.display(),
                key_path.display()
            )));
        }
        let pair = generate_self_signed(&DEFAULT_SELF_SIGNED_HOSTS)?;
        write_private(cert_path, pair.cert_pem.as_bytes())?;
        write_private(key_path, pair.key_pem.as_bytes())?;
        info!(cert = %cert_path.display(), "generated self-signed certificate");
    }

    let cert_pem = fs::read(cert_path)
        .map_err(|e| RelayError::Config(format!("failed to read {}: {e}", cert_path.display())))?;
    let key_pem = Zeroizing::new(
        fs::read(key_path)
            .map_err(|e| RelayError::Config(format!("failed to read {}: {e}", key_path.display())))?,
    );
    acceptor_from_pem(&cert_pem, &key_pem)
}

/// Like [`load_or_generate`], but a failure downgrades the hub to plain `ws`.
pub fn acceptor_or_plain(cert_path: &Path, key_path: &Path, generate: bool) -> Option<TlsAcceptor> {
    match load_or_generate(cert_path, key_path, generate) {
        Ok(acceptor) => Some(acceptor),
        Err(e) => {
            warn!(error = %e, "TLS unavailable; observer hub falls back to plain ws");
            None
        }
    }
}
