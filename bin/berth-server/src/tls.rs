//! TLS certificate provisioning for the optional TLS listener.
//!
//! Certificates live under the user config directory and are generated on
//! first use: a local CA valid for ten years, and a server certificate for
//! `localhost`/`127.0.0.1` valid for one year, signed by that CA.  Clients
//! that want to verify can trust `ca.pem` once.

use std::path::{Path, PathBuf};

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use time::{Duration, OffsetDateTime};
use tracing::info;

const CA_LIFETIME_DAYS: i64 = 10 * 365;
const SERVER_LIFETIME_DAYS: i64 = 365;

/// Paths to the server certificate chain and private key, generating both
/// (and the CA) if absent.
pub fn ensure_certificates(dir: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    let ca_path = dir.join("ca.pem");
    let cert_path = dir.join("server.pem");
    let key_path = dir.join("server-key.pem");
    if cert_path.is_file() && key_path.is_file() {
        return Ok((cert_path, key_path));
    }

    std::fs::create_dir_all(dir)?;
    let now = OffsetDateTime::now_utc();

    // ── Local CA ─────────────────────────────────────────────────────────────
    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "berth local CA");
    ca_params.not_before = now;
    ca_params.not_after = now + Duration::days(CA_LIFETIME_DAYS);
    let ca_cert = ca_params.self_signed(&ca_key)?;

    // ── Server certificate ───────────────────────────────────────────────────
    let server_key = KeyPair::generate()?;
    let mut params =
        CertificateParams::new(vec!["localhost".to_owned(), "127.0.0.1".to_owned()])?;
    params
        .distinguished_name
        .push(DnType::CommonName, "berth-server");
    params.not_before = now;
    params.not_after = now + Duration::days(SERVER_LIFETIME_DAYS);
    let server_cert = params.signed_by(&server_key, &ca_cert, &ca_key)?;

    std::fs::write(&ca_path, ca_cert.pem())?;
    // Serve the full chain so clients can build a path to the CA.
    std::fs::write(
        &cert_path,
        format!("{}{}", server_cert.pem(), ca_cert.pem()),
    )?;
    std::fs::write(&key_path, server_key.serialize_pem())?;

    info!(dir = %dir.display(), "generated TLS certificates");
    Ok((cert_path, key_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reuses_certificates() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (cert, key) = ensure_certificates(tmp.path()).expect("generate");
        assert!(cert.is_file());
        assert!(key.is_file());
        assert!(tmp.path().join("ca.pem").is_file());

        let cert_bytes = std::fs::read_to_string(&cert).expect("read cert");
        // Chain carries both the server cert and the CA.
        assert_eq!(cert_bytes.matches("-----BEGIN CERTIFICATE-----").count(), 2);

        // A second call must not regenerate.
        let (cert2, _) = ensure_certificates(tmp.path()).expect("reuse");
        assert_eq!(cert, cert2);
        assert_eq!(
            std::fs::read_to_string(&cert2).expect("read again"),
            cert_bytes
        );
    }
}
