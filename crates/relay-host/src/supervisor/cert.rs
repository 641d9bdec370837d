// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Certificate expiry, read either from the instance serving the external port or from disk.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider, ring};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme,
};

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Unable to read certificate {0}: {1}")]
    Unreadable(PathBuf, io::Error),
    #[error("No certificate found in {0}")]
    Missing(PathBuf),
    #[error("Unable to parse certificate from {0}: {1}")]
    Unparsable(String, String),
    #[error("TLS handshake with {0} failed: {1}")]
    Handshake(SocketAddr, io::Error),
    #[error("{0} presented no certificate")]
    NotPresented(SocketAddr),
}

fn not_after_of(der: &[u8]) -> Result<SystemTime, String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(|e| e.to_string())?;
    let not_after = cert.validity().not_after.timestamp();
    let secs =
        u64::try_from(not_after).map_err(|_| format!("not-after before epoch: {not_after}"))?;
    Ok(UNIX_EPOCH + Duration::from_secs(secs))
}

/// The "not valid after" instant of the leaf (first) certificate in a PEM file.
pub fn leaf_not_after(path: &Path) -> Result<SystemTime, CertificateError> {
    let file = File::open(path).map_err(|e| CertificateError::Unreadable(path.into(), e))?;
    let mut reader = BufReader::new(file);
    let leaf = match rustls_pemfile::certs(&mut reader).next() {
        Some(Ok(der)) => der,
        Some(Err(e)) => return Err(CertificateError::Unreadable(path.into(), e)),
        None => return Err(CertificateError::Missing(path.into())),
    };
    not_after_of(leaf.as_ref())
        .map_err(|reason| CertificateError::Unparsable(path.display().to_string(), reason))
}

/// Takes whatever certificate the peer presents. Handshake signatures are still checked, so the
/// peer does hold the key for the certificate we read. Nothing is trusted on the strength of it.
#[derive(Debug)]
struct PresentedCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for PresentedCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Handshake with whatever serves `addr` and read the "not valid after" instant of the leaf
/// certificate it presents. Each network step gives up after `timeout`.
pub fn served_leaf_not_after(
    addr: SocketAddr,
    timeout: Duration,
) -> Result<SystemTime, CertificateError> {
    let failed = move |e: io::Error| CertificateError::Handshake(addr, e);
    let provider = Arc::new(ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| failed(io::Error::other(e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PresentedCertificate(provider)))
        .with_no_client_auth();
    let mut conn = ClientConnection::new(Arc::new(config), ServerName::from(addr.ip()))
        .map_err(|e| failed(io::Error::other(e)))?;

    let mut tcp = TcpStream::connect_timeout(&addr, timeout).map_err(failed)?;
    tcp.set_read_timeout(Some(timeout))
        .and_then(|_| tcp.set_write_timeout(Some(timeout)))
        .map_err(failed)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut tcp).map_err(failed)?;
    }

    let leaf = conn
        .peer_certificates()
        .and_then(|chain| chain.first())
        .ok_or(CertificateError::NotPresented(addr))?;
    not_after_of(leaf.as_ref())
        .map_err(|reason| CertificateError::Unparsable(addr.to_string(), reason))
}

/// True when `not_after` lies strictly beyond `now + grace`.
pub fn valid_with_margin(not_after: SystemTime, now: SystemTime, grace: Duration) -> bool {
    match now.checked_add(grace) {
        Some(deadline) => deadline < not_after,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair, date_time_ymd};

    fn write_cert(dir: &Path, not_after: (i32, u8, u8)) -> PathBuf {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_before = date_time_ymd(2020, 1, 1);
        params.not_after = date_time_ymd(not_after.0, not_after.1, not_after.2);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let path = dir.join("cert.pem");
        std::fs::write(&path, cert.pem()).unwrap();
        path
    }

    #[test]
    fn reads_not_after_from_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_cert(dir.path(), (2031, 6, 1));
        let not_after = leaf_not_after(&path).unwrap();
        let secs = not_after.duration_since(UNIX_EPOCH).unwrap().as_secs();
        // 2031-06-01T00:00:00Z
        assert_eq!(secs, 1_938_038_400);
    }

    #[test]
    fn missing_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            leaf_not_after(&dir.path().join("nope.pem")),
            Err(CertificateError::Unreadable(..))
        ));
    }

    #[test]
    fn file_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "just some text\n").unwrap();
        assert!(matches!(
            leaf_not_after(&path),
            Err(CertificateError::Missing(_))
        ));
    }

    #[test]
    fn garbage_der_is_unparsable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pem");
        std::fs::write(
            &path,
            "-----BEGIN CERTIFICATE-----\nAAECAwQF\n-----END CERTIFICATE-----\n",
        )
        .unwrap();
        assert!(matches!(
            leaf_not_after(&path),
            Err(CertificateError::Unparsable(..))
        ));
    }

    #[test]
    fn closed_port_is_a_failed_handshake() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        assert!(matches!(
            served_leaf_not_after(addr, Duration::from_millis(500)),
            Err(CertificateError::Handshake(..))
        ));
    }

    #[test]
    fn margin_boundaries() {
        let grace = Duration::from_secs(86_400);
        let now = UNIX_EPOCH + Duration::from_secs(1_000_000);
        assert!(valid_with_margin(now + grace + Duration::from_secs(1), now, grace));
        assert!(!valid_with_margin(now + grace, now, grace));
        assert!(!valid_with_margin(now, now, grace));
        assert!(!valid_with_margin(now - Duration::from_secs(5), now, grace));
    }
}
