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

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, KeyPair, date_time_ymd};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;
use wsrelay_host::RelaySettings;
use wsrelay_host::connections::{ConnectionRegistry, NewConnection};

pub type ClientSocket = WebSocketStream<TlsStream<TcpStream>>;

/// A scratch directory holding a certificate, its key, and room for a PID file.
pub struct Fixture {
    pub dir: TempDir,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Fixture {
    /// Certificate for `localhost` valid from 2020 until `not_after` (year, month, day).
    pub fn with_cert_until(not_after: (i32, u8, u8)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fixture = Self {
            cert: dir.path().join("cert.pem"),
            key: dir.path().join("key.pem"),
            dir,
        };
        fixture.rotate(not_after);
        fixture
    }

    /// Replace the certificate and key on disk, as an operator renewing them would.
    pub fn rotate(&self, not_after: (i32, u8, u8)) {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_before = date_time_ymd(2020, 1, 1);
        params.not_after = date_time_ymd(not_after.0, not_after.1, not_after.2);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        std::fs::write(&self.cert, cert.pem()).unwrap();
        std::fs::write(&self.key, key.serialize_pem()).unwrap();
    }

    pub fn valid() -> Self {
        Self::with_cert_until((2099, 12, 31))
    }

    pub fn expired() -> Self {
        Self::with_cert_until((2021, 1, 1))
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.path().join("relay.pid")
    }

    /// Settings on ephemeral loopback ports.
    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            tls_cert: self.cert.clone(),
            tls_key: self.key.clone(),
            external_address: "127.0.0.1:0".parse().unwrap(),
            internal_address: "127.0.0.1:0".parse().unwrap(),
            log_file: None,
            pid_file: self.pid_file(),
            registry_path: None,
            tls_handshake_timeout_ms: 5_000,
            drain_timeout_ms: 500,
        }
    }

    /// A TLS WebSocket client connected to `/<connection_id>` on the external listener.
    pub async fn connect_client(&self, addr: SocketAddr, connection_id: Uuid) -> ClientSocket {
        connect_client(&self.cert, addr, &connection_id.to_string()).await
    }
}

pub async fn connect_client(cert: &Path, addr: SocketAddr, path: &str) -> ClientSocket {
    let mut roots = RootCertStore::empty();
    for der in wsrelay_host::tls::load_certificates(cert).unwrap() {
        roots.add(der).unwrap();
    }
    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    let tls = connector.connect(server_name, tcp).await.unwrap();
    let url = format!("wss://localhost:{}/{path}", addr.port());
    let (ws, _response) = tokio_tungstenite::client_async(url, tls).await.unwrap();
    ws
}

/// A TCP connection that never starts its TLS handshake.
pub async fn stalled_connection(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).await.unwrap();
    // Give the listener time to accept it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    stream
}

pub fn issue(registry: &dyn ConnectionRegistry, session: &str) -> Uuid {
    registry
        .issue(NewConnection {
            session_id: session.to_string(),
            ip: "127.0.0.1".to_string(),
            user_id: Some(1),
            user_agent_id: 1,
        })
        .unwrap()
}

/// Poll `check` until it yields a value or five seconds pass.
pub async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    for _ in 0..500 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
