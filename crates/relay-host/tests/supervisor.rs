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

//! Singleton start-up against a previous relay instance, real or stood in for.

mod common;

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use pretty_assertions::assert_eq;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use wsrelay_host::connections::InMemoryRegistry;
use wsrelay_host::supervisor::process::{ProcessControl, ProcessControlError};
use wsrelay_host::supervisor::{GRACE_PERIOD, SupervisorState, cert};
use wsrelay_host::{Preflight, RelayServer, RunningRelay, StartOutcome};

use common::{Fixture, stalled_connection};

/// Plays the previous instance: owns the external port until it is signalled.
struct PreviousInstance {
    listener: Mutex<Option<TcpListener>>,
    signalled: Mutex<Vec<i32>>,
}

impl PreviousInstance {
    fn holding(listener: TcpListener) -> Self {
        Self {
            listener: Mutex::new(Some(listener)),
            signalled: Mutex::new(vec![]),
        }
    }
}

impl ProcessControl for PreviousInstance {
    fn terminate(&self, pid: i32) -> Result<(), ProcessControlError> {
        self.signalled.lock().unwrap().push(pid);
        self.listener.lock().unwrap().take();
        Ok(())
    }

    fn kill(&self, pid: i32) -> Result<(), ProcessControlError> {
        self.terminate(pid)
    }

    fn is_alive(&self, _pid: i32) -> bool {
        self.listener.lock().unwrap().is_some()
    }
}

/// Delivers "SIGTERM" to a relay running in this process by starting its shutdown.
struct InProcessRelay {
    runtime: Handle,
    relay: Mutex<Option<RunningRelay>>,
    stopping: Mutex<Option<JoinHandle<()>>>,
    signalled: Mutex<Vec<i32>>,
}

impl InProcessRelay {
    fn new(relay: RunningRelay) -> Self {
        Self {
            runtime: Handle::current(),
            relay: Mutex::new(Some(relay)),
            stopping: Mutex::new(None),
            signalled: Mutex::new(vec![]),
        }
    }

    fn stopping(&self) -> JoinHandle<()> {
        self.stopping.lock().unwrap().take().unwrap()
    }
}

impl ProcessControl for InProcessRelay {
    fn terminate(&self, pid: i32) -> Result<(), ProcessControlError> {
        self.signalled.lock().unwrap().push(pid);
        if let Some(relay) = self.relay.lock().unwrap().take() {
            *self.stopping.lock().unwrap() = Some(self.runtime.spawn(relay.shutdown()));
        }
        Ok(())
    }

    fn kill(&self, pid: i32) -> Result<(), ProcessControlError> {
        self.terminate(pid)
    }

    fn is_alive(&self, _pid: i32) -> bool {
        self.stopping
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|stopping| !stopping.is_finished())
    }
}

fn served_cert_valid(address: std::net::SocketAddr) -> bool {
    let not_after = cert::served_leaf_not_after(address, Duration::from_secs(2)).unwrap();
    cert::valid_with_margin(not_after, SystemTime::now(), GRACE_PERIOD)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthy_instance_is_left_alone() {
    let fixture = Fixture::valid();
    let existing = RelayServer::new(fixture.settings(), Arc::new(InMemoryRegistry::new()))
        .bind()
        .await
        .unwrap();
    // An expiring file on disk does not matter while the served certificate is fine.
    fixture.rotate((2021, 1, 1));

    let mut settings = fixture.settings();
    settings.external_address = existing.external_address();
    let outcome = RelayServer::new(settings, Arc::new(InMemoryRegistry::new()))
        .start()
        .await
        .unwrap();
    assert!(matches!(outcome, StartOutcome::AlreadyRunning));
    assert!(served_cert_valid(existing.external_address()));
    assert!(fixture.pid_file().exists());

    existing.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rotated_certificate_replaces_an_instance_serving_an_expired_one() {
    let fixture = Fixture::expired();
    let mut settings = fixture.settings();
    settings.tls_handshake_timeout_ms = 10_000;
    settings.drain_timeout_ms = 10_000;
    let existing = RelayServer::new(settings.clone(), Arc::new(InMemoryRegistry::new()))
        .bind()
        .await
        .unwrap();
    let address = existing.external_address();
    let _stalled = stalled_connection(address).await;

    // The operator renews the files; the running instance still serves the old certificate.
    fixture.rotate((2099, 12, 31));
    assert!(!served_cert_valid(address));

    settings.external_address = address;
    let mut server = RelayServer::with_process_control(
        settings,
        Arc::new(InMemoryRegistry::new()),
        InProcessRelay::new(existing),
    );
    assert_eq!(server.preflight(), Preflight::Clear);
    assert_eq!(server.supervisor().state(), SupervisorState::NotRunning);
    assert_eq!(
        *server.supervisor().process_control().signalled.lock().unwrap(),
        vec![std::process::id() as i32]
    );
    let stopping = server.supervisor().process_control().stopping();

    let replacement = server.bind().await.unwrap();
    assert_eq!(replacement.external_address(), address);
    assert!(served_cert_valid(address));

    tokio::time::timeout(Duration::from_secs(2), stopping)
        .await
        .unwrap()
        .unwrap();
    let pid = std::fs::read_to_string(fixture.pid_file()).unwrap();
    assert_eq!(pid.trim(), std::process::id().to_string());
    replacement.shutdown().await;
}

#[tokio::test]
async fn instance_presenting_no_certificate_is_replaced() {
    let fixture = Fixture::valid();
    let existing = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = existing.local_addr().unwrap();
    std::fs::write(fixture.pid_file(), "4242\n").unwrap();
    let mut settings = fixture.settings();
    settings.external_address = address;

    let mut server = RelayServer::with_process_control(
        settings,
        Arc::new(InMemoryRegistry::new()),
        PreviousInstance::holding(existing),
    );
    assert_eq!(server.preflight(), Preflight::Clear);
    assert_eq!(server.supervisor().state(), SupervisorState::NotRunning);
    assert_eq!(
        *server.supervisor().process_control().signalled.lock().unwrap(),
        vec![4242]
    );

    let running = server.bind().await.unwrap();
    assert_eq!(running.external_address(), address);
    let pid = std::fs::read_to_string(fixture.pid_file()).unwrap();
    assert_eq!(pid.trim(), std::process::id().to_string());
    running.shutdown().await;
}

#[tokio::test]
async fn expiring_instance_without_pid_file_is_kept() {
    let fixture = Fixture::expired();
    let existing = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut settings = fixture.settings();
    settings.external_address = existing.local_addr().unwrap();

    let outcome = RelayServer::with_process_control(
        settings,
        Arc::new(InMemoryRegistry::new()),
        PreviousInstance::holding(existing),
    )
    .start()
    .await
    .unwrap();
    assert!(matches!(outcome, StartOutcome::AlreadyRunning));
}

#[tokio::test]
async fn free_port_starts_directly() {
    let fixture = Fixture::valid();
    let outcome = RelayServer::new(fixture.settings(), Arc::new(InMemoryRegistry::new()))
        .start()
        .await
        .unwrap();
    let StartOutcome::Started(running) = outcome else {
        panic!("expected the relay to start");
    };
    assert_ne!(running.external_address().port(), 0);
    running.shutdown().await;
}
