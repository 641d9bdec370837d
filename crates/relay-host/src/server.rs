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

//! Assembly of the relay: supervise, bind both listeners, run until told to stop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, trace, warn};

use crate::args::{ConfigError, RelaySettings};
use crate::connections::{ServerId, SharedRegistry};
use crate::external::ExternalListener;
use crate::internal::InternalListener;
use crate::listen::{Listener, ListenerTimeouts, SocketEvents};
use crate::relay::{LiveSockets, Relay};
use crate::supervisor::Supervisor;
use crate::supervisor::process::{
    PidFile, ProcessControl, ProcessControlError, SignalProcessControl,
};
use crate::tls::{self, TlsError};

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),
    #[error("Unable to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: SocketAddr,
        source: io::Error,
    },
    #[error("Unable to claim PID file: {0}")]
    PidFile(#[from] ProcessControlError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preflight {
    /// No healthy instance holds the external port; this process may bind it.
    Clear,
    AlreadyRunning,
}

pub enum StartOutcome {
    AlreadyRunning,
    Started(RunningRelay),
}

pub struct RelayServer<P: ProcessControl = SignalProcessControl> {
    settings: RelaySettings,
    registry: SharedRegistry,
    supervisor: Supervisor<P>,
}

impl RelayServer<SignalProcessControl> {
    pub fn new(settings: RelaySettings, registry: SharedRegistry) -> Self {
        Self::with_process_control(settings, registry, SignalProcessControl)
    }
}

impl<P: ProcessControl> RelayServer<P> {
    pub fn with_process_control(
        settings: RelaySettings,
        registry: SharedRegistry,
        control: P,
    ) -> Self {
        let supervisor = Supervisor::new(settings.supervisor_config(), control);
        Self {
            settings,
            registry,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &Supervisor<P> {
        &self.supervisor
    }

    /// Run the supervisor. Blocks for as long as retiring an old instance takes, so call it
    /// before the async runtime is doing anything else.
    pub fn preflight(&mut self) -> Preflight {
        if self.supervisor.server_already_running() {
            Preflight::AlreadyRunning
        } else {
            Preflight::Clear
        }
    }

    /// Preflight, then bind unless another instance is healthy.
    pub async fn start(mut self) -> Result<StartOutcome, StartError> {
        match self.preflight() {
            Preflight::AlreadyRunning => {
                info!(address = %self.settings.external_address, "Relay already running; not binding");
                Ok(StartOutcome::AlreadyRunning)
            }
            Preflight::Clear => Ok(StartOutcome::Started(self.bind().await?)),
        }
    }

    /// Bind both listeners and start serving. Failure to bind is fatal to this start attempt.
    pub async fn bind(self) -> Result<RunningRelay, StartError> {
        let settings = self.settings;
        settings.validate()?;
        let acceptor = tls::load_acceptor(&settings.tls_cert, &settings.tls_key).inspect_err(
            |e| error!(error = %e, "Unable to load TLS certificate for the external listener"),
        )?;

        let server_id = ServerId::generate();
        let sockets = LiveSockets::new();
        let timeouts = settings.listener_timeouts();
        let external = bind_listener(
            "external",
            settings.external_address,
            Some(acceptor),
            ExternalListener::new(server_id.clone(), self.registry.clone(), sockets.clone()),
            timeouts,
        )
        .await?;
        let internal = bind_listener(
            "internal",
            settings.internal_address,
            None,
            InternalListener::new(Relay::new(sockets.clone())),
            timeouts,
        )
        .await?;
        let external_address = local_addr("external", &external, settings.external_address)?;
        let internal_address = local_addr("internal", &internal, settings.internal_address)?;

        match self.registry.sweep_stale(&server_id) {
            Ok(0) => {}
            Ok(rows) => info!(rows, "Closed connections left open by previous instances"),
            Err(e) => error!(error = %e, "Unable to sweep stale connections"),
        }

        let pid_file = PidFile::create(&settings.pid_file)
            .inspect_err(|e| error!(error = %e, "Unable to claim PID file"))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        tasks.spawn(external.serve(shutdown_rx.clone()));
        tasks.spawn(internal.serve(shutdown_rx));

        info!(
            %server_id,
            %external_address,
            %internal_address,
            "Relay started"
        );
        Ok(RunningRelay {
            server_id,
            external_address,
            internal_address,
            sockets,
            shutdown,
            tasks,
            pid_file: Some(pid_file),
        })
    }
}

async fn bind_listener<H: SocketEvents>(
    name: &'static str,
    addr: SocketAddr,
    tls: Option<tokio_rustls::TlsAcceptor>,
    events: H,
    timeouts: ListenerTimeouts,
) -> Result<Listener<H>, StartError> {
    Listener::bind(name, addr, tls, Arc::new(events), timeouts)
        .await
        .map_err(|source| {
            error!(listener = name, %addr, error = %source, "Unable to bind listener");
            StartError::Bind {
                listener: name,
                addr,
                source,
            }
        })
}

fn local_addr<H: SocketEvents>(
    name: &'static str,
    listener: &Listener<H>,
    configured: SocketAddr,
) -> Result<SocketAddr, StartError> {
    listener.local_addr().map_err(|source| StartError::Bind {
        listener: name,
        addr: configured,
        source,
    })
}

/// A bound, serving relay. The PID file is held until shutdown starts, or until this is dropped.
pub struct RunningRelay {
    server_id: ServerId,
    external_address: SocketAddr,
    internal_address: SocketAddr,
    sockets: Arc<LiveSockets>,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
    pid_file: Option<PidFile>,
}

impl RunningRelay {
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn external_address(&self) -> SocketAddr {
        self.external_address
    }

    pub fn internal_address(&self) -> SocketAddr {
        self.internal_address
    }

    /// Number of external sockets currently established.
    pub fn live_connections(&self) -> usize {
        self.sockets.len()
    }

    /// Stop accepting, send clients a going-away close, and wait for both listeners to drain.
    /// The PID file is released before the listeners stop accepting.
    pub async fn shutdown(mut self) {
        if let Some(pid_file) = self.pid_file.take() {
            info!(path = ?pid_file.path(), "Releasing PID file");
            drop(pid_file);
        }
        if let Err(e) = self.shutdown.send(true) {
            trace!(error = %e, "Listeners already gone");
        }
        while let Some(finished) = self.tasks.join_next().await {
            if let Err(e) = finished {
                warn!(error = %e, "Listener task failed during shutdown");
            }
        }
        info!(server_id = %self.server_id, "Relay stopped");
    }

    /// Serve until SIGTERM, SIGINT or SIGHUP, then shut down.
    pub async fn run_until_signal(mut self) -> io::Result<()> {
        let mut term_signal = signal(SignalKind::terminate())?;
        let mut stop_signal = signal(SignalKind::interrupt())?;
        let mut hup_signal = signal(SignalKind::hangup())?;

        select! {
            _ = term_signal.recv() => {
                info!("TERM received, stopping...");
            }
            _ = stop_signal.recv() => {
                info!("STOP received, stopping...");
            }
            _ = hup_signal.recv() => {
                info!("HUP received, stopping...");
            }
            Some(finished) = self.tasks.join_next() => {
                error!(?finished, "Listener exited unexpectedly, stopping...");
            }
        }
        self.shutdown().await;
        Ok(())
    }
}
