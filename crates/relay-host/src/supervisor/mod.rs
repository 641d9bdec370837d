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

//! Start-up supervision of the singleton relay.
//!
//! Runs once, synchronously, before any listener is bound. It answers one question: may this
//! process bind the external port? Two independent signals feed the answer, whether the port is
//! already bound and whether the certificate the bound instance serves is valid beyond the grace
//! period. An instance serving a certificate that is about to expire is retired through its PID
//! file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, error, info, warn};

pub mod cert;
pub mod probe;
pub mod process;

use crate::supervisor::probe::{port_accepts_connections, probe_target};
use crate::supervisor::process::{ProcessControl, read_pid};

/// Restart an instance whose certificate expires within this window.
pub const GRACE_PERIOD: Duration = Duration::from_secs(86_400);
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long a terminated instance gets to release the port before SIGKILL.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);
/// How long to wait for the port after SIGKILL.
pub const KILL_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Unknown,
    Probing,
    NotRunning,
    Running,
    Restarting,
}

/// The two health observations about a possibly running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSignals {
    pub port_bound: bool,
    pub cert_valid_with_margin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing holds the port; bind it.
    Bind,
    /// A healthy instance holds the port; leave it alone.
    AlreadyRunning,
    /// An instance holds the port but its certificate is expiring; retire it.
    Restart,
}

impl HealthSignals {
    pub fn verdict(&self) -> Verdict {
        match (self.port_bound, self.cert_valid_with_margin) {
            (false, _) => Verdict::Bind,
            (true, true) => Verdict::AlreadyRunning,
            (true, false) => Verdict::Restart,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub external_address: SocketAddr,
    pub tls_cert: PathBuf,
    pub pid_file: PathBuf,
    pub grace_period: Duration,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub kill_wait: Duration,
}

impl SupervisorConfig {
    pub fn new(external_address: SocketAddr, tls_cert: PathBuf, pid_file: PathBuf) -> Self {
        Self {
            external_address,
            tls_cert,
            pid_file,
            grace_period: GRACE_PERIOD,
            probe_timeout: probe::PROBE_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            poll_timeout: POLL_TIMEOUT,
            kill_wait: KILL_WAIT,
        }
    }
}

pub struct Supervisor<P: ProcessControl> {
    config: SupervisorConfig,
    control: P,
    state: SupervisorState,
}

impl<P: ProcessControl> Supervisor<P> {
    pub fn new(config: SupervisorConfig, control: P) -> Self {
        Self {
            config,
            control,
            state: SupervisorState::Unknown,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn process_control(&self) -> &P {
        &self.control
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!(from = ?self.state, to = ?next, "Supervisor state");
        self.state = next;
    }

    fn port_bound(&self) -> bool {
        let addr = self.config.external_address;
        port_accepts_connections(addr.ip(), addr.port(), self.config.probe_timeout)
    }

    /// Whether the certificate presented on the external port outlives `now` by the grace
    /// period. A failed handshake or an unparsable certificate counts as expired.
    pub fn cert_valid_with_margin(&self, now: SystemTime) -> bool {
        let target = probe_target(self.config.external_address);
        match cert::served_leaf_not_after(target, self.config.probe_timeout) {
            Ok(not_after) => cert::valid_with_margin(not_after, now, self.config.grace_period),
            Err(e) => {
                warn!(error = %e, "Treating unreadable served certificate as expired");
                false
            }
        }
    }

    /// Whether the certificate on disk, the one a replacement would load, outlives `now` by the
    /// grace period.
    pub fn disk_cert_valid_with_margin(&self, now: SystemTime) -> bool {
        match cert::leaf_not_after(&self.config.tls_cert) {
            Ok(not_after) => cert::valid_with_margin(not_after, now, self.config.grace_period),
            Err(e) => {
                debug!(error = %e, "Certificate on disk is unreadable");
                false
            }
        }
    }

    /// Observe the port and, only if it is bound, the certificate.
    pub fn health(&self, now: SystemTime) -> HealthSignals {
        let port_bound = self.port_bound();
        let cert_valid_with_margin = port_bound && self.cert_valid_with_margin(now);
        HealthSignals {
            port_bound,
            cert_valid_with_margin,
        }
    }

    /// True when a live instance owns the external port and this process must not bind.
    ///
    /// An instance whose certificate is within the grace period is terminated first; if that
    /// fails the answer is still "running", since double-binding is worse than serving a
    /// soon-to-expire certificate.
    pub fn server_already_running(&mut self) -> bool {
        self.transition(SupervisorState::Probing);
        let signals = self.health(SystemTime::now());
        let verdict = signals.verdict();
        info!(
            address = %self.config.external_address,
            port_bound = signals.port_bound,
            cert_valid_with_margin = signals.cert_valid_with_margin,
            ?verdict,
            "Probed for an existing relay"
        );
        match verdict {
            Verdict::Bind => {
                self.transition(SupervisorState::NotRunning);
                false
            }
            Verdict::AlreadyRunning => {
                self.transition(SupervisorState::Running);
                true
            }
            Verdict::Restart => {
                if !self.disk_cert_valid_with_margin(SystemTime::now()) {
                    warn!(
                        cert = ?self.config.tls_cert,
                        "Certificate on disk is expiring too; restarting anyway"
                    );
                }
                if self.terminate_existing_server() {
                    self.transition(SupervisorState::NotRunning);
                    false
                } else {
                    error!("Could not retire the existing relay; leaving it running");
                    self.transition(SupervisorState::Running);
                    true
                }
            }
        }
    }

    /// Signal the instance named in the PID file and wait for the external port to free up.
    /// Escalates to SIGKILL at most once. Returns whether the port is free.
    pub fn terminate_existing_server(&mut self) -> bool {
        self.transition(SupervisorState::Restarting);
        let pid_file = &self.config.pid_file;
        let pid = match read_pid(pid_file) {
            Ok(pid) => pid,
            Err(e) => {
                error!(error = %e, "Cannot identify the running relay");
                return false;
            }
        };

        info!(pid, "Sending SIGTERM to existing relay");
        if let Err(e) = self.control.terminate(pid) {
            error!(pid, error = %e, "Unable to terminate existing relay");
            return false;
        }
        if self.wait_for_port_free(self.config.poll_timeout) {
            info!(pid, "Existing relay released the port");
            return true;
        }

        if !self.control.is_alive(pid) {
            error!(pid, "Port still bound but the recorded process is gone");
            return false;
        }
        warn!(pid, timeout = ?self.config.poll_timeout, "Relay ignored SIGTERM; sending SIGKILL");
        if let Err(e) = self.control.kill(pid) {
            error!(pid, error = %e, "Unable to kill existing relay");
            return false;
        }
        let freed = self.wait_for_port_free(self.config.kill_wait);
        if !freed {
            error!(pid, "Port still bound after SIGKILL");
        }
        freed
    }

    fn wait_for_port_free(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.port_bound() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }
}
