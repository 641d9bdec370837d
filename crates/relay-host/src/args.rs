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

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::builder::ValueHint;
use clap_derive::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wsrelay_common::{DEFAULT_EXTERNAL_ADDRESS, DEFAULT_INTERNAL_ADDRESS};

use crate::listen::ListenerTimeouts;
use crate::supervisor::SupervisorConfig;

/// Environment variables with this prefix override the configuration file.
pub const ENV_PREFIX: &str = "WSRELAY_";

#[derive(Parser, Debug)]
pub struct Args {
    #[arg(
        long,
        value_name = "config",
        help = "Path to configuration (YAML) file to use, if any. Environment variables prefixed \
                WSRELAY_ override its values.",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    pub debug: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Internal listener must bind a loopback address, not {0}")]
    NonLoopbackInternal(SocketAddr),
    #[error("External and internal listeners cannot share {0}")]
    SharedAddress(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub external_address: SocketAddr,
    pub internal_address: SocketAddr,
    /// Alert log; events are appended here as well as written to stderr.
    pub log_file: Option<PathBuf>,
    pub pid_file: PathBuf,
    /// SQLite connection registry shared with the application. In-memory when unset.
    pub registry_path: Option<PathBuf>,
    pub tls_handshake_timeout_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            tls_cert: PathBuf::from("cert.pem"),
            tls_key: PathBuf::from("key.pem"),
            external_address: DEFAULT_EXTERNAL_ADDRESS
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8443))),
            internal_address: DEFAULT_INTERNAL_ADDRESS
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8081))),
            log_file: None,
            pid_file: PathBuf::from("/tmp/wsrelay.pid"),
            registry_path: None,
            tls_handshake_timeout_ms: 10_000,
            drain_timeout_ms: 2_000,
        }
    }
}

impl RelaySettings {
    /// Defaults, then the YAML file if given, then `WSRELAY_*` environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(RelaySettings::default()));
        if let Some(config_file) = config_file {
            figment = figment.merge(Yaml::file(config_file));
        }
        let settings: RelaySettings = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.internal_address.ip().is_loopback() {
            return Err(ConfigError::NonLoopbackInternal(self.internal_address));
        }
        if self.internal_address.port() != 0 && self.internal_address == self.external_address {
            return Err(ConfigError::SharedAddress(self.internal_address));
        }
        Ok(())
    }

    pub fn listener_timeouts(&self) -> ListenerTimeouts {
        ListenerTimeouts {
            handshake: Duration::from_millis(self.tls_handshake_timeout_ms),
            drain: Duration::from_millis(self.drain_timeout_ms),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig::new(
            self.external_address,
            self.tls_cert.clone(),
            self.pid_file.clone(),
        )
    }
}
