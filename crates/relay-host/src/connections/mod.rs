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

//! Access to the persisted connection registry.
//!
//! The registry is owned by the surrounding application; the relay only flips the columns that
//! say which process instance holds which socket. Every mutation is a conditional update so that
//! a race with another writer ends in "zero rows affected" rather than a clobbered row.

use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;
use wsrelay_common::Fd;

mod in_memory;
mod registry;
mod sqlite;

pub use in_memory::InMemoryRegistry;
pub use registry::{
    ConnectionRegistry, RegistryConfig, RegistryError, RegistryFactory, SharedRegistry,
};
pub use sqlite::SqliteRegistry;

/// Identifies one running relay process. A socket descriptor is only meaningful together with
/// the server id of the process that accepted it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId(String);

impl ServerId {
    /// A fresh id for this process: start time in milliseconds plus the PID.
    pub fn generate() -> Self {
        let started = millis_since_epoch(SystemTime::now());
        Self(format!("{started}.{}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub connection_id: Uuid,
    pub session_id: String,
    pub ip: String,
    pub user_id: Option<i64>,
    pub user_agent_id: i64,
    /// Unset until some relay instance has accepted a socket for this row.
    pub server_id: Option<ServerId>,
    pub fd: Option<Fd>,
    pub opened: Option<SystemTime>,
    pub closed: Option<SystemTime>,
}

impl ConnectionRecord {
    /// Whether this row currently names a socket held by `server_id`.
    pub fn is_live_on(&self, server_id: &ServerId) -> bool {
        self.closed.is_none() && self.fd.is_some() && self.server_id.as_ref() == Some(server_id)
    }
}

/// Parameters for issuing a new connection identifier, ahead of any socket handshake.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub session_id: String,
    pub ip: String,
    pub user_id: Option<i64>,
    pub user_agent_id: i64,
}

pub(crate) fn millis_since_epoch(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn time_from_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}
