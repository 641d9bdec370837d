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

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use wsrelay_common::Fd;

use crate::connections::in_memory::InMemoryRegistry;
use crate::connections::sqlite::SqliteRegistry;
use crate::connections::{ConnectionRecord, NewConnection, ServerId};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("Registry lock poisoned")]
    Poisoned,
    #[error("Corrupt registry row: {0}")]
    Corrupt(String),
}

pub type SharedRegistry = Arc<dyn ConnectionRegistry>;

/// The relay's view of the persisted connection registry.
///
/// Mutating operations return the number of rows they affected; zero is a normal answer, not an
/// error.
pub trait ConnectionRegistry: Send + Sync {
    /// Mark the row for `connection_id` as held by `(server_id, fd)`, opened now and not closed.
    /// Any other row still claiming `(server_id, fd)` is closed in the same step.
    fn open(
        &self,
        connection_id: Uuid,
        server_id: &ServerId,
        fd: Fd,
    ) -> Result<usize, RegistryError>;

    /// Record the close of the socket `(server_id, fd)`. A row that is already closed, or that
    /// belongs to another instance, is left alone.
    fn close(&self, server_id: &ServerId, fd: Fd) -> Result<usize, RegistryError>;

    /// Insert a fresh row that no socket has claimed yet, returning its identifier.
    fn issue(&self, connection: NewConnection) -> Result<Uuid, RegistryError>;

    /// Close every row still open under a server id other than `current`.
    fn sweep_stale(&self, current: &ServerId) -> Result<usize, RegistryError>;

    /// Descriptors of the open sockets belonging to `user_id` that `server_id` holds. A descriptor
    /// is only a push target on the instance that accepted it.
    fn live_fds_for_user(
        &self,
        server_id: &ServerId,
        user_id: i64,
    ) -> Result<Vec<Fd>, RegistryError>;

    /// Descriptors of the open sockets belonging to `session_id` that `server_id` holds.
    fn live_fds_for_session(
        &self,
        server_id: &ServerId,
        session_id: &str,
    ) -> Result<Vec<Fd>, RegistryError>;

    fn get(&self, connection_id: Uuid) -> Result<Option<ConnectionRecord>, RegistryError>;
}

pub enum RegistryConfig {
    /// Rows live only as long as the process; nothing is shared with other processes.
    InMemoryOnly,
    /// SQLite file shared with the application that issues connection identifiers.
    Sqlite { path: PathBuf },
}

/// Factory for creating registry instances
pub struct RegistryFactory;

impl RegistryFactory {
    pub fn create(config: RegistryConfig) -> Result<SharedRegistry, RegistryError> {
        match config {
            RegistryConfig::InMemoryOnly => {
                warn!("Using in-memory connection registry; connection ids cannot be issued by other processes");
                Ok(Arc::new(InMemoryRegistry::new()))
            }
            RegistryConfig::Sqlite { path } => {
                info!(path = ?path, "Opening connection registry");
                Ok(Arc::new(SqliteRegistry::open(&path)?))
            }
        }
    }

    /// Build the registry named by an optional path: SQLite when given, in-memory otherwise.
    pub fn from_path(path: Option<&Path>) -> Result<SharedRegistry, RegistryError> {
        match path {
            Some(path) => Self::create(RegistryConfig::Sqlite {
                path: path.to_path_buf(),
            }),
            None => Self::create(RegistryConfig::InMemoryOnly),
        }
    }
}
