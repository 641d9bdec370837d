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

//! Process-local registry, used in tests and when no registry file is configured.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use uuid::Uuid;
use wsrelay_common::Fd;

use crate::connections::registry::{ConnectionRegistry, RegistryError};
use crate::connections::{ConnectionRecord, NewConnection, ServerId};

#[derive(Default)]
pub struct InMemoryRegistry {
    rows: Mutex<HashMap<Uuid, ConnectionRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<MutexGuard<'_, HashMap<Uuid, ConnectionRecord>>, RegistryError> {
        self.rows.lock().map_err(|_| RegistryError::Poisoned)
    }

    fn live_fds_where<F: Fn(&ConnectionRecord) -> bool>(
        &self,
        server_id: &ServerId,
        pred: F,
    ) -> Result<Vec<Fd>, RegistryError> {
        let rows = self.rows()?;
        let mut fds: Vec<Fd> = rows
            .values()
            .filter(|r| r.is_live_on(server_id) && pred(r))
            .filter_map(|r| r.fd)
            .collect();
        fds.sort_unstable();
        Ok(fds)
    }
}

impl ConnectionRegistry for InMemoryRegistry {
    fn open(
        &self,
        connection_id: Uuid,
        server_id: &ServerId,
        fd: Fd,
    ) -> Result<usize, RegistryError> {
        let mut rows = self.rows()?;
        if !rows.contains_key(&connection_id) {
            return Ok(0);
        }
        let now = SystemTime::now();
        for (id, row) in rows.iter_mut() {
            if *id != connection_id && row.is_live_on(server_id) && row.fd == Some(fd) {
                row.closed = Some(now);
            }
        }
        let Some(row) = rows.get_mut(&connection_id) else {
            return Ok(0);
        };
        row.server_id = Some(server_id.clone());
        row.fd = Some(fd);
        row.opened = Some(now);
        row.closed = None;
        Ok(1)
    }

    fn close(&self, server_id: &ServerId, fd: Fd) -> Result<usize, RegistryError> {
        let mut rows = self.rows()?;
        let now = SystemTime::now();
        let mut affected = 0;
        for row in rows.values_mut() {
            if row.is_live_on(server_id) && row.fd == Some(fd) {
                row.closed = Some(now);
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn issue(&self, connection: NewConnection) -> Result<Uuid, RegistryError> {
        let connection_id = Uuid::new_v4();
        let record = ConnectionRecord {
            connection_id,
            session_id: connection.session_id,
            ip: connection.ip,
            user_id: connection.user_id,
            user_agent_id: connection.user_agent_id,
            server_id: None,
            fd: None,
            opened: None,
            closed: None,
        };
        self.rows()?.insert(connection_id, record);
        Ok(connection_id)
    }

    fn sweep_stale(&self, current: &ServerId) -> Result<usize, RegistryError> {
        let mut rows = self.rows()?;
        let now = SystemTime::now();
        let mut affected = 0;
        for row in rows.values_mut() {
            let stale = row.closed.is_none()
                && row.server_id.is_some()
                && row.server_id.as_ref() != Some(current);
            if stale {
                row.closed = Some(now);
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn live_fds_for_user(
        &self,
        server_id: &ServerId,
        user_id: i64,
    ) -> Result<Vec<Fd>, RegistryError> {
        self.live_fds_where(server_id, |r| r.user_id == Some(user_id))
    }

    fn live_fds_for_session(
        &self,
        server_id: &ServerId,
        session_id: &str,
    ) -> Result<Vec<Fd>, RegistryError> {
        self.live_fds_where(server_id, |r| r.session_id == session_id)
    }

    fn get(&self, connection_id: Uuid) -> Result<Option<ConnectionRecord>, RegistryError> {
        Ok(self.rows()?.get(&connection_id).cloned())
    }
}
