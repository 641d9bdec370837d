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

//! Client-facing callbacks: tie each accepted socket to its registry row.

use std::sync::Arc;

use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wsrelay_common::Fd;

use crate::connections::{ServerId, SharedRegistry};
use crate::listen::{ConnectionContext, OpenDecision, Outbound, SocketEvents};
use crate::relay::LiveSockets;

/// The connection identifier is the last non-empty segment of the request path.
pub fn connection_id_from_path(path: &str) -> Option<Uuid> {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .and_then(|segment| Uuid::parse_str(segment).ok())
}

pub struct ExternalListener {
    server_id: ServerId,
    registry: SharedRegistry,
    sockets: Arc<LiveSockets>,
}

impl ExternalListener {
    pub fn new(server_id: ServerId, registry: SharedRegistry, sockets: Arc<LiveSockets>) -> Self {
        Self {
            server_id,
            registry,
            sockets,
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Claim the registry row for `connection_id` on behalf of `fd`. Returns the rows affected;
    /// a storage failure counts as zero.
    pub fn record_open(&self, connection_id: Uuid, fd: Fd) -> usize {
        match self.registry.open(connection_id, &self.server_id, fd) {
            Ok(rows) => rows,
            Err(e) => {
                error!(%connection_id, fd, server_id = %self.server_id, error = %e, "Registry open failed");
                0
            }
        }
    }

    /// Mark the row held by `(this instance, fd)` closed. Returns the rows affected; zero for an
    /// already-closed or foreign row, and for a storage failure.
    pub fn record_close(&self, fd: Fd) -> usize {
        match self.registry.close(&self.server_id, fd) {
            Ok(rows) => rows,
            Err(e) => {
                error!(fd, server_id = %self.server_id, error = %e, "Registry close failed");
                0
            }
        }
    }
}

impl SocketEvents for ExternalListener {
    fn on_open(&self, conn: &ConnectionContext, path: &str, outbound: Outbound) -> OpenDecision {
        let Some(connection_id) = connection_id_from_path(path) else {
            warn!(fd = conn.fd, peer = %conn.peer_addr, path, "Rejecting malformed connection identifier");
            return OpenDecision::Reject("malformed connection identifier".to_string());
        };
        if self.record_open(connection_id, conn.fd) == 0 {
            warn!(fd = conn.fd, peer = %conn.peer_addr, %connection_id, "Rejecting unknown connection identifier");
            return OpenDecision::Reject("unknown connection identifier".to_string());
        }
        if let Some(previous) = self.sockets.insert(conn.fd, connection_id, outbound) {
            warn!(fd = conn.fd, %previous, %connection_id, "Descriptor was still registered to another connection");
        }
        info!(fd = conn.fd, peer = %conn.peer_addr, %connection_id, "Client connection opened");
        OpenDecision::Accept
    }

    fn on_message(&self, conn: &ConnectionContext, message: Message) {
        debug!(fd = conn.fd, len = message.len(), "Ignoring client frame");
    }

    fn on_close(&self, conn: &ConnectionContext) {
        let connection_id = self.sockets.remove(conn.fd);
        let rows = self.record_close(conn.fd);
        info!(fd = conn.fd, ?connection_id, rows, "Client connection closed");
    }
}
