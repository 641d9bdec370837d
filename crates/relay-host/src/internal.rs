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

//! Worker-facing callbacks. Peers are trusted on the strength of being on loopback.

use std::net::SocketAddr;

use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use wsrelay_common::RelayInstruction;

use crate::listen::{ConnectionContext, OpenDecision, Outbound, SocketEvents};
use crate::relay::{Relay, RelayReport};

pub struct InternalListener {
    relay: Relay,
}

impl InternalListener {
    pub fn new(relay: Relay) -> Self {
        Self { relay }
    }

    /// Parse and carry out one frame's instruction. `None` when there was nothing to deliver.
    pub fn handle_frame(&self, text: &str) -> Option<RelayReport> {
        let instruction = match RelayInstruction::parse(text) {
            Ok(instruction) => instruction,
            Err(e) => {
                warn!(error = %e, "Discarding unparsable relay instruction");
                return None;
            }
        };
        if !instruction.has_targets() {
            debug!("Relay instruction names no targets");
            return None;
        }
        Some(self.relay.relay(&instruction))
    }
}

impl SocketEvents for InternalListener {
    fn accepts_peer(&self, peer_addr: SocketAddr) -> bool {
        peer_addr.ip().is_loopback()
    }

    fn on_open(&self, conn: &ConnectionContext, _path: &str, _outbound: Outbound) -> OpenDecision {
        debug!(fd = conn.fd, peer = %conn.peer_addr, "Worker connected");
        OpenDecision::Accept
    }

    fn on_message(&self, conn: &ConnectionContext, message: Message) {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => match bytes.try_into() {
                Ok(text) => text,
                Err(_) => {
                    warn!(fd = conn.fd, "Discarding non-UTF-8 binary frame");
                    return;
                }
            },
            _ => return,
        };
        self.handle_frame(text.as_str());
    }

    fn on_close(&self, conn: &ConnectionContext) {
        debug!(fd = conn.fd, "Worker disconnected");
    }
}
