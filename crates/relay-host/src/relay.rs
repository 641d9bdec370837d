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

//! Best-effort delivery of worker payloads to established external sockets.
//!
//! Nothing here waits or retries. Each connection has a small bounded outbound channel; a push
//! that finds it full is dropped like any other undeliverable push. A target that is not
//! established is logged and skipped; the remaining targets of the same instruction are still
//! attempted.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tracing::{debug, trace, warn};
use uuid::Uuid;
use wsrelay_common::{Fd, RelayInstruction};

use crate::listen::Outbound;

struct LiveSocket {
    connection_id: Uuid,
    outbound: Outbound,
}

/// The external sockets that completed their open handshake, keyed by descriptor.
#[derive(Default)]
pub struct LiveSockets {
    sockets: papaya::HashMap<Fd, LiveSocket>,
}

impl LiveSockets {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an established socket. Returns the connection id previously held under `fd`,
    /// which can only happen if a close was missed.
    pub fn insert(&self, fd: Fd, connection_id: Uuid, outbound: Outbound) -> Option<Uuid> {
        let guard = self.sockets.guard();
        self.sockets
            .insert(
                fd,
                LiveSocket {
                    connection_id,
                    outbound,
                },
                &guard,
            )
            .map(|previous| previous.connection_id)
    }

    pub fn remove(&self, fd: Fd) -> Option<Uuid> {
        let guard = self.sockets.guard();
        self.sockets
            .remove(&fd, &guard)
            .map(|removed| removed.connection_id)
    }

    pub fn connection_id(&self, fd: Fd) -> Option<Uuid> {
        let guard = self.sockets.guard();
        self.sockets.get(&fd, &guard).map(|s| s.connection_id)
    }

    pub fn contains(&self, fd: Fd) -> bool {
        self.connection_id(fd).is_some()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    fn send(&self, fd: Fd, message: Message) -> PushOutcome {
        let guard = self.sockets.guard();
        let Some(socket) = self.sockets.get(&fd, &guard) else {
            return PushOutcome::NotEstablished;
        };
        match socket.outbound.try_send(message) {
            Ok(()) => PushOutcome::Delivered,
            Err(TrySendError::Full(_)) => PushOutcome::Saturated,
            Err(TrySendError::Closed(_)) => PushOutcome::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Handed to the socket's writer.
    Delivered,
    /// No established socket holds this descriptor.
    NotEstablished,
    /// The socket is registered but its writer has already gone away.
    Disconnected,
    /// The socket's outbound channel is full; the client is not keeping up.
    Saturated,
}

/// Per-target results of one relay instruction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: Vec<Fd>,
    pub undeliverable: Vec<Fd>,
}

#[derive(Clone)]
pub struct Relay {
    sockets: Arc<LiveSockets>,
}

impl Relay {
    pub fn new(sockets: Arc<LiveSockets>) -> Self {
        Self { sockets }
    }

    /// Serialize `data` and write it to `fd` if that descriptor is an established socket.
    pub fn push(&self, fd: Fd, data: &Value) -> PushOutcome {
        self.push_payload(fd, Utf8Bytes::from(data.to_string()))
    }

    fn push_payload(&self, fd: Fd, payload: Utf8Bytes) -> PushOutcome {
        let outcome = self.sockets.send(fd, Message::Text(payload));
        match outcome {
            PushOutcome::Delivered => trace!(fd, "Pushed payload"),
            PushOutcome::NotEstablished => debug!(fd, "Dropping payload for unestablished socket"),
            PushOutcome::Disconnected => debug!(fd, "Dropping payload for disconnected socket"),
            PushOutcome::Saturated => warn!(fd, "Dropping payload; outbound channel full"),
        }
        outcome
    }

    /// Push the instruction's payload to each of its targets. The payload is serialized once.
    pub fn relay(&self, instruction: &RelayInstruction) -> RelayReport {
        let payload = Utf8Bytes::from(instruction.data.to_string());
        let mut report = RelayReport::default();
        for &fd in &instruction.fd {
            match self.push_payload(fd, payload.clone()) {
                PushOutcome::Delivered => report.delivered.push(fd),
                PushOutcome::NotEstablished
                | PushOutcome::Disconnected
                | PushOutcome::Saturated => report.undeliverable.push(fd),
            }
        }
        if !report.undeliverable.is_empty() {
            debug!(
                delivered = ?report.delivered,
                undeliverable = ?report.undeliverable,
                "Relay instruction partially delivered"
            );
        }
        report
    }
}
