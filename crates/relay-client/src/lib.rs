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

//! Client used by worker processes to hand payloads to the relay host's internal listener.
//!
//! The relay never acknowledges an instruction, so `send` returns as soon as the frame has been
//! written to the loopback socket.

use futures_util::SinkExt;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};
use wsrelay_common::{Fd, InstructionError, RelayInstruction};

pub use wsrelay_common::DEFAULT_INTERNAL_ADDRESS;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Could not connect to relay at {0}: {1}")]
    CouldNotConnect(String, tokio_tungstenite::tungstenite::Error),
    #[error("Could not send relay instruction: {0}")]
    CouldNotSend(tokio_tungstenite::tungstenite::Error),
    #[error("Could not encode relay instruction: {0}")]
    Encoding(#[from] InstructionError),
}

/// A connection to the internal listener of a running relay host.
pub struct RelayClient {
    address: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RelayClient {
    /// Connect to the internal listener at `address` (`host:port`, loopback).
    pub async fn connect(address: &str) -> Result<Self, ClientError> {
        let url = format!("ws://{address}/");
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::CouldNotConnect(address.to_string(), e))?;
        debug!(address, "Connected to relay internal listener");
        Ok(Self {
            address: address.to_string(),
            stream,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Write one instruction to the relay. Fire and forget.
    pub async fn send(&mut self, instruction: &RelayInstruction) -> Result<(), ClientError> {
        let payload = instruction.to_json()?;
        trace!(targets = ?instruction.fd, "Sending relay instruction");
        self.stream
            .send(Message::text(payload))
            .await
            .map_err(ClientError::CouldNotSend)
    }

    /// Build and send an instruction delivering `data` to each of `fds`.
    pub async fn push(&mut self, fds: Vec<Fd>, data: Value) -> Result<(), ClientError> {
        self.send(&RelayInstruction::new(fds, data)).await
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream
            .close(None)
            .await
            .map_err(ClientError::CouldNotSend)
    }
}
