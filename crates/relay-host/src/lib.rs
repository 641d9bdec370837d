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

//! WebSocket relay host.
//!
//! Terminates TLS WebSocket connections from clients on an external listener, accepts push
//! instructions from worker processes on a loopback-only internal listener, and relays each
//! payload to the client sockets it names. A start-up supervisor keeps the relay a singleton and
//! retires an instance whose certificate is about to expire.

pub mod args;
pub mod connections;
pub mod external;
pub mod internal;
pub mod listen;
pub mod relay;
pub mod server;
pub mod supervisor;
pub mod tls;

pub use args::{Args, ConfigError, RelaySettings};
pub use server::{Preflight, RelayServer, RunningRelay, StartError, StartOutcome};
