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

//! Pieces shared between the relay host and the worker processes that feed it.

mod instruction;
pub mod tracing;

pub use instruction::{Fd, InstructionError, RelayInstruction};

/// Default loopback address of the internal (worker-facing) listener.
pub const DEFAULT_INTERNAL_ADDRESS: &str = "127.0.0.1:8081";

/// Default address of the external (client-facing, TLS) listener.
pub const DEFAULT_EXTERNAL_ADDRESS: &str = "0.0.0.0:8443";
