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

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A socket descriptor as seen by the relay host process. Only meaningful together with the
/// server id of the instance that handed it out.
pub type Fd = i32;

#[derive(Debug, Error)]
pub enum InstructionError {
    #[error("Relay instruction is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Relay instruction must be a JSON object")]
    NotAnObject,
}

/// One push request from a worker: deliver `data` to every socket in `fd`.
///
/// Sent once over the internal listener, consumed by the relay, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayInstruction {
    #[serde(default)]
    pub fd: Vec<Fd>,
    #[serde(default)]
    pub data: Value,
}

impl RelayInstruction {
    pub fn new(fd: Vec<Fd>, data: Value) -> Self {
        Self { fd, data }
    }

    /// Parse the text payload of an internal frame.
    ///
    /// A missing `fd` key parses as an empty target list; the caller decides what to do with
    /// an instruction that has nowhere to go.
    pub fn parse(text: &str) -> Result<Self, InstructionError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(InstructionError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<String, InstructionError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn has_targets(&self) -> bool {
        !self.fd.is_empty()
    }
}
