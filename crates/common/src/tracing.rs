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

//! Shared tracing initialization for the relay binaries

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use eyre::eyre;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

fn env_filter(debug_fallback: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if debug_fallback { "debug" } else { "info" };
        EnvFilter::new(level)
    })
}

/// Initialize tracing with environment-based configuration and fallback support
///
/// - Uses `RUST_LOG` environment variable when available
/// - Falls back to provided debug flag when `RUST_LOG` is not set
/// - When `log_file` is given, every event is also appended to that file without ANSI colours.
///   That file is the alert log operators watch for start-up and registry failures.
pub fn init_tracing(debug_fallback: bool, log_file: Option<&Path>) -> Result<(), eyre::Report> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| eyre!("Unable to open log file {}: {}", path.display(), e))?;
            Some(
                fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_file(true)
                    .with_target(false)
                    .with_line_number(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_ansi(true)
                .with_file(true)
                .with_target(false)
                .with_line_number(true)
                .with_thread_names(true)
                .with_span_events(fmt::format::FmtSpan::NONE),
        )
        .with(file_layer)
        .with(env_filter(debug_fallback))
        .try_init()
        .map_err(|e| eyre!("Unable to install tracing subscriber: {}", e))?;

    Ok(())
}
