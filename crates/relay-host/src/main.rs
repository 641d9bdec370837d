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

use clap::Parser;
use eyre::WrapErr;
use mimalloc::MiMalloc;
use tracing::{error, info};
use wsrelay_host::connections::RegistryFactory;
use wsrelay_host::{Args, Preflight, RelayServer, RelaySettings};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> Result<(), eyre::Report> {
    color_eyre::install()?;
    let args = Args::parse();
    let settings = RelaySettings::load(args.config_file.as_deref())?;

    wsrelay_common::tracing::init_tracing(args.debug, settings.log_file.as_deref())
        .wrap_err("Unable to configure logging")?;

    let registry = RegistryFactory::from_path(settings.registry_path.as_deref())
        .inspect_err(|e| error!(error = %e, "Unable to open connection registry"))?;

    // Supervision happens before the reactor exists.
    let mut server = RelayServer::new(settings, registry);
    if server.preflight() == Preflight::AlreadyRunning {
        info!("Another relay instance is serving; exiting");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err("Unable to build runtime")?;
    runtime.block_on(async move {
        let running = server.bind().await?;
        running.run_until_signal().await?;
        info!("Done.");
        Ok::<_, eyre::Report>(())
    })
}
