// This file is part of xmgmtd, an application to manage PCIe-attached reconfigurable accelerator cards.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// xmgmtd is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// xmgmtd is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! Accelerator management daemon (xmgmtd) - System service for PCIe accelerator cards.
//!
//! This is the entry point of the xmgmtd daemon, which exposes the management control
//! plane of one accelerator card over the system DBus. The daemon:
//! - Attaches to the board backend named in its configuration
//! - Polls the card's firewalls in the background and publishes trips as signals
//! - Exposes two DBus interfaces: `control` and `status`
//! - Detaches cleanly on SIGINT or SIGTERM
//!
//! # DBus Service
//!
//! - **Service Name**: `com.xmgmt.daemon`
//! - **Status Interface**: `/com/xmgmt/daemon/status` - Snapshots and the `FaultEvent` signal
//! - **Control Interface**: `/com/xmgmt/daemon/control` - Downloads, resets and clock changes
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (`trace`, `debug`, `info`, `warn`, `error`
//!   or `off`). Defaults to `info`
//! - `XMGMTD_CONFIG` - Configuration file. Defaults to `/etc/xmgmtd/xmgmtd.toml`

use log::info;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use xmgmtd::boards::board::{Board, board_for_name, registered_boards};
use xmgmtd::boards::simulated::SimulatedBoard;
use xmgmtd::comm::dbus::control_interface::ControlInterface;
use xmgmtd::comm::dbus::status_interface::{StatusInterface, forward_fault_events};
use xmgmtd::config::{DBUS_CONTROL_PATH, DBUS_SERVICE_NAME, DBUS_STATUS_PATH, DaemonConfig};
use xmgmtd::device::DeviceState;
use zbus::connection;

/// Register all available board implementations.
fn register_boards() -> Result<(), Box<dyn Error>> {
    SimulatedBoard::register_board()?;
    info!("Registered boards: {}", registered_boards()?.join(", "));
    Ok(())
}

/// Main entry point for the xmgmtd daemon.
///
/// Initializes the daemon by:
/// 1. Setting up logging via `env_logger` (defaults to "info" level)
/// 2. Registering board implementations and loading the configuration
/// 3. Attaching to the configured board and starting the health monitor
/// 4. Connecting to the system DBus and advertising the service
/// 5. Serving requests until SIGINT or SIGTERM, then detaching
///
/// # Returns: `Result<(), Box<dyn Error>>`
/// * `Ok(())` - Terminated by signal after a clean detach
/// * `Err(Box<dyn Error>)` - Initialization error (bad configuration, DBus connection failed, etc.)
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    register_boards()?;

    let config_path = DaemonConfig::path_from_env();
    let config = DaemonConfig::load(Path::new(&config_path))?;
    let board: Arc<dyn Board> = Arc::from(board_for_name(&config.board, &config)?);
    let state = DeviceState::attach(board, config.device.clone())?;
    state.start_health_monitor()?;

    let conn = connection::Builder::system()?
        .name(DBUS_SERVICE_NAME)?
        .serve_at(DBUS_STATUS_PATH, StatusInterface::new(state.clone()))?
        .serve_at(DBUS_CONTROL_PATH, ControlInterface::new(state.clone()))?
        .build()
        .await?;
    let forwarder = tokio::spawn(forward_fault_events(
        conn.clone(),
        Arc::downgrade(&state),
        state.subscribe(),
    ));

    info!("Started {DBUS_SERVICE_NAME} dbus service");
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = sigterm.recv() => info!("Terminated"),
    }

    forwarder.abort();
    state.detach().await;
    Ok(())
}
