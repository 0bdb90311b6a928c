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


//! Mutating commands sent to the daemon's control interface.
//!
//! Image paths are resolved to absolute paths on the client side, since the daemon
//! refuses relative ones and does not share the caller's working directory.

use crate::ControlCommand;
use crate::proxies::control_proxy;
use std::path::Path;
use zbus::Connection;

/// Resolves `file` against the current directory, failing if it does not exist.
pub fn absolute_image_path(file: &Path) -> Result<String, zbus::Error> {
    let path = file.canonicalize().map_err(|e| {
        zbus::Error::Failure(format!("cannot resolve image path {}: {e}", file.display()))
    })?;
    Ok(path.to_string_lossy().to_string())
}

fn read_payload(file: &Option<std::path::PathBuf>) -> Result<Vec<u8>, zbus::Error> {
    match file {
        None => Ok(Vec::new()),
        Some(path) => std::fs::read(path).map_err(|e| {
            zbus::Error::Failure(format!("cannot read payload {}: {e}", path.display()))
        }),
    }
}

/// Argument parser for the control commands
pub async fn control_handler(command: &ControlCommand) -> Result<String, zbus::Error> {
    // resolve local files before touching the bus
    let image_path = match command {
        ControlCommand::Download { file } => Some(absolute_image_path(file)?),
        _ => None,
    };
    let payload = match command {
        ControlCommand::Submit { payload, .. } => read_payload(payload)?,
        _ => Vec::new(),
    };

    let connection = Connection::system().await?;
    let proxy = control_proxy::ControlProxy::new(&connection).await?;
    match command {
        ControlCommand::Download { .. } => {
            proxy
                .download_image(image_path.as_deref().unwrap_or_default())
                .await
        }
        ControlCommand::Cancel => proxy.cancel_download().await,
        ControlCommand::Scale { region, mhz } => {
            proxy.scale_frequencies(*region, mhz.clone()).await
        }
        ControlCommand::HotReset => proxy.hot_reset().await,
        ControlCommand::LogicReset => proxy.logic_reset().await,
        ControlCommand::Reboot => proxy.reboot().await,
        ControlCommand::Clear { domain } => proxy.clear_firewall(domain).await,
        ControlCommand::Submit { code, .. } => proxy.submit(*code, payload).await,
    }
}
