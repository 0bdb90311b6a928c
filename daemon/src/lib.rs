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

//! Control plane for PCIe-attached reconfigurable accelerator cards.
//!
//! The library holds everything the `xmgmtd` daemon does apart from process start-up:
//! - [`firewall`] - Tracks trips of the AXI fault isolation firewalls
//! - [`image`] - Validates image containers and streams them to the card
//! - [`reset`] - Sequences hot resets, logic resets and reboots
//! - [`clock`] - Validates and applies user region frequency changes
//! - [`telemetry`] - Point-in-time device information snapshots
//! - [`dispatch`] - Decodes management requests and routes them to the above
//!
//! All of them operate on a shared [`device::DeviceState`] attached to one
//! [`boards::board::Board`]. [`comm::dbus`] exposes the operations on the system bus.

pub mod boards;
pub mod clock;
pub mod comm;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod firewall;
pub mod health;
pub mod image;
pub mod reset;
pub mod system_io;
pub mod telemetry;
