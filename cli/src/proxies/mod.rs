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


//! DBus proxy interfaces for the xmgmtd daemon.
//!
//! The proxies are generated by the `zbus` `#[proxy]` macro and give the CLI typed,
//! asynchronous access to the daemon over the system bus.
//!
//! # Modules
//!
//! - [`control_proxy`] - Mutating operations (image download, resets, clock scaling)
//! - [`status_proxy`] - Read-only operations (device snapshot, error report, reset stage)
//!
//! # DBus Service Information
//!
//! - **Service Name**: `com.xmgmt.daemon`
//! - **Control Interface**: `com.xmgmt.daemon.control` at `/com/xmgmt/daemon/control`
//! - **Status Interface**: `com.xmgmt.daemon.status` at `/com/xmgmt/daemon/status`

pub mod control_proxy;
pub mod status_proxy;
