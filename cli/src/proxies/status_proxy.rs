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


use zbus::{Result, proxy};
#[proxy(
    default_service = "com.xmgmt.daemon",
    interface = "com.xmgmt.daemon.status",
    default_path = "/com/xmgmt/daemon/status"
)]
pub trait Status {
    async fn get_info(&self) -> Result<String>;
    async fn get_errors(&self) -> Result<String>;
    async fn get_reset_state(&self) -> Result<String>;
}
