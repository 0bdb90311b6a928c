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
    interface = "com.xmgmt.daemon.control",
    default_path = "/com/xmgmt/daemon/control"
)]
pub trait Control {
    async fn download_image(&self, image_path_str: &str) -> Result<String>;
    async fn cancel_download(&self) -> Result<String>;
    async fn scale_frequencies(&self, region: u32, targets: Vec<u16>) -> Result<String>;
    async fn hot_reset(&self) -> Result<String>;
    async fn logic_reset(&self) -> Result<String>;
    async fn reboot(&self) -> Result<String>;
    async fn clear_firewall(&self, domain_str: &str) -> Result<String>;
    async fn submit(&self, code: u32, payload: Vec<u8>) -> Result<String>;
}
