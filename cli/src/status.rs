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


//! Read-only queries against the daemon's status interface.
//!
//! The daemon replies with compact JSON. These handlers re-indent it for a terminal and
//! fall back to the raw reply when it does not parse.

use crate::proxies::status_proxy;
use zbus::Connection;

/// Which status query to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusQuery {
    Info,
    Errors,
    ResetState,
}

async fn call_status(query: StatusQuery) -> Result<String, zbus::Error> {
    let connection = Connection::system().await?;
    let proxy = status_proxy::StatusProxy::new(&connection).await?;
    match query {
        StatusQuery::Info => proxy.get_info().await,
        StatusQuery::Errors => proxy.get_errors().await,
        StatusQuery::ResetState => proxy.get_reset_state().await,
    }
}

/// Re-indents a JSON reply, returning it untouched if it is not JSON.
pub fn pretty(reply: &str) -> String {
    serde_json::from_str::<serde_json::Value>(reply)
        .and_then(|value| serde_json::to_string_pretty(&value))
        .unwrap_or_else(|_| reply.to_string())
}

/// Argument parser for the info, errors and state commands
pub async fn status_handler(query: StatusQuery) -> Result<String, zbus::Error> {
    Ok(pretty(&call_status(query).await?))
}
