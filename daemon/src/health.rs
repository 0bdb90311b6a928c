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

//! Background firewall polling.
//!
//! The management driver raises an interrupt when a firewall trips; the daemon has no
//! interrupt line of its own, so a [`HealthMonitor`] task reads the latched status of
//! every firewall each `health_interval_ms` and feeds anything new to
//! [`firewall::observe`]. The task holds only a weak reference to the device and is
//! stopped explicitly on detach.

use crate::device::DeviceState;
use crate::error::XmgmtError;
use crate::firewall::{self, FirewallDomain};
use log::{debug, trace, warn};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

#[derive(Debug)]
pub struct HealthMonitor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Spawn the polling task on the current tokio runtime.
    pub fn spawn(state: Weak<DeviceState>, period: Duration) -> HealthMonitor {
        let (stop, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(state) = state.upgrade() else {
                            debug!("Device gone, health monitor exiting");
                            break;
                        };
                        match poll_once(&state) {
                            Ok(0) => {}
                            Ok(n) => debug!("Health monitor observed {n} new trip(s)"),
                            Err(e) => warn!("Health poll failed: {e}"),
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            trace!("Health monitor stopped");
        });
        HealthMonitor { stop, handle }
    }

    /// Signal the task and wait for it to finish.
    pub async fn stop(self) {
        if self.stop.send(true).is_err() {
            trace!("Health monitor already exited");
        }
        if let Err(e) = self.handle.await {
            warn!("Health monitor task ended abnormally: {e}");
        }
    }
}

/// Read every firewall once and record trips for domains not already tripped.
///
/// # Returns: `Result<usize, XmgmtError>`
/// * `Ok(usize)` - Number of newly observed trips
/// * `Err(XmgmtError::Hardware)` - A firewall status register could not be read
pub fn poll_once(state: &DeviceState) -> Result<usize, XmgmtError> {
    let mut observed = 0;
    for domain in FirewallDomain::ALL {
        if firewall::is_tripped(state, domain)? {
            continue;
        }
        let status = state.board().firewalls().status(domain)?;
        if status != 0 {
            firewall::observe(state, domain, status)?;
            observed += 1;
        }
    }
    Ok(observed)
}
