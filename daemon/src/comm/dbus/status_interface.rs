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

use crate::comm::dbus::to_json;
use crate::config::DBUS_STATUS_PATH;
use crate::device::{DeviceState, FaultEvent};
use crate::dispatch::{Command, dispatch};
use crate::error::XmgmtError;
use crate::firewall;
use crate::reset::{self, ResetStage};
use log::{error, info, trace, warn};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use zbus::object_server::SignalEmitter;
use zbus::{Connection, fdo, interface};

pub struct StatusInterface {
    state: Arc<DeviceState>,
}

impl StatusInterface {
    pub fn new(state: Arc<DeviceState>) -> Self {
        StatusInterface { state }
    }
}

#[derive(Debug, Serialize)]
struct ResetStatus {
    stage: ResetStage,
    /// Operation holding the exclusivity token, if any.
    busy: Option<String>,
}

#[interface(name = "com.xmgmt.daemon.status")]
impl StatusInterface {
    async fn get_info(&self) -> Result<String, fdo::Error> {
        info!("get_info called");
        Ok(dispatch(&self.state, Command::InfoQuery).await?.render()?)
    }

    async fn get_errors(&self) -> Result<String, fdo::Error> {
        info!("get_errors called");
        Ok(dispatch(&self.state, Command::ErrorQuery).await?.render()?)
    }

    async fn get_reset_state(&self) -> Result<String, fdo::Error> {
        info!("get_reset_state called");
        let status = ResetStatus {
            stage: reset::stage(&self.state)?,
            busy: self.state.exclusive_holder()?.map(|op| op.to_string()),
        };
        Ok(to_json(&status)?)
    }

    /// Emitted for every firewall trip, failed reset and partial reconfiguration.
    #[zbus(signal)]
    async fn fault_event(
        emitter: &SignalEmitter<'_>,
        kind: &str,
        detail: &str,
    ) -> zbus::Result<()>;

    /// Emitted after every firewall trip with the error report as `get_errors` returns it.
    #[zbus(signal)]
    async fn error_report(emitter: &SignalEmitter<'_>, report: &str) -> zbus::Result<()>;
}

/// The JSON error report to push alongside `event`, if it is a trip.
pub(crate) fn report_for_event(
    state: &DeviceState,
    event: &FaultEvent,
) -> Result<Option<String>, XmgmtError> {
    match event {
        FaultEvent::FirewallTrip(..) => Ok(Some(to_json(&firewall::snapshot(state)?)?)),
        FaultEvent::ResetFailed { .. } | FaultEvent::PartialReconfiguration(..) => Ok(None),
    }
}

/// Relay fault events from the device to the `FaultEvent` signal until the device goes away.
///
/// Trips are followed by an `ErrorReport` signal carrying a fresh snapshot.
pub async fn forward_fault_events(
    conn: Connection,
    state: Weak<DeviceState>,
    mut events: broadcast::Receiver<FaultEvent>,
) {
    let emitter = match SignalEmitter::new(&conn, DBUS_STATUS_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            error!("Cannot emit fault events on {DBUS_STATUS_PATH}: {e}");
            return;
        }
    };
    loop {
        match events.recv().await {
            Ok(event) => {
                trace!("Forwarding fault event {}", event.kind());
                if let Err(e) =
                    StatusInterface::fault_event(&emitter, event.kind(), &event.to_string()).await
                {
                    warn!("Failed to emit fault event: {e}");
                }
                let Some(state) = state.upgrade() else {
                    break;
                };
                match report_for_event(&state, &event) {
                    Ok(Some(report)) => {
                        if let Err(e) = StatusInterface::error_report(&emitter, &report).await {
                            warn!("Failed to emit error report: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Could not build error report for {}: {e}", event.kind()),
                }
            }
            Err(RecvError::Lagged(missed)) => warn!("{missed} fault events were not forwarded"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boards::simulated::SimulatedBoard;
    use crate::config::DeviceConfig;
    use crate::firewall::FirewallDomain;
    use crate::reset::ResetKind;
    use googletest::prelude::*;

    fn attach() -> Arc<DeviceState> {
        DeviceState::attach(Arc::new(SimulatedBoard::new()), DeviceConfig::default())
            .expect("attach")
    }

    #[gtest]
    fn trip_event_carries_current_error_report() {
        let state = attach();
        let mut events = state.subscribe();
        firewall::observe(&state, FirewallDomain::Datapath, 0x4).expect("observe");
        let event = events.try_recv().expect("trip event");

        let report = report_for_event(&state, &event)
            .expect("report")
            .expect("trips carry a report");
        let parsed: serde_json::Value = serde_json::from_str(&report).expect("valid json");
        assert_that!(parsed["trips"].as_array().map(Vec::len), some(eq(1)));
        assert_that!(parsed["trips"][0]["status_code"].as_u64(), some(eq(4)));
        assert_that!(parsed["firewall_level"].as_u64(), some(eq(3)));
    }

    #[gtest]
    fn other_events_carry_no_report() {
        let state = attach();
        let event = FaultEvent::ResetFailed {
            kind: ResetKind::Hot,
            stage: ResetStage::Quiescing,
            reason: String::from("no ack"),
        };
        assert_that!(report_for_event(&state, &event).expect("report").is_none(), eq(true));
    }
}
