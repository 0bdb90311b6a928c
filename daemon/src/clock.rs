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

//! Clock controller.
//!
//! Validates and applies frequency scaling requests for the user region clocks. A request
//! is all or nothing: one target outside the supported range of its clock rejects the
//! whole request, and a zero target leaves that clock alone.

use crate::device::DeviceState;
use crate::error::XmgmtError;
use crate::firewall::FirewallDomain;
use log::{info, trace};

/// Clock slots in a scaling request and in the reported clock state.
pub const NUM_SUPPORTED_CLOCKS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyScalingRequest {
    /// Only region 0 exists on current shells.
    pub region: u32,
    /// MHz per clock, 0 meaning unchanged.
    pub targets: [u16; NUM_SUPPORTED_CLOCKS],
}

impl FrequencyScalingRequest {
    /// Build a request from up to [`NUM_SUPPORTED_CLOCKS`] targets; missing ones are 0.
    ///
    /// # Returns: `Result<FrequencyScalingRequest, XmgmtError>`
    /// * `Ok(FrequencyScalingRequest)` - Request with trailing targets zero filled
    /// * `Err(XmgmtError::Argument)` - More targets than clock slots
    pub fn new(region: u32, targets: &[u16]) -> Result<Self, XmgmtError> {
        if targets.len() > NUM_SUPPORTED_CLOCKS {
            return Err(XmgmtError::Argument(format!(
                "{} frequency targets given but only {NUM_SUPPORTED_CLOCKS} clocks exist",
                targets.len()
            )));
        }
        let mut padded = [0; NUM_SUPPORTED_CLOCKS];
        padded[..targets.len()].copy_from_slice(targets);
        Ok(FrequencyScalingRequest {
            region,
            targets: padded,
        })
    }
}

/// Current frequencies as last programmed or read back after a reset.
pub fn frequencies(state: &DeviceState) -> Result<[u16; NUM_SUPPORTED_CLOCKS], XmgmtError> {
    Ok(state.lock()?.clocks)
}

/// Apply `request` to the clock generators.
///
/// Does not take the exclusivity token but refuses to run while a download or a reset
/// holds it.
///
/// # Returns: `Result<(), XmgmtError>`
/// * `Ok(())` - Every non-zero target programmed, or nothing to do
/// * `Err(XmgmtError::Argument)` - Region other than 0
/// * `Err(XmgmtError::PartiallyInvalid)` - A target outside its clock's range
/// * `Err(XmgmtError::DomainTripped)` - Datapath or management firewall tripped
/// * `Err(XmgmtError::Busy)` - A download or reset is in progress
pub fn scale(state: &DeviceState, request: &FrequencyScalingRequest) -> Result<(), XmgmtError> {
    if request.region != 0 {
        return Err(XmgmtError::Argument(format!(
            "region {} does not exist",
            request.region
        )));
    }
    let wizard = state.board().clocks();
    for (index, target) in request.targets.iter().copied().enumerate() {
        if target == 0 {
            continue;
        }
        let range = wizard.supported_range(index);
        if !range.as_ref().is_some_and(|r| r.contains(&target)) {
            let (min, max) = range.map_or((0, 0), |r| (*r.start(), *r.end()));
            return Err(XmgmtError::PartiallyInvalid {
                index,
                target,
                min,
                max,
            });
        }
    }

    // Held across programming so two scale calls cannot interleave.
    let mut inner = state.lock()?;
    if let Some(operation) = inner.exclusive {
        return Err(XmgmtError::Busy(operation.to_string()));
    }
    for domain in [FirewallDomain::Datapath, FirewallDomain::ManagementControl] {
        if inner.firewall.is_tripped(domain) {
            return Err(XmgmtError::DomainTripped(domain));
        }
    }
    if request.targets.iter().all(|target| *target == 0) {
        trace!("Frequency request changes nothing");
        return Ok(());
    }

    let mut next = inner.clocks;
    for (current, target) in next.iter_mut().zip(request.targets) {
        if target != 0 {
            *current = target;
        }
    }
    wizard.program(&next)?;
    inner.clocks = next;
    info!("Clocks now at {next:?} MHz");
    Ok(())
}
