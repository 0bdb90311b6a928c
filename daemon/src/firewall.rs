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

//! Firewall monitor.
//!
//! Tracks trips of the three AXI firewalls that isolate the card's internal bus domains.
//! [`FirewallMonitor`] is the plain bookkeeping (bounded trip log, per-domain state); the
//! free functions at the bottom apply it to a [`DeviceState`] under its lock, which is
//! what makes a trip visible to the clock controller and image loader the moment it is
//! observed.
//!
//! A domain has two flags. `tripped` is what callers see. `resolved` records whether a
//! reset has since dealt with the hardware condition; only a resolved domain may be
//! cleared. The reset coordinator is the only writer of `resolved`.

use crate::device::{DeviceState, FaultEvent};
use crate::error::XmgmtError;
use crate::reset::ResetStage;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Capacity of the trip log. Older records are evicted first.
pub const MAX_TRIP_RECORDS: usize = 8;

pub const NUM_FIREWALL_DOMAINS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallDomain {
    /// Management BAR AXI-Lite access protection.
    ManagementControl,
    /// User BAR AXI-Lite access protection.
    UserControl,
    /// DMA data path protection.
    Datapath,
}

impl FirewallDomain {
    pub const ALL: [FirewallDomain; NUM_FIREWALL_DOMAINS] = [
        FirewallDomain::ManagementControl,
        FirewallDomain::UserControl,
        FirewallDomain::Datapath,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            FirewallDomain::ManagementControl => 0,
            FirewallDomain::UserControl => 1,
            FirewallDomain::Datapath => 2,
        }
    }

    /// Severity reported in [`ErrorReport::firewall_level`] when this domain is tripped.
    pub fn level(self) -> u32 {
        self.index() as u32 + 1
    }
}

impl fmt::Display for FirewallDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FirewallDomain::ManagementControl => "management_control",
            FirewallDomain::UserControl => "user_control",
            FirewallDomain::Datapath => "datapath",
        };
        f.write_str(name)
    }
}

impl FromStr for FirewallDomain {
    type Err = XmgmtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FirewallDomain::ALL
            .into_iter()
            .find(|domain| domain.to_string() == s)
            .ok_or_else(|| XmgmtError::Argument(format!("'{s}' is not a firewall domain")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirewallTripRecord {
    pub domain: FirewallDomain,
    pub status_code: u32,
    /// Monotonic nanoseconds since the device was attached.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PciErrorCounters {
    pub device_status: u32,
    pub uncorrectable: u32,
    pub correctable: u32,
}

impl PciErrorCounters {
    /// Counters reported when the link error registers cannot be read.
    pub fn unknown() -> Self {
        PciErrorCounters {
            device_status: u32::MAX,
            uncorrectable: u32::MAX,
            correctable: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    /// Oldest first, at most [`MAX_TRIP_RECORDS`].
    pub trips: Vec<FirewallTripRecord>,
    /// 0 when nothing is tripped, otherwise the highest [`FirewallDomain::level`] tripped.
    pub firewall_level: u32,
    pub pci_errors: PciErrorCounters,
}

#[derive(Debug, Clone, Copy)]
struct DomainStatus {
    tripped: bool,
    resolved: bool,
}

#[derive(Debug)]
pub struct FirewallMonitor {
    log: VecDeque<FirewallTripRecord>,
    domains: [DomainStatus; NUM_FIREWALL_DOMAINS],
}

impl Default for FirewallMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewallMonitor {
    pub fn new() -> Self {
        FirewallMonitor {
            log: VecDeque::with_capacity(MAX_TRIP_RECORDS),
            domains: [DomainStatus {
                tripped: false,
                resolved: true,
            }; NUM_FIREWALL_DOMAINS],
        }
    }

    /// Append `record` to the log, evicting the oldest record when full.
    ///
    /// # Returns: `bool`
    /// * `true` - The domain went from untripped to tripped
    /// * `false` - The domain was already tripped
    pub fn observe(&mut self, record: FirewallTripRecord) -> bool {
        if self.log.len() == MAX_TRIP_RECORDS {
            if let Some(evicted) = self.log.pop_front() {
                debug!("Trip log full, evicting {evicted:?}");
            }
        }
        self.log.push_back(record);
        let status = &mut self.domains[record.domain.index()];
        let transitioned = !status.tripped;
        status.tripped = true;
        status.resolved = false;
        transitioned
    }

    pub fn is_tripped(&self, domain: FirewallDomain) -> bool {
        self.domains[domain.index()].tripped
    }

    pub(crate) fn is_resolved(&self, domain: FirewallDomain) -> bool {
        self.domains[domain.index()].resolved
    }

    pub fn tripped_domains(&self) -> impl Iterator<Item = FirewallDomain> + '_ {
        FirewallDomain::ALL
            .into_iter()
            .filter(|domain| self.is_tripped(*domain))
    }

    pub fn level(&self) -> u32 {
        self.tripped_domains()
            .map(FirewallDomain::level)
            .max()
            .unwrap_or(0)
    }

    /// Report with zeroed PCI counters; the caller fills those in from the board.
    pub fn snapshot(&self) -> ErrorReport {
        ErrorReport {
            trips: self.log.iter().copied().collect(),
            firewall_level: self.level(),
            pci_errors: PciErrorCounters::default(),
        }
    }

    /// Clear `domain` and drop its records from the log.
    ///
    /// # Returns: `Result<(), XmgmtError>`
    /// * `Ok(())` - Domain is no longer tripped (clearing an untripped domain is a no-op)
    /// * `Err(XmgmtError::StillActive)` - No reset has resolved the domain since it tripped
    pub fn clear(&mut self, domain: FirewallDomain) -> Result<(), XmgmtError> {
        let status = &mut self.domains[domain.index()];
        if !status.resolved {
            return Err(XmgmtError::StillActive(domain));
        }
        status.tripped = false;
        self.log.retain(|record| record.domain != domain);
        Ok(())
    }

    pub(crate) fn mark_unresolved(&mut self, domains: &[FirewallDomain]) {
        for domain in domains {
            self.domains[domain.index()].resolved = false;
        }
    }

    pub(crate) fn mark_resolved(&mut self, domains: &[FirewallDomain]) {
        for domain in domains {
            self.domains[domain.index()].resolved = true;
        }
    }
}

/// Record a trip of `domain` reported with `status_code`.
///
/// Called from the health monitor (the interrupt path) and concurrently with any
/// command. A domain's first trip is pushed as a [`FaultEvent::FirewallTrip`].
pub fn observe(
    state: &DeviceState,
    domain: FirewallDomain,
    status_code: u32,
) -> Result<FirewallTripRecord, XmgmtError> {
    let record = FirewallTripRecord {
        domain,
        status_code,
        timestamp: state.now(),
    };
    let transitioned = state.lock()?.firewall.observe(record);
    if transitioned {
        state.emit(FaultEvent::FirewallTrip(record));
    } else {
        debug!("Firewall {domain} tripped again with status 0x{status_code:X}");
    }
    Ok(record)
}

pub fn is_tripped(state: &DeviceState, domain: FirewallDomain) -> Result<bool, XmgmtError> {
    Ok(state.lock()?.firewall.is_tripped(domain))
}

/// Consistent error report: the trip log is copied under the lock, PCI counters are read
/// from the board afterwards.
pub fn snapshot(state: &DeviceState) -> Result<ErrorReport, XmgmtError> {
    let mut report = state.lock()?.firewall.snapshot();
    report.pci_errors = state
        .board()
        .telemetry()
        .pci_errors()
        .unwrap_or_else(|e| {
            warn!("PCI error counters unavailable: {e}");
            PciErrorCounters::unknown()
        });
    Ok(report)
}

/// Clear a tripped domain, both in the board's latch and in the monitor.
///
/// # Returns: `Result<(), XmgmtError>`
/// * `Ok(())` - Domain cleared
/// * `Err(XmgmtError::StillActive)` - The last reset failed, or none has completed since the trip
/// * `Err(XmgmtError::Hardware)` - The board refused to clear its latch
pub fn clear(state: &DeviceState, domain: FirewallDomain) -> Result<(), XmgmtError> {
    let mut inner = state.lock()?;
    if inner.reset_stage == ResetStage::Failed {
        return Err(XmgmtError::StillActive(domain));
    }
    if !inner.firewall.is_tripped(domain) {
        return inner.firewall.clear(domain);
    }
    // Refuse before touching the latch, so a refused clear leaves the board alone.
    if !inner.firewall.is_resolved(domain) {
        return Err(XmgmtError::StillActive(domain));
    }
    state.board().firewalls().clear(domain)?;
    inner.firewall.clear(domain)?;
    info!("Firewall {domain} cleared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use googletest::matchers::is_empty as empty;
    use rstest::*;

    fn record(domain: FirewallDomain, status_code: u32) -> FirewallTripRecord {
        FirewallTripRecord {
            domain,
            status_code,
            timestamp: u64::from(status_code),
        }
    }

    #[gtest]
    fn fresh_monitor_reports_nothing() {
        let report = FirewallMonitor::new().snapshot();
        assert_that!(report.trips, empty());
        assert_that!(report.firewall_level, eq(0));
    }

    #[gtest]
    #[rstest]
    #[case::exactly_full(8)]
    #[case::one_over(9)]
    #[case::many_over(50)]
    fn log_keeps_the_most_recent_records(#[case] count: u32) {
        let mut monitor = FirewallMonitor::new();
        let domains = FirewallDomain::ALL;
        for n in 0..count {
            monitor.observe(record(domains[n as usize % domains.len()], n));
        }
        let codes: Vec<u32> = monitor
            .snapshot()
            .trips
            .iter()
            .map(|r| r.status_code)
            .collect();
        let expected: Vec<u32> = (count.saturating_sub(MAX_TRIP_RECORDS as u32)..count).collect();
        assert_that!(codes, eq(&expected));
    }

    #[gtest]
    fn only_first_trip_is_a_transition() {
        let mut monitor = FirewallMonitor::new();
        assert_that!(monitor.observe(record(FirewallDomain::Datapath, 1)), eq(true));
        assert_that!(monitor.observe(record(FirewallDomain::Datapath, 2)), eq(false));
        assert_that!(monitor.is_tripped(FirewallDomain::Datapath), eq(true));
        assert_that!(monitor.is_tripped(FirewallDomain::UserControl), eq(false));
    }

    #[gtest]
    fn level_is_highest_tripped_domain() {
        let mut monitor = FirewallMonitor::new();
        monitor.observe(record(FirewallDomain::UserControl, 1));
        assert_that!(monitor.level(), eq(2));
        monitor.observe(record(FirewallDomain::ManagementControl, 1));
        assert_that!(monitor.level(), eq(2));
        monitor.observe(record(FirewallDomain::Datapath, 1));
        assert_that!(monitor.level(), eq(3));
    }

    #[gtest]
    fn clear_requires_resolution() {
        let mut monitor = FirewallMonitor::new();
        monitor.observe(record(FirewallDomain::Datapath, 7));
        assert_that!(
            monitor.clear(FirewallDomain::Datapath),
            err(displays_as(contains_substring("XmgmtError::StillActive")))
        );
        assert_that!(monitor.is_tripped(FirewallDomain::Datapath), eq(true));

        monitor.mark_resolved(&[FirewallDomain::Datapath]);
        assert_that!(monitor.clear(FirewallDomain::Datapath), ok(anything()));
        assert_that!(monitor.is_tripped(FirewallDomain::Datapath), eq(false));
    }

    #[gtest]
    fn clear_drops_only_that_domains_records() {
        let mut monitor = FirewallMonitor::new();
        monitor.observe(record(FirewallDomain::Datapath, 1));
        monitor.observe(record(FirewallDomain::UserControl, 2));
        monitor.observe(record(FirewallDomain::Datapath, 3));
        monitor.mark_resolved(&[FirewallDomain::Datapath]);
        monitor
            .clear(FirewallDomain::Datapath)
            .expect("resolved domain should clear");
        let report = monitor.snapshot();
        let domains: Vec<FirewallDomain> = report.trips.iter().map(|r| r.domain).collect();
        assert_that!(domains, eq(&vec![FirewallDomain::UserControl]));
        assert_that!(report.firewall_level, eq(2));
    }

    #[gtest]
    fn new_trip_after_resolution_needs_another_reset() {
        let mut monitor = FirewallMonitor::new();
        monitor.observe(record(FirewallDomain::UserControl, 1));
        monitor.mark_resolved(&[FirewallDomain::UserControl]);
        monitor.observe(record(FirewallDomain::UserControl, 2));
        assert_that!(monitor.clear(FirewallDomain::UserControl), err(anything()));
    }

    #[gtest]
    #[rstest]
    #[case::management("management_control", FirewallDomain::ManagementControl)]
    #[case::user("user_control", FirewallDomain::UserControl)]
    #[case::datapath("datapath", FirewallDomain::Datapath)]
    fn domain_names_parse(#[case] name: &str, #[case] expected: FirewallDomain) {
        assert_that!(name.parse::<FirewallDomain>(), ok(eq(&expected)));
    }

    #[gtest]
    fn unknown_domain_name_is_argument_error() {
        assert_that!(
            "dma".parse::<FirewallDomain>(),
            err(displays_as(contains_substring("XmgmtError::Argument")))
        );
    }
}
