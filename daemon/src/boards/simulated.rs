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

//! In-memory accelerator card.
//!
//! `SimulatedBoard` behaves like a healthy two-clock card: every reset is acknowledged on
//! the first poll, downloads land in a fake configuration memory and sensors return fixed
//! plausible values. Failure injection knobs let tests (and operators trying the daemon
//! without hardware) withhold acknowledgements, fail a given chunk, remove the stable
//! fallback image or make sensors unreadable.
//!
//! When the daemon configuration names a `pci_slot`, identity, link and sensors come from
//! [`SysfsTelemetry`] instead of the built-in values.

use crate::boards::board::{
    Board, ClockWizard, FirewallStatus, Icap, ResetLines, TelemetrySource, register_board,
};
use crate::boards::sysfs_telemetry::SysfsTelemetry;
use crate::clock::NUM_SUPPORTED_CLOCKS;
use crate::config::DaemonConfig;
use crate::error::XmgmtError;
use crate::firewall::{FirewallDomain, NUM_FIREWALL_DOMAINS, PciErrorCounters};
use crate::image::ContainerHeader;
use crate::reset::ResetKind;
use crate::telemetry::{DeviceIdentity, LinkInfo, Sensor};
use log::{debug, trace};
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const SIMULATED_BOARD_NAME: &str = "simulated";

/// Feature ROM timestamp of the simulated shell.
pub const SIMULATED_FEATURE_ID: u64 = 0x5D14_FBE6;

const SIMULATED_CLOCKS: usize = 2;
const CLOCK_RANGE: RangeInclusive<u16> = 10..=500;
const DEFAULT_FREQUENCIES: [u16; NUM_SUPPORTED_CLOCKS] = [300, 500, 0, 0];

#[derive(Debug)]
struct SimState {
    frequencies: [u16; NUM_SUPPORTED_CLOCKS],
    latched: [u32; NUM_FIREWALL_DOMAINS],
    withhold_quiesce_ack: bool,
    withhold_ready_ack: bool,
    in_reset: bool,
    reset_count: usize,
    fail_chunk_at: Option<usize>,
    pending_uuid: Option<[u8; 16]>,
    chunk_index: usize,
    chunks_written: usize,
    loaded_uuid: Option<[u8; 16]>,
    golden_image: bool,
    rollbacks: usize,
    sensors_available: bool,
}

pub struct SimulatedBoard {
    state: Mutex<SimState>,
    telemetry: Option<Box<dyn TelemetrySource>>,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBoard {
    pub fn new() -> Self {
        SimulatedBoard {
            state: Mutex::new(SimState {
                frequencies: DEFAULT_FREQUENCIES,
                latched: [0; NUM_FIREWALL_DOMAINS],
                withhold_quiesce_ack: false,
                withhold_ready_ack: false,
                in_reset: false,
                reset_count: 0,
                fail_chunk_at: None,
                pending_uuid: None,
                chunk_index: 0,
                chunks_written: 0,
                loaded_uuid: None,
                golden_image: false,
                rollbacks: 0,
                sensors_available: true,
            }),
            telemetry: None,
        }
    }

    /// Serve identity, link and sensors from `telemetry` instead of the built-in values.
    pub fn with_telemetry(mut self, telemetry: Box<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn register_board() -> Result<(), XmgmtError> {
        register_board(SIMULATED_BOARD_NAME, construct)
    }

    // The simulator must stay usable after a panicking test thread.
    fn sim(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latch `status` in the firewall of `domain`, as the hardware would on a violation.
    pub fn trip(&self, domain: FirewallDomain, status: u32) {
        self.sim().latched[domain.index()] = status;
    }

    pub fn latched(&self, domain: FirewallDomain) -> u32 {
        self.sim().latched[domain.index()]
    }

    pub fn withhold_quiesce_ack(&self, withhold: bool) {
        self.sim().withhold_quiesce_ack = withhold;
    }

    pub fn withhold_ready_ack(&self, withhold: bool) {
        self.sim().withhold_ready_ack = withhold;
    }

    /// Make the ICAP reject chunk `index` (0 based) of every following download.
    pub fn fail_chunk_at(&self, index: Option<usize>) {
        self.sim().fail_chunk_at = index;
    }

    pub fn set_golden_image(&self, available: bool) {
        self.sim().golden_image = available;
    }

    pub fn set_sensors_available(&self, available: bool) {
        self.sim().sensors_available = available;
    }

    /// Change the running frequencies behind the daemon's back.
    pub fn set_frequencies(&self, frequencies: [u16; NUM_SUPPORTED_CLOCKS]) {
        self.sim().frequencies = frequencies;
    }

    /// Chunks accepted by the ICAP during the last download.
    pub fn chunks_written(&self) -> usize {
        self.sim().chunks_written
    }

    pub fn loaded_uuid(&self) -> Option<[u8; 16]> {
        self.sim().loaded_uuid
    }

    /// Number of times any reset line was asserted.
    pub fn reset_count(&self) -> usize {
        self.sim().reset_count
    }

    pub fn rollbacks(&self) -> usize {
        self.sim().rollbacks
    }
}

fn construct(config: &DaemonConfig) -> Result<Box<dyn Board>, XmgmtError> {
    let board = match &config.pci_slot {
        Some(slot) => {
            debug!("Simulated board reads telemetry from PCI slot {slot}");
            SimulatedBoard::new().with_telemetry(Box::new(SysfsTelemetry::new(slot)))
        }
        None => SimulatedBoard::new(),
    };
    Ok(Box::new(board))
}

impl Board for SimulatedBoard {
    fn name(&self) -> &str {
        SIMULATED_BOARD_NAME
    }

    fn icap(&self) -> &dyn Icap {
        self
    }

    fn reset_lines(&self) -> &dyn ResetLines {
        self
    }

    fn clocks(&self) -> &dyn ClockWizard {
        self
    }

    fn telemetry(&self) -> &dyn TelemetrySource {
        match &self.telemetry {
            Some(telemetry) => telemetry.as_ref(),
            None => self,
        }
    }

    fn firewalls(&self) -> &dyn FirewallStatus {
        self
    }
}

impl Icap for SimulatedBoard {
    fn begin(&self, header: &ContainerHeader) -> Result<(), XmgmtError> {
        let mut sim = self.sim();
        if !sim.in_reset {
            return Err(XmgmtError::Hardware(String::from(
                "ICAP programmed while the user region is live",
            )));
        }
        sim.pending_uuid = Some(header.uuid);
        sim.chunk_index = 0;
        sim.chunks_written = 0;
        // Configuration memory is undefined from here on.
        sim.loaded_uuid = None;
        Ok(())
    }

    fn write_chunk(&self, chunk: &[u8]) -> Result<(), XmgmtError> {
        let mut sim = self.sim();
        let index = sim.chunk_index;
        sim.chunk_index += 1;
        if sim.fail_chunk_at == Some(index) {
            return Err(XmgmtError::Hardware(format!(
                "ICAP rejected chunk {index} ({} bytes)",
                chunk.len()
            )));
        }
        sim.chunks_written += 1;
        trace!("ICAP accepted chunk {index}");
        Ok(())
    }

    fn finish(&self) -> Result<(), XmgmtError> {
        let mut sim = self.sim();
        sim.loaded_uuid = sim.pending_uuid.take();
        Ok(())
    }

    fn rollback(&self) -> Result<bool, XmgmtError> {
        let mut sim = self.sim();
        if !sim.golden_image {
            return Ok(false);
        }
        sim.rollbacks += 1;
        sim.pending_uuid = None;
        Ok(true)
    }
}

impl ResetLines for SimulatedBoard {
    fn drain(&self, kind: ResetKind) -> Result<(), XmgmtError> {
        trace!("Draining for {kind}");
        Ok(())
    }

    fn assert_reset(&self, kind: ResetKind) -> Result<(), XmgmtError> {
        let mut sim = self.sim();
        sim.in_reset = true;
        sim.reset_count += 1;
        if kind == ResetKind::Cold {
            sim.loaded_uuid = None;
            sim.frequencies = DEFAULT_FREQUENCIES;
        }
        Ok(())
    }

    fn is_quiesced(&self, _kind: ResetKind) -> Result<bool, XmgmtError> {
        let sim = self.sim();
        Ok(sim.in_reset && !sim.withhold_quiesce_ack)
    }

    fn deassert_reset(&self, _kind: ResetKind) -> Result<(), XmgmtError> {
        self.sim().in_reset = false;
        Ok(())
    }

    fn is_ready(&self, _kind: ResetKind) -> Result<bool, XmgmtError> {
        let sim = self.sim();
        Ok(!sim.in_reset && !sim.withhold_ready_ack)
    }
}

impl ClockWizard for SimulatedBoard {
    fn num_clocks(&self) -> usize {
        SIMULATED_CLOCKS
    }

    fn supported_range(&self, index: usize) -> Option<RangeInclusive<u16>> {
        (index < SIMULATED_CLOCKS).then_some(CLOCK_RANGE)
    }

    fn frequencies(&self) -> Result<[u16; NUM_SUPPORTED_CLOCKS], XmgmtError> {
        Ok(self.sim().frequencies)
    }

    fn calibration(&self) -> Result<[bool; NUM_SUPPORTED_CLOCKS], XmgmtError> {
        let mut calibrated = [false; NUM_SUPPORTED_CLOCKS];
        for slot in calibrated.iter_mut().take(SIMULATED_CLOCKS) {
            *slot = true;
        }
        Ok(calibrated)
    }

    fn program(&self, targets: &[u16; NUM_SUPPORTED_CLOCKS]) -> Result<(), XmgmtError> {
        for (index, target) in targets.iter().enumerate() {
            let supported = self
                .supported_range(index)
                .is_some_and(|range| range.contains(target));
            if *target != 0 && !supported {
                return Err(XmgmtError::Hardware(format!(
                    "clock {index} cannot run at {target} MHz"
                )));
            }
        }
        self.sim().frequencies = *targets;
        Ok(())
    }
}

impl TelemetrySource for SimulatedBoard {
    fn identity(&self) -> Result<DeviceIdentity, XmgmtError> {
        Ok(DeviceIdentity {
            vendor: 0x10ee,
            device: 0x5004,
            subsystem_vendor: 0x10ee,
            subsystem_device: 0x000e,
            driver_version: 0x0002_0000,
            device_version: 0x0001,
            feature_id: SIMULATED_FEATURE_ID,
            time_stamp: SIMULATED_FEATURE_ID,
            vbnv: String::from("xilinx_u250_gen3x16_base"),
            fpga: String::from("xcu250-figd2104-2L-e"),
            xmc_version: 0x0003_0001,
            pci_slot: 0x0300,
            is_xpr: true,
            ddr_channel_num: 4,
            ddr_channel_size: 16,
        })
    }

    fn link(&self) -> Result<LinkInfo, XmgmtError> {
        Ok(LinkInfo {
            pcie_link_width: 16,
            pcie_link_speed: 3,
        })
    }

    fn read_sensor(&self, sensor: Sensor) -> Result<i64, XmgmtError> {
        if !self.sim().sensors_available {
            return Err(XmgmtError::Hardware(format!("{sensor:?} is not responding")));
        }
        let value = match sensor {
            Sensor::OnchipTemp => 52,
            Sensor::FanTemp => 38,
            Sensor::FanSpeed => 2800,
            Sensor::VccInt => 850,
            Sensor::VccAux => 1800,
            Sensor::VccBram => 850,
            Sensor::TwelveVoltPex | Sensor::TwelveVoltAux | Sensor::TwelveVoltSw => 12_100,
            Sensor::PexCurrent => 3_200,
            Sensor::AuxCurrent => 1_100,
            Sensor::ThreeVoltThreePex | Sensor::ThreeVoltThreeAux => 3_300,
            Sensor::DdrVppBottom | Sensor::DdrVppTop => 2_500,
            Sensor::Sys5v5 => 5_500,
            Sensor::OneVoltTwoTop | Sensor::Vcc1v2Bottom => 1_200,
            Sensor::OneVoltEightTop => 1_800,
            Sensor::ZeroVoltEight => 850,
            Sensor::Mgt0v9Avcc => 900,
            Sensor::Mgtavtt => 1_200,
            Sensor::Se98Temp(index) if index < 4 => 40 + i64::from(index),
            Sensor::DimmTemp(index) if index < 4 => 35 + i64::from(index),
            Sensor::Se98Temp(_) | Sensor::DimmTemp(_) => {
                return Err(XmgmtError::Argument(format!("no sensor {sensor:?}")));
            }
        };
        Ok(value)
    }

    fn pci_errors(&self) -> Result<PciErrorCounters, XmgmtError> {
        Ok(PciErrorCounters::default())
    }
}

impl FirewallStatus for SimulatedBoard {
    fn status(&self, domain: FirewallDomain) -> Result<u32, XmgmtError> {
        Ok(self.sim().latched[domain.index()])
    }

    fn clear(&self, domain: FirewallDomain) -> Result<(), XmgmtError> {
        let mut sim = self.sim();
        if !sim.in_reset {
            return Err(XmgmtError::Hardware(format!(
                "firewall {domain} cannot be cleared outside reset"
            )));
        }
        sim.latched[domain.index()] = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    #[gtest]
    #[rstest]
    #[case::first(0, Some(10..=500))]
    #[case::second(1, Some(10..=500))]
    #[case::absent(2, None)]
    fn only_two_clocks_are_driven(
        #[case] index: usize,
        #[case] expected: Option<RangeInclusive<u16>>,
    ) {
        let board = SimulatedBoard::new();
        assert_that!(board.supported_range(index), eq(&expected));
    }

    #[gtest]
    fn icap_refuses_a_live_region() {
        let board = SimulatedBoard::new();
        let header = ContainerHeader {
            length: 65,
            timestamp: 0,
            feature_rom_timestamp: 0,
            uuid: [1; 16],
            version: 1,
        };
        assert_that!(
            board.begin(&header),
            err(displays_as(contains_substring("user region is live")))
        );
        board.assert_reset(ResetKind::Logic).expect("assert reset");
        assert_that!(board.begin(&header), ok(anything()));
    }

    #[gtest]
    fn firewall_clear_requires_reset() {
        let board = SimulatedBoard::new();
        board.trip(FirewallDomain::UserControl, 0x4);
        assert_that!(FirewallStatus::clear(&board, FirewallDomain::UserControl), err(anything()));
        board.assert_reset(ResetKind::Hot).expect("assert reset");
        assert_that!(FirewallStatus::clear(&board, FirewallDomain::UserControl), ok(anything()));
        assert_that!(board.latched(FirewallDomain::UserControl), eq(0));
    }

    #[gtest]
    fn program_rejects_absent_clock() {
        let board = SimulatedBoard::new();
        assert_that!(
            board.program(&[100, 100, 100, 0]),
            err(displays_as(contains_substring("clock 2")))
        );
        assert_that!(board.frequencies(), ok(eq(&DEFAULT_FREQUENCIES)));
    }
}
