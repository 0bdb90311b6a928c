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

//! Telemetry snapshot.
//!
//! [`snapshot`] gathers identity, link, clock and sensor state into a fresh [`DeviceInfo`].
//! It never waits for the exclusivity token and never fails because a single reading is
//! unavailable: such fields carry the "unknown" sentinel of their type instead
//! ([`UNKNOWN_U16`], [`UNKNOWN_I16`], [`UNKNOWN_U32`], [`UNKNOWN_U64`]).

use crate::clock::NUM_SUPPORTED_CLOCKS;
use crate::device::DeviceState;
use crate::error::XmgmtError;
use crate::image::{ImageState, uuid_to_string};
use log::{debug, trace};
use serde::Serialize;

pub const UNKNOWN_U16: u16 = u16::MAX;
pub const UNKNOWN_I16: i16 = i16::MIN;
pub const UNKNOWN_U32: u32 = u32::MAX;
pub const UNKNOWN_U64: u64 = u64::MAX;

/// Number of slots for sensor categories with several instances on the card.
pub const NUM_MULTI_SENSORS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub vendor: u16,
    pub device: u16,
    pub subsystem_vendor: u16,
    pub subsystem_device: u16,
    pub driver_version: u32,
    pub device_version: u32,
    /// Timestamp of the shell's feature ROM; images must be built against it.
    pub feature_id: u64,
    pub time_stamp: u64,
    pub vbnv: String,
    pub fpga: String,
    pub xmc_version: u64,
    pub pci_slot: u32,
    pub is_xpr: bool,
    pub ddr_channel_num: u16,
    pub ddr_channel_size: u16,
}

impl DeviceIdentity {
    pub fn unknown() -> Self {
        DeviceIdentity {
            vendor: UNKNOWN_U16,
            device: UNKNOWN_U16,
            subsystem_vendor: UNKNOWN_U16,
            subsystem_device: UNKNOWN_U16,
            driver_version: UNKNOWN_U32,
            device_version: UNKNOWN_U32,
            feature_id: UNKNOWN_U64,
            time_stamp: UNKNOWN_U64,
            vbnv: String::new(),
            fpga: String::new(),
            xmc_version: UNKNOWN_U64,
            pci_slot: UNKNOWN_U32,
            is_xpr: false,
            ddr_channel_num: UNKNOWN_U16,
            ddr_channel_size: UNKNOWN_U16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub pcie_link_width: u16,
    /// PCIe generation, 1 to 5.
    pub pcie_link_speed: u16,
}

impl LinkInfo {
    pub fn unknown() -> Self {
        LinkInfo {
            pcie_link_width: UNKNOWN_U16,
            pcie_link_speed: UNKNOWN_U16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockInfo {
    /// MHz, 0 for clocks the card does not have.
    pub frequencies: [u16; NUM_SUPPORTED_CLOCKS],
    pub calibrated: [bool; NUM_SUPPORTED_CLOCKS],
    pub num_clocks: u16,
}

/// Every sensor the management firmware and the system monitor expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sensor {
    /// °C
    OnchipTemp,
    FanTemp,
    /// RPM
    FanSpeed,
    /// mV from here on unless noted
    VccInt,
    VccAux,
    VccBram,
    TwelveVoltPex,
    TwelveVoltAux,
    /// mA
    PexCurrent,
    /// mA
    AuxCurrent,
    ThreeVoltThreePex,
    ThreeVoltThreeAux,
    DdrVppBottom,
    Sys5v5,
    OneVoltTwoTop,
    OneVoltEightTop,
    ZeroVoltEight,
    DdrVppTop,
    Mgt0v9Avcc,
    TwelveVoltSw,
    Mgtavtt,
    Vcc1v2Bottom,
    /// °C, instance 0 to 3
    Se98Temp(u8),
    /// °C, instance 0 to 3
    DimmTemp(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SensorReadings {
    pub onchip_temp: u16,
    pub fan_temp: u16,
    pub fan_speed: u16,
    pub vcc_int: u16,
    pub vcc_aux: u16,
    pub vcc_bram: u16,
    pub twelve_vol_pex: u16,
    pub twelve_vol_aux: u16,
    pub pex_curr: u64,
    pub aux_curr: u64,
    pub three_vol_three_pex: u16,
    pub three_vol_three_aux: u16,
    pub ddr_vpp_btm: u16,
    pub sys_5v5: u16,
    pub one_vol_two_top: u16,
    pub one_vol_eight_top: u16,
    pub zero_vol_eight: u16,
    pub ddr_vpp_top: u16,
    pub mgt0v9avcc: u16,
    pub twelve_vol_sw: u16,
    pub mgtavtt: u16,
    pub vcc1v2_btm: u16,
    pub se98_temp: [i16; NUM_MULTI_SENSORS],
    pub dimm_temp: [i16; NUM_MULTI_SENSORS],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub identity: DeviceIdentity,
    pub link: LinkInfo,
    pub clocks: ClockInfo,
    pub sensors: SensorReadings,
    /// Uuid of the image in the user region, when the daemon loaded it.
    pub image_uuid: Option<String>,
    pub image_partial: bool,
}

/// Assemble a point-in-time view of the card.
///
/// # Returns: `Result<DeviceInfo, XmgmtError>`
/// * `Ok(DeviceInfo)` - Snapshot, with sentinels for anything unreadable
/// * `Err(XmgmtError::Internal)` - Device state lock poisoned
pub fn snapshot(state: &DeviceState) -> Result<DeviceInfo, XmgmtError> {
    // Copy what the daemon owns first so the lock is never held across board reads.
    let (frequencies, image) = {
        let inner = state.lock()?;
        (inner.clocks, inner.image)
    };
    let board = state.board();
    let telemetry = board.telemetry();

    let identity = telemetry.identity().unwrap_or_else(|e| {
        debug!("Identity unavailable: {e}");
        DeviceIdentity::unknown()
    });
    let link = telemetry.link().unwrap_or_else(|e| {
        debug!("Link state unavailable: {e}");
        LinkInfo::unknown()
    });
    let clocks = ClockInfo {
        frequencies,
        calibrated: board
            .clocks()
            .calibration()
            .unwrap_or([false; NUM_SUPPORTED_CLOCKS]),
        num_clocks: u16::try_from(board.clocks().num_clocks()).unwrap_or(UNKNOWN_U16),
    };

    let read_u16 = |sensor: Sensor| -> u16 {
        read(state, sensor)
            .and_then(|v| u16::try_from(v).ok())
            .filter(|v| *v != UNKNOWN_U16)
            .unwrap_or(UNKNOWN_U16)
    };
    let read_u64 = |sensor: Sensor| -> u64 {
        read(state, sensor)
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(UNKNOWN_U64)
    };
    let read_i16 = |sensor: Sensor| -> i16 {
        read(state, sensor)
            .and_then(|v| i16::try_from(v).ok())
            .filter(|v| *v != UNKNOWN_I16)
            .unwrap_or(UNKNOWN_I16)
    };

    let mut se98_temp = [UNKNOWN_I16; NUM_MULTI_SENSORS];
    let mut dimm_temp = [UNKNOWN_I16; NUM_MULTI_SENSORS];
    for (slot, index) in (0..NUM_MULTI_SENSORS as u8).enumerate() {
        se98_temp[slot] = read_i16(Sensor::Se98Temp(index));
        dimm_temp[slot] = read_i16(Sensor::DimmTemp(index));
    }

    let sensors = SensorReadings {
        onchip_temp: read_u16(Sensor::OnchipTemp),
        fan_temp: read_u16(Sensor::FanTemp),
        fan_speed: read_u16(Sensor::FanSpeed),
        vcc_int: read_u16(Sensor::VccInt),
        vcc_aux: read_u16(Sensor::VccAux),
        vcc_bram: read_u16(Sensor::VccBram),
        twelve_vol_pex: read_u16(Sensor::TwelveVoltPex),
        twelve_vol_aux: read_u16(Sensor::TwelveVoltAux),
        pex_curr: read_u64(Sensor::PexCurrent),
        aux_curr: read_u64(Sensor::AuxCurrent),
        three_vol_three_pex: read_u16(Sensor::ThreeVoltThreePex),
        three_vol_three_aux: read_u16(Sensor::ThreeVoltThreeAux),
        ddr_vpp_btm: read_u16(Sensor::DdrVppBottom),
        sys_5v5: read_u16(Sensor::Sys5v5),
        one_vol_two_top: read_u16(Sensor::OneVoltTwoTop),
        one_vol_eight_top: read_u16(Sensor::OneVoltEightTop),
        zero_vol_eight: read_u16(Sensor::ZeroVoltEight),
        ddr_vpp_top: read_u16(Sensor::DdrVppTop),
        mgt0v9avcc: read_u16(Sensor::Mgt0v9Avcc),
        twelve_vol_sw: read_u16(Sensor::TwelveVoltSw),
        mgtavtt: read_u16(Sensor::Mgtavtt),
        vcc1v2_btm: read_u16(Sensor::Vcc1v2Bottom),
        se98_temp,
        dimm_temp,
    };

    Ok(DeviceInfo {
        identity,
        link,
        clocks,
        sensors,
        image_uuid: match image {
            ImageState::Loaded(uuid) => Some(uuid_to_string(&uuid)),
            ImageState::Unknown | ImageState::Partial => None,
        },
        image_partial: image == ImageState::Partial,
    })
}

fn read(state: &DeviceState, sensor: Sensor) -> Option<i64> {
    match state.board().telemetry().read_sensor(sensor) {
        Ok(value) => Some(value),
        Err(e) => {
            trace!("{sensor:?} unavailable: {e}");
            None
        }
    }
}
