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

//! Telemetry read from sysfs and hwmon.
//!
//! Identity and link state come from the PCI device directory
//! (`/sys/bus/pci/devices/<bdf>/`), the shell description from its `feature_rom/`
//! subdirectory and the PCIe error counters from the AER statistics files. Sensors are
//! read from the two hwmon nodes the management driver registers, found by their `name`
//! attribute ([`MB_HWMON_NAME`] and [`SYSMON_HWMON_NAME`]).

use crate::boards::board::TelemetrySource;
use crate::config::{HWMON_DIR, MB_HWMON_NAME, PCI_DEVICES_DIR, SYSMON_HWMON_NAME};
use crate::error::XmgmtError;
use crate::firewall::PciErrorCounters;
use crate::system_io::{fs_read, fs_read_dir, fs_read_u64};
use crate::telemetry::{
    DeviceIdentity, LinkInfo, Sensor, UNKNOWN_U16, UNKNOWN_U32, UNKNOWN_U64,
};
use log::{debug, trace};
use std::path::{Path, PathBuf};

// PCIe Device Status register error bits.
const STATUS_CORRECTABLE: u32 = 1 << 0;
const STATUS_NON_FATAL: u32 = 1 << 1;
const STATUS_FATAL: u32 = 1 << 2;

#[derive(Debug, Clone)]
pub struct SysfsTelemetry {
    slot: String,
    pci_root: PathBuf,
    hwmon_root: PathBuf,
}

impl SysfsTelemetry {
    /// Telemetry for the card at PCI address `slot`, e.g. `0000:65:00.0`.
    pub fn new(slot: &str) -> Self {
        Self::with_roots(slot, Path::new(PCI_DEVICES_DIR), Path::new(HWMON_DIR))
    }

    pub fn with_roots(slot: &str, pci_root: &Path, hwmon_root: &Path) -> Self {
        SysfsTelemetry {
            slot: slot.to_owned(),
            pci_root: pci_root.to_owned(),
            hwmon_root: hwmon_root.to_owned(),
        }
    }

    fn device_dir(&self) -> PathBuf {
        self.pci_root.join(&self.slot)
    }

    fn read_u16(&self, attribute: &str) -> Result<u16, XmgmtError> {
        let path = self.device_dir().join(attribute);
        let value = fs_read_u64(&path)?;
        u16::try_from(value).map_err(|_| {
            XmgmtError::Hardware(format!("{path:?} holds {value}, which is not a u16"))
        })
    }

    fn read_string(&self, attribute: &str) -> String {
        match fs_read(&self.device_dir().join(attribute)) {
            Ok(s) => s.trim().trim_end_matches('\0').to_owned(),
            Err(e) => {
                debug!("{e}");
                String::new()
            }
        }
    }

    fn read_optional_u64(&self, attribute: &str) -> u64 {
        fs_read_u64(&self.device_dir().join(attribute)).unwrap_or(UNKNOWN_U64)
    }

    /// Locate the hwmon directory registered by `driver_name`.
    fn find_hwmon(&self, driver_name: &str) -> Result<PathBuf, XmgmtError> {
        for entry in fs_read_dir(&self.hwmon_root)? {
            let dir = self.hwmon_root.join(entry);
            match fs_read(&dir.join("name")) {
                Ok(name) if name.trim() == driver_name => return Ok(dir),
                Ok(_) => {}
                Err(e) => trace!("Skipping hwmon entry: {e}"),
            }
        }
        Err(XmgmtError::Hardware(format!(
            "no hwmon node named {driver_name} under {:?}",
            self.hwmon_root
        )))
    }

    fn aer_total(&self, file: &str, counter: &str) -> Result<u32, XmgmtError> {
        let path = self.device_dir().join(file);
        let contents = fs_read(&path)?;
        contents
            .lines()
            .filter_map(|line| line.split_once(' '))
            .find(|(name, _)| *name == counter)
            .and_then(|(_, value)| value.trim().parse::<u32>().ok())
            .ok_or_else(|| XmgmtError::Hardware(format!("{counter} not found in {path:?}")))
    }
}

/// The hwmon node, attribute and divisor that yield `sensor` in its native unit.
fn hwmon_attribute(sensor: Sensor) -> (&'static str, String, i64) {
    let mb = |attribute: &str| (MB_HWMON_NAME, attribute.to_owned(), 1);
    let millidegrees = |index: u32| (MB_HWMON_NAME, format!("temp{index}_input"), 1000);
    match sensor {
        Sensor::OnchipTemp => (SYSMON_HWMON_NAME, String::from("temp1_input"), 1000),
        Sensor::VccInt => (SYSMON_HWMON_NAME, String::from("in0_input"), 1),
        Sensor::VccAux => (SYSMON_HWMON_NAME, String::from("in1_input"), 1),
        Sensor::VccBram => (SYSMON_HWMON_NAME, String::from("in2_input"), 1),
        Sensor::FanTemp => millidegrees(1),
        Sensor::FanSpeed => mb("fan1_input"),
        Sensor::TwelveVoltPex => mb("in0_input"),
        Sensor::TwelveVoltAux => mb("in1_input"),
        Sensor::ThreeVoltThreePex => mb("in2_input"),
        Sensor::ThreeVoltThreeAux => mb("in3_input"),
        Sensor::DdrVppBottom => mb("in4_input"),
        Sensor::Sys5v5 => mb("in5_input"),
        Sensor::OneVoltTwoTop => mb("in6_input"),
        Sensor::OneVoltEightTop => mb("in7_input"),
        Sensor::ZeroVoltEight => mb("in8_input"),
        Sensor::DdrVppTop => mb("in9_input"),
        Sensor::Mgt0v9Avcc => mb("in10_input"),
        Sensor::TwelveVoltSw => mb("in11_input"),
        Sensor::Mgtavtt => mb("in12_input"),
        Sensor::Vcc1v2Bottom => mb("in13_input"),
        Sensor::PexCurrent => mb("curr1_input"),
        Sensor::AuxCurrent => mb("curr2_input"),
        Sensor::Se98Temp(index) => millidegrees(2 + u32::from(index)),
        Sensor::DimmTemp(index) => millidegrees(6 + u32::from(index)),
    }
}

/// `0000:65:00.0` to the packed bus/device/function number.
fn parse_bdf(slot: &str) -> Option<u32> {
    let mut parts = slot.rsplit(':');
    let dev_fn = parts.next()?;
    let bus = u32::from_str_radix(parts.next()?, 16).ok()?;
    let (dev, func) = dev_fn.split_once('.')?;
    let dev = u32::from_str_radix(dev, 16).ok()?;
    let func = u32::from_str_radix(func, 16).ok()?;
    Some((bus << 8) | (dev << 3) | func)
}

/// `8.0 GT/s PCIe` to the PCIe generation number.
fn link_generation(speed: &str) -> Option<u16> {
    let rate = speed.split_whitespace().next()?;
    match rate {
        "2.5" => Some(1),
        "5.0" | "5" => Some(2),
        "8.0" | "8" => Some(3),
        "16.0" | "16" => Some(4),
        "32.0" | "32" => Some(5),
        _ => None,
    }
}

impl TelemetrySource for SysfsTelemetry {
    fn identity(&self) -> Result<DeviceIdentity, XmgmtError> {
        let vbnv = self.read_string("feature_rom/VBNV");
        Ok(DeviceIdentity {
            vendor: self.read_u16("vendor")?,
            device: self.read_u16("device")?,
            subsystem_vendor: self.read_u16("subsystem_vendor").unwrap_or(UNKNOWN_U16),
            subsystem_device: self.read_u16("subsystem_device").unwrap_or(UNKNOWN_U16),
            driver_version: UNKNOWN_U32,
            device_version: self
                .read_u16("revision")
                .map(u32::from)
                .unwrap_or(UNKNOWN_U32),
            feature_id: self.read_optional_u64("feature_rom/timestamp"),
            time_stamp: self.read_optional_u64("feature_rom/timestamp"),
            is_xpr: vbnv.contains("xpr"),
            vbnv,
            fpga: self.read_string("feature_rom/FPGA"),
            xmc_version: self.read_optional_u64("xmc/version"),
            pci_slot: parse_bdf(&self.slot).unwrap_or(UNKNOWN_U32),
            ddr_channel_num: self
                .read_u16("feature_rom/ddr_bank_count_max")
                .unwrap_or(UNKNOWN_U16),
            ddr_channel_size: self
                .read_u16("feature_rom/ddr_bank_size")
                .unwrap_or(UNKNOWN_U16),
        })
    }

    fn link(&self) -> Result<LinkInfo, XmgmtError> {
        let speed = fs_read(&self.device_dir().join("current_link_speed"))?;
        let pcie_link_speed = link_generation(speed.trim()).ok_or_else(|| {
            XmgmtError::Hardware(format!("unrecognised link speed '{}'", speed.trim()))
        })?;
        Ok(LinkInfo {
            pcie_link_width: self.read_u16("current_link_width")?,
            pcie_link_speed,
        })
    }

    fn read_sensor(&self, sensor: Sensor) -> Result<i64, XmgmtError> {
        let (driver, attribute, divisor) = hwmon_attribute(sensor);
        let path = self.find_hwmon(driver)?.join(attribute);
        let raw = fs_read(&path)?;
        let value = raw.trim().parse::<i64>().map_err(|_| {
            XmgmtError::Hardware(format!("Could not parse '{}' read from {path:?}", raw.trim()))
        })?;
        Ok(value / divisor)
    }

    fn pci_errors(&self) -> Result<PciErrorCounters, XmgmtError> {
        let correctable = self.aer_total("aer_dev_correctable", "TOTAL_ERR_COR")?;
        let fatal = self.aer_total("aer_dev_fatal", "TOTAL_ERR_FATAL")?;
        let non_fatal = self.aer_total("aer_dev_nonfatal", "TOTAL_ERR_NONFATAL")?;
        let mut device_status = 0;
        if correctable > 0 {
            device_status |= STATUS_CORRECTABLE;
        }
        if non_fatal > 0 {
            device_status |= STATUS_NON_FATAL;
        }
        if fatal > 0 {
            device_status |= STATUS_FATAL;
        }
        Ok(PciErrorCounters {
            device_status,
            uncorrectable: fatal.saturating_add(non_fatal),
            correctable,
        })
    }
}
