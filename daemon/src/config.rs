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

use crate::error::XmgmtError;
use log::{info, trace};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// The driver-decided location of PCI device objects. Typically `/sys/bus/pci/devices/`.
pub static PCI_DEVICES_DIR: &str = "/sys/bus/pci/devices/";

/// The location of hwmon class objects. Typically `/sys/class/hwmon/`.
pub static HWMON_DIR: &str = "/sys/class/hwmon/";

/// hwmon `name` of the board management controller sensors.
pub static MB_HWMON_NAME: &str = "xclmgmt_microblaze";

/// hwmon `name` of the on-die system monitor.
pub static SYSMON_HWMON_NAME: &str = "xclmgmt_sysmon";

/// Default location of the daemon configuration file.
pub static DEFAULT_CONFIG_PATH: &str = "/etc/xmgmtd/xmgmtd.toml";

/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
pub static CONFIG_PATH_ENV: &str = "XMGMTD_CONFIG";

pub static DBUS_SERVICE_NAME: &str = "com.xmgmt.daemon";
pub static DBUS_STATUS_PATH: &str = "/com/xmgmt/daemon/status";
pub static DBUS_CONTROL_PATH: &str = "/com/xmgmt/daemon/control";

/// Top level daemon configuration, read from a TOML file.
///
/// ```toml
/// board = "simulated"
/// pci_slot = "0000:65:00.0"
///
/// [device]
/// quiesce_timeout_ms = 2000
/// rollback = false
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Name of the registered board backend to attach to.
    pub board: String,
    /// PCI address used to read identity, link and hwmon sensors from sysfs.
    pub pci_slot: Option<String>,
    pub device: DeviceConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            board: "simulated".into(),
            pci_slot: None,
            device: DeviceConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load the configuration from `path`, falling back to defaults when the file is absent.
    ///
    /// # Returns: `Result<DaemonConfig, XmgmtError>`
    /// * `Ok(DaemonConfig)` - Parsed or default configuration
    /// * `Err(XmgmtError::IORead)` - The file exists but could not be read
    /// * `Err(XmgmtError::Config)` - The file is not valid TOML or fails validation
    pub fn load(path: &Path) -> Result<DaemonConfig, XmgmtError> {
        if !path.exists() {
            info!("No configuration at {path:?}, using defaults");
            return Ok(DaemonConfig::default());
        }
        trace!("Reading configuration from {path:?}");
        let contents = crate::system_io::fs_read(path)?;
        let config = Self::parse(&contents)?;
        info!("Loaded configuration from {path:?}");
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<DaemonConfig, XmgmtError> {
        let config: DaemonConfig =
            toml::from_str(contents).map_err(|e| XmgmtError::Config(e.to_string()))?;
        config.device.validate()?;
        Ok(config)
    }

    /// Resolve the config file location from the environment.
    pub fn path_from_env() -> String {
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }
}

/// Per-device tunables. Wait bounds and rollback depend on the card, so none of these are fixed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub quiesce_timeout_ms: u64,
    pub restore_timeout_ms: u64,
    /// Bound for the cold (PROM) reboot, which reloads the whole shell.
    pub reboot_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub chunk_size: usize,
    pub max_image_size: u64,
    /// Attempt to restore the previous stable image when a download fails mid-stream.
    pub rollback: bool,
    pub health_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            quiesce_timeout_ms: 2000,
            restore_timeout_ms: 2000,
            reboot_timeout_ms: 10_000,
            poll_interval_ms: 10,
            chunk_size: 64 * 1024,
            max_image_size: 256 * 1024 * 1024,
            rollback: true,
            health_interval_ms: 500,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), XmgmtError> {
        if self.chunk_size == 0 {
            return Err(XmgmtError::Config("chunk_size must be non-zero".into()));
        }
        if self.poll_interval_ms == 0 || self.health_interval_ms == 0 {
            return Err(XmgmtError::Config(
                "poll_interval_ms and health_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_millis(self.restore_timeout_ms)
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_millis(self.reboot_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    #[gtest]
    fn empty_file_gives_defaults() {
        let config = DaemonConfig::parse("").expect("empty config should parse");
        assert_that!(config.board, eq("simulated"));
        assert_that!(config.device.chunk_size, eq(64 * 1024));
        assert_that!(config.device.rollback, eq(true));
    }

    #[gtest]
    fn partial_device_table_keeps_other_defaults() {
        let config = DaemonConfig::parse(
            "pci_slot = \"0000:65:00.0\"\n[device]\nquiesce_timeout_ms = 50\nrollback = false\n",
        )
        .expect("config should parse");
        assert_that!(config.pci_slot, some(eq("0000:65:00.0")));
        assert_that!(config.device.quiesce_timeout(), eq(Duration::from_millis(50)));
        assert_that!(config.device.rollback, eq(false));
        assert_that!(config.device.restore_timeout_ms, eq(2000));
    }

    #[gtest]
    #[rstest]
    #[case::zero_chunk("[device]\nchunk_size = 0\n")]
    #[case::zero_poll("[device]\npoll_interval_ms = 0\n")]
    #[case::not_toml("board = ")]
    #[case::wrong_type("[device]\nrollback = \"yes\"\n")]
    fn invalid_config_is_rejected(#[case] contents: &str) {
        assert_that!(
            DaemonConfig::parse(contents),
            err(displays_as(contains_substring("XmgmtError::Config")))
        );
    }

    #[gtest]
    fn missing_file_gives_defaults() {
        let config = DaemonConfig::load(Path::new("/nonexistent/xmgmtd.toml"))
            .expect("missing file should fall back to defaults");
        assert_that!(config.board, eq("simulated"));
    }
}
