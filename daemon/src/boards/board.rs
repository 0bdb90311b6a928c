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

//! Hardware seams for a PCIe accelerator card.
//!
//! The control plane never touches registers directly. Each card family provides a
//! [`Board`] which hands out one implementation of each of the traits below:
//! - [`Icap`] - The reconfiguration engine the user region image is streamed into
//! - [`ResetLines`] - Drain, assert and release of the per-region reset lines
//! - [`ClockWizard`] - The programmable clock generators feeding the user region
//! - [`TelemetrySource`] - Identity, PCIe link, sensors and PCIe error counters
//! - [`FirewallStatus`] - The latched status registers of the AXI firewalls
//!
//! All methods are synchronous and expected to return quickly; the coordinator does its
//! own polling for anything that needs an acknowledgement.
//!
//! # Board Registration
//!
//! Boards register themselves at daemon startup with [`register_board`] under a short
//! name. The `board` key of the daemon configuration then selects one with
//! [`board_for_name`].
//!
//! ```rust,no_run
//! # use xmgmtd::boards::board::{board_for_name, register_board};
//! # use xmgmtd::boards::simulated::SimulatedBoard;
//! # use xmgmtd::config::DaemonConfig;
//! # fn example() -> Result<(), xmgmtd::error::XmgmtError> {
//! SimulatedBoard::register_board()?;
//! let board = board_for_name("simulated", &DaemonConfig::default())?;
//! # Ok(())
//! # }
//! ```

use crate::clock::NUM_SUPPORTED_CLOCKS;
use crate::config::DaemonConfig;
use crate::error::XmgmtError;
use crate::firewall::{FirewallDomain, PciErrorCounters};
use crate::image::ContainerHeader;
use crate::reset::ResetKind;
use crate::telemetry::{DeviceIdentity, LinkInfo, Sensor};
use std::any::Any;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Mutex, OnceLock};

/// Board constructors get the full daemon configuration so they can find their PCI slot.
type BoardConstructor = fn(&DaemonConfig) -> Result<Box<dyn Board>, XmgmtError>;

/// Global registry of board implementations, keyed by the name used in the config file.
pub static BOARD_REGISTRY: OnceLock<Mutex<HashMap<&'static str, BoardConstructor>>> =
    OnceLock::new();

/// The reconfiguration engine of the user region.
pub trait Icap: Send + Sync {
    /// Prepare to receive the payload described by `header`.
    fn begin(&self, header: &ContainerHeader) -> Result<(), XmgmtError>;

    /// Push the next piece of the payload.
    ///
    /// # Returns: `Result<(), XmgmtError>`
    /// * `Ok(())` - Chunk accepted
    /// * `Err(XmgmtError::Hardware)` - Engine reported an error; the region is now undefined
    fn write_chunk(&self, chunk: &[u8]) -> Result<(), XmgmtError>;

    /// Signal end of payload and wait for the engine to report done.
    fn finish(&self) -> Result<(), XmgmtError>;

    /// Reprogram the last stable image after a failed download.
    ///
    /// # Returns: `Result<bool, XmgmtError>`
    /// * `Ok(true)` - Previous image programmed
    /// * `Ok(false)` - This card keeps no stable image to fall back to
    /// * `Err(XmgmtError::Hardware)` - Fallback attempted and failed
    fn rollback(&self) -> Result<bool, XmgmtError>;
}

/// Reset lines for the regions covered by each [`ResetKind`].
pub trait ResetLines: Send + Sync {
    /// Stop accepting new work in the affected regions.
    fn drain(&self, kind: ResetKind) -> Result<(), XmgmtError>;
    fn assert_reset(&self, kind: ResetKind) -> Result<(), XmgmtError>;
    /// True once outstanding transactions have drained and reset is held.
    fn is_quiesced(&self, kind: ResetKind) -> Result<bool, XmgmtError>;
    fn deassert_reset(&self, kind: ResetKind) -> Result<(), XmgmtError>;
    /// True once the region has come back out of reset and is usable.
    fn is_ready(&self, kind: ResetKind) -> Result<bool, XmgmtError>;
}

/// The clock generators of the user region.
pub trait ClockWizard: Send + Sync {
    /// How many of the [`NUM_SUPPORTED_CLOCKS`] slots this card actually drives.
    fn num_clocks(&self) -> usize;

    /// Supported range of clock `index` in MHz, `None` when the card has no such clock.
    fn supported_range(&self, index: usize) -> Option<RangeInclusive<u16>>;

    /// Current frequencies in MHz; absent clocks read as 0.
    fn frequencies(&self) -> Result<[u16; NUM_SUPPORTED_CLOCKS], XmgmtError>;

    /// Which clocks have been calibrated against the reference.
    fn calibration(&self) -> Result<[bool; NUM_SUPPORTED_CLOCKS], XmgmtError>;

    /// Program every clock to `targets` in one step.
    fn program(&self, targets: &[u16; NUM_SUPPORTED_CLOCKS]) -> Result<(), XmgmtError>;
}

/// Read-only device information.
pub trait TelemetrySource: Send + Sync {
    fn identity(&self) -> Result<DeviceIdentity, XmgmtError>;
    fn link(&self) -> Result<LinkInfo, XmgmtError>;
    /// Raw sensor value in the sensor's native unit (mV, mA, °C or RPM).
    fn read_sensor(&self, sensor: Sensor) -> Result<i64, XmgmtError>;
    fn pci_errors(&self) -> Result<PciErrorCounters, XmgmtError>;
}

/// Latched status of the AXI firewalls.
pub trait FirewallStatus: Send + Sync {
    /// Latched status code for `domain`, 0 when the firewall has not tripped.
    fn status(&self, domain: FirewallDomain) -> Result<u32, XmgmtError>;
    /// Unlatch the firewall of `domain`.
    fn clear(&self, domain: FirewallDomain) -> Result<(), XmgmtError>;
}

/// A complete card implementation.
///
/// The trait extends `Any` so tests and board specific tooling can downcast to the
/// concrete type.
pub trait Board: Any + Send + Sync {
    /// The name this board registered under.
    fn name(&self) -> &str;
    fn icap(&self) -> &dyn Icap;
    fn reset_lines(&self) -> &dyn ResetLines;
    fn clocks(&self) -> &dyn ClockWizard;
    fn telemetry(&self) -> &dyn TelemetrySource;
    fn firewalls(&self) -> &dyn FirewallStatus;
}

fn init_board_registry() -> Mutex<HashMap<&'static str, BoardConstructor>> {
    Mutex::new(HashMap::new())
}

/// Register a board implementation under `name`.
///
/// Registering the same name twice replaces the earlier constructor.
///
/// # Returns: `Result<(), XmgmtError>`
/// * `Ok(())` - Board registered
/// * `Err(XmgmtError::Internal)` - Registry lock poisoned
pub fn register_board(name: &'static str, constructor: BoardConstructor) -> Result<(), XmgmtError> {
    let mut registry = BOARD_REGISTRY
        .get_or_init(init_board_registry)
        .lock()
        .map_err(|_| XmgmtError::Internal(String::from("couldn't lock BOARD_REGISTRY")))?;
    registry.insert(name, constructor);
    Ok(())
}

/// Construct the board registered as `name`.
///
/// # Returns: `Result<Box<dyn Board>, XmgmtError>`
/// * `Ok(Box<dyn Board>)` - Newly constructed board
/// * `Err(XmgmtError::Config)` - No board registered under `name`
/// * `Err(XmgmtError::Internal)` - Registry not initialized or lock failure
pub fn board_for_name(name: &str, config: &DaemonConfig) -> Result<Box<dyn Board>, XmgmtError> {
    let constructor = {
        let registry = BOARD_REGISTRY
            .get()
            .ok_or(XmgmtError::Internal(String::from(
                "couldn't get BOARD_REGISTRY",
            )))?
            .lock()
            .map_err(|_| XmgmtError::Internal(String::from("couldn't lock BOARD_REGISTRY")))?;
        *registry.get(name).ok_or_else(|| {
            XmgmtError::Config(format!(
                "no board named '{name}' is registered (known: {})",
                known_names(&registry)
            ))
        })?
    };
    constructor(config)
}

fn known_names(registry: &HashMap<&'static str, BoardConstructor>) -> String {
    let mut names: Vec<&str> = registry.keys().copied().collect();
    names.sort_unstable();
    names.join(", ")
}

/// Names of every registered board, sorted.
pub fn registered_boards() -> Result<Vec<&'static str>, XmgmtError> {
    let Some(registry) = BOARD_REGISTRY.get() else {
        return Ok(Vec::new());
    };
    let registry = registry
        .lock()
        .map_err(|_| XmgmtError::Internal(String::from("couldn't lock BOARD_REGISTRY")))?;
    let mut names: Vec<&'static str> = registry.keys().copied().collect();
    names.sort_unstable();
    Ok(names)
}
