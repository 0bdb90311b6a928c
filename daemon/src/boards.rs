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

//! Board support for the management daemon.
//!
//! [`board`] holds the hardware seams every card implementation provides and the registry
//! `main` picks one from. [`simulated`] is an in-memory card used when no hardware
//! backend is configured and throughout the test suite. [`sysfs_telemetry`] reads
//! identity, link state and sensors for a real card from sysfs and hwmon.

pub mod board;
pub mod simulated;
pub mod sysfs_telemetry;
