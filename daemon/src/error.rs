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

use crate::firewall::FirewallDomain;
use crate::reset::ResetStage;
use log::error;
use std::path::PathBuf;
use std::time::Duration;
use zbus::fdo;

#[derive(Debug, thiserror::Error)]
pub enum XmgmtError {
    #[error("XmgmtError::InvalidContainer: Image container rejected: {0}")]
    InvalidContainer(String),
    #[error("XmgmtError::DomainTripped: Operation blocked, firewall {0} is tripped")]
    DomainTripped(FirewallDomain),
    #[error(
        "XmgmtError::PartiallyInvalid: Clock {index} target {target} MHz is outside {min}..={max} MHz, request rejected"
    )]
    PartiallyInvalid {
        index: usize,
        target: u16,
        min: u16,
        max: u16,
    },
    #[error("XmgmtError::Busy: {0} is in progress")]
    Busy(String),
    #[error("XmgmtError::Timeout: Hardware did not acknowledge {stage} within {waited:?}")]
    Timeout { stage: ResetStage, waited: Duration },
    #[error(
        "XmgmtError::PartialReconfiguration: Download failed mid-stream and no stable image could be restored, a hot reset or reboot is required: {0}"
    )]
    PartialReconfiguration(String),
    #[error("XmgmtError::StillActive: The condition behind firewall {0} has not been reset")]
    StillActive(FirewallDomain),
    #[error("XmgmtError::Cancelled: Image download was cancelled")]
    Cancelled,
    #[error("XmgmtError::UnsupportedCommand: {0}")]
    UnsupportedCommand(String),
    #[error("XmgmtError::Argument: {0}")]
    Argument(String),
    #[error("XmgmtError::Hardware: {0}")]
    Hardware(String),
    #[error("XmgmtError::Config: {0}")]
    Config(String),
    #[error("XmgmtError::IORead: An IO error occurred when reading from {file:?}: {e}")]
    IORead { file: PathBuf, e: std::io::Error },
    #[error("XmgmtError::IOReadDir: An IO error occurred when reading directory {dir:?}: {e}")]
    IOReadDir { dir: PathBuf, e: std::io::Error },
    #[error("XmgmtError::Internal: An Internal error occurred: {0}")]
    Internal(String),
}

impl From<XmgmtError> for fdo::Error {
    fn from(err: XmgmtError) -> Self {
        error!("{err}");
        match err {
            XmgmtError::Argument(..) => fdo::Error::InvalidArgs(err.to_string()),
            XmgmtError::InvalidContainer(..) => fdo::Error::InvalidArgs(err.to_string()),
            XmgmtError::PartiallyInvalid { .. } => fdo::Error::InvalidArgs(err.to_string()),
            XmgmtError::UnsupportedCommand(..) => fdo::Error::NotSupported(err.to_string()),
            XmgmtError::Timeout { .. } => fdo::Error::TimedOut(err.to_string()),
            XmgmtError::IORead { .. } => fdo::Error::IOError(err.to_string()),
            XmgmtError::IOReadDir { .. } => fdo::Error::IOError(err.to_string()),
            _ => fdo::Error::Failed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use googletest::prelude::*;

    #[gtest]
    fn busy_maps_to_failed_with_variant_prefix() {
        let err: fdo::Error = XmgmtError::Busy("hot reset".into()).into();
        let fdo::Error::Failed(msg) = err else {
            panic!("Busy should map to fdo::Error::Failed");
        };
        assert_that!(msg, contains_substring("XmgmtError::Busy"));
    }

    #[gtest]
    fn timeout_maps_to_timed_out() {
        let err: fdo::Error = XmgmtError::Timeout {
            stage: ResetStage::Quiescing,
            waited: Duration::from_millis(20),
        }
        .into();
        assert!(
            matches!(err, fdo::Error::TimedOut(_)),
            "Timeout should map to fdo::Error::TimedOut, got {err:?}"
        );
    }

    #[gtest]
    fn tripped_domain_is_named() {
        let err = XmgmtError::DomainTripped(FirewallDomain::Datapath);
        assert_that!(err.to_string(), contains_substring("datapath"));
    }
}
