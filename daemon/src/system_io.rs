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

//! Error wrapping file system read helpers.
//!
//! Thin wrappers around `std::fs` reads with trace logging and conversion to
//! [`XmgmtError`]. The daemon only ever reads from the file system: sysfs attributes,
//! hwmon sensors, its configuration and the image containers handed to it by callers.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use xmgmtd::system_io::fs_read;
//! # use std::path::Path;
//! # fn example() -> Result<(), xmgmtd::error::XmgmtError> {
//! let width = fs_read(Path::new("/sys/bus/pci/devices/0000:65:00.0/current_link_width"))?;
//! # Ok(())
//! # }
//! ```

use crate::error::XmgmtError;
use log::trace;
use std::fs::OpenOptions;
use std::io::Read;
use std::path::Path;

/// Read the contents of a file to a String.
///
/// # Arguments
///
/// * `file_path` - Path to the file to read
///
/// # Returns: `Result<String, XmgmtError>`
/// * `Ok(String)` - The complete contents of the file
/// * `Err(XmgmtError::IORead)` - If the file cannot be read (doesn't exist, permissions, etc.)
pub fn fs_read(file_path: &Path) -> Result<String, XmgmtError> {
    trace!("Attempting to read from {file_path:?}");
    let mut buf: String = String::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_string(&mut buf));

    match result {
        Ok(_) => {
            trace!("Reading done");
            Ok(buf)
        }
        Err(e) => Err(XmgmtError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Read the contents of a file as raw bytes.
///
/// Used to load image containers. The caller keeps ownership of the buffer; the image
/// loader only borrows it.
///
/// # Returns: `Result<Vec<u8>, XmgmtError>`
/// * `Ok(Vec<u8>)` - The complete contents of the file
/// * `Err(XmgmtError::IORead)` - If the file cannot be read
pub fn fs_read_bytes(file_path: &Path) -> Result<Vec<u8>, XmgmtError> {
    trace!("Attempting to read bytes from {file_path:?}");
    let mut buf = Vec::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_end(&mut buf));

    match result {
        Ok(n) => {
            trace!("Read {n} bytes");
            Ok(buf)
        }
        Err(e) => Err(XmgmtError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Size of a file in bytes, without reading it.
///
/// # Returns: `Result<u64, XmgmtError>`
/// * `Ok(u64)` - Length reported by the file's metadata
/// * `Err(XmgmtError::IORead)` - If the metadata cannot be read
pub fn fs_file_len(file_path: &Path) -> Result<u64, XmgmtError> {
    trace!("Attempting to stat {file_path:?}");
    std::fs::metadata(file_path)
        .map(|metadata| metadata.len())
        .map_err(|e| XmgmtError::IORead {
            file: file_path.into(),
            e,
        })
}

/// Read a sysfs attribute and parse it as an unsigned integer.
///
/// Accepts decimal and `0x` prefixed hexadecimal, which covers both the PCI id
/// attributes (`0x10ee`) and the hwmon `*_input` files (`41000`).
pub fn fs_read_u64(file_path: &Path) -> Result<u64, XmgmtError> {
    let contents = fs_read(file_path)?;
    let trimmed = contents.trim().trim_end_matches('\0');
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|_| {
        XmgmtError::Hardware(format!(
            "Could not parse '{trimmed}' read from {file_path:?} as an integer"
        ))
    })
}

/// Read the contents of a directory and return entry names.
///
/// Entries that cannot be read are silently skipped.
///
/// # Returns: `Result<Vec<String>, XmgmtError>`
/// * `Ok(Vec<String>)` - List of entry names in the directory
/// * `Err(XmgmtError::IOReadDir)` - If the directory cannot be read
pub fn fs_read_dir(dir: &Path) -> Result<Vec<String>, XmgmtError> {
    trace!("Attempting to read directory '{dir:?}'");
    std::fs::read_dir(dir).map_or_else(
        |e| {
            Err(XmgmtError::IOReadDir {
                dir: dir.to_owned(),
                e,
            })
        },
        |iter| {
            let ret = iter
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            trace!("Dir reading done.");
            Ok(ret)
        },
    )
}
