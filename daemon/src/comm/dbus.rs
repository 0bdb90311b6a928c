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

pub mod control_interface;
pub mod status_interface;

use crate::error::XmgmtError;
use crate::system_io::{fs_file_len, fs_read_bytes};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

/// Check that `image_path_str` names an image file the daemon may read.
///
/// Paths must be absolute and free of `..` so the daemon, which runs privileged, only
/// reads the file the caller named.
pub(crate) fn validate_image_path(image_path_str: &str) -> Result<PathBuf, XmgmtError> {
    if image_path_str.is_empty() {
        return Err(XmgmtError::Argument(
            "An image path is required. Provided path is empty.".into(),
        ));
    }
    let path = Path::new(image_path_str);
    if !path.is_absolute() {
        return Err(XmgmtError::Argument(format!(
            "{image_path_str} is not an absolute path."
        )));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(XmgmtError::Argument(format!(
            "{image_path_str} must not contain '..' components."
        )));
    }
    if !path.exists() || path.is_dir() {
        return Err(XmgmtError::Argument(format!(
            "{image_path_str} is not a valid path to an image file."
        )));
    }
    Ok(path.to_path_buf())
}

/// Validate `image_path_str` and read the whole container into memory.
///
/// Files larger than `max_len` are refused from their metadata, before any byte is read.
pub(crate) fn read_image(image_path_str: &str, max_len: u64) -> Result<Vec<u8>, XmgmtError> {
    let path = validate_image_path(image_path_str)?;
    let len = fs_file_len(&path)?;
    if len > max_len {
        return Err(XmgmtError::InvalidContainer(format!(
            "{image_path_str} is {len} bytes, which exceeds the {max_len} byte limit"
        )));
    }
    fs_read_bytes(&path)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, XmgmtError> {
    serde_json::to_string(value)
        .map_err(|e| XmgmtError::Internal(format!("could not serialize reply: {e}")))
}

#[cfg(test)]
mod test_read_image {
    use crate::comm::dbus::read_image;
    use googletest::prelude::*;
    use std::io::Write;

    #[gtest]
    fn oversized_file_is_refused() {
        let mut file = tempfile::NamedTempFile::new().expect("failed to create temp file");
        file.write_all(&[0u8; 128]).expect("failed to write temp file");
        let path = file.path().to_str().expect("temp path is utf-8");
        assert_that!(
            read_image(path, 64),
            err(displays_as(all![
                contains_substring("XmgmtError::InvalidContainer"),
                contains_substring("exceeds the 64 byte limit")
            ]))
        );
        let bytes = read_image(path, 128).expect("file at the limit should be read");
        assert_that!(bytes.len(), eq(128));
    }
}
