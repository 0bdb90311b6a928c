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

//! Image loader.
//!
//! Validates an image container and streams its payload to the card's reconfiguration
//! engine (ICAP). The sequence is:
//!
//! 1. take the exclusivity token, refusing while the datapath firewall is tripped
//! 2. validate the container header, failing fast with no state change
//! 3. quiesce the user region through the reset coordinator
//! 4. stream the payload in `chunk_size` pieces, checking for cancellation between them
//! 5. restore the region
//! 6. release the token (guard drop)
//!
//! Once step 3 has run, a failure either rolls back to the previous stable image (when
//! enabled and the board has one) or leaves the region partially programmed, which is
//! reported as [`XmgmtError::PartialReconfiguration`]. Nothing is retried.
//!
//! # Container layout
//!
//! All integers are little-endian.
//!
//! | offset | size | field                   |
//! |--------|------|-------------------------|
//! | 0      | 8    | magic `"xclbin2\0"`     |
//! | 8      | 8    | total container length  |
//! | 16     | 8    | build timestamp         |
//! | 24     | 8    | feature ROM timestamp   |
//! | 32     | 16   | image uuid              |
//! | 48     | 4    | format version          |
//! | 52     | 12   | reserved                |
//! | 64     | ..   | payload                 |

use crate::device::{DeviceState, ExclusiveGuard, FaultEvent, Operation};
use crate::error::XmgmtError;
use crate::firewall::FirewallDomain;
use crate::reset::{self, ResetKind, ResetStage};
use crate::telemetry::UNKNOWN_U64;
use log::{error, info, trace, warn};

pub const CONTAINER_MAGIC: &[u8; 8] = b"xclbin2\0";
pub const HEADER_LEN: usize = 64;

/// A caller owned image container. The loader only borrows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescriptor<'a> {
    bytes: &'a [u8],
}

impl<'a> ImageDescriptor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ImageDescriptor { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub length: u64,
    pub timestamp: u64,
    pub feature_rom_timestamp: u64,
    pub uuid: [u8; 16],
    pub version: u32,
}

impl ContainerHeader {
    /// Parse and bound-check the header at the start of `bytes`.
    ///
    /// # Returns: `Result<ContainerHeader, XmgmtError>`
    /// * `Ok(ContainerHeader)` - Magic matches, `length` equals `bytes.len()`, payload is
    ///   non-empty and the container fits in `max_len`
    /// * `Err(XmgmtError::InvalidContainer)` - Anything else
    pub fn parse(bytes: &[u8], max_len: u64) -> Result<ContainerHeader, XmgmtError> {
        if bytes.len() < HEADER_LEN {
            return Err(XmgmtError::InvalidContainer(format!(
                "{} bytes is shorter than the {HEADER_LEN} byte header",
                bytes.len()
            )));
        }
        if &bytes[0..8] != CONTAINER_MAGIC {
            return Err(XmgmtError::InvalidContainer(format!(
                "bad magic {:?}",
                &bytes[0..8]
            )));
        }
        let header = ContainerHeader {
            length: read_u64(bytes, 8),
            timestamp: read_u64(bytes, 16),
            feature_rom_timestamp: read_u64(bytes, 24),
            uuid: bytes[32..48].try_into().map_err(|_| {
                XmgmtError::InvalidContainer("uuid field is truncated".into())
            })?,
            version: u32::from_le_bytes([bytes[48], bytes[49], bytes[50], bytes[51]]),
        };
        if header.length > max_len {
            return Err(XmgmtError::InvalidContainer(format!(
                "container length {} exceeds the {max_len} byte limit",
                header.length
            )));
        }
        if header.length != bytes.len() as u64 {
            return Err(XmgmtError::InvalidContainer(format!(
                "header declares {} bytes but {} were supplied",
                header.length,
                bytes.len()
            )));
        }
        if header.length as usize == HEADER_LEN {
            return Err(XmgmtError::InvalidContainer("payload is empty".into()));
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(CONTAINER_MAGIC);
        out[8..16].copy_from_slice(&self.length.to_le_bytes());
        out[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        out[24..32].copy_from_slice(&self.feature_rom_timestamp.to_le_bytes());
        out[32..48].copy_from_slice(&self.uuid);
        out[48..52].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    pub fn uuid_string(&self) -> String {
        uuid_to_string(&self.uuid)
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut field = [0u8; 8];
    field.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(field)
}

pub fn uuid_to_string(uuid: &[u8; 16]) -> String {
    uuid.iter().map(|b| format!("{b:02x}")).collect()
}

/// Build a container around `payload`. Used by tooling and tests.
pub fn build_container(
    uuid: [u8; 16],
    feature_rom_timestamp: u64,
    payload: &[u8],
) -> Vec<u8> {
    let header = ContainerHeader {
        length: (HEADER_LEN + payload.len()) as u64,
        timestamp: 0,
        feature_rom_timestamp,
        uuid,
        version: 1,
    };
    let mut container = header.encode().to_vec();
    container.extend_from_slice(payload);
    container
}

/// What the user region currently holds, as far as the daemon knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Unknown,
    Loaded([u8; 16]),
    /// A download failed mid-stream and nothing could be restored.
    Partial,
}

pub fn image_state(state: &DeviceState) -> Result<ImageState, XmgmtError> {
    Ok(state.lock()?.image)
}

/// Download `descriptor` to the user region of the card.
///
/// # Returns: `Result<(), XmgmtError>`
/// * `Ok(())` - Image programmed and region back out of reset
/// * `Err(XmgmtError::DomainTripped)` - Datapath firewall tripped, nothing was touched
/// * `Err(XmgmtError::Busy)` - Another download or a reset is in progress
/// * `Err(XmgmtError::InvalidContainer)` - Header rejected, nothing was touched
/// * `Err(XmgmtError::Hardware)` - Shell-specific image but the card's shell is unknown
/// * `Err(XmgmtError::Timeout)` - Quiesce or restore was not acknowledged
/// * `Err(XmgmtError::Cancelled)` (or the streaming error) - Failed, previous image rolled back
/// * `Err(XmgmtError::PartialReconfiguration)` - Failed with no rollback, or an earlier
///   download did and no hot reset or reboot has happened since
pub async fn download(
    state: &DeviceState,
    descriptor: ImageDescriptor<'_>,
) -> Result<(), XmgmtError> {
    let guard = state.try_acquire(Operation::Download, |inner| {
        if inner.firewall.is_tripped(FirewallDomain::Datapath) {
            return Err(XmgmtError::DomainTripped(FirewallDomain::Datapath));
        }
        if inner.image == ImageState::Partial {
            return Err(XmgmtError::PartialReconfiguration(String::from(
                "the user region still holds a partially written image",
            )));
        }
        Ok(())
    })?;

    let config = state.config();
    let bytes = descriptor.bytes();
    let header = ContainerHeader::parse(bytes, config.max_image_size)?;
    let feature_id = state.board().telemetry().identity()?.feature_id;
    if header.feature_rom_timestamp != 0 && feature_id == UNKNOWN_U64 {
        return Err(XmgmtError::Hardware(format!(
            "card does not report its shell, cannot check an image built for shell 0x{:X}",
            header.feature_rom_timestamp
        )));
    }
    if header.feature_rom_timestamp != 0 && header.feature_rom_timestamp != feature_id {
        return Err(XmgmtError::InvalidContainer(format!(
            "image was built for shell 0x{:X} but the card runs 0x{feature_id:X}",
            header.feature_rom_timestamp
        )));
    }
    info!(
        "Downloading image {} ({} bytes)",
        header.uuid_string(),
        header.length
    );

    reset::quiesce(state, &guard, ResetKind::Logic).await?;
    let payload = &bytes[HEADER_LEN..];
    match stream(state, &header, payload).await {
        Ok(()) => {
            reset::restore(state, &guard, ResetKind::Logic).await?;
            state.lock()?.image = ImageState::Loaded(header.uuid);
            info!("Image {} loaded", header.uuid_string());
            Ok(())
        }
        Err(cause) => recover(state, &guard, cause).await,
    }
}

/// Ask an in-flight download to stop at the next chunk boundary.
///
/// # Returns: `Result<bool, XmgmtError>`
/// * `Ok(true)` - A download is running and will see the request
/// * `Ok(false)` - Nothing to cancel
pub fn cancel(state: &DeviceState) -> Result<bool, XmgmtError> {
    let inner = state.lock()?;
    if inner.exclusive == Some(Operation::Download) {
        state.request_cancel();
        info!("Cancellation requested for the running download");
        return Ok(true);
    }
    Ok(false)
}

async fn stream(
    state: &DeviceState,
    header: &ContainerHeader,
    payload: &[u8],
) -> Result<(), XmgmtError> {
    let icap = state.board().icap();
    icap.begin(header)?;
    for (index, chunk) in payload.chunks(state.config().chunk_size).enumerate() {
        if state.take_cancel_request() {
            return Err(XmgmtError::Cancelled);
        }
        let datapath_tripped = state.lock()?.firewall.is_tripped(FirewallDomain::Datapath);
        if datapath_tripped {
            return Err(XmgmtError::DomainTripped(FirewallDomain::Datapath));
        }
        icap.write_chunk(chunk)?;
        trace!("Wrote chunk {index} ({} bytes)", chunk.len());
        tokio::task::yield_now().await;
    }
    icap.finish()
}

async fn recover(
    state: &DeviceState,
    guard: &ExclusiveGuard<'_>,
    cause: XmgmtError,
) -> Result<(), XmgmtError> {
    warn!("Download failed after quiesce: {cause}");
    if state.config().rollback {
        match state.board().icap().rollback() {
            Ok(true) => {
                reset::restore(state, guard, ResetKind::Logic).await?;
                warn!("Rolled back to the previous stable image");
                return Err(cause);
            }
            Ok(false) => info!("Board has no stable image to roll back to"),
            Err(e) => error!("Rollback failed: {e}"),
        }
    }

    let reason = cause.to_string();
    {
        let mut inner = state.lock()?;
        inner.image = ImageState::Partial;
    }
    state.emit(FaultEvent::PartialReconfiguration(reason.clone()));
    // The region is still held in reset and its contents are unusable.
    Err(reset::fail(
        state,
        ResetKind::Logic,
        ResetStage::Reset,
        XmgmtError::PartialReconfiguration(reason),
    ))
}
