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

use crate::clock::{self, FrequencyScalingRequest};
use crate::comm::dbus::read_image;
use crate::device::DeviceState;
use crate::dispatch::{self, Command, dispatch};
use crate::firewall::{self, FirewallDomain};
use crate::image::{self, ImageDescriptor};
use log::info;
use std::sync::Arc;
use zbus::{fdo, interface};

pub struct ControlInterface {
    state: Arc<DeviceState>,
}

impl ControlInterface {
    pub fn new(state: Arc<DeviceState>) -> Self {
        ControlInterface { state }
    }
}

#[interface(name = "com.xmgmt.daemon.control")]
impl ControlInterface {
    async fn download_image(&self, image_path_str: &str) -> Result<String, fdo::Error> {
        info!("download_image called with image_path_str: {image_path_str}");
        let bytes = read_image(image_path_str, self.state.config().max_image_size)?;
        image::download(&self.state, ImageDescriptor::new(&bytes)).await?;
        Ok(format!("{image_path_str} downloaded"))
    }

    async fn cancel_download(&self) -> Result<String, fdo::Error> {
        info!("cancel_download called");
        Ok(match image::cancel(&self.state)? {
            true => String::from("Cancellation requested"),
            false => String::from("No download in progress"),
        })
    }

    async fn scale_frequencies(&self, region: u32, targets: Vec<u16>) -> Result<String, fdo::Error> {
        info!("scale_frequencies called with region: {region} and targets: {targets:?}");
        let request = FrequencyScalingRequest::new(region, &targets)?;
        clock::scale(&self.state, &request)?;
        Ok(format!(
            "Clocks set to {:?} MHz",
            clock::frequencies(&self.state)?
        ))
    }

    async fn hot_reset(&self) -> Result<String, fdo::Error> {
        info!("hot_reset called");
        Ok(dispatch(&self.state, Command::HotReset).await?.render()?)
    }

    async fn logic_reset(&self) -> Result<String, fdo::Error> {
        info!("logic_reset called");
        Ok(dispatch(&self.state, Command::LogicReset).await?.render()?)
    }

    async fn reboot(&self) -> Result<String, fdo::Error> {
        info!("reboot called");
        Ok(dispatch(&self.state, Command::Reboot).await?.render()?)
    }

    async fn clear_firewall(&self, domain_str: &str) -> Result<String, fdo::Error> {
        info!("clear_firewall called with domain_str: {domain_str}");
        let domain: FirewallDomain = domain_str.parse()?;
        firewall::clear(&self.state, domain)?;
        Ok(format!("Firewall {domain} cleared"))
    }

    /// Raw management request, numbered like the management driver's ioctls.
    async fn submit(&self, code: u32, payload: Vec<u8>) -> Result<String, fdo::Error> {
        info!("submit called with code: {code} and {} payload bytes", payload.len());
        Ok(dispatch::submit(&self.state, code, &payload).await?.render()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boards::simulated::{SIMULATED_FEATURE_ID, SimulatedBoard};
    use crate::config::DeviceConfig;
    use crate::image::build_container;
    use googletest::prelude::*;
    use std::io::Write;

    fn interface() -> ControlInterface {
        let state = DeviceState::attach(Arc::new(SimulatedBoard::new()), DeviceConfig::default())
            .expect("attach");
        ControlInterface::new(state)
    }

    #[tokio::test]
    #[gtest]
    async fn download_reads_the_named_file() {
        let control = interface();
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&build_container([3; 16], SIMULATED_FEATURE_ID, &[1; 256]))
            .expect("write image");
        let path = file.path().to_str().expect("utf-8 path").to_owned();
        assert_that!(
            control.download_image(&path).await,
            ok(ends_with("downloaded"))
        );
    }

    #[tokio::test]
    #[gtest]
    async fn invalid_path_is_invalid_args() {
        let control = interface();
        let result = control.download_image("relative/image.xclbin").await;
        assert!(
            matches!(result, Err(fdo::Error::InvalidArgs(_))),
            "relative paths should be rejected as InvalidArgs, got {result:?}"
        );
    }

    #[tokio::test]
    #[gtest]
    async fn too_many_targets_is_invalid_args() {
        let control = interface();
        let result = control.scale_frequencies(0, vec![100; 5]).await;
        assert!(
            matches!(result, Err(fdo::Error::InvalidArgs(_))),
            "five targets should be rejected as InvalidArgs, got {result:?}"
        );
    }

    #[tokio::test]
    #[gtest]
    async fn unknown_code_is_not_supported() {
        let control = interface();
        let result = control.submit(42, Vec::new()).await;
        assert!(
            matches!(result, Err(fdo::Error::NotSupported(_))),
            "code 42 should be NotSupported, got {result:?}"
        );
    }

    #[tokio::test]
    #[gtest]
    async fn cancel_without_download() {
        let control = interface();
        assert_that!(
            control.cancel_download().await,
            ok(eq("No download in progress"))
        );
    }
}
