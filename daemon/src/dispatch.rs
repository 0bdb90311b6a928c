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

//! Command dispatcher.
//!
//! Decodes raw management requests into [`Command`] and routes them to the components.
//! Request codes follow the management ioctl numbering:
//!
//! | code | command                                    | payload                      |
//! |------|--------------------------------------------|------------------------------|
//! | 0    | [`Command::InfoQuery`]                     | empty                        |
//! | 1    | legacy raw bitstream download, unsupported | -                            |
//! | 2    | [`Command::FrequencyScale`]                | `u32` region, 4 x `u16` (LE) |
//! | 3    | [`Command::LogicReset`]                    | empty                        |
//! | 4    | [`Command::HotReset`]                      | empty                        |
//! | 5    | [`Command::Reboot`]                        | empty                        |
//! | 6    | [`Command::ImageDownload`]                 | image container              |
//! | 7    | [`Command::ErrorQuery`]                    | empty                        |

use crate::clock::{self, FrequencyScalingRequest, NUM_SUPPORTED_CLOCKS};
use crate::device::DeviceState;
use crate::error::XmgmtError;
use crate::firewall::{self, ErrorReport};
use crate::image::{self, ImageDescriptor};
use crate::reset;
use crate::telemetry::{self, DeviceInfo};
use log::{debug, info};

pub const CODE_INFO: u32 = 0;
pub const CODE_LEGACY_DOWNLOAD: u32 = 1;
pub const CODE_FREQ_SCALE: u32 = 2;
pub const CODE_LOGIC_RESET: u32 = 3;
pub const CODE_HOT_RESET: u32 = 4;
pub const CODE_REBOOT: u32 = 5;
pub const CODE_IMAGE_DOWNLOAD: u32 = 6;
pub const CODE_ERROR_QUERY: u32 = 7;

const FREQ_SCALE_PAYLOAD_LEN: usize = 4 + 2 * NUM_SUPPORTED_CLOCKS;

/// Every request the control plane accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    InfoQuery,
    ImageDownload(ImageDescriptor<'a>),
    FrequencyScale(FrequencyScalingRequest),
    HotReset,
    LogicReset,
    Reboot,
    ErrorQuery,
}

impl<'a> Command<'a> {
    /// Decode a raw request.
    ///
    /// # Returns: `Result<Command, XmgmtError>`
    /// * `Ok(Command)` - Known code with a well formed payload
    /// * `Err(XmgmtError::UnsupportedCommand)` - Unknown code or malformed payload
    pub fn decode(code: u32, payload: &'a [u8]) -> Result<Command<'a>, XmgmtError> {
        let command = match code {
            CODE_INFO => Command::InfoQuery,
            CODE_LEGACY_DOWNLOAD => {
                return Err(XmgmtError::UnsupportedCommand(String::from(
                    "raw bitstream download was replaced by image container download",
                )));
            }
            CODE_FREQ_SCALE => Command::FrequencyScale(decode_freq_scale(payload)?),
            CODE_LOGIC_RESET => Command::LogicReset,
            CODE_HOT_RESET => Command::HotReset,
            CODE_REBOOT => Command::Reboot,
            CODE_IMAGE_DOWNLOAD => {
                return Ok(Command::ImageDownload(ImageDescriptor::new(payload)));
            }
            CODE_ERROR_QUERY => Command::ErrorQuery,
            other => {
                return Err(XmgmtError::UnsupportedCommand(format!(
                    "unknown request code {other}"
                )));
            }
        };
        if !matches!(command, Command::FrequencyScale(_)) && !payload.is_empty() {
            return Err(XmgmtError::UnsupportedCommand(format!(
                "request code {code} takes no payload but {} bytes were sent",
                payload.len()
            )));
        }
        Ok(command)
    }

    /// True for the commands that take the exclusivity token.
    pub fn is_exclusive(&self) -> bool {
        matches!(
            self,
            Command::ImageDownload(_) | Command::HotReset | Command::LogicReset | Command::Reboot
        )
    }
}

fn decode_freq_scale(payload: &[u8]) -> Result<FrequencyScalingRequest, XmgmtError> {
    if payload.len() != FREQ_SCALE_PAYLOAD_LEN {
        return Err(XmgmtError::UnsupportedCommand(format!(
            "frequency scale payload must be {FREQ_SCALE_PAYLOAD_LEN} bytes, got {}",
            payload.len()
        )));
    }
    let region = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let mut targets = [0u16; NUM_SUPPORTED_CLOCKS];
    for (target, bytes) in targets.iter_mut().zip(payload[4..].chunks_exact(2)) {
        *target = u16::from_le_bytes([bytes[0], bytes[1]]);
    }
    Ok(FrequencyScalingRequest { region, targets })
}

/// Result of a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Info(Box<DeviceInfo>),
    Errors(ErrorReport),
    Done(String),
}

impl Response {
    /// Snapshots render as JSON, completions as their message.
    pub fn render(&self) -> Result<String, XmgmtError> {
        let rendered = match self {
            Response::Info(info) => serde_json::to_string(info),
            Response::Errors(report) => serde_json::to_string(report),
            Response::Done(message) => return Ok(message.clone()),
        };
        rendered.map_err(|e| XmgmtError::Internal(format!("could not serialize response: {e}")))
    }
}

/// Run `command` against the device.
pub async fn dispatch(state: &DeviceState, command: Command<'_>) -> Result<Response, XmgmtError> {
    debug!("Dispatching {command:?}");
    let response = match command {
        Command::InfoQuery => Response::Info(Box::new(telemetry::snapshot(state)?)),
        Command::ErrorQuery => Response::Errors(firewall::snapshot(state)?),
        Command::ImageDownload(descriptor) => {
            image::download(state, descriptor).await?;
            Response::Done(String::from("Image downloaded"))
        }
        Command::FrequencyScale(request) => {
            clock::scale(state, &request)?;
            Response::Done(format!(
                "Clocks set to {:?} MHz",
                clock::frequencies(state)?
            ))
        }
        Command::HotReset => {
            reset::hot_reset(state).await?;
            Response::Done(String::from("Hot reset complete"))
        }
        Command::LogicReset => {
            reset::logic_reset(state).await?;
            Response::Done(String::from("Logic reset complete"))
        }
        Command::Reboot => {
            reset::reboot(state).await?;
            Response::Done(String::from("Reboot complete"))
        }
    };
    if command.is_exclusive() {
        info!("{command:?} finished");
    }
    Ok(response)
}

/// Decode and dispatch a raw request in one step.
pub async fn submit(state: &DeviceState, code: u32, payload: &[u8]) -> Result<Response, XmgmtError> {
    let command = Command::decode(code, payload)?;
    dispatch(state, command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boards::simulated::{SIMULATED_FEATURE_ID, SimulatedBoard};
    use crate::config::DeviceConfig;
    use crate::firewall::FirewallDomain;
    use crate::image::build_container;
    use googletest::prelude::*;
    use rstest::*;
    use std::sync::Arc;

    fn attach() -> Arc<DeviceState> {
        let config = DeviceConfig {
            poll_interval_ms: 1,
            ..DeviceConfig::default()
        };
        DeviceState::attach(Arc::new(SimulatedBoard::new()), config).expect("attach")
    }

    fn freq_payload(region: u32, targets: [u16; 4]) -> Vec<u8> {
        let mut payload = region.to_le_bytes().to_vec();
        for target in targets {
            payload.extend_from_slice(&target.to_le_bytes());
        }
        payload
    }

    #[gtest]
    #[rstest]
    #[case::info(CODE_INFO, Command::InfoQuery)]
    #[case::logic_reset(CODE_LOGIC_RESET, Command::LogicReset)]
    #[case::hot_reset(CODE_HOT_RESET, Command::HotReset)]
    #[case::reboot(CODE_REBOOT, Command::Reboot)]
    #[case::errors(CODE_ERROR_QUERY, Command::ErrorQuery)]
    fn decodes_payloadless_commands(#[case] code: u32, #[case] expected: Command<'static>) {
        assert_that!(Command::decode(code, &[]), ok(eq(&expected)));
    }

    #[gtest]
    fn decodes_frequency_scale_payload() {
        let payload = freq_payload(0, [100, 0, 0, 0x1234]);
        assert_that!(
            Command::decode(CODE_FREQ_SCALE, &payload),
            ok(eq(&Command::FrequencyScale(FrequencyScalingRequest {
                region: 0,
                targets: [100, 0, 0, 0x1234],
            })))
        );
    }

    #[gtest]
    #[rstest]
    #[case::legacy_download(CODE_LEGACY_DOWNLOAD, vec![])]
    #[case::unknown_code(8, vec![])]
    #[case::huge_code(u32::MAX, vec![])]
    #[case::short_freq_payload(CODE_FREQ_SCALE, vec![0; 6])]
    #[case::payload_on_reset(CODE_HOT_RESET, vec![1])]
    fn rejects_unsupported_requests(#[case] code: u32, #[case] payload: Vec<u8>) {
        assert_that!(
            Command::decode(code, &payload),
            err(displays_as(contains_substring("XmgmtError::UnsupportedCommand")))
        );
    }

    #[tokio::test]
    #[gtest]
    async fn info_query_renders_json() {
        let state = attach();
        let response = submit(&state, CODE_INFO, &[]).await.expect("info");
        let rendered = response.render().expect("render");
        let parsed: serde_json::Value = serde_json::from_str(&rendered).expect("valid json");
        assert_that!(parsed["identity"]["vendor"].as_u64(), some(eq(0x10ee)));
        assert_that!(parsed["clocks"]["frequencies"][0].as_u64(), some(eq(300)));
    }

    #[tokio::test]
    #[gtest]
    async fn error_query_renders_level_and_trips() {
        let state = attach();
        firewall::observe(&state, FirewallDomain::UserControl, 0x80).expect("observe");
        let response = submit(&state, CODE_ERROR_QUERY, &[]).await.expect("errors");
        let rendered = response.render().expect("render");
        assert_that!(rendered, contains_substring("\"firewall_level\":2"));
        assert_that!(rendered, contains_substring("\"domain\":\"user_control\""));
    }

    #[tokio::test]
    #[gtest]
    async fn download_then_scale_through_the_dispatcher() {
        let state = attach();
        let image = build_container([7; 16], SIMULATED_FEATURE_ID, &[0xee; 512]);
        assert_that!(
            submit(&state, CODE_IMAGE_DOWNLOAD, &image).await,
            ok(eq(&Response::Done(String::from("Image downloaded"))))
        );
        let payload = freq_payload(0, [0, 200, 0, 0]);
        assert_that!(submit(&state, CODE_FREQ_SCALE, &payload).await, ok(anything()));
        assert_that!(clock::frequencies(&state), ok(eq(&[300, 200, 0, 0])));
    }

    #[gtest]
    fn exclusive_commands() {
        assert_that!(Command::HotReset.is_exclusive(), eq(true));
        assert_that!(Command::ImageDownload(ImageDescriptor::new(&[])).is_exclusive(), eq(true));
        assert_that!(Command::InfoQuery.is_exclusive(), eq(false));
        assert_that!(Command::ErrorQuery.is_exclusive(), eq(false));
    }
}
