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

use crate::simulated::{Device, device, wait_for_exclusive, wait_for_stage};
use googletest::prelude::*;
use rstest::*;
use std::time::Duration;
use tokio::time::Instant;
use xmgmtd::boards::simulated::SIMULATED_FEATURE_ID;
use xmgmtd::clock::{self, FrequencyScalingRequest};
use xmgmtd::firewall::{self, FirewallDomain};
use xmgmtd::device::Operation;
use xmgmtd::image::{self, ImageDescriptor, ImageState, build_container, uuid_to_string};
use xmgmtd::reset::{self, ResetStage};
use xmgmtd::telemetry;

fn image() -> Vec<u8> {
    build_container([0x11; 16], SIMULATED_FEATURE_ID, &[0x5a; 8192])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[gtest]
#[rstest]
async fn second_download_is_busy_without_waiting(device: Device) {
    device.board.withhold_quiesce_ack(true);
    let first = {
        let state = device.state.clone();
        tokio::spawn(async move {
            let image = image();
            image::download(&state, ImageDescriptor::new(&image)).await
        })
    };
    wait_for_exclusive(&device.state).await;

    let started = Instant::now();
    let second_image = image();
    let second = image::download(&device.state, ImageDescriptor::new(&second_image)).await;
    assert_that!(started.elapsed(), lt(Duration::from_millis(100)));
    assert_that!(
        second,
        err(displays_as(contains_substring("XmgmtError::Busy")))
    );
    assert_that!(
        reset::hot_reset(&device.state).await,
        err(displays_as(contains_substring("image download is in progress")))
    );

    device.board.withhold_quiesce_ack(false);
    let first = first.await.expect("download task panicked");
    assert_that!(first, ok(anything()));
    assert_that!(image::image_state(&device.state), ok(eq(&ImageState::Loaded([0x11; 16]))));
    assert_that!(device.state.exclusive_holder().expect("lock"), none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[gtest]
#[rstest]
async fn trip_during_download_is_never_lost(device: Device) {
    device.board.withhold_quiesce_ack(true);
    let downloading = {
        let state = device.state.clone();
        tokio::spawn(async move {
            let image = image();
            image::download(&state, ImageDescriptor::new(&image)).await
        })
    };
    wait_for_exclusive(&device.state).await;
    firewall::observe(&device.state, FirewallDomain::Datapath, 0x2).expect("observe");
    device.board.withhold_quiesce_ack(false);

    let outcome = downloading.await.expect("download task panicked");
    if let Err(e) = &outcome {
        assert_that!(
            e.to_string(),
            any![
                contains_substring("XmgmtError::DomainTripped"),
                contains_substring("XmgmtError::PartialReconfiguration")
            ]
        );
    }
    let report = firewall::snapshot(&device.state).expect("snapshot");
    assert_that!(report.trips.len(), eq(1));
    assert_that!(report.firewall_level, eq(3));
}

#[tokio::test]
#[gtest]
#[rstest]
async fn scale_waits_for_nothing_and_changes_nothing_while_busy(device: Device) {
    device.board.withhold_quiesce_ack(true);
    let resetting = reset::hot_reset(&device.state);
    let scaling = async {
        wait_for_exclusive(&device.state).await;
        let request = FrequencyScalingRequest::new(0, &[0, 100]).expect("request");
        let result = clock::scale(&device.state, &request);
        device.board.withhold_quiesce_ack(false);
        result
    };
    let (reset_result, scale_result) = tokio::join!(resetting, scaling);
    assert_that!(reset_result, ok(anything()));
    assert_that!(
        scale_result,
        err(displays_as(contains_substring("XmgmtError::Busy")))
    );
    assert_that!(clock::frequencies(&device.state), ok(eq(&[300, 500, 0, 0])));
    assert_that!(reset::stage(&device.state), ok(eq(&ResetStage::Idle)));
}

#[gtest]
#[rstest]
#[case::all_zero(&[0, 0, 0, 0], true)]
#[case::one_out_of_range(&[200, 9000], false)]
#[case::absent_clock(&[0, 0, 250], false)]
fn scale_is_all_or_nothing(device: Device, #[case] targets: &[u16], #[case] succeeds: bool) {
    let request = FrequencyScalingRequest::new(0, targets).expect("request");
    assert_that!(clock::scale(&device.state, &request).is_ok(), eq(succeeds));
    assert_that!(clock::frequencies(&device.state), ok(eq(&[300, 500, 0, 0])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[gtest]
#[rstest]
async fn snapshots_do_not_wait_for_a_held_download(device: Device) {
    let first = image();
    image::download(&device.state, ImageDescriptor::new(&first))
        .await
        .expect("first download");
    firewall::observe(&device.state, FirewallDomain::UserControl, 0x8).expect("observe");

    device.board.withhold_quiesce_ack(true);
    let downloading = {
        let state = device.state.clone();
        tokio::spawn(async move {
            let image = build_container([0x22; 16], SIMULATED_FEATURE_ID, &[0x5a; 512]);
            image::download(&state, ImageDescriptor::new(&image)).await
        })
    };
    wait_for_stage(&device.state, ResetStage::Quiescing).await;

    let started = Instant::now();
    let info = telemetry::snapshot(&device.state).expect("telemetry snapshot");
    let report = firewall::snapshot(&device.state).expect("error snapshot");
    assert_that!(started.elapsed(), lt(Duration::from_millis(100)));

    // Still the image and clocks from before the held download started.
    let loaded = uuid_to_string(&[0x11; 16]);
    assert_that!(info.image_uuid.as_deref(), some(eq(loaded.as_str())));
    assert_that!(info.image_partial, eq(false));
    assert_that!(
        info.clocks.frequencies,
        eq(clock::frequencies(&device.state).expect("frequencies"))
    );
    assert_that!(report.trips.len(), eq(1));
    assert_that!(report.trips[0].domain, eq(FirewallDomain::UserControl));
    assert_that!(report.firewall_level, eq(FirewallDomain::UserControl.level()));
    assert_that!(
        device.state.exclusive_holder().expect("lock"),
        some(eq(Operation::Download))
    );

    device.board.withhold_quiesce_ack(false);
    let outcome = downloading.await.expect("download task panicked");
    assert_that!(outcome, ok(anything()));
}
