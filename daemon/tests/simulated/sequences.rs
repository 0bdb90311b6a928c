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

use crate::simulated::{Device, device, wait_for_stage};
use googletest::prelude::*;
use googletest::matchers::is_empty as empty;
use rstest::*;
use xmgmtd::boards::simulated::SIMULATED_FEATURE_ID;
use xmgmtd::dispatch::{
    CODE_ERROR_QUERY, CODE_HOT_RESET, CODE_IMAGE_DOWNLOAD, CODE_INFO, Response, submit,
};
use xmgmtd::firewall::{self, ErrorReport, FirewallDomain};
use xmgmtd::health;
use xmgmtd::image::build_container;
use xmgmtd::reset::{self, ResetStage};

async fn error_query(device: &Device) -> ErrorReport {
    match submit(&device.state, CODE_ERROR_QUERY, &[]).await {
        Ok(Response::Errors(report)) => report,
        other => panic!("ErrorQuery returned {other:?}"),
    }
}

#[tokio::test]
#[gtest]
#[rstest]
async fn trip_blocks_download_until_hot_reset(device: Device) {
    let image = build_container([0x42; 16], SIMULATED_FEATURE_ID, &[0xc3; 4096]);

    assert_that!(reset::stage(&device.state), ok(eq(&ResetStage::Idle)));
    let report = error_query(&device).await;
    assert_that!(report.trips, empty());
    assert_that!(report.firewall_level, eq(0));

    device.board.trip(FirewallDomain::Datapath, 0x0004_0000);
    assert_that!(health::poll_once(&device.state), ok(eq(&1)));
    let report = error_query(&device).await;
    assert_that!(report.trips.len(), eq(1));
    assert_that!(report.trips[0].domain, eq(FirewallDomain::Datapath));
    assert_that!(report.trips[0].status_code, eq(0x0004_0000));

    assert_that!(
        submit(&device.state, CODE_IMAGE_DOWNLOAD, &image).await,
        err(displays_as(contains_substring("XmgmtError::DomainTripped")))
    );

    // Hold each acknowledgement so the intermediate stages can be seen.
    device.board.withhold_quiesce_ack(true);
    device.board.withhold_ready_ack(true);
    let resetting = submit(&device.state, CODE_HOT_RESET, &[]);
    let observing = async {
        wait_for_stage(&device.state, ResetStage::Quiescing).await;
        device.board.withhold_quiesce_ack(false);
        wait_for_stage(&device.state, ResetStage::Restoring).await;
        assert_that!(
            firewall::is_tripped(&device.state, FirewallDomain::Datapath),
            ok(eq(&false))
        );
        device.board.withhold_ready_ack(false);
    };
    let (reset_result, ()) = tokio::join!(resetting, observing);
    assert_that!(reset_result, ok(anything()));
    assert_that!(reset::stage(&device.state), ok(eq(&ResetStage::Idle)));
    assert_that!(device.board.latched(FirewallDomain::Datapath), eq(0));

    let report = error_query(&device).await;
    assert_that!(report.trips, empty());
    assert_that!(report.firewall_level, eq(0));

    assert_that!(
        submit(&device.state, CODE_IMAGE_DOWNLOAD, &image).await,
        ok(anything())
    );
    let info = match submit(&device.state, CODE_INFO, &[]).await {
        Ok(Response::Info(info)) => info,
        other => panic!("InfoQuery returned {other:?}"),
    };
    let expected_uuid = "42".repeat(16);
    assert_that!(info.image_uuid.as_deref(), some(eq(expected_uuid.as_str())));
}

#[tokio::test]
#[gtest]
#[rstest]
async fn failed_reset_blocks_clear_until_next_reset(device: Device) {
    firewall::observe(&device.state, FirewallDomain::UserControl, 0x10).expect("observe");
    device.board.withhold_quiesce_ack(true);
    let mut events = device.state.subscribe();

    let started = tokio::time::Instant::now();
    assert_that!(
        reset::hot_reset(&device.state).await,
        err(displays_as(contains_substring("XmgmtError::Timeout")))
    );
    assert_that!(started.elapsed().as_millis(), ge(2000));
    assert_that!(reset::stage(&device.state), ok(eq(&ResetStage::Failed)));
    let event = events.recv().await.expect("fault event");
    assert_that!(event.kind(), eq("reset_failed"));

    for domain in FirewallDomain::ALL {
        assert_that!(
            firewall::clear(&device.state, domain),
            err(displays_as(contains_substring("XmgmtError::StillActive")))
        );
    }

    device.board.withhold_quiesce_ack(false);
    reset::hot_reset(&device.state)
        .await
        .expect("a fresh reset should complete");
    assert_that!(
        firewall::is_tripped(&device.state, FirewallDomain::UserControl),
        ok(eq(&false))
    );
    for domain in FirewallDomain::ALL {
        assert_that!(firewall::clear(&device.state, domain), ok(anything()));
    }
}

#[tokio::test]
#[gtest]
#[rstest]
async fn trip_log_keeps_the_eight_most_recent(device: Device) {
    for code in 1..=20u32 {
        firewall::observe(&device.state, FirewallDomain::UserControl, code).expect("observe");
    }
    let report = error_query(&device).await;
    let codes: Vec<u32> = report.trips.iter().map(|t| t.status_code).collect();
    assert_that!(codes, eq(&(13..=20).collect::<Vec<u32>>()));
    assert_that!(report.firewall_level, eq(2));
}
