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

//! Reset coordinator.
//!
//! Sequences the card through `Idle -> Quiescing -> Reset -> Restoring -> Idle`. Any
//! hardware error or missing acknowledgement in `Quiescing` or `Restoring` lands in
//! `Failed`, which is reported and left for an operator to act on; a new reset request is
//! that action. Only one sequence runs at a time because every entry point requires the
//! device's exclusivity token.
//!
//! Firewall bookkeeping: for a requested reset, entering `Quiescing` marks the scoped
//! domains unresolved and reaching `Reset` (reset line asserted and acknowledged) marks
//! them resolved. A download's quiesce leaves the bookkeeping alone. `Failed` marks every
//! domain unresolved so that nothing can be cleared until a reset completes.
//!
//! A hot reset or reboot also discards a partially written image; a logic reset does not.

use crate::device::{DeviceState, ExclusiveGuard, FaultEvent, Operation};
use crate::error::XmgmtError;
use crate::firewall::{self, FirewallDomain};
use crate::image::ImageState;
use log::{info, trace, warn};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::{Instant, sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetStage {
    Idle,
    Quiescing,
    Reset,
    Restoring,
    Failed,
}

impl fmt::Display for ResetStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResetStage::Idle => "idle",
            ResetStage::Quiescing => "quiescing",
            ResetStage::Reset => "reset",
            ResetStage::Restoring => "restoring",
            ResetStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// PCIe hot reset of the whole card.
    Hot,
    /// Compute logic (user region) reset only.
    Logic,
    /// Reload the shell from flash.
    Cold,
}

impl ResetKind {
    /// Firewall domains whose condition this reset resolves.
    pub fn domains(self) -> &'static [FirewallDomain] {
        match self {
            ResetKind::Hot | ResetKind::Cold => &FirewallDomain::ALL,
            ResetKind::Logic => &[FirewallDomain::UserControl, FirewallDomain::Datapath],
        }
    }
}

impl fmt::Display for ResetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResetKind::Hot => "hot reset",
            ResetKind::Logic => "logic reset",
            ResetKind::Cold => "reboot",
        };
        f.write_str(name)
    }
}

pub fn stage(state: &DeviceState) -> Result<ResetStage, XmgmtError> {
    Ok(state.lock()?.reset_stage)
}

pub async fn hot_reset(state: &DeviceState) -> Result<(), XmgmtError> {
    reset(state, ResetKind::Hot).await
}

pub async fn logic_reset(state: &DeviceState) -> Result<(), XmgmtError> {
    reset(state, ResetKind::Logic).await
}

pub async fn reboot(state: &DeviceState) -> Result<(), XmgmtError> {
    reset(state, ResetKind::Cold).await
}

/// Run a complete reset sequence of `kind`, clearing the trips it resolves.
///
/// # Returns: `Result<(), XmgmtError>`
/// * `Ok(())` - Back in `Idle`
/// * `Err(XmgmtError::Busy)` - A download or another reset holds the exclusivity token
/// * `Err(XmgmtError::Timeout)` - The card did not acknowledge; stage is now `Failed`
/// * `Err(XmgmtError::Hardware)` - The card reported an error; stage is now `Failed`
pub async fn reset(state: &DeviceState, kind: ResetKind) -> Result<(), XmgmtError> {
    let guard = state.try_acquire(Operation::Reset(kind), |_| Ok(()))?;
    info!("Starting {kind}");
    quiesce(state, &guard, kind).await?;
    clear_resolved_trips(state, kind)?;
    restore(state, &guard, kind).await?;
    info!("{kind} complete");
    Ok(())
}

/// Drain outstanding work and hold the region of `kind` in reset.
///
/// Requires the exclusivity token; the image loader calls this with its own guard.
pub async fn quiesce(
    state: &DeviceState,
    guard: &ExclusiveGuard<'_>,
    kind: ResetKind,
) -> Result<(), XmgmtError> {
    debug_assert!(guard.belongs_to(state));
    {
        let mut inner = state.lock()?;
        match inner.reset_stage {
            ResetStage::Idle | ResetStage::Failed => {}
            other => {
                return Err(XmgmtError::Internal(format!(
                    "cannot quiesce for {kind} while {other}"
                )));
            }
        }
        inner.reset_stage = ResetStage::Quiescing;
        if resolves_trips(guard) {
            inner.firewall.mark_unresolved(kind.domains());
        }
    }
    trace!("{kind}: quiescing");

    let config = state.config();
    let lines = state.board().reset_lines();
    let result = async {
        lines.drain(kind)?;
        lines.assert_reset(kind)?;
        wait_for_ack(
            ResetStage::Quiescing,
            config.quiesce_timeout(),
            config.poll_interval(),
            || lines.is_quiesced(kind),
        )
        .await
    }
    .await;

    match result {
        Ok(()) => {
            let mut inner = state.lock()?;
            inner.reset_stage = ResetStage::Reset;
            if resolves_trips(guard) {
                inner.firewall.mark_resolved(kind.domains());
            }
            trace!("{kind}: held in reset");
            Ok(())
        }
        Err(e) => Err(fail(state, kind, ResetStage::Quiescing, e)),
    }
}

/// Release the reset of `kind` and wait until clocks and telemetry are usable again.
pub async fn restore(
    state: &DeviceState,
    guard: &ExclusiveGuard<'_>,
    kind: ResetKind,
) -> Result<(), XmgmtError> {
    debug_assert!(guard.belongs_to(state));
    {
        let mut inner = state.lock()?;
        if inner.reset_stage != ResetStage::Reset {
            return Err(XmgmtError::Internal(format!(
                "cannot restore after {kind} while {}",
                inner.reset_stage
            )));
        }
        inner.reset_stage = ResetStage::Restoring;
    }
    trace!("{kind}: restoring");

    let config = state.config();
    let board = state.board();
    let timeout = match kind {
        ResetKind::Cold => config.reboot_timeout(),
        ResetKind::Hot | ResetKind::Logic => config.restore_timeout(),
    };
    let result = async {
        board.reset_lines().deassert_reset(kind)?;
        wait_for_ack(ResetStage::Restoring, timeout, config.poll_interval(), || {
            board.reset_lines().is_ready(kind)
        })
        .await?;
        let clocks = board.clocks().frequencies()?;
        board.telemetry().identity()?;
        Ok::<_, XmgmtError>(clocks)
    }
    .await;

    match result {
        Ok(clocks) => {
            let mut inner = state.lock()?;
            inner.clocks = clocks;
            match kind {
                ResetKind::Cold => inner.image = ImageState::Unknown,
                ResetKind::Hot if inner.image == ImageState::Partial => {
                    inner.image = ImageState::Unknown
                }
                ResetKind::Hot | ResetKind::Logic => {}
            }
            inner.reset_stage = ResetStage::Idle;
            Ok(())
        }
        Err(e) => Err(fail(state, kind, ResetStage::Restoring, e)),
    }
}

/// Only a requested reset resolves trips. A download holds its region in reset too, but
/// a trip it finds stays unresolved until someone asks for a reset.
fn resolves_trips(guard: &ExclusiveGuard<'_>) -> bool {
    matches!(guard.operation(), Operation::Reset(..))
}

/// Put the coordinator in `Failed` after something went wrong while `stage`.
pub(crate) fn fail(
    state: &DeviceState,
    kind: ResetKind,
    stage: ResetStage,
    cause: XmgmtError,
) -> XmgmtError {
    match state.lock() {
        Ok(mut inner) => {
            inner.reset_stage = ResetStage::Failed;
            inner.firewall.mark_unresolved(&FirewallDomain::ALL);
        }
        Err(e) => return e,
    }
    state.emit(FaultEvent::ResetFailed {
        kind,
        stage,
        reason: cause.to_string(),
    });
    cause
}

/// Clear every tripped domain that the reset of `kind` resolved.
///
/// A trip that lands between quiesce and this point is not resolved; it stays tripped
/// for the next reset instead of failing this one.
fn clear_resolved_trips(state: &DeviceState, kind: ResetKind) -> Result<(), XmgmtError> {
    let tripped: Vec<FirewallDomain> = {
        let inner = state.lock()?;
        kind.domains()
            .iter()
            .copied()
            .filter(|domain| inner.firewall.is_tripped(*domain))
            .collect()
    };
    for domain in tripped {
        match firewall::clear(state, domain) {
            Ok(()) => {}
            Err(XmgmtError::StillActive(domain)) => {
                warn!("Firewall {domain} tripped again during {kind}, leaving it tripped");
            }
            Err(e) => return Err(fail(state, kind, ResetStage::Reset, e)),
        }
    }
    Ok(())
}

/// Poll `acknowledged` every `poll` until it reports true or `timeout` elapses.
async fn wait_for_ack<F>(
    stage: ResetStage,
    timeout: Duration,
    poll: Duration,
    mut acknowledged: F,
) -> Result<(), XmgmtError>
where
    F: FnMut() -> Result<bool, XmgmtError>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if acknowledged()? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(XmgmtError::Timeout {
                stage,
                waited: timeout,
            });
        }
        trace!("Waiting for acknowledgement while {stage}");
        sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boards::simulated::SimulatedBoard;
    use crate::config::DeviceConfig;
    use googletest::prelude::*;
    use googletest::matchers::is_empty as empty;
    use rstest::*;
    use std::sync::Arc;

    fn fast_config() -> DeviceConfig {
        DeviceConfig {
            quiesce_timeout_ms: 30,
            restore_timeout_ms: 30,
            reboot_timeout_ms: 30,
            poll_interval_ms: 1,
            ..DeviceConfig::default()
        }
    }

    fn attach() -> (Arc<SimulatedBoard>, Arc<DeviceState>) {
        let board = Arc::new(SimulatedBoard::new());
        let state =
            DeviceState::attach(board.clone(), fast_config()).expect("failed to attach");
        (board, state)
    }

    #[tokio::test]
    #[gtest]
    #[rstest]
    #[case::hot(ResetKind::Hot)]
    #[case::logic(ResetKind::Logic)]
    #[case::cold(ResetKind::Cold)]
    async fn reset_returns_to_idle(#[case] kind: ResetKind) {
        let (board, state) = attach();
        assert_that!(reset(&state, kind).await, ok(anything()));
        assert_that!(stage(&state), ok(eq(&ResetStage::Idle)));
        assert_that!(board.reset_count(), eq(1));
        assert_that!(state.exclusive_holder().expect("lock"), none());
    }

    #[tokio::test]
    #[gtest]
    async fn hot_reset_clears_every_trip() {
        let (board, state) = attach();
        for domain in FirewallDomain::ALL {
            board.trip(domain, 0x10);
            firewall::observe(&state, domain, 0x10).expect("observe");
        }
        hot_reset(&state).await.expect("hot reset should succeed");
        let report = firewall::snapshot(&state).expect("snapshot");
        assert_that!(report.trips, empty());
        assert_that!(report.firewall_level, eq(0));
        assert_that!(board.latched(FirewallDomain::Datapath), eq(0));
    }

    #[tokio::test]
    #[gtest]
    async fn logic_reset_leaves_management_domain_tripped() {
        let (_board, state) = attach();
        firewall::observe(&state, FirewallDomain::ManagementControl, 1).expect("observe");
        firewall::observe(&state, FirewallDomain::Datapath, 2).expect("observe");
        logic_reset(&state).await.expect("logic reset should succeed");
        assert_that!(
            firewall::is_tripped(&state, FirewallDomain::Datapath),
            ok(eq(&false))
        );
        assert_that!(
            firewall::is_tripped(&state, FirewallDomain::ManagementControl),
            ok(eq(&true))
        );
        assert_that!(
            firewall::clear(&state, FirewallDomain::ManagementControl),
            err(displays_as(contains_substring("XmgmtError::StillActive")))
        );
    }

    #[tokio::test]
    #[gtest]
    async fn quiesce_timeout_fails_and_blocks_clear_until_next_reset() {
        let (board, state) = attach();
        board.withhold_quiesce_ack(true);
        let mut events = state.subscribe();

        let result = hot_reset(&state).await;
        assert_that!(
            result,
            err(displays_as(contains_substring("XmgmtError::Timeout")))
        );
        assert_that!(stage(&state), ok(eq(&ResetStage::Failed)));
        let event = events.try_recv().expect("a fault event should be emitted");
        assert_that!(event.kind(), eq("reset_failed"));

        for domain in FirewallDomain::ALL {
            assert_that!(
                firewall::clear(&state, domain),
                err(displays_as(contains_substring("XmgmtError::StillActive")))
            );
        }

        board.withhold_quiesce_ack(false);
        hot_reset(&state).await.expect("fresh reset should succeed");
        for domain in FirewallDomain::ALL {
            assert_that!(firewall::clear(&state, domain), ok(anything()));
        }
    }

    #[tokio::test]
    #[gtest]
    async fn restore_timeout_fails() {
        let (board, state) = attach();
        board.withhold_ready_ack(true);
        assert_that!(
            reboot(&state).await,
            err(displays_as(contains_substring("restoring")))
        );
        assert_that!(stage(&state), ok(eq(&ResetStage::Failed)));
    }

    #[tokio::test]
    #[gtest]
    async fn concurrent_reset_is_busy() {
        let (board, state) = attach();
        board.withhold_quiesce_ack(true);
        let first = hot_reset(&state);
        let second = async {
            tokio::task::yield_now().await;
            logic_reset(&state).await
        };
        let (first, second) = tokio::join!(first, second);
        assert_that!(first, err(anything()));
        assert_that!(
            second,
            err(displays_as(contains_substring("XmgmtError::Busy")))
        );
    }

    #[tokio::test]
    #[gtest]
    async fn restore_rereads_clocks() {
        let (board, state) = attach();
        board.set_frequencies([100, 200, 0, 0]);
        hot_reset(&state).await.expect("hot reset should succeed");
        assert_that!(state.lock().expect("lock").clocks, eq([100, 200, 0, 0]));
    }
}
