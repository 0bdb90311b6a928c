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

//! Process-wide device state.
//!
//! A [`DeviceState`] is created when the daemon attaches to a card and torn down on
//! detach. Every component operation takes a shared reference to it. All mutable fields
//! (trip log, clock frequencies, exclusivity token, reset stage, image state) live behind
//! one mutex, which is never held across an `.await`. Long running operations instead
//! hold the exclusivity token through an [`ExclusiveGuard`], so concurrent downloads and
//! resets get [`XmgmtError::Busy`] immediately rather than queueing.

use crate::boards::board::Board;
use crate::clock::NUM_SUPPORTED_CLOCKS;
use crate::config::DeviceConfig;
use crate::error::XmgmtError;
use crate::firewall::{FirewallMonitor, FirewallTripRecord};
use crate::health::HealthMonitor;
use crate::image::ImageState;
use crate::reset::{ResetKind, ResetStage};
use log::{error, info, trace, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;

const FAULT_EVENT_CAPACITY: usize = 64;

/// The operations that need the exclusivity token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Download,
    Reset(ResetKind),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Download => write!(f, "image download"),
            Operation::Reset(kind) => write!(f, "{kind}"),
        }
    }
}

/// Device level conditions pushed to the telemetry publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultEvent {
    FirewallTrip(FirewallTripRecord),
    ResetFailed {
        kind: ResetKind,
        stage: ResetStage,
        reason: String,
    },
    PartialReconfiguration(String),
}

impl FaultEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FaultEvent::FirewallTrip(..) => "firewall_trip",
            FaultEvent::ResetFailed { .. } => "reset_failed",
            FaultEvent::PartialReconfiguration(..) => "partial_reconfiguration",
        }
    }
}

impl fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultEvent::FirewallTrip(record) => write!(
                f,
                "firewall {} tripped with status 0x{:X} at {}",
                record.domain, record.status_code, record.timestamp
            ),
            FaultEvent::ResetFailed {
                kind,
                stage,
                reason,
            } => write!(f, "{kind} failed while {stage}: {reason}"),
            FaultEvent::PartialReconfiguration(reason) => {
                write!(f, "partial reconfiguration: {reason}")
            }
        }
    }
}

/// Mutable state, only reachable through [`DeviceState::lock`].
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) firewall: FirewallMonitor,
    pub(crate) clocks: [u16; NUM_SUPPORTED_CLOCKS],
    pub(crate) exclusive: Option<Operation>,
    pub(crate) reset_stage: ResetStage,
    pub(crate) image: ImageState,
}

pub struct DeviceState {
    board: Arc<dyn Board>,
    config: DeviceConfig,
    inner: Mutex<Inner>,
    cancel_requested: AtomicBool,
    events: broadcast::Sender<FaultEvent>,
    epoch: Instant,
    health: Mutex<Option<HealthMonitor>>,
}

impl fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceState")
            .field("board", &self.board.name())
            .field("config", &self.config)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl DeviceState {
    /// Attach to `board` and build the initial state.
    ///
    /// Reads the current clock frequencies from the board so that frequency scaling
    /// requests with zero targets keep the values the card actually runs at.
    ///
    /// # Returns: `Result<Arc<DeviceState>, XmgmtError>`
    /// * `Ok(Arc<DeviceState>)` - Attached device, no trips, reset stage `Idle`
    /// * `Err(XmgmtError::Config)` - `config` failed validation
    /// * `Err(XmgmtError::Hardware)` - The clock wizard could not be read
    pub fn attach(
        board: Arc<dyn Board>,
        config: DeviceConfig,
    ) -> Result<Arc<DeviceState>, XmgmtError> {
        config.validate()?;
        let clocks = board.clocks().frequencies()?;
        let (events, _) = broadcast::channel(FAULT_EVENT_CAPACITY);
        info!("Attached to {} board", board.name());
        Ok(Arc::new(DeviceState {
            board,
            config,
            inner: Mutex::new(Inner {
                firewall: FirewallMonitor::new(),
                clocks,
                exclusive: None,
                reset_stage: ResetStage::Idle,
                image: ImageState::Unknown,
            }),
            cancel_requested: AtomicBool::new(false),
            events,
            epoch: Instant::now(),
            health: Mutex::new(None),
        }))
    }

    /// Start polling the board's firewall status. Replaces a previously started monitor.
    pub fn start_health_monitor(self: &Arc<Self>) -> Result<(), XmgmtError> {
        let monitor = HealthMonitor::spawn(Arc::downgrade(self), self.config.health_interval());
        let previous = self
            .health
            .lock()
            .map_err(|_| XmgmtError::Internal("couldn't lock health monitor slot".into()))?
            .replace(monitor);
        if previous.is_some() {
            warn!("Health monitor was already running, replacing it");
        }
        Ok(())
    }

    /// Stop the owned background tasks. The state itself is dropped with its last reference.
    pub async fn detach(&self) {
        let monitor = match self.health.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        info!("Detached from {} board", self.board.name());
    }

    pub fn board(&self) -> &dyn Board {
        self.board.as_ref()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Subscribe to fault events. Events emitted before subscribing are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<FaultEvent> {
        self.events.subscribe()
    }

    /// Monotonic nanoseconds since attach.
    pub(crate) fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Inner>, XmgmtError> {
        self.inner
            .lock()
            .map_err(|_| XmgmtError::Internal(String::from("couldn't lock device state")))
    }

    pub(crate) fn emit(&self, event: FaultEvent) {
        match &event {
            FaultEvent::FirewallTrip(..) => warn!("Fault event: {event}"),
            _ => error!("Fault event: {event}"),
        }
        if self.events.send(event).is_err() {
            trace!("No fault event subscribers");
        }
    }

    /// Take the exclusivity token for `operation`.
    ///
    /// `precheck` runs under the same lock, so a condition it rejects (a tripped domain,
    /// say) is linearized against the token: a rejected call never touches it.
    ///
    /// # Returns: `Result<ExclusiveGuard, XmgmtError>`
    /// * `Ok(ExclusiveGuard)` - Token held until the guard is dropped
    /// * `Err(XmgmtError::Busy)` - Another download or reset holds the token
    /// * `Err(_)` - Whatever `precheck` returned
    pub(crate) fn try_acquire<F>(
        &self,
        operation: Operation,
        precheck: F,
    ) -> Result<ExclusiveGuard<'_>, XmgmtError>
    where
        F: FnOnce(&Inner) -> Result<(), XmgmtError>,
    {
        let mut inner = self.lock()?;
        precheck(&inner)?;
        if let Some(held) = inner.exclusive {
            return Err(XmgmtError::Busy(held.to_string()));
        }
        inner.exclusive = Some(operation);
        if operation == Operation::Download {
            self.cancel_requested.store(false, Ordering::SeqCst);
        }
        trace!("Exclusivity taken for {operation}");
        Ok(ExclusiveGuard {
            state: self,
            operation,
        })
    }

    /// The operation currently holding the exclusivity token, if any.
    pub fn exclusive_holder(&self) -> Result<Option<Operation>, XmgmtError> {
        Ok(self.lock()?.exclusive)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_cancel_request(&self) -> bool {
        self.cancel_requested.swap(false, Ordering::SeqCst)
    }
}

/// Proof of holding the exclusivity token. Released on drop.
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    state: &'a DeviceState,
    operation: Operation,
}

impl ExclusiveGuard<'_> {
    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub(crate) fn belongs_to(&self, state: &DeviceState) -> bool {
        std::ptr::eq(self.state, state)
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        // The token must be released even if another holder of the lock panicked.
        let mut inner = self
            .state
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        inner.exclusive = None;
        trace!("Exclusivity released for {}", self.operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boards::simulated::SimulatedBoard;
    use googletest::prelude::*;

    fn attach() -> Arc<DeviceState> {
        DeviceState::attach(Arc::new(SimulatedBoard::new()), DeviceConfig::default())
            .expect("failed to attach to simulated board")
    }

    #[gtest]
    fn second_acquire_is_busy_until_guard_dropped() {
        let state = attach();
        let guard = state
            .try_acquire(Operation::Download, |_| Ok(()))
            .expect("first acquire should succeed");
        assert_that!(
            state.try_acquire(Operation::Reset(ResetKind::Hot), |_| Ok(())),
            err(displays_as(contains_substring("image download is in progress")))
        );
        drop(guard);
        assert_that!(state.exclusive_holder().expect("state lock poisoned"), none());
        assert_that!(
            state.try_acquire(Operation::Reset(ResetKind::Hot), |_| Ok(())),
            ok(anything())
        );
    }

    #[gtest]
    fn rejected_precheck_leaves_token_free() {
        let state = attach();
        let result = state.try_acquire(Operation::Download, |_| {
            Err(XmgmtError::Argument("nope".into()))
        });
        assert_that!(result, err(anything()));
        assert_that!(state.exclusive_holder().expect("state lock poisoned"), none());
    }

    #[gtest]
    fn acquiring_download_resets_cancel_request() {
        let state = attach();
        state.request_cancel();
        let _guard = state
            .try_acquire(Operation::Download, |_| Ok(()))
            .expect("acquire should succeed");
        assert_that!(state.take_cancel_request(), eq(false));
    }

    #[gtest]
    fn config_is_validated_on_attach() {
        let config = DeviceConfig {
            chunk_size: 0,
            ..DeviceConfig::default()
        };
        assert_that!(
            DeviceState::attach(Arc::new(SimulatedBoard::new()), config),
            err(displays_as(contains_substring("chunk_size")))
        );
    }
}
