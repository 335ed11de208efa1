//! Measurement and state publication shared by every controller variant.
//!
//! [`Telemetry`] owns the controller state and the latest measurement, both
//! observable through `watch` channels, and forwards the interesting events
//! to a [`TelemetrySink`] supplied by the surrounding component.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info};

use crate::measurement::Measurement;
use crate::model::ControllerState;

/// Receiver for controller output.
///
/// Called from background tasks; implementations must not block.
pub trait TelemetrySink: Send + Sync {
    /// A new measurement was recorded.
    fn publish(&self, measurement: &Measurement, expires_at: DateTime<Utc>);

    /// The controller entered [`ControllerState::Faulted`].
    fn faulted(&self, reason: &str);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn publish(&self, _measurement: &Measurement, _expires_at: DateTime<Utc>) {}
    fn faulted(&self, _reason: &str) {}
}

pub struct Telemetry {
    state: watch::Sender<ControllerState>,
    measurement: watch::Sender<Option<Measurement>>,
    sink: Arc<dyn TelemetrySink>,
    failures: AtomicU64,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("state", &*self.state.borrow())
            .field("failures", &self.failures())
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        let (state, _) = watch::channel(ControllerState::Disconnected);
        let (measurement, _) = watch::channel(None);
        Self {
            state,
            measurement,
            sink,
            failures: AtomicU64::new(0),
        }
    }

    // ── State ────────────────────────────────────────────────────────

    pub fn state(&self) -> ControllerState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Move to `next`. The sink hears about a fault only on the transition
    /// into [`ControllerState::Faulted`], not on repeated faults.
    pub fn set_state(&self, next: ControllerState) {
        let previous = self.state.send_replace(next.clone());
        if previous == next {
            return;
        }
        info!(from = %previous, to = %next, "controller state changed");
        if let ControllerState::Faulted { reason } = &next {
            if !previous.is_faulted() {
                error!(%reason, "controller faulted");
                self.sink.faulted(reason);
            }
        }
    }

    pub fn fault(&self, reason: impl Into<String>) {
        self.set_state(ControllerState::Faulted {
            reason: reason.into(),
        });
    }

    // ── Measurements ─────────────────────────────────────────────────

    /// Store `measurement` as the latest one and hand it to the sink.
    pub fn record(&self, measurement: Measurement) {
        let expires_at = measurement.expires_at();
        self.sink.publish(&measurement, expires_at);
        self.measurement.send_replace(Some(measurement));
    }

    /// Drop the latest measurement and count a failed cycle.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.measurement.send_replace(None);
    }

    pub fn clear(&self) {
        self.measurement.send_replace(None);
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Latest measurement, fresh or not.
    pub fn latest(&self) -> Option<Measurement> {
        self.measurement.borrow().clone()
    }

    /// Latest measurement, if it has not expired at `now`.
    pub fn current_at(&self, now: DateTime<Utc>) -> Option<Measurement> {
        self.measurement
            .borrow()
            .as_ref()
            .filter(|m| m.is_current_at(now))
            .cloned()
    }

    pub fn current(&self) -> Option<Measurement> {
        self.current_at(Utc::now())
    }

    pub fn subscribe_measurements(&self) -> watch::Receiver<Option<Measurement>> {
        self.measurement.subscribe()
    }
}
