//! Periodic status polling for an Astelco DIMM.
//!
//! Each tick first sweeps the command table, so stale commands are failed
//! even when nothing new is issued. It then sends one combined status `GET`
//! unless the previous cycle is still outstanding, and fetches the seeing
//! values only when the device reports a measurement newer than the last
//! one recorded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dimm_api::{CommandReply, Reply, Session};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::measurement::{Measurement, SeeingDetails, timestamp_from_unix};
use crate::model::{AmebaMode, AmebaState, DimmStatus, ScopeMotionState};
use crate::telemetry::Telemetry;

/// Variables read on every tick.
pub const STATUS_VARIABLES: &[&str] = &[
    "AMEBA.MODE",
    "AMEBA.STATE",
    "SCOPE.MOTION_STATE",
    "SCOPE.RA",
    "SCOPE.DEC",
    "SCOPE.ALT",
    "SCOPE.AZ",
    "DIMM.TIMESTAMP",
];

/// Variables read when a new measurement is available.
pub const MEASUREMENT_VARIABLES: &[&str] = &[
    "DIMM.SEEING",
    "DIMM.SEEING_LOWFREQ",
    "DIMM.AIRMASS",
    "DIMM.FLUX_LEFT",
    "DIMM.FLUX_RIGHT",
    "DIMM.STREHL_LEFT",
    "DIMM.STREHL_RIGHT",
];

/// What a single [`StatusPoller::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The previous status cycle was still outstanding.
    Skipped,
    /// Status refreshed, no new measurement on the device.
    Unchanged,
    /// A new measurement was recorded.
    Recorded,
    /// The device had new data, but it was unusable or already expired.
    Discarded,
}

// ── In-flight guard ──────────────────────────────────────────────────

/// Holds the poller's single status slot; released on drop, including when
/// a tick is cancelled mid-await.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ── StatusPoller ─────────────────────────────────────────────────────

pub struct StatusPoller {
    session: Session,
    telemetry: Arc<Telemetry>,
    validity: Duration,
    in_flight: AtomicBool,
    status: watch::Sender<DimmStatus>,
    /// Device timestamp of the last measurement consumed.
    last_timestamp: Mutex<Option<f64>>,
    /// Set by `DIMM.*` events; consumed by the next tick.
    flagged: AtomicBool,
    /// Timestamp carried by the latest `DIMM.TIMESTAMP` event.
    hinted: Mutex<Option<f64>>,
    status_queries: AtomicU64,
}

impl StatusPoller {
    pub fn new(session: Session, telemetry: Arc<Telemetry>, validity: Duration) -> Self {
        let (status, _) = watch::channel(DimmStatus::default());
        Self {
            session,
            telemetry,
            validity,
            in_flight: AtomicBool::new(false),
            status,
            last_timestamp: Mutex::new(None),
            flagged: AtomicBool::new(false),
            hinted: Mutex::new(None),
            status_queries: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> DimmStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DimmStatus> {
        self.status.subscribe()
    }

    /// Status queries issued so far.
    pub fn status_queries(&self) -> u64 {
        self.status_queries.load(Ordering::Relaxed)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    // ── Tick ─────────────────────────────────────────────────────────

    /// Run one polling cycle.
    ///
    /// Errors are those of the status or measurement commands; the caller
    /// decides which of them end polling.
    pub async fn tick(&self) -> Result<TickOutcome, CoreError> {
        let swept = self.session.sweep();
        if swept > 0 {
            warn!(swept, "failed commands that outlived the command timeout");
        }

        let Some(_slot) = InFlight::acquire(&self.in_flight) else {
            debug!("status query still outstanding, skipping tick");
            return Ok(TickOutcome::Skipped);
        };

        self.status_queries.fetch_add(1, Ordering::Relaxed);
        let reply = self.session.get(STATUS_VARIABLES).await?;
        self.apply_status(&reply);

        let hinted = self.hinted.lock().take();
        let flagged = self.flagged.swap(false, Ordering::AcqRel);
        let device_ts = reply
            .float("DIMM.TIMESTAMP")
            .ok()
            .filter(|ts| *ts > 0.0)
            .or(hinted);
        let last = *self.last_timestamp.lock();
        let fresh = match (device_ts, last) {
            (Some(ts), Some(last)) => ts > last,
            (Some(_), None) => true,
            (None, _) => flagged,
        };
        if !fresh {
            return Ok(TickOutcome::Unchanged);
        }

        // A failed read leaves the measurement pending for the next tick
        let measurement = match self.fetch_measurement(device_ts).await {
            Ok(measurement) => measurement,
            Err(e) => {
                if let Some(ts) = hinted {
                    self.hinted.lock().get_or_insert(ts);
                }
                if flagged {
                    self.flagged.store(true, Ordering::Release);
                }
                return Err(e);
            }
        };
        if let Some(ts) = device_ts {
            *self.last_timestamp.lock() = Some(ts);
        }
        match measurement {
            Some(m) if m.is_current() => {
                info!(seeing = m.seeing, timestamp = %m.timestamp, "new seeing measurement");
                self.telemetry.record(m);
                Ok(TickOutcome::Recorded)
            }
            Some(m) => {
                debug!(timestamp = %m.timestamp, "measurement already expired");
                Ok(TickOutcome::Discarded)
            }
            None => Ok(TickOutcome::Discarded),
        }
    }

    fn apply_status(&self, reply: &CommandReply) {
        let mut status = DimmStatus {
            mode: reply.int("AMEBA.MODE").ok().and_then(AmebaMode::from_code),
            state: reply.int("AMEBA.STATE").ok().and_then(AmebaState::from_code),
            motion: reply
                .int("SCOPE.MOTION_STATE")
                .ok()
                .and_then(ScopeMotionState::from_code),
            ra: reply.float("SCOPE.RA").ok(),
            dec: reply.float("SCOPE.DEC").ok(),
            altitude: reply.float("SCOPE.ALT").ok(),
            azimuth: reply.float("SCOPE.AZ").ok(),
            activity: None,
            updated_at: Some(Utc::now()),
        };
        status.classify();
        self.publish_status(status);
    }

    fn publish_status(&self, status: DimmStatus) {
        let previous = self.status.send_replace(status.clone());
        if previous.activity != status.activity {
            info!(
                from = ?previous.activity,
                to = ?status.activity,
                "device activity changed"
            );
        }
    }

    /// Read the seeing values. `Ok(None)` when the device's values are
    /// unusable; that is not a new measurement.
    async fn fetch_measurement(
        &self,
        device_ts: Option<f64>,
    ) -> Result<Option<Measurement>, CoreError> {
        let reply = self.session.get(MEASUREMENT_VARIABLES).await?;

        let seeing = match reply.float("DIMM.SEEING") {
            Ok(v) if v > 0.0 => v,
            Ok(v) => {
                warn!(seeing = v, "device reported non-positive seeing");
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "no usable seeing value");
                return Ok(None);
            }
        };
        let timestamp = device_ts
            .and_then(timestamp_from_unix)
            .unwrap_or_else(Utc::now);
        let positive = |name: &str| reply.float(name).ok().filter(|v| *v > 0.0);
        let details = SeeingDetails {
            seeing_lowfreq: positive("DIMM.SEEING_LOWFREQ"),
            airmass: positive("DIMM.AIRMASS"),
            flux_left: reply.float("DIMM.FLUX_LEFT").ok(),
            flux_right: reply.float("DIMM.FLUX_RIGHT").ok(),
            strehl_left: reply.float("DIMM.STREHL_LEFT").ok(),
            strehl_right: reply.float("DIMM.STREHL_RIGHT").ok(),
            hr_num: None,
            nimg: Some(1),
        };
        Ok(Some(
            Measurement::new(seeing, timestamp, self.validity).with_details(details),
        ))
    }

    // ── Unsolicited events ───────────────────────────────────────────

    /// Digest an unsolicited line pushed by the device.
    pub fn handle_event(&self, event: &Reply) {
        let Reply::Event {
            kind,
            name,
            description,
            ..
        } = event
        else {
            return;
        };
        let value = description.as_deref().map(str::trim);

        if name == "AMEBA.STATE" {
            let state = value
                .and_then(|v| v.parse::<i64>().ok())
                .and_then(AmebaState::from_code);
            if let Some(state) = state {
                let mut status = self.status();
                status.state = Some(state);
                status.classify();
                self.publish_status(status);
            }
        } else if name.starts_with("DIMM.") {
            if name == "DIMM.TIMESTAMP" {
                if let Some(ts) = value.and_then(|v| v.parse::<f64>().ok()) {
                    *self.hinted.lock() = Some(ts);
                }
            }
            self.flagged.store(true, Ordering::Release);
        } else {
            debug!(%kind, %name, "ignoring device event");
        }
    }

    // ── Loop ─────────────────────────────────────────────────────────

    /// Tick every `every` and digest events until `cancel` fires.
    ///
    /// Returns an error only for failures that end the session; command
    /// timeouts, rejections and bad values are logged and polling goes on.
    pub async fn run(&self, every: Duration, cancel: CancellationToken) -> Result<(), CoreError> {
        let mut events = self.session.subscribe_events();
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "device events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(CoreError::ConnectionLost {
                            reason: "event stream closed".into(),
                        });
                    }
                },
                _ = interval.tick() => {
                    let outcome = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Ok(()),
                        outcome = self.tick() => outcome,
                    };
                    match outcome {
                        Ok(outcome) => debug!(?outcome, "poll tick"),
                        Err(e @ (CoreError::ConnectionLost { .. }
                            | CoreError::ConnectionFailed { .. })) => return Err(e),
                        Err(e) => warn!(error = %e, "poll tick failed"),
                    }
                }
            }
        }
    }
}
