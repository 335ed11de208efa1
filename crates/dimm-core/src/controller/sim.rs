//! Simulated DIMM: synthetic seeing without any device or network.
//!
//! The simulator dwells on a random target for U(min, max) minutes and
//! takes exposures of roughly `(min + max) / 2` seconds while there. Each
//! exposure either fails, with probability `chance_failure`, or yields a
//! seeing value drawn from N(`avg_seeing`, `std_seeing`) truncated to
//! positive values.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SimSettings;
use crate::measurement::{Measurement, SeeingDetails};
use crate::model::{AmebaMode, AmebaState, ControllerState, DimmStatus, ScopeMotionState};
use crate::telemetry::{Telemetry, TelemetrySink};

/// Redraws allowed before falling back to the mean.
const MAX_DRAWS: usize = 100;
/// Bright Star Catalogue size; targets are drawn from it.
const CATALOG_SIZE: i64 = 9110;

#[derive(Debug, Clone, Copy, Default)]
struct Target {
    hr_num: i64,
    ra: f64,
    dec: f64,
    altitude: f64,
    azimuth: f64,
}

#[derive(Clone)]
pub struct SimController {
    inner: Arc<SimInner>,
}

struct SimInner {
    settings: SimSettings,
    validity: Duration,
    telemetry: Arc<Telemetry>,
    rng: Mutex<StdRng>,
    target: Mutex<Option<Target>>,
    task: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SimController {
    pub fn new(settings: SimSettings, validity: Duration, sink: Arc<dyn TelemetrySink>) -> Self {
        let rng = settings
            .seed
            .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            inner: Arc::new(SimInner {
                settings,
                validity,
                telemetry: Arc::new(Telemetry::new(sink)),
                rng: Mutex::new(rng),
                target: Mutex::new(None),
                task: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.inner.telemetry
    }

    pub async fn start(&self) {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(self.clone(), cancel.clone()));
        *task = Some((cancel, handle));
        self.inner.telemetry.set_state(ControllerState::Running);
    }

    pub async fn stop(&self) {
        let task = self.inner.task.lock().await.take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            let _ = handle.await;
        }
        *self.inner.target.lock() = None;
        self.inner.telemetry.set_state(ControllerState::Disconnected);
    }

    /// Synthetic status: monitoring a target while running.
    pub fn status(&self) -> DimmStatus {
        let Some(target) = *self.inner.target.lock() else {
            return DimmStatus::default();
        };
        let mut status = DimmStatus {
            mode: Some(AmebaMode::Auto),
            state: Some(AmebaState::Monitoring),
            motion: Some(ScopeMotionState::Tracking),
            ra: Some(target.ra),
            dec: Some(target.dec),
            altitude: Some(target.altitude),
            azimuth: Some(target.azimuth),
            activity: None,
            updated_at: Some(Utc::now()),
        };
        status.classify();
        status
    }

    // ── Sampling ─────────────────────────────────────────────────────

    /// Time spent on one target.
    pub fn sample_dwell(&self) -> Duration {
        let s = &self.inner.settings;
        let (lo, hi) = ordered(s.min_time_in_target, s.max_time_in_target);
        let minutes = if hi > lo {
            self.inner.rng.lock().gen_range(lo..hi)
        } else {
            lo
        };
        Duration::from_secs_f64((minutes * 60.0).max(0.0))
    }

    /// Duration of one exposure, clamped to the configured range.
    pub fn sample_exposure(&self) -> Duration {
        let s = &self.inner.settings;
        let (lo, hi) = ordered(s.min_exposure_time, s.max_exposure_time);
        let mean = (lo + hi) / 2.0;
        let secs = Normal::new(mean, s.std_exposure_time.abs())
            .map_or(mean, |dist| dist.sample(&mut *self.inner.rng.lock()));
        Duration::from_secs_f64(secs.clamp(lo, hi).max(0.0))
    }

    fn sample_seeing(&self) -> f64 {
        let s = &self.inner.settings;
        let fallback = s.avg_seeing.abs();
        let Ok(dist) = Normal::new(s.avg_seeing, s.std_seeing.abs()) else {
            return fallback;
        };
        let mut rng = self.inner.rng.lock();
        std::iter::repeat_with(|| dist.sample(&mut *rng))
            .take(MAX_DRAWS)
            .find(|v| *v > 0.0)
            .unwrap_or(fallback)
    }

    fn next_target(&self) -> Target {
        let mut rng = self.inner.rng.lock();
        Target {
            hr_num: rng.gen_range(1..=CATALOG_SIZE),
            ra: rng.gen_range(0.0..24.0),
            dec: rng.gen_range(-90.0..30.0),
            altitude: rng.gen_range(30.0..90.0),
            azimuth: rng.gen_range(0.0..360.0),
        }
    }

    /// Finish one exposure: record a measurement, or count a failure.
    pub fn expose(&self) -> Option<Measurement> {
        let chance = self.inner.settings.chance_failure.clamp(0.0, 1.0);
        if self.inner.rng.lock().gen_bool(chance) {
            debug!("simulated exposure failed");
            self.inner.telemetry.record_failure();
            return None;
        }

        let target = self.inner.target.lock().unwrap_or_default();
        let seeing = self.sample_seeing();
        let airmass = 1.0 / target.altitude.to_radians().sin().max(0.05);
        let measurement = Measurement::new(seeing, Utc::now(), self.inner.validity).with_details(
            SeeingDetails {
                seeing_lowfreq: Some(seeing),
                airmass: Some(airmass),
                hr_num: Some(target.hr_num),
                nimg: Some(1),
                ..SeeingDetails::default()
            },
        );
        self.inner.telemetry.record(measurement.clone());
        Some(measurement)
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b { (a, b) } else { (b, a) }
}

// ── Background task ──────────────────────────────────────────────────

async fn run(sim: SimController, cancel: CancellationToken) {
    info!("simulated DIMM started");
    loop {
        let target = sim.next_target();
        *sim.inner.target.lock() = Some(target);
        let leave_at = Instant::now() + sim.sample_dwell();
        debug!(hr_num = target.hr_num, "simulated DIMM on new target");

        while Instant::now() < leave_at {
            let exposure = sim.sample_exposure();
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("simulated DIMM stopped");
                    return;
                }
                () = tokio::time::sleep(exposure) => {}
            }
            sim.expose();
        }
    }
}
