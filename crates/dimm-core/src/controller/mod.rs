// ── Controller variants ──
//
// One enum over the three ways of obtaining seeing values. The variant is
// picked from configuration once and never changes for the life of a run.

pub mod astelco;
pub mod sim;
pub mod soar;

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::{ControllerKind, DimmConfig};
use crate::error::CoreError;
use crate::measurement::Measurement;
use crate::model::{ControllerState, DimmStatus};
use crate::telemetry::{Telemetry, TelemetrySink};

use self::astelco::AstelcoController;
use self::sim::SimController;
use self::soar::SoarController;

/// The active controller.
#[derive(Clone)]
pub enum DimmController {
    Sim(SimController),
    Astelco(AstelcoController),
    Soar(SoarController),
}

impl DimmController {
    /// Build the variant named by `config.controller`. Does not start it.
    pub fn from_config(
        config: &DimmConfig,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self, CoreError> {
        let validity = config.measurement_validity;
        Ok(match config.controller {
            ControllerKind::Sim => Self::Sim(SimController::new(config.sim.clone(), validity, sink)),
            ControllerKind::Astelco => Self::Astelco(AstelcoController::new(
                config.astelco.clone(),
                validity,
                sink,
            )?),
            ControllerKind::Soar => {
                Self::Soar(SoarController::from_settings(&config.soar, validity, sink))
            }
        })
    }

    pub fn kind(&self) -> ControllerKind {
        match self {
            Self::Sim(_) => ControllerKind::Sim,
            Self::Astelco(_) => ControllerKind::Astelco,
            Self::Soar(_) => ControllerKind::Soar,
        }
    }

    fn telemetry(&self) -> &Arc<Telemetry> {
        match self {
            Self::Sim(c) => c.telemetry(),
            Self::Astelco(c) => c.telemetry(),
            Self::Soar(c) => c.telemetry(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Begin producing measurements. Starting a running controller is a
    /// no-op.
    pub async fn start(&self) -> Result<(), CoreError> {
        match self {
            Self::Sim(c) => {
                c.start().await;
                Ok(())
            }
            Self::Astelco(c) => c.start().await,
            Self::Soar(c) => {
                c.start().await;
                Ok(())
            }
        }
    }

    /// Stop and release everything `start` acquired.
    pub async fn stop(&self) {
        match self {
            Self::Sim(c) => c.stop().await,
            Self::Astelco(c) => c.stop().await,
            Self::Soar(c) => c.stop().await,
        }
    }

    /// Tear down and start again, typically after a fault.
    pub async fn recover(&self) -> Result<(), CoreError> {
        self.stop().await;
        self.start().await
    }

    // ── Observation ──────────────────────────────────────────────────

    /// The latest measurement, only while it is still current.
    pub fn get_measurement(&self) -> Option<Measurement> {
        self.telemetry().current()
    }

    pub fn state(&self) -> ControllerState {
        self.telemetry().state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.telemetry().subscribe_state()
    }

    pub fn subscribe_measurements(&self) -> watch::Receiver<Option<Measurement>> {
        self.telemetry().subscribe_measurements()
    }

    pub fn status(&self) -> DimmStatus {
        match self {
            Self::Sim(c) => c.status(),
            Self::Astelco(c) => c.status(),
            Self::Soar(_) => DimmStatus::default(),
        }
    }

    /// Cycles that ended without a usable measurement.
    pub fn failures(&self) -> u64 {
        self.telemetry().failures()
    }
}
