// ── Astelco DIMM controller ──
//
// Owns one OpenTPL session to the instrument, a status poller driving it,
// and a watcher on the link. Background tasks never return errors to the
// caller: any failure ends in `ControllerState::Faulted` and the sink is
// told. Reconnecting is the owner's decision (`DimmController::recover`).

use std::sync::Arc;
use std::time::Duration;

use dimm_api::{DataValue, LinkState, Session};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AstelcoSettings;
use crate::error::CoreError;
use crate::model::{AmebaMode, ControllerState, DimmStatus};
use crate::poller::StatusPoller;
use crate::telemetry::{Telemetry, TelemetrySink};
use crate::weather::{Precipitation, WeatherReport};

#[derive(Clone)]
pub struct AstelcoController {
    inner: Arc<AstelcoInner>,
}

struct AstelcoInner {
    settings: AstelcoSettings,
    validity: Duration,
    telemetry: Arc<Telemetry>,
    /// Serializes `start` and `stop`.
    lifecycle: tokio::sync::Mutex<()>,
    active: Mutex<Option<Active>>,
    precipitation: Mutex<Precipitation>,
}

/// Everything acquired by one successful `start`.
struct Active {
    session: Session,
    poller: Arc<StatusPoller>,
    cancel: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl AstelcoController {
    /// Fails when the poll interval does not exceed the command timeout.
    pub fn new(
        settings: AstelcoSettings,
        validity: Duration,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<Self, CoreError> {
        if settings.poll_interval <= settings.command_timeout {
            return Err(CoreError::Config {
                message: format!(
                    "poll interval ({:?}) must be longer than the command timeout ({:?})",
                    settings.poll_interval, settings.command_timeout
                ),
            });
        }
        Ok(Self {
            inner: Arc::new(AstelcoInner {
                settings,
                validity,
                telemetry: Arc::new(Telemetry::new(sink)),
                lifecycle: tokio::sync::Mutex::new(()),
                active: Mutex::new(None),
                precipitation: Mutex::new(Precipitation::default()),
            }),
        })
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.inner.telemetry
    }

    pub fn settings(&self) -> &AstelcoSettings {
        &self.inner.settings
    }

    /// The open session, while running.
    pub fn session(&self) -> Option<Session> {
        self.inner.active.lock().as_ref().map(|a| a.session.clone())
    }

    pub fn poller(&self) -> Option<Arc<StatusPoller>> {
        self.inner.active.lock().as_ref().map(|a| Arc::clone(&a.poller))
    }

    /// Last status read from the instrument; empty when not running.
    pub fn status(&self) -> DimmStatus {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|a| a.poller.status())
            .unwrap_or_default()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect, authenticate and begin polling.
    ///
    /// A no-op while running. A faulted controller is torn down and
    /// reconnected. Connection failures are returned and also leave the
    /// controller `Faulted`.
    pub async fn start(&self) -> Result<(), CoreError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let telemetry = &self.inner.telemetry;
        if self.inner.active.lock().is_some() {
            if !telemetry.state().is_faulted() {
                return Ok(());
            }
            self.teardown().await;
        }

        telemetry.set_state(ControllerState::Connecting);
        let settings = &self.inner.settings;
        let session = match Session::connect(&settings.to_session_config()).await {
            Ok(session) => session,
            Err(e) => {
                let err = CoreError::from(e);
                telemetry.fault(err.to_string());
                return Err(err);
            }
        };
        info!(peer = session.peer(), "connected to DIMM");

        let poller = Arc::new(StatusPoller::new(
            session.clone(),
            Arc::clone(telemetry),
            self.inner.validity,
        ));
        let cancel = CancellationToken::new();
        telemetry.set_state(ControllerState::Running);

        let poll_task = {
            let poller = Arc::clone(&poller);
            let telemetry = Arc::clone(telemetry);
            let cancel = cancel.clone();
            let every = settings.poll_interval;
            tokio::spawn(async move {
                if let Err(e) = poller.run(every, cancel).await {
                    telemetry.fault(e.to_string());
                }
            })
        };

        let link_task = {
            let mut link = session.subscribe_link();
            let telemetry = Arc::clone(telemetry);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let lost = tokio::select! {
                    biased;
                    () = cancel.cancelled() => false,
                    res = link.wait_for(|s| *s == LinkState::Lost) => res.is_ok(),
                };
                if lost {
                    telemetry.fault("connection to DIMM lost");
                }
            })
        };

        *self.inner.active.lock() = Some(Active {
            session,
            poller,
            cancel,
            task_handles: vec![poll_task, link_task],
        });
        Ok(())
    }

    /// Close the session and join every background task.
    pub async fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.teardown().await;
        self.inner.telemetry.set_state(ControllerState::Disconnected);
    }

    async fn teardown(&self) {
        let active = self.inner.active.lock().take();
        let Some(active) = active else {
            return;
        };
        active.cancel.cancel();
        if active.session.close().await {
            debug!("DIMM session closed");
        }
        for handle in active.task_handles {
            let _ = handle.await;
        }
    }

    // ── Device commands ──────────────────────────────────────────────

    /// Forward station weather to the instrument in one `SET`.
    ///
    /// Returns how many values the device accepted. Values it refuses are
    /// logged and do not fail the call.
    pub async fn send_weather(&self, report: &WeatherReport) -> Result<usize, CoreError> {
        let session = self.session().ok_or(CoreError::NotRunning)?;
        let assignments = report.assignments(&mut self.inner.precipitation.lock());
        if assignments.is_empty() {
            return Ok(0);
        }

        let reply = session.set(&assignments).await?;
        let mut accepted = 0;
        for (name, value) in &reply.data {
            if let DataValue::Error(reason) = value {
                warn!(%name, %reason, "device refused weather value");
            } else {
                accepted += 1;
            }
        }
        debug!(accepted, sent = assignments.len(), "weather forwarded");
        Ok(accepted)
    }

    pub async fn set_ameba_mode(&self, mode: AmebaMode) -> Result<(), CoreError> {
        let session = self.session().ok_or(CoreError::NotRunning)?;
        let reply = session
            .set(&[("AMEBA.MODE", mode.code().to_string())])
            .await?;
        if let Some(DataValue::Error(reason)) = reply.data.get("AMEBA.MODE") {
            return Err(CoreError::DataQuality {
                name: "AMEBA.MODE".into(),
                reason: reason.clone(),
            });
        }
        info!(%mode, "AMEBA mode set");
        Ok(())
    }
}
