//! `dimm status`: one status snapshot from an Astelco DIMM.

use chrono::{DateTime, Utc};
use serde::Serialize;

use dimm_core::{AstelcoController, CoreError, DeviceActivity, DimmStatus};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output::{self, FieldRow};

#[derive(Debug, Serialize)]
struct StatusView {
    controller: String,
    #[serde(flatten)]
    device: DimmStatus,
    seeing: Option<f64>,
    measured_at: Option<DateTime<Utc>>,
}

pub async fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let ctl = super::astelco_controller("status", global)?;
    ctl.start().await?;
    let result = first_status(&ctl).await;
    let measurement = ctl.telemetry().current();
    let controller = ctl.telemetry().state().to_string();
    ctl.stop().await;

    let view = StatusView {
        controller,
        device: result?,
        seeing: measurement.as_ref().map(|m| m.seeing),
        measured_at: measurement.map(|m| m.timestamp),
    };
    let color = output::should_color(global.color);
    let rows = table_rows(&view, color);
    let rendered = output::render(global.output, &view, Some(rows))?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}

/// Wait for the poller's first completed status query.
async fn first_status(ctl: &AstelcoController) -> Result<DimmStatus, CliError> {
    let poller = ctl.poller().ok_or(CoreError::NotRunning)?;
    let mut rx = poller.subscribe_status();
    let wait = ctl.settings().poll_interval + ctl.settings().command_timeout;

    let outcome = tokio::time::timeout(wait, async {
        rx.wait_for(|s| s.updated_at.is_some())
            .await
            .map(|s| (*s).clone())
    })
    .await;

    match outcome {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(_)) => Err(CoreError::NotRunning.into()),
        Err(_) => match ctl.telemetry().state() {
            dimm_core::ControllerState::Faulted { reason } => {
                Err(CliError::ConnectionLost { reason })
            }
            _ => Err(CoreError::Timeout { elapsed: wait }.into()),
        },
    }
}

fn table_rows(view: &StatusView, color: bool) -> Vec<FieldRow> {
    fn opt<T: ToString>(value: Option<T>) -> String {
        value.map_or_else(|| "-".into(), |v| v.to_string())
    }
    fn coord(value: Option<f64>) -> String {
        value.map_or_else(|| "-".into(), |v| format!("{v:.3}"))
    }

    let d = &view.device;
    let activity = match d.activity {
        Some(a) => output::paint(
            &a.to_string(),
            Some(a.is_operating()).filter(|_| a != DeviceActivity::Stalled),
            color,
        ),
        None => "-".into(),
    };
    let updated = d.updated_at.map_or_else(
        || "-".into(),
        |at| {
            let age = (Utc::now() - at).to_std().unwrap_or_default();
            let age = std::time::Duration::from_secs(age.as_secs());
            format!("{} ago", humantime::format_duration(age))
        },
    );

    vec![
        FieldRow::new("Controller", view.controller.clone()),
        FieldRow::new("Mode", opt(d.mode)),
        FieldRow::new("Sequencer", opt(d.state)),
        FieldRow::new("Telescope", opt(d.motion)),
        FieldRow::new("Activity", activity),
        FieldRow::new("RA (h)", coord(d.ra)),
        FieldRow::new("Dec (deg)", coord(d.dec)),
        FieldRow::new("Altitude (deg)", coord(d.altitude)),
        FieldRow::new("Azimuth (deg)", coord(d.azimuth)),
        FieldRow::new("Seeing (arcsec)", coord(view.seeing)),
        FieldRow::new("Updated", updated),
    ]
}
