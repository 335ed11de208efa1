//! Telemetry sink that prints one JSON object per line on stdout.

use std::io::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;

use dimm_core::{Measurement, SeeingDetails, TelemetrySink};

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Line<'a> {
    Measurement {
        seeing: f64,
        timestamp: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        details: &'a SeeingDetails,
    },
    Fault {
        reason: &'a str,
    },
}

#[derive(Debug, Default)]
pub struct JsonLineSink {
    quiet: bool,
}

impl JsonLineSink {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }

    fn emit(&self, line: &Line<'_>) {
        if self.quiet {
            return;
        }
        match serde_json::to_string(line) {
            Ok(text) => {
                let mut stdout = std::io::stdout().lock();
                let _ = writeln!(stdout, "{text}");
                let _ = stdout.flush();
            }
            Err(e) => tracing::warn!(error = %e, "could not serialize telemetry line"),
        }
    }
}

impl TelemetrySink for JsonLineSink {
    fn publish(&self, measurement: &Measurement, expires_at: DateTime<Utc>) {
        self.emit(&Line::Measurement {
            seeing: measurement.seeing,
            timestamp: measurement.timestamp,
            expires_at,
            details: &measurement.details,
        });
    }

    fn faulted(&self, reason: &str) {
        self.emit(&Line::Fault { reason });
    }
}
