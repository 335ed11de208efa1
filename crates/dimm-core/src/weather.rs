//! Weather forwarding.
//!
//! An Astelco DIMM refuses to open, and closes again, unless it keeps
//! receiving fresh weather. Station readings arrive with sentinel values
//! for missing data; [`WeatherReport::assignments`] turns one report into
//! the `WEATHER.*`/`SKY.*` values worth sending.

use crate::model::SkyStatus;

/// Station sentinel for "no data".
pub const MISSING: f64 = -99.0;

/// An instantaneous reading and its two-minute average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub avg2m: f64,
}

impl Reading {
    /// The average when it is positive, else the instantaneous value when it
    /// is non-negative.
    pub fn usable(self) -> Option<f64> {
        if self.avg2m > 0.0 {
            Some(self.avg2m)
        } else if self.value >= 0.0 {
            Some(self.value)
        } else {
            None
        }
    }
}

/// One batch of station data. Fields left `None` are not forwarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeatherReport {
    /// Celsius.
    pub ambient_temp: Option<f64>,
    /// Percent.
    pub humidity: Option<f64>,
    /// mbar.
    pub pressure: Option<f64>,
    /// m/s.
    pub wind_speed: Option<Reading>,
    /// Degrees clockwise from north.
    pub wind_direction: Option<Reading>,
    /// One-minute average, Celsius.
    pub dew_point: Option<f64>,
    /// One-minute precipitation sum.
    pub precipitation: Option<f64>,
    /// One-minute average snow depth.
    pub snow_depth: Option<f64>,
    pub sky_temp: Option<f64>,
    pub sky_status: Option<SkyStatus>,
}

/// Rain and snow are reported separately but share one device flag, so the
/// last known state of each has to be remembered between reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Precipitation {
    pub rain: bool,
    pub snow: bool,
}

fn present(v: f64) -> bool {
    v.is_finite() && v > MISSING
}

impl WeatherReport {
    /// Variable assignments for one `SET`, updating `memory` with any rain or
    /// snow information in this report.
    pub fn assignments(&self, memory: &mut Precipitation) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        let mut push = |name: &'static str, value: f64| out.push((name, value.to_string()));

        if let Some(v) = self.ambient_temp.filter(|v| v.is_finite()) {
            push("WEATHER.TEMP_AMB", v);
        }
        if let Some(v) = self.humidity.filter(|v| v.is_finite()) {
            push("WEATHER.RH", v);
        }
        if let Some(v) = self.pressure.filter(|v| v.is_finite()) {
            push("WEATHER.PRESSURE", v);
        }
        if let Some(v) = self.wind_speed.and_then(Reading::usable) {
            push("WEATHER.WIND", v);
        }
        if let Some(v) = self.wind_direction.and_then(Reading::usable) {
            push("WEATHER.WIND_DIR", v);
        }
        if let Some(v) = self.dew_point.filter(|v| present(*v)) {
            push("WEATHER.TEMP_DEW", v);
        }
        if let Some(v) = self.sky_temp.filter(|v| v.is_finite()) {
            push("SKY.TEMP", v);
        }

        let mut rain_changed = false;
        if let Some(v) = self.precipitation.filter(|v| present(*v)) {
            memory.rain = v > 0.0;
            rain_changed = true;
        }
        if let Some(v) = self.snow_depth.filter(|v| present(*v)) {
            memory.snow = v > 0.0;
            rain_changed = true;
        }
        if rain_changed {
            let wet = i64::from(memory.rain || memory.snow);
            out.push(("WEATHER.RAIN", wet.to_string()));
        }
        if let Some(status) = self.sky_status {
            out.push(("SKY.STATUS", status.code().to_string()));
        }
        out
    }
}
