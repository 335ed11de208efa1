//! Validity-bounded seeing measurements.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Ancillary values reported alongside the seeing. Anything the device did
/// not report, or reported as unusable, is `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeeingDetails {
    pub seeing_lowfreq: Option<f64>,
    /// Airmass (sec z) of the observed star.
    pub airmass: Option<f64>,
    pub flux_left: Option<f64>,
    pub flux_right: Option<f64>,
    pub strehl_left: Option<f64>,
    pub strehl_right: Option<f64>,
    /// Harvard Revised catalog number of the target.
    pub hr_num: Option<i64>,
    /// Images combined into this value.
    pub nimg: Option<u32>,
}

/// One seeing value and the window in which it may be reported as current.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// FWHM seeing, arcsec.
    pub seeing: f64,
    pub timestamp: DateTime<Utc>,
    pub validity: Duration,
    pub details: SeeingDetails,
}

impl Measurement {
    pub fn new(seeing: f64, timestamp: DateTime<Utc>, validity: Duration) -> Self {
        Self {
            seeing,
            timestamp,
            validity,
            details: SeeingDetails::default(),
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: SeeingDetails) -> Self {
        self.details = details;
        self
    }

    /// `timestamp + validity`. Saturates instead of overflowing.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let validity = TimeDelta::from_std(self.validity).unwrap_or(TimeDelta::MAX);
        self.timestamp
            .checked_add_signed(validity)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Current strictly before `expires_at`; at the boundary it is expired.
    pub fn is_current_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    pub fn is_current(&self) -> bool {
        self.is_current_at(Utc::now())
    }
}

/// Convert device seconds-since-epoch into a timestamp.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions, clippy::cast_sign_loss)]
pub fn timestamp_from_unix(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    let whole = secs.trunc();
    let nanos = ((secs - whole) * 1e9).round();
    DateTime::from_timestamp(whole as i64, (nanos as u32).min(999_999_999))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn expires_validity_after_timestamp() {
        let m = Measurement::new(0.7, at(1_000), Duration::from_secs(60));
        assert_eq!(m.expires_at(), at(1_060));
    }

    #[test]
    fn current_strictly_before_expiry() {
        let m = Measurement::new(0.7, at(1_000), Duration::from_secs(60));
        assert!(m.is_current_at(at(1_000)));
        assert!(m.is_current_at(at(1_059)));
        assert!(m.is_current_at(at(1_060) - TimeDelta::nanoseconds(1)));
        assert!(!m.is_current_at(at(1_060)));
        assert!(!m.is_current_at(at(5_000)));
    }

    #[test]
    fn zero_validity_is_never_current() {
        let m = Measurement::new(0.7, at(1_000), Duration::ZERO);
        assert!(!m.is_current_at(at(1_000)));
    }

    #[test]
    fn huge_validity_saturates() {
        let m = Measurement::new(0.7, at(1_000), Duration::MAX);
        assert_eq!(m.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(m.is_current_at(at(4_000_000_000)));
    }

    #[test]
    fn unix_seconds_conversion() {
        let ts = timestamp_from_unix(1_718_000_000.5).unwrap();
        assert_eq!(ts.timestamp(), 1_718_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
        assert!(timestamp_from_unix(0.0).is_none());
        assert!(timestamp_from_unix(-3.0).is_none());
        assert!(timestamp_from_unix(f64::NAN).is_none());
    }
}
