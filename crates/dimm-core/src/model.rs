// ── Domain model ──
//
// Device status codes as the Astelco controller reports them, the activity
// derived from them, and the controller lifecycle state.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Generates the wire-code conversions for a `#[repr(i64)]` status enum.
macro_rules! device_codes {
    ($($ty:ident),+ $(,)?) => {$(
        impl $ty {
            /// Numeric code used on the wire.
            #[allow(clippy::as_conversions)]
            pub const fn code(self) -> i64 {
                self as i64
            }

            pub fn from_code(code: i64) -> Option<Self> {
                Self::from_repr(code)
            }
        }
    )+};
}

// ── Device codes ─────────────────────────────────────────────────────

/// `AMEBA.MODE`: who is driving the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::FromRepr, strum::EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i64)]
pub enum AmebaMode {
    Off = 0,
    Auto = 1,
    Manual = 2,
}

/// `AMEBA.STATE`: what the automatic sequencer is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::FromRepr, strum::EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i64)]
pub enum AmebaState {
    Inactive = 0,
    Waiting = 1,
    Slewing = 2,
    Tracking = 3,
    Focusing = 4,
    Monitoring = 5,
}

/// `SCOPE.MOTION_STATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::FromRepr, strum::EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i64)]
pub enum ScopeMotionState {
    Error = -2,
    Parked = -1,
    Stopped = 0,
    Slewing = 1,
    Tracking = 2,
}

/// `SCOPE.POWER_STATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::FromRepr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i64)]
pub enum PowerState {
    Parked = 0,
    PoweredUp = 1,
}

/// `WEATHER.RAIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::FromRepr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i64)]
pub enum RainState {
    Dry = 0,
    Precipitation = 1,
}

/// `SKY.STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::FromRepr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i64)]
pub enum SkyStatus {
    Clear = 0,
    LightlyCloudy = 1,
    Cloudy = 2,
    Precipitating = 3,
}

/// Answer to a `!TYPE` property query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::FromRepr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(i64)]
pub enum VariableType {
    Null = 0,
    Int = 1,
    Float = 2,
    String = 3,
}

device_codes!(
    AmebaMode,
    AmebaState,
    ScopeMotionState,
    PowerState,
    RainState,
    SkyStatus,
    VariableType,
);

// ── Activity classification ──────────────────────────────────────────

/// What the instrument is doing, derived from mode, sequencer state and
/// telescope motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceActivity {
    /// Telescope reports a motion error. Overrides everything else.
    Fault,
    /// Sequencer switched off.
    Disabled,
    /// Operator in control.
    Manual,
    /// Automatic, inactive and parked.
    Parked,
    /// Automatic and inactive but not parked.
    Idle,
    /// Automatic, waiting for conditions to allow opening.
    Waiting,
    Slewing,
    /// Tracking or focusing on a target before monitoring starts.
    Acquiring,
    /// Monitoring while the telescope tracks: seeing values are flowing.
    Measuring,
    /// Sequencer claims to monitor but the telescope is not tracking.
    Stalled,
}

impl DeviceActivity {
    pub fn classify(mode: AmebaMode, state: AmebaState, motion: ScopeMotionState) -> Self {
        match (mode, state, motion) {
            (_, _, ScopeMotionState::Error) => Self::Fault,
            (AmebaMode::Off, _, _) => Self::Disabled,
            (AmebaMode::Manual, _, _) => Self::Manual,
            (AmebaMode::Auto, AmebaState::Inactive, ScopeMotionState::Parked) => Self::Parked,
            (AmebaMode::Auto, AmebaState::Inactive, _) => Self::Idle,
            (AmebaMode::Auto, AmebaState::Waiting, _) => Self::Waiting,
            (AmebaMode::Auto, AmebaState::Slewing, _) => Self::Slewing,
            (AmebaMode::Auto, AmebaState::Tracking | AmebaState::Focusing, _) => Self::Acquiring,
            (AmebaMode::Auto, AmebaState::Monitoring, ScopeMotionState::Tracking) => {
                Self::Measuring
            }
            (AmebaMode::Auto, AmebaState::Monitoring, _) => Self::Stalled,
        }
    }

    /// The instrument is enabled and not in error.
    pub fn is_operating(self) -> bool {
        !matches!(self, Self::Fault | Self::Disabled)
    }
}

// ── Device status snapshot ───────────────────────────────────────────

/// Latest status reported by an Astelco device. Fields the device did not
/// report (or reported as `NULL`) are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DimmStatus {
    pub mode: Option<AmebaMode>,
    pub state: Option<AmebaState>,
    pub motion: Option<ScopeMotionState>,
    /// Hours.
    pub ra: Option<f64>,
    /// Degrees.
    pub dec: Option<f64>,
    pub altitude: Option<f64>,
    pub azimuth: Option<f64>,
    pub activity: Option<DeviceActivity>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DimmStatus {
    /// Recompute `activity` from the three status codes. Unknown when any
    /// of them is unknown.
    pub fn classify(&mut self) {
        self.activity = match (self.mode, self.state, self.motion) {
            (Some(mode), Some(state), Some(motion)) => {
                Some(DeviceActivity::classify(mode, state, motion))
            }
            _ => None,
        };
    }
}

// ── Controller lifecycle ─────────────────────────────────────────────

/// Lifecycle state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ControllerState {
    Disconnected,
    Connecting,
    Running,
    Faulted { reason: String },
}

impl ControllerState {
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted { .. })
    }
}
