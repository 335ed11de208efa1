// ── Runtime controller configuration ──
//
// These types describe *which* controller to run and how to tune it.
// They never touch disk: dimm-config resolves files and environment into a
// `DimmConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use dimm_api::SessionConfig;

/// Which controller variant to run. Chosen once at startup.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ControllerKind {
    #[default]
    Sim,
    Astelco,
    Soar,
}

/// Synthetic seeing generator parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SimSettings {
    /// Mean seeing, arcsec.
    pub avg_seeing: f64,
    pub std_seeing: f64,
    /// Probability in `[0, 1]` that an exposure fails.
    pub chance_failure: f64,
    /// Dwell time per target, minutes.
    pub min_time_in_target: f64,
    pub max_time_in_target: f64,
    /// Exposure duration, seconds.
    pub min_exposure_time: f64,
    pub max_exposure_time: f64,
    pub std_exposure_time: f64,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            avg_seeing: 0.5,
            std_seeing: 0.1,
            chance_failure: 0.0,
            min_time_in_target: 1.0,
            max_time_in_target: 5.0,
            min_exposure_time: 1.0,
            max_exposure_time: 3.0,
            std_exposure_time: 0.1,
            seed: None,
        }
    }
}

/// Connection and polling parameters for an Astelco DIMM.
#[derive(Debug, Clone)]
pub struct AstelcoSettings {
    pub host: String,
    pub port: u16,
    pub auto_auth: bool,
    pub user: String,
    pub password: SecretString,
    /// Must stay strictly above `command_timeout`.
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_pending: usize,
}

impl Default for AstelcoSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 65432,
            auto_auth: false,
            user: "admin".into(),
            password: SecretString::from("admin"),
            poll_interval: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            max_pending: 100,
        }
    }
}

impl AstelcoSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Session parameters derived from these settings.
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.host.clone(),
            port: self.port,
            auto_auth: self.auto_auth,
            user: self.user.clone(),
            password: self.password.clone(),
            connect_timeout: self.connect_timeout,
            read_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            max_pending: self.max_pending,
            ..SessionConfig::default()
        }
    }
}

/// External seeing store polling.
#[derive(Debug, Clone, PartialEq)]
pub struct SoarSettings {
    pub check_interval: Duration,
    /// JSON export to read records from. `None` starts with an empty
    /// in-memory store.
    pub source: Option<PathBuf>,
}

impl Default for SoarSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(180),
            source: None,
        }
    }
}

/// Complete runtime configuration.
///
/// Built by dimm-config or by hand in tests; immutable once a controller is
/// constructed from it.
#[derive(Debug, Clone)]
pub struct DimmConfig {
    pub controller: ControllerKind,
    /// How long a measurement stays current after it was taken.
    pub measurement_validity: Duration,
    pub sim: SimSettings,
    pub astelco: AstelcoSettings,
    pub soar: SoarSettings,
}

impl Default for DimmConfig {
    fn default() -> Self {
        Self {
            controller: ControllerKind::default(),
            measurement_validity: Duration::from_secs(60),
            sim: SimSettings::default(),
            astelco: AstelcoSettings::default(),
            soar: SoarSettings::default(),
        }
    }
}
