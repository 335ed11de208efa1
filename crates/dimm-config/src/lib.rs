//! Configuration for the DIMM controller.
//!
//! Layered with figment: built-in defaults, then a TOML file, then `DIMM_`
//! environment variables (`__` separates sections, so
//! `DIMM_ASTELCO__PORT=6000` sets `astelco.port`). [`Settings::validate`]
//! enforces the documented bounds and [`Settings::into_dimm_config`]
//! produces the runtime `dimm_core::DimmConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dimm_core::{AstelcoSettings, ControllerKind, DimmConfig, SimSettings, SoarSettings};

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "DIMM_";
/// Password fallback when `astelco.password_env` is unset or empty.
pub const PASSWORD_ENV: &str = "DIMM_PASSWORD";

const REDACTED: &str = "********";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// `sim`, `astelco` or `soar`.
    pub controller: ControllerKind,

    /// Seconds a measurement stays current.
    pub measurement_validity_secs: u64,

    pub sim: SimSection,
    pub astelco: AstelcoSection,
    pub soar: SoarSection,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            controller: ControllerKind::Sim,
            measurement_validity_secs: 60,
            sim: SimSection::default(),
            astelco: AstelcoSection::default(),
            soar: SoarSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimSection {
    pub avg_seeing: f64,
    pub std_seeing: f64,
    pub chance_failure: f64,
    /// Minutes.
    pub min_time_in_target: f64,
    pub max_time_in_target: f64,
    /// Seconds.
    pub min_exposure_time: f64,
    pub max_exposure_time: f64,
    pub std_exposure_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SimSection {
    fn default() -> Self {
        let d = SimSettings::default();
        Self {
            avg_seeing: d.avg_seeing,
            std_seeing: d.std_seeing,
            chance_failure: d.chance_failure,
            min_time_in_target: d.min_time_in_target,
            max_time_in_target: d.max_time_in_target,
            min_exposure_time: d.min_exposure_time,
            max_exposure_time: d.max_exposure_time,
            std_exposure_time: d.std_exposure_time,
            seed: d.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AstelcoSection {
    pub host: String,
    pub port: u16,
    /// The device authenticates the link itself.
    pub auto_auth: bool,
    pub user: String,

    /// Plaintext password (prefer `password_env` or `DIMM_PASSWORD`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Environment variable holding the password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    pub poll_interval_secs: u64,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_pending: usize,
}

impl Default for AstelcoSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 65432,
            auto_auth: false,
            user: "admin".into(),
            password: Some("admin".into()),
            password_env: None,
            poll_interval_secs: 10,
            command_timeout_secs: 5,
            connect_timeout_secs: 10,
            max_pending: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SoarSection {
    pub check_interval_secs: u64,
    /// JSON export of the seeing table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl Default for SoarSection {
    fn default() -> Self {
        Self {
            check_interval_secs: 180,
            source: None,
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "dimm", "dimm").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("dimm");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Loading ─────────────────────────────────────────────────────────

/// The layered provider. An explicit `path` must exist; the default
/// location is optional.
pub fn figment(path: Option<&Path>) -> Result<Figment, ConfigError> {
    let file = match path {
        Some(path) if !path.exists() => {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Some(path) => path.to_path_buf(),
        None => config_path(),
    };

    Ok(Figment::new()
        .merge(Serialized::defaults(Settings::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).split("__")))
}

/// Load and validate.
pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let settings: Settings = figment(path)?.extract()?;
    settings.validate()?;
    Ok(settings)
}

// ── Validation ──────────────────────────────────────────────────────

fn check_range(field: &str, value: f64, lo: f64, hi: f64) -> Result<(), ConfigError> {
    if (lo..=hi).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} is outside [{lo}, {hi}]")))
    }
}

fn check_positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} must be greater than zero")))
    }
}

impl Settings {
    /// Enforce the documented bounds. Reports the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.measurement_validity_secs == 0 {
            return Err(invalid("measurement_validity_secs", "must be greater than zero"));
        }

        let sim = &self.sim;
        check_positive("sim.avg_seeing", sim.avg_seeing)?;
        check_positive("sim.std_seeing", sim.std_seeing)?;
        check_range("sim.chance_failure", sim.chance_failure, 0.0, 1.0)?;
        check_range("sim.min_time_in_target", sim.min_time_in_target, 1.0, 5.0)?;
        check_range("sim.max_time_in_target", sim.max_time_in_target, 5.0, 8.0)?;
        check_range("sim.min_exposure_time", sim.min_exposure_time, 0.05, 2.0)?;
        check_range("sim.max_exposure_time", sim.max_exposure_time, 3.0, 5.0)?;
        check_range("sim.std_exposure_time", sim.std_exposure_time, 0.1, 0.5)?;

        let a = &self.astelco;
        if a.host.trim().is_empty() {
            return Err(invalid("astelco.host", "must not be empty"));
        }
        if a.port == 0 {
            return Err(invalid("astelco.port", "must be between 1 and 65535"));
        }
        for (field, value) in [
            ("astelco.command_timeout_secs", a.command_timeout_secs),
            ("astelco.connect_timeout_secs", a.connect_timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if a.poll_interval_secs <= a.command_timeout_secs {
            return Err(invalid(
                "astelco.poll_interval_secs",
                format!(
                    "{}s must be longer than command_timeout_secs ({}s)",
                    a.poll_interval_secs, a.command_timeout_secs
                ),
            ));
        }
        if a.max_pending == 0 {
            return Err(invalid("astelco.max_pending", "must be at least 1"));
        }

        if self.soar.check_interval_secs == 0 {
            return Err(invalid("soar.check_interval_secs", "must be greater than zero"));
        }
        Ok(())
    }

    // ── Translation ──────────────────────────────────────────────────

    /// Password from, in order: the variable named by `password_env`,
    /// `DIMM_PASSWORD`, the plaintext `password`.
    pub fn resolve_password(&self) -> Result<SecretString, ConfigError> {
        let a = &self.astelco;
        if let Some(name) = a.password_env.as_deref().filter(|n| !n.is_empty()) {
            if let Ok(value) = std::env::var(name) {
                return Ok(SecretString::from(value));
            }
        }
        if let Ok(value) = std::env::var(PASSWORD_ENV) {
            return Ok(SecretString::from(value));
        }
        if let Some(value) = &a.password {
            return Ok(SecretString::from(value.clone()));
        }
        if a.auto_auth {
            return Ok(SecretString::from(String::new()));
        }
        Err(invalid(
            "astelco.password",
            format!("no password configured; set astelco.password_env or {PASSWORD_ENV}"),
        ))
    }

    /// Validate and build the runtime configuration.
    pub fn into_dimm_config(&self) -> Result<DimmConfig, ConfigError> {
        self.validate()?;
        let sim = &self.sim;
        let a = &self.astelco;
        let password = if self.controller == ControllerKind::Astelco {
            self.resolve_password()?
        } else {
            self.resolve_password()
                .unwrap_or_else(|_| SecretString::from(String::new()))
        };

        Ok(DimmConfig {
            controller: self.controller,
            measurement_validity: Duration::from_secs(self.measurement_validity_secs),
            sim: SimSettings {
                avg_seeing: sim.avg_seeing,
                std_seeing: sim.std_seeing,
                chance_failure: sim.chance_failure,
                min_time_in_target: sim.min_time_in_target,
                max_time_in_target: sim.max_time_in_target,
                min_exposure_time: sim.min_exposure_time,
                max_exposure_time: sim.max_exposure_time,
                std_exposure_time: sim.std_exposure_time,
                seed: sim.seed,
            },
            astelco: AstelcoSettings {
                host: a.host.clone(),
                port: a.port,
                auto_auth: a.auto_auth,
                user: a.user.clone(),
                password,
                poll_interval: Duration::from_secs(a.poll_interval_secs),
                command_timeout: Duration::from_secs(a.command_timeout_secs),
                connect_timeout: Duration::from_secs(a.connect_timeout_secs),
                max_pending: a.max_pending,
            },
            soar: SoarSettings {
                check_interval: Duration::from_secs(self.soar.check_interval_secs),
                source: self.soar.source.clone(),
            },
        })
    }

    /// Copy safe to print: any plaintext password is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.astelco.password.is_some() {
            copy.astelco.password = Some(REDACTED.into());
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
