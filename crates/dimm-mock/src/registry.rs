// ── Variable registry ──
//
// Flat map of dotted, upper-case variable names to typed values. Names are
// grouped by their first segment into modules; only the modules listed in
// `MODULES` are reachable through GET/SET.

use std::fmt;

use indexmap::IndexMap;
use thiserror::Error;

const MODULES: &[&str] = &["AMEBA", "DIMM", "SCOPE", "METEO", "WEATHER", "SKY"];

// Startup limits for automatic operation.
pub const MAX_HUMIDITY: f64 = 97.0;
pub const MAX_WIND: f64 = 9.0;
pub const MAX_SKY_TEMP: f64 = -20.0;

pub const MODE_AUTO: i64 = 1;

pub mod code {
    pub const AMEBA_INACTIVE: i64 = 0;
    pub const AMEBA_SLEWING: i64 = 2;
    pub const AMEBA_MONITORING: i64 = 5;

    pub const SCOPE_PARKED: i64 = -1;
    pub const SCOPE_SLEWING: i64 = 1;
    pub const SCOPE_TRACKING: i64 = 2;

    pub const POWER_PARKED: i64 = 0;
    pub const POWER_UP: i64 = 1;

    pub const RAIN_DRY: i64 = 0;
    pub const SKY_CLEAR: i64 = 0;
}

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VariableError {
    #[error("{0} not a valid module name")]
    NoSuchModule(String),

    #[error("field {0} does not exist")]
    NoSuchVariable(String),

    #[error("field {0} is read-only")]
    ReadOnly(String),

    #[error("cannot parse {raw:?} for {name}: {reason}")]
    BadValue {
        name: String,
        raw: String,
        reason: String,
    },
}

// ── Values ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// OpenTPL `!TYPE` code: 1 int, 2 float, 3 string.
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Int(_) => 1,
            Self::Float(_) => 2,
            Self::Text(_) => 3,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => i32::try_from(*v).ok().map(f64::from),
            Self::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(_) | Self::Text(_) => None,
        }
    }

    /// Parse `raw` as a value of the same type as `self`.
    fn parse_like(&self, name: &str, raw: &str) -> Result<Self, VariableError> {
        let bad = |reason: &str| VariableError::BadValue {
            name: name.to_owned(),
            raw: raw.to_owned(),
            reason: reason.to_owned(),
        };
        match self {
            Self::Int(_) => raw
                .parse()
                .map(Self::Int)
                .map_err(|_| bad("expected an integer")),
            Self::Float(_) => raw
                .parse()
                .map(Self::Float)
                .map_err(|_| bad("expected a number")),
            Self::Text(_) => raw
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .map(|s| Self::Text(s.to_owned()))
                .ok_or_else(|| bad("strings must be enclosed in double quotes")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "\"{v}\""),
        }
    }
}

#[derive(Debug, Clone)]
struct Variable {
    value: Value,
    settable: bool,
}

// ── Registry ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Registry {
    vars: IndexMap<String, Variable>,
}

impl Registry {
    /// Device state at power-up: automatic mode selected, weather and sky
    /// values that forbid opening.
    pub fn new() -> Self {
        let mut r = Self {
            vars: IndexMap::new(),
        };
        let version = Value::Int(0x0001_0100);

        // AMEBA
        r.define("AMEBA.VERSION", version.clone(), false);
        r.define("AMEBA.MODE", Value::Int(MODE_AUTO), true);
        r.define("AMEBA.STATE", Value::Int(code::AMEBA_INACTIVE), false);
        r.define("AMEBA.SUN_ALT_CONDITION", Value::Float(0.0), false);
        r.define("AMEBA.START_TIME", Value::Float(0.0), false);
        r.define("AMEBA.FINISH_TIME", Value::Float(0.0), false);
        for prefix in ["AMEBA.MANUAL", "AMEBA.CURRENT"] {
            let settable = prefix == "AMEBA.MANUAL";
            r.define(&format!("{prefix}.NAME"), Value::Text(String::new()), settable);
            for field in ["RA", "DEC", "BRIGHTNESS", "COLOR"] {
                r.define(&format!("{prefix}.{field}"), Value::Float(0.0), settable);
            }
        }
        r.define("AMEBA.MANUAL.STELLAR_CLASS", Value::Text("G5III".into()), true);
        r.define("AMEBA.CURRENT.START_TIME", Value::Float(0.0), false);

        // DIMM
        r.define("DIMM.VERSION", version.clone(), false);
        for field in [
            "SEEING",
            "SEEING_LOWFREQ",
            "FLUX_LEFT",
            "FLUX_RIGHT",
            "FLUX_RMS_LEFT",
            "FLUX_RMS_RIGHT",
            "AIRMASS",
            "STREHL_LEFT",
            "STREHL_RIGHT",
            "TIMESTAMP",
        ] {
            r.define(&format!("DIMM.{field}"), Value::Float(0.0), false);
        }

        // SCOPE
        r.define("SCOPE.VERSION", version.clone(), false);
        for field in ["RA", "DEC", "AZ", "ALT"] {
            r.define(&format!("SCOPE.{field}"), Value::Float(0.0), false);
        }
        r.define("SCOPE.FOCUS", Value::Int(0), false);
        r.define("SCOPE.MOTION_STATE", Value::Int(code::SCOPE_PARKED), false);
        r.define("SCOPE.POWER_STATE", Value::Int(code::POWER_PARKED), false);
        r.define("SCOPE.STATUS.LIST", Value::Text(String::new()), false);

        // METEO
        r.define("METEO.VERSION", version, false);

        // WEATHER
        r.define("WEATHER.TEMP_AMB", Value::Float(0.0), true);
        r.define("WEATHER.WIND", Value::Float(MAX_WIND * 1.1), true);
        r.define("WEATHER.WIND_DIR", Value::Float(0.0), true);
        r.define("WEATHER.RH", Value::Float(100.0), true);
        r.define("WEATHER.TEMP_DEW", Value::Float(0.0), true);
        r.define("WEATHER.PRESSURE", Value::Float(0.0), true);
        r.define("WEATHER.RAIN", Value::Int(1), true);

        // SKY
        r.define("SKY.STATUS", Value::Int(3), true);
        r.define("SKY.TEMP", Value::Float(MAX_SKY_TEMP + 1.0), true);

        r
    }

    /// Weather and sky values that permit automatic operation.
    pub fn open_weather(&mut self) {
        self.put("WEATHER.WIND", Value::Float(2.0));
        self.put("WEATHER.RH", Value::Float(40.0));
        self.put("WEATHER.RAIN", Value::Int(code::RAIN_DRY));
        self.put("SKY.STATUS", Value::Int(code::SKY_CLEAR));
        self.put("SKY.TEMP", Value::Float(MAX_SKY_TEMP - 10.0));
    }

    fn define(&mut self, name: &str, value: Value, settable: bool) {
        self.vars
            .insert(name.to_owned(), Variable { value, settable });
    }

    fn lookup(&self, name: &str) -> Result<&Variable, VariableError> {
        let upper = name.to_ascii_uppercase();
        let module = upper.split('.').next().unwrap_or_default();
        if !MODULES.contains(&module) {
            return Err(VariableError::NoSuchModule(module.to_owned()));
        }
        self.vars
            .get(&upper)
            .ok_or(VariableError::NoSuchVariable(upper))
    }

    pub fn get(&self, name: &str) -> Result<&Value, VariableError> {
        self.lookup(name).map(|v| &v.value)
    }

    /// Apply a client `SET`, honoring the settable flag and the value type.
    pub fn set(&mut self, name: &str, raw: &str) -> Result<(), VariableError> {
        let upper = name.trim().to_ascii_uppercase();
        if upper == "SCOPE.STATUS.CLEAR" {
            self.put("SCOPE.STATUS.LIST", Value::Text(String::new()));
            return Ok(());
        }
        let var = self.lookup(&upper)?;
        if !var.settable {
            return Err(VariableError::ReadOnly(upper));
        }
        let value = var.value.parse_like(&upper, raw.trim())?;
        self.put(&upper, value);
        Ok(())
    }

    /// Internal write that bypasses the settable flag.
    pub fn put(&mut self, name: &str, value: Value) {
        if let Some(var) = self.vars.get_mut(name) {
            var.value = value;
        }
    }

    fn float(&self, name: &str) -> f64 {
        self.vars
            .get(name)
            .and_then(|v| v.value.as_f64())
            .unwrap_or(f64::NAN)
    }

    fn int(&self, name: &str) -> Option<i64> {
        self.vars.get(name).and_then(|v| v.value.as_i64())
    }

    pub fn mode_is_auto(&self) -> bool {
        self.int("AMEBA.MODE") == Some(MODE_AUTO)
    }

    /// Do weather and sky permit starting automatic operation?
    pub fn can_open(&self) -> bool {
        self.float("WEATHER.RH") <= MAX_HUMIDITY
            && self.float("WEATHER.WIND") <= MAX_WIND
            && self.int("WEATHER.RAIN") == Some(code::RAIN_DRY)
            && self.int("SKY.STATUS") == Some(code::SKY_CLEAR)
            && self.float("SKY.TEMP") <= MAX_SKY_TEMP
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
