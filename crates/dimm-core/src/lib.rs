// dimm-core: controller variants and measurement bookkeeping on top of dimm-api.

pub mod config;
pub mod controller;
pub mod error;
pub mod measurement;
pub mod model;
pub mod poller;
pub mod recovery;
pub mod telemetry;
pub mod weather;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{AstelcoSettings, ControllerKind, DimmConfig, SimSettings, SoarSettings};
pub use controller::DimmController;
pub use controller::astelco::AstelcoController;
pub use controller::sim::SimController;
pub use controller::soar::{FileStore, MemoryStore, SeeingRecord, SeeingStore, SoarController, StoreError};
pub use error::CoreError;
pub use measurement::{Measurement, SeeingDetails};
pub use model::{
    AmebaMode, AmebaState, ControllerState, DeviceActivity, DimmStatus, PowerState, RainState,
    ScopeMotionState, SkyStatus, VariableType,
};
pub use poller::{StatusPoller, TickOutcome};
pub use recovery::RecoveryPolicy;
pub use telemetry::{NullSink, Telemetry, TelemetrySink};
pub use weather::{Precipitation, Reading, WeatherReport};
