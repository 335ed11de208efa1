// dimm-mock: Simulated Astelco DIMM for tests and bench runs

pub mod registry;
pub mod server;

pub use registry::{Registry, Value, VariableError};
pub use server::{MockConfig, MockDimm, MockStats};
