//! Command dispatch: bridges CLI args -> controllers -> output formatting.

pub mod config_cmd;
pub mod mock;
pub mod mode;
pub mod run;
pub mod status;
pub mod weather;

use std::sync::Arc;

use dimm_config::Settings;
use dimm_core::{AstelcoController, ControllerKind, NullSink};

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a device-bound command to the appropriate handler.
pub async fn dispatch(cmd: Command, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Run(args) => run::handle(args, global).await,
        Command::Status => status::handle(global).await,
        Command::Mode(args) => mode::handle(args, global).await,
        Command::Weather(args) => weather::handle(args, global).await,
        // Handled before dispatch
        Command::Mock(_) | Command::Config(_) | Command::Completions(_) => {
            Err(CliError::Internal("command dispatched twice".into()))
        }
    }
}

// ── Shared helpers ──────────────────────────────────────────────────

pub fn load_settings(global: &GlobalOpts) -> Result<Settings, CliError> {
    Ok(dimm_config::load(global.config.as_deref())?)
}

/// Build an Astelco controller for a one-shot device command. Other
/// controller kinds have no device to talk to.
pub fn astelco_controller(command: &str, global: &GlobalOpts) -> Result<AstelcoController, CliError> {
    let settings = load_settings(global)?;
    if settings.controller != ControllerKind::Astelco {
        return Err(CliError::Unsupported {
            command: command.into(),
            controller: settings.controller.to_string(),
        });
    }
    let config = settings.into_dimm_config()?;
    Ok(AstelcoController::new(
        config.astelco,
        config.measurement_validity,
        Arc::new(NullSink),
    )?)
}
