//! `dimm mode`: switch `AMEBA.MODE`.

use dimm_core::AmebaMode;

use crate::cli::{GlobalOpts, ModeArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(args: ModeArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let mode = AmebaMode::from(args.mode);
    let ctl = super::astelco_controller("mode", global)?;
    ctl.start().await?;
    let result = ctl.set_ameba_mode(mode).await;
    ctl.stop().await;
    result?;

    let color = output::should_color(global.color);
    output::print_output(&output::ok_mark(&format!("AMEBA mode set to {mode}"), color), global.quiet);
    Ok(())
}
