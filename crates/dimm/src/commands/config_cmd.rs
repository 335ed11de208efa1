//! Config subcommand handlers.

use dimm_config::Settings;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Check => {
            let settings = super::load_settings(global)?;
            // Also resolves the password for the astelco controller
            settings.into_dimm_config()?;
            let color = output::should_color(global.color);
            output::print_output(
                &output::ok_mark(
                    &format!("configuration OK (controller: {})", settings.controller),
                    color,
                ),
                global.quiet,
            );
            Ok(())
        }

        ConfigCommand::Show => {
            // Unvalidated, so a broken file can still be inspected
            let settings: Settings = dimm_config::figment(global.config.as_deref())?.extract()?;
            let settings = settings.redacted();
            let rendered = match global.output {
                OutputFormat::Table => settings.to_toml()?,
                format => output::render(format, &settings, None)?,
            };
            output::print_output(rendered.trim_end(), global.quiet);
            Ok(())
        }

        ConfigCommand::Path => {
            let path = global
                .config
                .clone()
                .unwrap_or_else(dimm_config::config_path);
            output::print_output(&path.display().to_string(), global.quiet);
            Ok(())
        }
    }
}
