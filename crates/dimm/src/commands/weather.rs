//! `dimm weather`: forward one weather report.

use dimm_core::weather::MISSING;
use dimm_core::{Reading, SkyStatus, WeatherReport};

use crate::cli::{GlobalOpts, SkyArg, WeatherArgs};
use crate::error::CliError;
use crate::output;

impl From<SkyArg> for SkyStatus {
    fn from(sky: SkyArg) -> Self {
        match sky {
            SkyArg::Clear => Self::Clear,
            SkyArg::LightlyCloudy => Self::LightlyCloudy,
            SkyArg::Cloudy => Self::Cloudy,
            SkyArg::Precipitating => Self::Precipitating,
        }
    }
}

/// Single readings from the command line carry no two-minute average.
fn report(args: &WeatherArgs) -> WeatherReport {
    let reading = |value: f64| Reading {
        value,
        avg2m: MISSING,
    };
    WeatherReport {
        ambient_temp: args.temp,
        humidity: args.humidity,
        pressure: args.pressure,
        wind_speed: args.wind.map(reading),
        wind_direction: args.wind_dir.map(reading),
        dew_point: args.dew_point,
        precipitation: args.rain,
        snow_depth: args.snow,
        sky_temp: args.sky_temp,
        sky_status: args.sky.map(SkyStatus::from),
    }
}

pub async fn handle(args: WeatherArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let report = report(&args);
    if report == WeatherReport::default() {
        return Err(CliError::Validation {
            field: "weather".into(),
            reason: "give at least one reading".into(),
        });
    }

    let ctl = super::astelco_controller("weather", global)?;
    ctl.start().await?;
    let result = ctl.send_weather(&report).await;
    ctl.stop().await;
    let accepted = result?;

    let color = output::should_color(global.color);
    output::print_output(
        &output::ok_mark(&format!("{accepted} weather values accepted"), color),
        global.quiet,
    );
    Ok(())
}
