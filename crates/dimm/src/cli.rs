//! Clap derive structures for the `dimm` CLI.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use dimm_core::{AmebaMode, ControllerKind};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// dimm -- run and inspect DIMM seeing monitors
#[derive(Debug, Parser)]
#[command(
    name = "dimm",
    version,
    about = "Run and inspect DIMM seeing monitors",
    long_about = "Drives a Differential Image Motion Monitor through one of three\n\
        controllers (simulated, Astelco OpenTPL device, SOAR seeing store)\n\
        and reports seeing measurements as JSON lines.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "DIMM_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format for status and config views
    #[arg(long, short = 'o', default_value = "table", global = true)]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the configured controller and print measurements
    Run(RunArgs),

    /// Read the current status of an Astelco DIMM once
    Status,

    /// Switch the AMEBA operating mode of an Astelco DIMM
    Mode(ModeArgs),

    /// Forward one weather report to an Astelco DIMM
    Weather(WeatherArgs),

    /// Serve the simulated Astelco DIMM
    Mock(MockArgs),

    /// Inspect configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Run ──────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Controller to run (overrides the config file)
    #[arg(long)]
    pub controller: Option<ControllerKind>,

    /// Stop after this long (e.g. "90s", "2h")
    #[arg(long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,

    /// Give up after this many failed recovery attempts
    #[arg(long)]
    pub max_retries: Option<u32>,
}

// ── Device commands ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Off,
    Auto,
    Manual,
}

impl From<ModeArg> for AmebaMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Off => Self::Off,
            ModeArg::Auto => Self::Auto,
            ModeArg::Manual => Self::Manual,
        }
    }
}

#[derive(Debug, Args)]
pub struct ModeArgs {
    pub mode: ModeArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SkyArg {
    Clear,
    LightlyCloudy,
    Cloudy,
    Precipitating,
}

#[derive(Debug, Args)]
pub struct WeatherArgs {
    /// Ambient temperature, Celsius
    #[arg(long, allow_negative_numbers = true)]
    pub temp: Option<f64>,

    /// Relative humidity, percent
    #[arg(long)]
    pub humidity: Option<f64>,

    /// Pressure, mbar
    #[arg(long)]
    pub pressure: Option<f64>,

    /// Wind speed, m/s
    #[arg(long)]
    pub wind: Option<f64>,

    /// Wind direction, degrees
    #[arg(long)]
    pub wind_dir: Option<f64>,

    /// Dew point, Celsius
    #[arg(long, allow_negative_numbers = true)]
    pub dew_point: Option<f64>,

    /// Precipitation sum over the last minute
    #[arg(long)]
    pub rain: Option<f64>,

    /// Snow depth
    #[arg(long)]
    pub snow: Option<f64>,

    /// Sky temperature, Celsius
    #[arg(long, allow_negative_numbers = true)]
    pub sky_temp: Option<f64>,

    /// Sky condition
    #[arg(long)]
    pub sky: Option<SkyArg>,
}

// ── Mock ─────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct MockArgs {
    /// Port to listen on (0 picks a free one)
    #[arg(long, default_value = "65432")]
    pub port: u16,

    /// Accept commands without AUTH
    #[arg(long)]
    pub no_auth: bool,

    /// Start with weather that lets the DIMM open
    #[arg(long)]
    pub open: bool,

    /// Slew time per target
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub slew: Duration,

    /// Time spent measuring per target
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub measure: Duration,

    /// Cadence of unsolicited status events
    #[arg(long, value_parser = humantime::parse_duration)]
    pub events: Option<Duration>,

    /// Fixed RNG seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Stop after this long
    #[arg(long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the resolved configuration
    Check,

    /// Print the resolved configuration (password redacted)
    Show,

    /// Print the default config file location
    Path,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
