//! `dimm mock`: serve the simulated device until interrupted.

use tracing::info;

use dimm_mock::{MockConfig, MockDimm};

use crate::cli::{GlobalOpts, MockArgs};
use crate::error::CliError;
use crate::output;

fn mock_config(args: &MockArgs) -> MockConfig {
    MockConfig {
        port: args.port,
        require_auth: !args.no_auth,
        open_weather: args.open,
        slew_duration: args.slew,
        measurement_duration: args.measure,
        event_interval: args.events,
        seed: args.seed,
        ..MockConfig::default()
    }
}

pub async fn handle(args: MockArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let mock = MockDimm::start(mock_config(&args)).await?;
    output::print_output(&format!("listening on {}", mock.addr()), global.quiet);

    tokio::select! {
        biased;
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        () = async {
            match args.duration {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        } => {}
    }

    let stats = mock.stats();
    mock.shutdown().await;
    info!(
        connections = stats.connections,
        commands = stats.commands,
        measurements = stats.measurements,
        "mock stopped"
    );
    Ok(())
}
