//! `dimm run`: start the configured controller and keep it alive.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use dimm_core::{ControllerState, DimmController, RecoveryPolicy};

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;
use crate::sink::JsonLineSink;

pub async fn handle(args: RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let mut settings = super::load_settings(global)?;
    if let Some(kind) = args.controller {
        settings.controller = kind;
    }
    let config = settings.into_dimm_config()?;
    let controller =
        DimmController::from_config(&config, Arc::new(JsonLineSink::new(global.quiet)))?;
    let policy = RecoveryPolicy {
        max_retries: args.max_retries,
        ..RecoveryPolicy::default()
    };

    info!(controller = %controller.kind(), "starting");
    let result = tokio::select! {
        biased;
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
        () = deadline(args.duration) => Ok(()),
        result = supervise(&controller, &policy) => result,
    };

    controller.stop().await;
    info!(failures = controller.failures(), "stopped");
    result
}

async fn deadline(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Start the controller, then recover it after every fault until the
/// retry budget runs out. Only returns on a fatal error.
async fn supervise(controller: &DimmController, policy: &RecoveryPolicy) -> Result<(), CliError> {
    let mut state = controller.subscribe_state();
    let mut attempt: u32 = 0;
    let mut outcome = controller.start().await;

    loop {
        let reason = match outcome {
            Ok(()) => {
                attempt = 0;
                let faulted = state
                    .wait_for(ControllerState::is_faulted)
                    .await
                    .map(|s| match &*s {
                        ControllerState::Faulted { reason } => reason.clone(),
                        _ => String::new(),
                    });
                match faulted {
                    Ok(reason) => reason,
                    // Controller dropped: nothing left to supervise
                    Err(_) => return Ok(()),
                }
            }
            Err(e) if e.is_recoverable() => e.to_string(),
            Err(e) => return Err(e.into()),
        };

        let Some(delay) = policy.delay_for(attempt) else {
            return Err(CliError::RecoveryExhausted {
                attempts: attempt,
                reason,
            });
        };
        attempt += 1;
        warn!(%reason, attempt, delay = %humantime::format_duration(delay), "recovering controller");
        tokio::time::sleep(delay).await;
        outcome = controller.recover().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use dimm_core::{DimmConfig, NullSink};

    #[tokio::test]
    async fn refused_connection_with_no_retries_gives_up() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = DimmConfig {
            controller: dimm_core::ControllerKind::Astelco,
            ..DimmConfig::default()
        };
        config.astelco.port = port;
        config.astelco.connect_timeout = Duration::from_secs(2);
        let controller = DimmController::from_config(&config, Arc::new(NullSink)).unwrap();
        let policy = RecoveryPolicy {
            max_retries: Some(0),
            ..RecoveryPolicy::default()
        };

        let err = supervise(&controller, &policy).await.unwrap_err();
        assert!(
            matches!(err, CliError::RecoveryExhausted { attempts: 0, .. }),
            "{err:?}"
        );
        assert!(controller.state().is_faulted());
    }
}
