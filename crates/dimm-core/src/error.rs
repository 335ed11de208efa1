// ── Core error types ──
//
// Controller-level errors. Consumers never see raw wire-protocol failures;
// the `From<dimm_api::Error>` impl folds them into the categories a
// controller actually reacts to.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to DIMM at {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Controller is not running")]
    NotRunning,

    // ── Command errors ───────────────────────────────────────────────
    #[error("Command timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("Command rejected by device: {message}")]
    Rejected { message: String },

    #[error("Too many outstanding commands (limit {limit})")]
    Saturated { limit: usize },

    #[error("Unusable value for {name}: {reason}")]
    DataQuality { name: String, reason: String },

    // ── External store errors ────────────────────────────────────────
    #[error("Seeing store error: {0}")]
    Store(#[from] crate::controller::soar::StoreError),

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether a fresh connection might succeed where this one failed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::ConnectionLost { .. } | Self::Timeout { .. }
        )
    }
}

// ── Conversion from protocol-layer errors ────────────────────────────

impl From<dimm_api::Error> for CoreError {
    fn from(err: dimm_api::Error) -> Self {
        use dimm_api::Error as E;
        match err {
            E::Connect { addr, reason } => Self::ConnectionFailed { addr, reason },
            E::Io(e) => Self::ConnectionLost {
                reason: e.to_string(),
            },
            E::ConnectionLost { reason } => Self::ConnectionLost { reason },
            E::NotConnected => Self::ConnectionLost {
                reason: "session is not open".into(),
            },
            E::Authentication { message } => Self::AuthenticationFailed { message },
            E::Protocol(message) => Self::Internal(format!("protocol violation: {message}")),
            E::Timeout { elapsed, .. } => Self::Timeout { elapsed },
            E::Rejected { reason, .. } => Self::Rejected { message: reason },
            E::TooManyPending { limit } => Self::Saturated { limit },
            E::DuplicateId { id } => Self::Internal(format!("duplicate command id {id}")),
            E::AlreadyCompleted { id } => Self::Internal(format!("command {id} completed twice")),
            E::DataQuality { name, reason } => Self::DataQuality { name, reason },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use dimm_api::CommandId;

    #[test]
    fn protocol_errors_fold_into_controller_categories() {
        let lost: CoreError = dimm_api::Error::NotConnected.into();
        assert!(matches!(lost, CoreError::ConnectionLost { .. }));
        assert!(lost.is_recoverable());

        let timeout: CoreError = dimm_api::Error::Timeout {
            id: CommandId::new(4),
            elapsed: Duration::from_secs(5),
        }
        .into();
        assert!(matches!(timeout, CoreError::Timeout { elapsed } if elapsed == Duration::from_secs(5)));

        let nak: CoreError = dimm_api::Error::Rejected {
            id: CommandId::new(2),
            reason: "ERROR UNKNOWN".into(),
        }
        .into();
        assert!(matches!(nak, CoreError::Rejected { ref message } if message == "ERROR UNKNOWN"));
        assert!(!nak.is_recoverable());

        let auth: CoreError = dimm_api::Error::Authentication {
            message: "refused".into(),
        }
        .into();
        assert!(!auth.is_recoverable());
    }
}
