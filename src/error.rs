use thiserror::Error;

use crate::backend::BackendError;

/// Failure of a user-triggered action. `Display` is the user-facing text.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{message}")]
    Failed {
        action: &'static str,
        message: String,
        #[source]
        source: BackendError,
    },
    #[error("Add participants before generating certificates")]
    EmptyRoster,
    #[error("sync engine is shut down")]
    ShutDown,
}
